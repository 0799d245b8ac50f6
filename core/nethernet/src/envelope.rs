//! Secure envelope around every discovery packet
//!
//! # Wire Layout
//!
//! ```text
//! ┌──────────────────────┬────────────────────────────────────┐
//! │ Checksum (32B)       │ Encrypted packet body              │
//! │ digest(plaintext)    │ encrypt(plaintext)                 │
//! └──────────────────────┴────────────────────────────────────┘
//! ```
//!
//! The checksum detects corruption and tampering; it does not authenticate
//! the sender. Cipher and digest sit behind [`EnvelopeCipher`] so they can be
//! swapped without touching packet dispatch.

use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, NONCE_LEN};
use ring::digest;
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Length of the checksum prefix
pub const CHECKSUM_LEN: usize = 32;

/// Default key material for the envelope cipher (little-endian u64 seed)
pub const DEFAULT_ENVELOPE_KEY: u64 = 0xdead_beef;

/// Length of the AES-GCM authentication tag appended by the default cipher
const TAG_LEN: usize = 16;

// ============================================================================
// Cipher Contract
// ============================================================================

/// Pluggable checksum + symmetric cipher backing the envelope.
///
/// Contract: `decrypt(encrypt(p)) == p` and `checksum` is a deterministic
/// 32-byte digest. `decrypt` fails with [`Error::Integrity`] on bytes it
/// cannot open.
pub trait EnvelopeCipher: Send {
    fn checksum(&self, plaintext: &[u8]) -> [u8; CHECKSUM_LEN];
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// Default cipher: HMAC-SHA256 checksum, AES-256-GCM body.
///
/// Ciphertext is `nonce (12B) || sealed body || tag (16B)`. Both keys are
/// derived from one seed with domain-separated SHA-256.
pub struct RingCipher {
    checksum_key: hmac::Key,
    body_key: LessSafeKey,
    rng: SystemRandom,
}

impl RingCipher {
    /// Build a cipher from arbitrary key material
    pub fn new(secret: &[u8]) -> Result<Self> {
        let checksum_material = derive_key(b"nethernet-checksum", secret);
        let body_material = derive_key(b"nethernet-body", secret);

        let unbound = UnboundKey::new(&aead::AES_256_GCM, body_material.as_ref())
            .map_err(|_| Error::Config("invalid envelope key length".to_string()))?;

        Ok(Self {
            checksum_key: hmac::Key::new(hmac::HMAC_SHA256, checksum_material.as_ref()),
            body_key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    /// Build a cipher from a u64 seed (the form carried in config files)
    pub fn from_seed(seed: u64) -> Result<Self> {
        Self::new(&seed.to_le_bytes())
    }
}

fn derive_key(label: &[u8], secret: &[u8]) -> digest::Digest {
    let mut ctx = digest::Context::new(&digest::SHA256);
    ctx.update(label);
    ctx.update(secret);
    ctx.finish()
}

impl EnvelopeCipher for RingCipher {
    fn checksum(&self, plaintext: &[u8]) -> [u8; CHECKSUM_LEN] {
        let tag = hmac::sign(&self.checksum_key, plaintext);
        let mut out = [0u8; CHECKSUM_LEN];
        out.copy_from_slice(tag.as_ref());
        out
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| Error::Integrity("nonce generation failed".to_string()))?;

        let mut body = plaintext.to_vec();
        self.body_key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut body,
            )
            .map_err(|_| Error::Integrity("encryption failed".to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + body.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < NONCE_LEN + TAG_LEN {
            return Err(Error::Integrity(format!(
                "ciphertext too short: {} bytes",
                ciphertext.len()
            )));
        }

        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes.copy_from_slice(&ciphertext[..NONCE_LEN]);

        let mut body = ciphertext[NONCE_LEN..].to_vec();
        let plaintext = self
            .body_key
            .open_in_place(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut body,
            )
            .map_err(|_| Error::Integrity("decryption failed".to_string()))?;

        Ok(plaintext.to_vec())
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// Wraps and unwraps discovery datagrams
pub struct Envelope {
    cipher: Box<dyn EnvelopeCipher>,
}

impl Envelope {
    pub fn new(cipher: Box<dyn EnvelopeCipher>) -> Self {
        Self { cipher }
    }

    /// Envelope backed by [`RingCipher`] seeded with `seed`
    pub fn with_seed(seed: u64) -> Result<Self> {
        Ok(Self::new(Box::new(RingCipher::from_seed(seed)?)))
    }

    /// `checksum(plaintext) ++ encrypt(plaintext)`
    pub fn encode(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let checksum = self.cipher.checksum(plaintext);
        let body = self.cipher.encrypt(plaintext)?;

        let mut out = Vec::with_capacity(CHECKSUM_LEN + body.len());
        out.extend_from_slice(&checksum);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decrypt and verify a datagram, returning the packet plaintext
    pub fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        if bytes.len() < CHECKSUM_LEN {
            return Err(Error::Integrity(format!(
                "envelope too short: {} bytes",
                bytes.len()
            )));
        }

        let plaintext = self.cipher.decrypt(&bytes[CHECKSUM_LEN..])?;

        let expected = self.cipher.checksum(&plaintext);
        if expected[..] != bytes[..CHECKSUM_LEN] {
            return Err(Error::Integrity("checksum mismatch".to_string()));
        }

        Ok(plaintext)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> Envelope {
        Envelope::with_seed(DEFAULT_ENVELOPE_KEY).unwrap()
    }

    #[test]
    fn test_encode_decode() {
        let env = envelope();
        let plaintext = b"discovery packet body".to_vec();

        let wire = env.encode(&plaintext).unwrap();
        assert!(wire.len() > CHECKSUM_LEN);
        assert_eq!(env.decode(&wire).unwrap(), plaintext);
    }

    #[test]
    fn test_empty_plaintext() {
        let env = envelope();
        let wire = env.encode(&[]).unwrap();
        assert!(env.decode(&wire).unwrap().is_empty());
    }

    #[test]
    fn test_too_short() {
        let env = envelope();
        assert!(matches!(env.decode(&[0u8; 31]), Err(Error::Integrity(_))));
        assert!(matches!(env.decode(&[]), Err(Error::Integrity(_))));
    }

    #[test]
    fn test_checksum_bit_flip_rejected() {
        let env = envelope();
        let wire = env.encode(b"hello").unwrap();

        for byte in 0..CHECKSUM_LEN {
            for bit in 0..8 {
                let mut tampered = wire.clone();
                tampered[byte] ^= 1 << bit;
                assert!(
                    matches!(env.decode(&tampered), Err(Error::Integrity(_))),
                    "flip at byte {} bit {} was accepted",
                    byte,
                    bit
                );
            }
        }
    }

    #[test]
    fn test_body_tamper_rejected() {
        let env = envelope();
        let mut wire = env.encode(b"hello").unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0x80;
        assert!(matches!(env.decode(&wire), Err(Error::Integrity(_))));
    }

    #[test]
    fn test_different_keys_do_not_interoperate() {
        let a = Envelope::with_seed(1).unwrap();
        let b = Envelope::with_seed(2).unwrap();
        let wire = a.encode(b"secret").unwrap();
        assert!(matches!(b.decode(&wire), Err(Error::Integrity(_))));
    }

    #[test]
    fn test_checksum_is_deterministic() {
        let cipher = RingCipher::from_seed(DEFAULT_ENVELOPE_KEY).unwrap();
        assert_eq!(cipher.checksum(b"abc"), cipher.checksum(b"abc"));
        assert_ne!(cipher.checksum(b"abc"), cipher.checksum(b"abd"));
    }

    #[test]
    fn test_encryption_uses_fresh_nonce() {
        let cipher = RingCipher::from_seed(DEFAULT_ENVELOPE_KEY).unwrap();
        let a = cipher.encrypt(b"same").unwrap();
        let b = cipher.encrypt(b"same").unwrap();
        assert_ne!(a, b);
        assert_eq!(cipher.decrypt(&a).unwrap(), b"same");
        assert_eq!(cipher.decrypt(&b).unwrap(), b"same");
    }
}
