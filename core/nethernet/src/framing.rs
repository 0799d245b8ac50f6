//! Message segmentation for the reliable channel
//!
//! Channel messages have a size limit, so an application payload is split
//! into segments, each prefixed by one byte holding how many segments still
//! follow it:
//!
//! ```text
//! payload (N bytes, limit M per channel message)
//!
//! ┌───┬──────────────┐ ┌───┬──────────────┐     ┌───┬──────────┐
//! │k-1│ M-1 bytes    │ │k-2│ M-1 bytes    │ ... │ 0 │ rest     │
//! └───┴──────────────┘ └───┴──────────────┘     └───┴──────────┘
//! ```
//!
//! A single byte bounds a message to 256 segments. The channel is ordered,
//! so reassembly only has to check that the countdown is consistent.

use crate::error::{Error, Result};

pub const SEGMENT_HEADER_LEN: usize = 1;

/// Most segments one message may span
pub const MAX_SEGMENTS: usize = u8::MAX as usize + 1;

/// Number of segments `len` bytes need under `max_message_size`.
///
/// Fails with [`Error::Format`] when the payload cannot be framed at all:
/// the limit leaves no room for data, or more than [`MAX_SEGMENTS`] would be
/// needed.
pub fn segment_count(len: usize, max_message_size: usize) -> Result<usize> {
    if max_message_size <= SEGMENT_HEADER_LEN {
        return Err(Error::Format(format!(
            "channel message limit {} leaves no room for data",
            max_message_size
        )));
    }

    let chunk = max_message_size - SEGMENT_HEADER_LEN;
    let count = ((len + chunk - 1) / chunk).max(1);
    if count > MAX_SEGMENTS {
        return Err(Error::Format(format!(
            "payload of {} bytes needs {} segments (max {})",
            len, count, MAX_SEGMENTS
        )));
    }
    Ok(count)
}

/// Split `payload` into channel messages no larger than `max_message_size`
pub fn segment(payload: &[u8], max_message_size: usize) -> Result<Vec<Vec<u8>>> {
    let count = segment_count(payload.len(), max_message_size)?;
    if payload.is_empty() {
        return Ok(vec![vec![0]]);
    }

    let chunk = max_message_size - SEGMENT_HEADER_LEN;
    Ok(payload
        .chunks(chunk)
        .enumerate()
        .map(|(i, part)| {
            let mut seg = Vec::with_capacity(SEGMENT_HEADER_LEN + part.len());
            seg.push((count - 1 - i) as u8);
            seg.extend_from_slice(part);
            seg
        })
        .collect())
}

/// Rebuilds payloads from segments received in order
#[derive(Debug, Default)]
pub struct Reassembler {
    buf: Vec<u8>,
    /// Remaining count the next segment must carry
    expected: Option<u8>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one channel message; returns the payload when its last segment arrives
    pub fn push(&mut self, segment: &[u8]) -> Result<Option<Vec<u8>>> {
        let (&remaining, body) = segment
            .split_first()
            .ok_or_else(|| Error::Format("empty segment".to_string()))?;

        if let Some(expected) = self.expected {
            if remaining != expected {
                log::warn!(
                    "Segment countdown mismatch (expected {}, got {}), dropping {} buffered bytes",
                    expected,
                    remaining,
                    self.buf.len()
                );
                self.buf.clear();
            }
        }

        self.buf.extend_from_slice(body);

        if remaining == 0 {
            self.expected = None;
            return Ok(Some(std::mem::take(&mut self.buf)));
        }

        self.expected = Some(remaining - 1);
        Ok(None)
    }

    /// Bytes buffered for an incomplete message
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn is_idle(&self) -> bool {
        self.expected.is_none()
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.expected = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_segment() {
        let segs = segment(b"hello", 16).unwrap();
        assert_eq!(segs, vec![b"\x00hello".to_vec()]);
    }

    #[test]
    fn test_empty_payload_is_header_only() {
        let segs = segment(&[], 16).unwrap();
        assert_eq!(segs, vec![vec![0u8]]);

        let mut r = Reassembler::new();
        assert_eq!(r.push(&segs[0]).unwrap(), Some(Vec::new()));
    }

    #[test]
    fn test_countdown_headers() {
        let payload: Vec<u8> = (0..10).collect();
        let segs = segment(&payload, 4).unwrap();
        let headers: Vec<u8> = segs.iter().map(|s| s[0]).collect();
        assert_eq!(headers, vec![3, 2, 1, 0]);
        assert!(segs.iter().all(|s| s.len() <= 4));
    }

    #[test]
    fn test_reassemble_in_order() {
        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let segs = segment(&payload, 97).unwrap();

        let mut r = Reassembler::new();
        let mut out = None;
        for (i, seg) in segs.iter().enumerate() {
            out = r.push(seg).unwrap();
            assert_eq!(out.is_some(), i == segs.len() - 1);
        }
        assert_eq!(out.unwrap(), payload);
        assert!(r.is_idle());
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn test_segment_limit() {
        // 256 segments of 1 byte fit, 257 do not
        assert_eq!(segment(&[7u8; 256], 2).unwrap().len(), 256);
        assert!(matches!(segment(&[7u8; 257], 2), Err(Error::Format(_))));
        assert!(matches!(segment(b"x", 1), Err(Error::Format(_))));
    }

    #[test]
    fn test_segment_count() {
        assert_eq!(segment_count(0, 16).unwrap(), 1);
        assert_eq!(segment_count(15, 16).unwrap(), 1);
        assert_eq!(segment_count(16, 16).unwrap(), 2);
        assert_eq!(segment_count(63 * 256, 64).unwrap(), 256);
        assert!(matches!(segment_count(63 * 257, 64), Err(Error::Format(_))));
    }

    #[test]
    fn test_mismatch_restarts_with_current_segment() {
        let mut r = Reassembler::new();
        assert_eq!(r.push(&[2, 1, 1]).unwrap(), None);
        // expected 1, got 0: old data dropped, this segment completes alone
        assert_eq!(r.push(&[0, 9]).unwrap(), Some(vec![9]));
        assert!(r.is_idle());
    }

    #[test]
    fn test_empty_segment_rejected() {
        let mut r = Reassembler::new();
        assert!(matches!(r.push(&[]), Err(Error::Format(_))));
    }

    #[test]
    fn test_reset_discards_partial() {
        let mut r = Reassembler::new();
        r.push(&[1, 5, 5]).unwrap();
        assert_eq!(r.pending(), 2);
        r.reset();
        assert!(r.is_idle());
        assert_eq!(r.push(&[0, 1]).unwrap(), Some(vec![1]));
    }
}
