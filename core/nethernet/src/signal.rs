//! Signaling messages carried inside discovery `Message` packets
//!
//! # Text Encoding
//!
//! ```text
//! <TYPE> <connection_id> <data...>
//!
//! CONNECTREQUEST 8126307841233 v=0\r\no=- 42 2 IN IP4 127.0.0.1\r\n...
//! CANDIDATEADD 8126307841233 candidate:1 1 UDP 2122317823 10.0.0.2 50000 typ host
//! ```
//!
//! Fields are separated by a single space; `data` is everything after the
//! second separator and may itself contain spaces. The sender's NetworkId is
//! not part of the text: the receiver fills it in from the packet header.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::{ConnectionId, NetworkId};

// ============================================================================
// Constants
// ============================================================================

/// Message payload used as a liveness probe; never dispatched as a signal
pub const KEEPALIVE_MARKER: &str = "Ping";

/// Origin line some engines emit for a loopback session
const LOOPBACK_ORIGIN_PREFIX: &str = "o=rtc ";
const LOOPBACK_ORIGIN_SUFFIX: &str = " 0 IN IP4 127.0.0.1";

// ============================================================================
// Signal Types
// ============================================================================

/// Handshake step carried by a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalType {
    /// Client offer description
    ConnectRequest,
    /// Server answer description
    ConnectResponse,
    /// ICE candidate from either side
    CandidateAdd,
    /// Negotiation refused; data holds a [`ConnectErrorCode`]
    ConnectError,
}

impl SignalType {
    pub fn token(&self) -> &'static str {
        match self {
            SignalType::ConnectRequest => "CONNECTREQUEST",
            SignalType::ConnectResponse => "CONNECTRESPONSE",
            SignalType::CandidateAdd => "CANDIDATEADD",
            SignalType::ConnectError => "CONNECTERROR",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "CONNECTREQUEST" => Some(SignalType::ConnectRequest),
            "CONNECTRESPONSE" => Some(SignalType::ConnectResponse),
            "CANDIDATEADD" => Some(SignalType::CandidateAdd),
            "CONNECTERROR" => Some(SignalType::ConnectError),
            _ => None,
        }
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Reason codes carried in a `ConnectError` signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectErrorCode {
    Unknown = 0,
    /// The server has no peer-connection engine available
    TransportUnavailable = 1,
    /// The offer could not be applied
    NegotiationFailed = 2,
    /// Signal referenced a session the server does not know
    SessionNotFound = 3,
}

impl ConnectErrorCode {
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => ConnectErrorCode::TransportUnavailable,
            2 => ConnectErrorCode::NegotiationFailed,
            3 => ConnectErrorCode::SessionNotFound,
            _ => ConnectErrorCode::Unknown,
        }
    }

    /// Parse the data field of a `ConnectError` signal
    pub fn parse(data: &str) -> Self {
        data.trim()
            .parse::<u8>()
            .map(Self::from_code)
            .unwrap_or(ConnectErrorCode::Unknown)
    }
}

impl fmt::Display for ConnectErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectErrorCode::Unknown => write!(f, "unknown error"),
            ConnectErrorCode::TransportUnavailable => write!(f, "transport unavailable"),
            ConnectErrorCode::NegotiationFailed => write!(f, "negotiation failed"),
            ConnectErrorCode::SessionNotFound => write!(f, "session not found"),
        }
    }
}

// ============================================================================
// Signal
// ============================================================================

/// One handshake message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    pub signal_type: SignalType,
    pub connection_id: ConnectionId,
    pub data: String,
    /// Sender (inbound) or recipient (outbound) NetworkId; never serialized
    pub network_id: Option<NetworkId>,
}

impl Signal {
    pub fn new(
        signal_type: SignalType,
        connection_id: ConnectionId,
        data: impl Into<String>,
        network_id: Option<NetworkId>,
    ) -> Self {
        Self {
            signal_type,
            connection_id,
            data: data.into(),
            network_id,
        }
    }

    /// `ConnectError` signal for a session
    pub fn connect_error(
        connection_id: ConnectionId,
        code: ConnectErrorCode,
        network_id: Option<NetworkId>,
    ) -> Self {
        Self::new(
            SignalType::ConnectError,
            connection_id,
            (code as u8).to_string(),
            network_id,
        )
    }

    pub fn to_text(&self) -> String {
        format!(
            "{} {} {}",
            self.signal_type.token(),
            self.connection_id,
            self.data
        )
    }

    pub fn from_text(text: &str) -> Result<Self> {
        let mut parts = text.splitn(3, ' ');
        let (token, id, data) = match (parts.next(), parts.next(), parts.next()) {
            (Some(token), Some(id), Some(data)) => (token, id, data),
            _ => {
                return Err(Error::Format(format!(
                    "signal needs 3 fields: {:?}",
                    truncate(text)
                )))
            }
        };

        let signal_type = SignalType::from_token(token)
            .ok_or_else(|| Error::Format(format!("unknown signal type {:?}", truncate(token))))?;

        let connection_id = id
            .parse::<u64>()
            .map_err(|_| Error::Format(format!("invalid connection id {:?}", truncate(id))))?;

        Ok(Self::new(signal_type, connection_id, data, None))
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

impl FromStr for Signal {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Signal::from_text(s)
    }
}

fn truncate(s: &str) -> &str {
    match s.char_indices().nth(48) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// ============================================================================
// Description Rewrite
// ============================================================================

/// Embed the local NetworkId in a session description's origin field.
///
/// The first occurrence of `o=rtc <digits> 0 IN IP4 127.0.0.1` anywhere in
/// the text is replaced; whatever follows it on the same line is kept. Any
/// other text passes through unchanged.
pub fn rewrite_session_origin(description: &str, network_id: NetworkId) -> String {
    match find_loopback_origin(description) {
        Some((start, end)) => format!(
            "{}o=- {} 2 IN IP4 127.0.0.1{}",
            &description[..start],
            network_id,
            &description[end..]
        ),
        None => description.to_string(),
    }
}

/// Byte range of the first loopback origin field
fn find_loopback_origin(text: &str) -> Option<(usize, usize)> {
    let mut from = 0;
    while let Some(pos) = text[from..].find(LOOPBACK_ORIGIN_PREFIX) {
        let start = from + pos;
        let rest = &text[start + LOOPBACK_ORIGIN_PREFIX.len()..];
        let digits = rest.bytes().take_while(|b| b.is_ascii_digit()).count();
        if digits > 0 && rest[digits..].starts_with(LOOPBACK_ORIGIN_SUFFIX) {
            let end = start
                + LOOPBACK_ORIGIN_PREFIX.len()
                + digits
                + LOOPBACK_ORIGIN_SUFFIX.len();
            return Some((start, end));
        }
        from = start + LOOPBACK_ORIGIN_PREFIX.len();
    }
    None
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_roundtrip_keeps_fields() {
        let signals = [
            Signal::new(SignalType::ConnectRequest, 1, "v=0\r\ns=- with spaces\r\n", Some(9)),
            Signal::new(SignalType::ConnectResponse, u64::MAX, "answer", None),
            Signal::new(SignalType::CandidateAdd, 0, "", None),
            Signal::connect_error(77, ConnectErrorCode::NegotiationFailed, None),
        ];

        for signal in signals {
            let decoded = Signal::from_text(&signal.to_text()).unwrap();
            assert_eq!(decoded.signal_type, signal.signal_type);
            assert_eq!(decoded.connection_id, signal.connection_id);
            assert_eq!(decoded.data, signal.data);
            assert_eq!(decoded.network_id, None);
        }
    }

    #[test]
    fn test_text_format() {
        let signal = Signal::new(SignalType::CandidateAdd, 12345, "candidate:1 1 UDP", Some(3));
        assert_eq!(signal.to_text(), "CANDIDATEADD 12345 candidate:1 1 UDP");
        assert_eq!(format!("{}", signal), signal.to_text());
    }

    #[test]
    fn test_wrong_field_count() {
        assert!(matches!(Signal::from_text(""), Err(Error::Format(_))));
        assert!(matches!(Signal::from_text("CONNECTREQUEST"), Err(Error::Format(_))));
        assert!(matches!(Signal::from_text("CONNECTREQUEST 12"), Err(Error::Format(_))));
    }

    #[test]
    fn test_unknown_type_token() {
        assert!(matches!(Signal::from_text("HELLO 1 data"), Err(Error::Format(_))));
        assert!(matches!(Signal::from_text("connectrequest 1 data"), Err(Error::Format(_))));
    }

    #[test]
    fn test_bad_connection_id() {
        assert!(matches!(Signal::from_text("CANDIDATEADD -1 x"), Err(Error::Format(_))));
        assert!(matches!(Signal::from_text("CANDIDATEADD abc x"), Err(Error::Format(_))));
    }

    #[test]
    fn test_keepalive_marker_is_not_a_signal() {
        assert!(Signal::from_text(KEEPALIVE_MARKER).is_err());
    }

    #[test]
    fn test_connect_error_code() {
        let signal = Signal::connect_error(5, ConnectErrorCode::TransportUnavailable, None);
        assert_eq!(signal.data, "1");
        assert_eq!(
            ConnectErrorCode::parse(&signal.data),
            ConnectErrorCode::TransportUnavailable
        );
        assert_eq!(ConnectErrorCode::parse("garbage"), ConnectErrorCode::Unknown);
        assert_eq!(format!("{}", ConnectErrorCode::SessionNotFound), "session not found");
    }

    #[test]
    fn test_rewrite_origin_line() {
        let sdp = "v=0\r\no=rtc 1234567 0 IN IP4 127.0.0.1\r\ns=-\r\n";
        let rewritten = rewrite_session_origin(sdp, 99);
        assert_eq!(rewritten, "v=0\r\no=- 99 2 IN IP4 127.0.0.1\r\ns=-\r\n");
    }

    #[test]
    fn test_rewrite_last_line_without_newline() {
        let sdp = "v=0\no=rtc 1 0 IN IP4 127.0.0.1";
        assert_eq!(rewrite_session_origin(sdp, 5), "v=0\no=- 5 2 IN IP4 127.0.0.1");
    }

    #[test]
    fn test_rewrite_passthrough() {
        let inputs = [
            "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\n",
            "v=0\r\no=rtc abc 0 IN IP4 127.0.0.1\r\n",
            "v=0\r\no=rtc 1 0 IN IP4 10.0.0.1\r\n",
            "",
        ];
        for sdp in inputs {
            assert_eq!(rewrite_session_origin(sdp, 7), sdp);
        }
    }

    #[test]
    fn test_rewrite_keeps_trailing_text() {
        let sdp = "v=0\r\no=rtc 4242 0 IN IP4 127.0.0.1 x-extra\r\ns=-\r\n";
        assert_eq!(
            rewrite_session_origin(sdp, 8),
            "v=0\r\no=- 8 2 IN IP4 127.0.0.1 x-extra\r\ns=-\r\n"
        );
    }

    #[test]
    fn test_rewrite_skips_near_misses() {
        let sdp = "o=rtc  0 IN IP4 127.0.0.1\no=rtc 12 0 IN IP4 127.0.0.1\n";
        assert_eq!(
            rewrite_session_origin(sdp, 6),
            "o=rtc  0 IN IP4 127.0.0.1\no=- 6 2 IN IP4 127.0.0.1\n"
        );
    }

    #[test]
    fn test_rewrite_first_match_only() {
        let sdp = "o=rtc 1 0 IN IP4 127.0.0.1\no=rtc 2 0 IN IP4 127.0.0.1\n";
        assert_eq!(
            rewrite_session_origin(sdp, 3),
            "o=- 3 2 IN IP4 127.0.0.1\no=rtc 2 0 IN IP4 127.0.0.1\n"
        );
    }
}
