//! Error taxonomy shared by every layer of the crate
//!
//! Inbound parsing errors (`Format`, `Integrity`, `Protocol`) are never fatal:
//! the discovery receive path logs them and drops the datagram. Errors from
//! caller-invoked operations are returned to the caller.

use std::fmt;
use std::io;

/// Errors produced by the discovery, signaling and framing layers
#[derive(Debug)]
pub enum Error {
    /// Malformed bytes: truncated packet, unparseable signal text, bad segment
    Format(String),
    /// Envelope checksum mismatch or undecryptable body
    Integrity(String),
    /// Unrecognized packet type or protocol violation
    Protocol(String),
    /// The peer-connection engine reported a failure
    Transport(String),
    /// Operation on an instance in the wrong lifecycle state (usually closed)
    State(String),
    /// Invalid configuration or packet schema
    Config(String),
    /// Socket-level failure
    Io(io::Error),
}

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for the error classes raised by untrusted inbound bytes.
    ///
    /// These are logged and the offending datagram discarded.
    pub fn is_inbound_rejection(&self) -> bool {
        matches!(
            self,
            Error::Format(_) | Error::Integrity(_) | Error::Protocol(_)
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Format(msg) => write!(f, "format error: {}", msg),
            Error::Integrity(msg) => write!(f, "integrity error: {}", msg),
            Error::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Error::Transport(msg) => write!(f, "transport error: {}", msg),
            Error::State(msg) => write!(f, "state error: {}", msg),
            Error::Config(msg) => write!(f, "config error: {}", msg),
            Error::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_rejection_classes() {
        assert!(Error::Format("x".into()).is_inbound_rejection());
        assert!(Error::Integrity("x".into()).is_inbound_rejection());
        assert!(Error::Protocol("x".into()).is_inbound_rejection());
        assert!(!Error::Transport("x".into()).is_inbound_rejection());
        assert!(!Error::State("x".into()).is_inbound_rejection());
        assert!(!Error::Io(io::Error::new(io::ErrorKind::Other, "x")).is_inbound_rejection());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            format!("{}", Error::Integrity("checksum mismatch".into())),
            "integrity error: checksum mismatch"
        );
        assert_eq!(
            format!("{}", Error::State("client is closed".into())),
            "state error: client is closed"
        );
    }

    #[test]
    fn test_json_error_maps_to_config() {
        let err: Error = serde_json::from_str::<u32>("not json").unwrap_err().into();
        assert!(matches!(err, Error::Config(_)));
    }
}
