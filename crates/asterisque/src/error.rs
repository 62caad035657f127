use std::fmt;

use asterisque_core::{CodecError, ProtocolError, Value, close_code};
use asterisque_trust::TrustError;

/// The failure a result handle resolves to, and the error type service
/// handlers return. Travels on the wire as the `(code, message,
/// description)` tuple inside a failure `Close`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Abort {
    pub code: u8,
    pub message: String,
    pub description: String,
}

impl Abort {
    pub fn new(code: u8, message: &str) -> Abort {
        Abort { code, message: message.to_string(), description: String::new() }
    }

    pub fn with_description(code: u8, message: &str, description: &str) -> Abort {
        Abort { code, message: message.to_string(), description: description.to_string() }
    }

    /// Wrapper for uncaught handler failures.
    pub fn unexpected(message: &str) -> Abort {
        Abort::new(close_code::UNEXPECTED_ERROR, message)
    }

    pub fn cancelled() -> Abort {
        Abort::new(close_code::CANCELLED, "call cancelled")
    }

    pub fn session_closed() -> Abort {
        Abort::new(close_code::SESSION_CLOSED, "session closed")
    }

    pub fn timeout() -> Abort {
        Abort::new(close_code::TIMEOUT, "session idle timeout")
    }

    /// Reconstruct from a failure `Close` body.
    pub fn from_close_body(code: u8, body: &Value) -> Abort {
        if let Value::List(items) = body {
            if items.len() == 3 {
                if let (Value::Int32(c), Value::String(message), Value::String(description)) =
                    (&items[0], &items[1], &items[2])
                {
                    return Abort {
                        code: *c as u8,
                        message: message.clone(),
                        description: description.clone(),
                    };
                }
            }
        }
        Abort::new(code, "call failed")
    }
}

impl fmt::Display for Abort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.description.is_empty() {
            write!(f, "abort {}: {}", self.code, self.message)
        } else {
            write!(f, "abort {}: {} ({})", self.code, self.message, self.description)
        }
    }
}

impl std::error::Error for Abort {}

/// Peer authentication failures during the handshake.
#[derive(Debug)]
pub enum AuthError {
    /// The sealed certificate envelope did not parse or verify.
    EnvelopeRejected(TrustError),
    /// No envelope seal was produced by a trusted CA.
    SignerNotTrusted,
    /// The sealed certificate does not match any TLS peer certificate.
    PeerCertificateMismatch,
    /// The exchanged certificate failed trust-context verification.
    Untrusted(TrustError),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::EnvelopeRejected(e) => write!(f, "sealed certificate rejected: {}", e),
            AuthError::SignerNotTrusted => {
                write!(f, "no envelope seal from a trusted CA")
            }
            AuthError::PeerCertificateMismatch => {
                write!(f, "sealed certificate does not match the TLS peer")
            }
            AuthError::Untrusted(e) => write!(f, "peer certificate not trusted: {}", e),
        }
    }
}

impl std::error::Error for AuthError {}

/// Failures raised by the wire factory and the handshake.
#[derive(Debug)]
pub enum ConnectError {
    /// URI scheme not recognised by the factory.
    UnsupportedProtocol(String),
    /// URI present but unusable (missing host or port, bad syntax).
    BadUri(String),
    /// A `wss` endpoint was named but no TLS context is available.
    TlsRequired,
    Io(std::io::Error),
    Codec(CodecError),
    Protocol(ProtocolError),
    Authentication(AuthError),
    /// TLS material missing or unusable for a `wss` endpoint.
    Trust(TrustError),
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::UnsupportedProtocol(scheme) => {
                write!(f, "unsupported protocol scheme: {}", scheme)
            }
            ConnectError::BadUri(what) => write!(f, "bad uri: {}", what),
            ConnectError::TlsRequired => {
                write!(f, "wss endpoint requires a TLS trust context")
            }
            ConnectError::Io(e) => write!(f, "connection i/o error: {}", e),
            ConnectError::Codec(e) => write!(f, "codec error: {}", e),
            ConnectError::Protocol(e) => write!(f, "protocol violation: {}", e),
            ConnectError::Authentication(e) => write!(f, "authentication failed: {}", e),
            ConnectError::Trust(e) => write!(f, "trust material unavailable: {}", e),
        }
    }
}

impl std::error::Error for ConnectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectError::Io(e) => Some(e),
            ConnectError::Codec(e) => Some(e),
            ConnectError::Protocol(e) => Some(e),
            ConnectError::Authentication(e) => Some(e),
            ConnectError::Trust(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConnectError {
    fn from(e: std::io::Error) -> ConnectError {
        ConnectError::Io(e)
    }
}

impl From<ProtocolError> for ConnectError {
    fn from(e: ProtocolError) -> ConnectError {
        ConnectError::Protocol(e)
    }
}

impl From<AuthError> for ConnectError {
    fn from(e: AuthError) -> ConnectError {
        ConnectError::Authentication(e)
    }
}

impl From<TrustError> for ConnectError {
    fn from(e: TrustError) -> ConnectError {
        ConnectError::Trust(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_round_trips_through_close_body() {
        let abort = Abort::with_description(close_code::TIMEOUT, "timeout", "pipe idle");
        let close = asterisque_core::Close::failure(1, abort.code, &abort.message, &abort.description);
        let restored = Abort::from_close_body(close.code, &close.body);
        assert_eq!(restored, abort);
    }

    #[test]
    fn malformed_close_body_still_yields_an_abort() {
        let abort = Abort::from_close_body(close_code::CANCELLED, &Value::Null);
        assert_eq!(abort.code, close_code::CANCELLED);
    }
}
