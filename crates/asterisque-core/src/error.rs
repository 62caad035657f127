use std::fmt;

/// Errors raised while encoding or decoding messages.
///
/// A decoder that merely ran out of input does *not* produce a `CodecError`;
/// that outcome is reported as `Ok(None)` ("unsatisfied") so the caller can
/// retry once more bytes arrive. Every variant here is fatal for the frame
/// (and, on the inbound path, for the wire).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The encoded body would exceed the 16-bit length budget.
    MessageTooLarge(usize),
    /// A string or binary value exceeds 65 535 bytes.
    ValueTooLong(usize),
    /// A char does not fit in the u16 code-point field.
    CharOutOfRange(u32),
    /// Unknown message tag byte.
    UnknownTag(u8),
    /// Unknown control kind byte.
    UnknownControlKind(u8),
    /// Unknown value-type discriminator.
    UnknownValueType(u8),
    /// A string field did not hold valid UTF-8.
    InvalidUtf8,
    /// Structurally invalid body (wrong size, eof block with payload, ...).
    Malformed(&'static str),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::MessageTooLarge(len) => {
                write!(f, "message body of {} bytes exceeds the 16-bit frame limit", len)
            }
            CodecError::ValueTooLong(len) => {
                write!(f, "string/binary value of {} bytes exceeds 65535", len)
            }
            CodecError::CharOutOfRange(cp) => {
                write!(f, "char U+{:04X} does not fit in a u16 code point", cp)
            }
            CodecError::UnknownTag(tag) => write!(f, "unknown message tag 0x{:02X}", tag),
            CodecError::UnknownControlKind(kind) => {
                write!(f, "unknown control kind 0x{:02X}", kind)
            }
            CodecError::UnknownValueType(t) => {
                write!(f, "unknown value-type discriminator {}", t)
            }
            CodecError::InvalidUtf8 => write!(f, "string field is not valid UTF-8"),
            CodecError::Malformed(what) => write!(f, "malformed message: {}", what),
        }
    }
}

impl std::error::Error for CodecError {}

/// Handshake or routing violations that terminate the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The stream did not begin with the `*Q` magic.
    BadMagic([u8; 2]),
    /// The first message on a fresh wire was not `Control(SyncSession)`.
    HandshakeExpected,
    /// Peer speaks an incompatible major protocol version.
    VersionMismatch { local: u16, remote: u16 },
    /// An `Open` arrived for a pipe id that is already active.
    DuplicatePipe(u16),
    /// The wire closed before the handshake completed.
    WireClosed,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::BadMagic(bytes) => {
                write!(f, "stream magic mismatch: got {:02X} {:02X}", bytes[0], bytes[1])
            }
            ProtocolError::HandshakeExpected => {
                write!(f, "first message was not Control(SyncSession)")
            }
            ProtocolError::VersionMismatch { local, remote } => {
                write!(
                    f,
                    "incompatible protocol version: local {:04X}, remote {:04X}",
                    local, remote
                )
            }
            ProtocolError::DuplicatePipe(id) => {
                write!(f, "Open received for active pipe id {:04X}", id)
            }
            ProtocolError::WireClosed => write!(f, "wire closed during handshake"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_error_display() {
        let s = format!("{}", CodecError::MessageTooLarge(70000));
        assert!(s.contains("70000"));
        let s = format!("{}", CodecError::UnknownTag(0x7F));
        assert!(s.contains("7F"));
    }

    #[test]
    fn protocol_error_display() {
        let s = format!("{}", ProtocolError::VersionMismatch { local: 0x0100, remote: 0x0200 });
        assert!(s.contains("0100"));
        assert!(s.contains("0200"));
    }
}
