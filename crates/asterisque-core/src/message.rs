use std::collections::BTreeMap;

use crate::Value;

/// On-wire protocol version, major-minor packed into a u16 (`0x0100` = v1.0).
/// Peers whose major byte differs are rejected during the handshake.
pub const PROTOCOL_VERSION: u16 = 0x0100;

/// Default seconds between keepalive probes, negotiable per session.
pub const DEFAULT_PING_SECS: u32 = 10;

/// Default seconds of inbound silence before a session gives up.
pub const DEFAULT_SESSION_TIMEOUT_SECS: u32 = 30;

/// Default capacity of the inbound and outbound wire queues, in messages.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// One message on the wire, always associated with a single pipe id except
/// for [`Control`] messages.
///
/// For a given pipe the receiver observes exactly `Open?, Block*, Close`:
/// the `Open` only from the pipe's originator, blocks in send order per
/// direction, and `Close` terminal.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Open(Open),
    Block(Block),
    Close(Close),
    Control(Control),
}

impl Message {
    /// The pipe this message belongs to; `None` for control messages.
    pub fn pipe_id(&self) -> Option<u16> {
        match self {
            Message::Open(open) => Some(open.pipe_id),
            Message::Block(block) => Some(block.pipe_id),
            Message::Close(close) => Some(close.pipe_id),
            Message::Control(_) => None,
        }
    }
}

/// Starts a new pipe: one function call on the peer's service.
#[derive(Debug, Clone, PartialEq)]
pub struct Open {
    pub pipe_id: u16,
    /// Scheduling hint, -128..=127, default 0. Higher drains first.
    pub priority: i8,
    pub function_id: u16,
    pub params: Value,
}

impl Open {
    pub fn new(pipe_id: u16, function_id: u16, params: Value) -> Open {
        Open { pipe_id, priority: 0, function_id, params }
    }
}

/// One chunk of a pipe's ordered data stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub pipe_id: u16,
    /// 7-bit droppable hint: a receiver under pressure may drop any block
    /// whose loss is non-zero and must deliver every block whose loss is 0.
    pub loss: u8,
    pub payload: Vec<u8>,
    /// Terminates this direction of the stream. EOF blocks carry no payload.
    pub eof: bool,
}

impl Block {
    /// Largest payload a single block may carry (header margin subtracted
    /// from the 16-bit frame budget).
    pub const MAX_PAYLOAD: usize = 65_528;

    /// Largest value of the 7-bit loss field.
    pub const MAX_LOSS: u8 = 0x7F;

    pub fn new(pipe_id: u16, payload: Vec<u8>) -> Block {
        Block { pipe_id, loss: 0, payload, eof: false }
    }

    pub fn eof(pipe_id: u16) -> Block {
        Block { pipe_id, loss: 0, payload: Vec::new(), eof: true }
    }

    pub fn with_loss(pipe_id: u16, loss: u8, payload: Vec<u8>) -> Block {
        Block { pipe_id, loss: loss & Self::MAX_LOSS, payload, eof: false }
    }
}

/// Close result codes. The numeric values travel on the wire.
pub mod close_code {
    /// Call completed; the close body is the function result.
    pub const SUCCESS: u8 = 0;
    /// No service bound under the session's service id.
    pub const SERVICE_NOT_FOUND: u8 = 1;
    /// The service exists but does not expose the requested function.
    pub const FUNCTION_NOT_FOUND: u8 = 2;
    /// Session or pipe idle deadline expired.
    pub const TIMEOUT: u8 = 3;
    /// The originator cancelled the call.
    pub const CANCELLED: u8 = 4;
    /// The session shut down while the call was active.
    pub const SESSION_CLOSED: u8 = 5;
    /// Uncaught handler failure, body carries (code, message, description).
    pub const UNEXPECTED_ERROR: u8 = 0xFF;
}

/// Terminates a pipe with either a result or an error tuple.
#[derive(Debug, Clone, PartialEq)]
pub struct Close {
    pub pipe_id: u16,
    /// One of [`close_code`]; `SUCCESS` means `body` is the call result.
    pub code: u8,
    pub body: Value,
}

impl Close {
    pub fn success(pipe_id: u16, result: Value) -> Close {
        Close { pipe_id, code: close_code::SUCCESS, body: result }
    }

    /// Failure close. The body is the `(code, message, description)` error
    /// tuple delivered to the originator's result handle.
    pub fn failure(pipe_id: u16, code: u8, message: &str, description: &str) -> Close {
        Close {
            pipe_id,
            code,
            body: Value::List(vec![
                Value::Int32(code as i32),
                Value::String(message.to_string()),
                Value::String(description.to_string()),
            ]),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == close_code::SUCCESS
    }
}

/// Session-level messages, not associated with any pipe.
#[derive(Debug, Clone, PartialEq)]
pub enum Control {
    /// Handshake payload; the first message on every fresh wire.
    SyncSession(SyncSession),
    /// Graceful session shutdown.
    Close,
}

/// Handshake payload carried inside `Control(SyncSession)`.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSession {
    /// Packed major-minor protocol version.
    pub version: u16,
    /// Assigned by the primary; the secondary sends 0 and echoes the
    /// primary's pick in steady state.
    pub session_id: u64,
    /// Sender's wall clock, milliseconds since the UNIX epoch.
    pub utc_ms: u64,
    /// Signed envelope of the sender's certificate and attributes
    /// (canonical JSON bytes, see `asterisque-trust`).
    pub sealed_certificate: Vec<u8>,
    /// Service the sender wants to reach on the peer.
    pub service_id: String,
    /// Negotiable options, e.g. `ping` and `sessionTimeout` in seconds.
    pub config: BTreeMap<String, String>,
}

impl SyncSession {
    pub fn new(service_id: &str) -> SyncSession {
        SyncSession {
            version: PROTOCOL_VERSION,
            session_id: 0,
            utc_ms: 0,
            sealed_certificate: Vec::new(),
            service_id: service_id.to_string(),
            config: BTreeMap::new(),
        }
    }

    /// Config key for the keepalive interval, seconds.
    pub const CONFIG_PING: &'static str = "ping";

    /// Config key for the idle session timeout, seconds.
    pub const CONFIG_SESSION_TIMEOUT: &'static str = "sessionTimeout";
}

/// Saturating priority arithmetic for pipe scheduling hints.
pub mod priority {
    /// One step more urgent, saturating at `i8::MAX`.
    pub fn upper(p: i8) -> i8 {
        p.saturating_add(1)
    }

    /// One step less urgent, saturating at `i8::MIN`.
    pub fn lower(p: i8) -> i8 {
        p.saturating_sub(1)
    }
}

/// Pipe-id space helpers. The accepting ("primary") side of a connection
/// allocates ids with the MSB set, the connecting side ids with the MSB
/// clear, so the two ends can never collide without negotiation.
pub mod pipe_id {
    /// Mask of the originator bit.
    pub const PRIMARY_MASK: u16 = 0x8000;

    /// True if the id was allocated by the primary (accepting) side.
    pub fn is_primary(id: u16) -> bool {
        id & PRIMARY_MASK != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_saturates() {
        assert_eq!(priority::upper(0), 1);
        assert_eq!(priority::upper(i8::MAX), i8::MAX);
        assert_eq!(priority::lower(0), -1);
        assert_eq!(priority::lower(i8::MIN), i8::MIN);
    }

    #[test]
    fn pipe_id_partition() {
        assert!(pipe_id::is_primary(0x8000));
        assert!(pipe_id::is_primary(0xFFFF));
        assert!(!pipe_id::is_primary(0x0001));
        assert!(!pipe_id::is_primary(0x7FFF));
    }

    #[test]
    fn close_failure_body_is_error_tuple() {
        let close = Close::failure(7, close_code::TIMEOUT, "timeout", "pipe idle too long");
        assert!(!close.is_success());
        match &close.body {
            Value::List(items) => {
                assert_eq!(items[0], Value::Int32(close_code::TIMEOUT as i32));
                assert_eq!(items[1], Value::String("timeout".to_string()));
            }
            other => panic!("expected error tuple, got {:?}", other),
        }
    }

    #[test]
    fn block_loss_is_masked_to_seven_bits() {
        let block = Block::with_loss(1, 0xFF, vec![1]);
        assert_eq!(block.loss, 0x7F);
    }
}
