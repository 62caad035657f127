//! Core types for asterisque: the message model, the self-describing binary
//! codec, bounded message queues with edge-triggered notifications, the
//! [`Wire`] abstraction that binds a transport to a pair of queues, and the
//! flow-control primitives ([`Latch`], [`CircuitBreaker`]) used by the pipe
//! layer.
//!
//! This crate is transport-agnostic: the actual drivers (TCP streams,
//! WebSocket, TLS) live in the `asterisque` crate and only consume the codec
//! and queue surface defined here.

mod codec;
mod error;
mod flow;
mod message;
mod queue;
mod value;
mod wire;

pub use codec::*;
pub use error::*;
pub use flow::*;
pub use message::*;
pub use queue::*;
pub use value::*;
pub use wire::*;
