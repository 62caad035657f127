//! asterisque: a bidirectional, multiplexed RPC runtime over framed
//! transports.
//!
//! Once a connection is established either end may initiate calls. Each call
//! runs on a logical pipe carrying the request, an ordered stream of data
//! blocks in either direction, and one terminating result. A [`Node`] serves
//! any number of wires: it exchanges signed peer identities during the
//! `SyncSession` handshake, negotiates session parameters, and routes
//! messages between pipes and registered [`Service`] functions.
//!
//! ```no_run
//! use asterisque::{Node, NodeOptions, Service};
//! use asterisque_core::Value;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let node = Node::new(NodeOptions { service_id: "echo".to_string(), ..Default::default() });
//! node.register_service(
//!     "echo",
//!     Service::new().func(1, |_pipe, params| async move { Ok(params) }),
//! );
//! let session = node.connect("ws://127.0.0.1:9966/").await?;
//! let pipe = session.open(1, Value::from("XYZ")).await?;
//! let result = pipe.result().await?;
//! # let _ = result;
//! # Ok(())
//! # }
//! ```

mod error;
mod node;
mod pipe;
mod service;
mod session;
pub mod transport;

pub use error::*;
pub use node::*;
pub use pipe::{PIPE_BUFFER_CAPACITY, Pipe, PipeState};
pub use service::*;
pub use session::{Session, SessionOptions};

// The message model and flow-control primitives are part of the public
// surface; re-export the core crate wholesale.
pub use asterisque_core as core;
pub use asterisque_trust as trust;
