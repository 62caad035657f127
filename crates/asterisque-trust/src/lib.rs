//! Trust material for asterisque nodes.
//!
//! A [`TrustContext`] owns the on-disk bundle of a node's own key pair, the
//! trusted CA set (`ca/`) and the block-list (`blocked/`), watches the
//! directories through a lazy [`Cache`], verifies peer certificate paths and
//! produces the rustls configs the TLS carrier consumes. The [`Envelope`]
//! utility signs and verifies the canonical JSON form of handshake payloads.

mod cache;
mod context;
mod envelope;
mod error;

pub use cache::*;
pub use context::*;
pub use envelope::*;
pub use error::*;
