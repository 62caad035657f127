//! Transport drivers: the tasks that move bytes between a [`Wire`]'s queues
//! and a concrete byte channel.
//!
//! Each driver runs one read task and one write task. The read task feeds a
//! restartable [`FrameDecoder`] and offers decoded messages into the wire's
//! inbound queue, suspending (and therefore pausing reads) while the queue
//! is full. The write task drains the outbound queue highest-priority first
//! and encodes onto the channel. A decode failure or a magic mismatch closes
//! the wire.

use asterisque_core::{FrameDecoder, STREAM_MAGIC, Wire};

#[cfg(feature = "websocket")]
mod factory;
#[cfg(feature = "stream")]
mod stream;
#[cfg(feature = "tls")]
pub(crate) mod tls;
#[cfg(feature = "websocket")]
pub(crate) mod websocket;

#[cfg(feature = "websocket")]
pub(crate) use factory::*;
#[cfg(feature = "stream")]
pub use stream::*;
#[cfg(feature = "websocket")]
pub use websocket::spawn_ws_driver;

/// Verify the stream magic once, then drain every complete message out of
/// the decoder into the wire. `Err` means the wire must close.
pub(crate) async fn pump_decoder(
    wire: &Wire,
    decoder: &mut FrameDecoder,
    magic_checked: &mut bool,
) -> Result<(), ()> {
    if !*magic_checked {
        let buffered = decoder.buffered();
        if buffered.len() < 2 {
            return Ok(());
        }
        if buffered[..2] != STREAM_MAGIC {
            tracing::warn!(
                got = ?&buffered[..2],
                "stream does not start with the *Q magic"
            );
            return Err(());
        }
        *magic_checked = true;
    }
    loop {
        match decoder.next() {
            Ok(Some(msg)) => {
                if !wire.inbound().push(msg).await {
                    return Err(());
                }
            }
            Ok(None) => return Ok(()),
            Err(e) => {
                tracing::warn!(error = %e, "inbound decode failed");
                return Err(());
            }
        }
    }
}
