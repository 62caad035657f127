//! The [`Wire`]: a full-duplex framed channel bound to one transport.
//!
//! A wire owns nothing about the byte transport itself; a driver task (see
//! the `asterisque` crate) encodes messages popped from `outbound` onto the
//! byte channel and offers decoded inbound messages into `inbound`. The
//! queues are where back-pressure lives: a full `inbound` pauses the
//! driver's reads, an empty `outbound` pauses its writes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::{DEFAULT_QUEUE_CAPACITY, MessageQueue};

/// Negotiated TLS view of the peer, when the transport carries one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSession {
    /// Protocol name, e.g. `TLSv1.3`.
    pub protocol: String,
    /// Negotiated cipher suite name.
    pub cipher_suite: String,
    /// Peer certificate chain, leaf first, DER bytes.
    pub certificates: Vec<Vec<u8>>,
}

/// Callback fired exactly once when the wire closes.
pub type CloseListener = Arc<dyn Fn(&Wire) + Send + Sync>;

/// Handle used to remove a close listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseListenerId(u64);

struct WireInner {
    primary: bool,
    inbound: MessageQueue,
    outbound: MessageQueue,
    peer: Mutex<Option<PeerSession>>,
    closed: AtomicBool,
    closed_notify: Notify,
    close_listeners: Mutex<Vec<(CloseListenerId, CloseListener)>>,
    next_listener: AtomicU64,
}

/// A single framed channel bound to one transport connection.
///
/// `primary` is set by the accepting side; it selects the MSB half of the
/// pipe-id space and makes this side responsible for session-id generation
/// during the handshake.
#[derive(Clone)]
pub struct Wire {
    inner: Arc<WireInner>,
}

impl Wire {
    pub fn new(primary: bool, inbound_capacity: usize, outbound_capacity: usize) -> Wire {
        Wire {
            inner: Arc::new(WireInner {
                primary,
                inbound: MessageQueue::new(inbound_capacity),
                outbound: MessageQueue::new(outbound_capacity),
                peer: Mutex::new(None),
                closed: AtomicBool::new(false),
                closed_notify: Notify::new(),
                close_listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    /// A wire with the default queue capacities.
    pub fn with_defaults(primary: bool) -> Wire {
        Wire::new(primary, DEFAULT_QUEUE_CAPACITY, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn is_primary(&self) -> bool {
        self.inner.primary
    }

    /// Messages decoded from the peer.
    pub fn inbound(&self) -> &MessageQueue {
        &self.inner.inbound
    }

    /// Messages awaiting encoding to the peer.
    pub fn outbound(&self) -> &MessageQueue {
        &self.inner.outbound
    }

    /// The TLS view of the peer, `None` on plain transports.
    pub fn peer_session(&self) -> Option<PeerSession> {
        self.inner.peer.lock().clone()
    }

    /// Install the TLS view; called by the TLS driver after its handshake.
    pub fn set_peer_session(&self, peer: PeerSession) {
        *self.inner.peer.lock() = Some(peer);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Resolves once the wire has closed; immediately if it already has.
    pub async fn closed(&self) {
        loop {
            let notified = self.inner.closed_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    /// Close both queues and fire close listeners. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(primary = self.inner.primary, "wire closed");
        self.inner.inbound.close();
        self.inner.outbound.close();
        self.inner.closed_notify.notify_waiters();
        let listeners: Vec<CloseListener> = {
            let mut guard = self.inner.close_listeners.lock();
            guard.drain(..).map(|(_, l)| l).collect()
        };
        for listener in listeners {
            listener(self);
        }
    }

    /// Register a close listener. If the wire is already closed the listener
    /// fires immediately.
    pub fn on_close(&self, listener: CloseListener) -> CloseListenerId {
        if self.is_closed() {
            listener(self);
            return CloseListenerId(0);
        }
        let id = CloseListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        self.inner.close_listeners.lock().push((id, listener));
        id
    }

    pub fn remove_close_listener(&self, id: CloseListenerId) {
        self.inner.close_listeners.lock().retain(|(lid, _)| *lid != id);
    }
}

impl std::fmt::Debug for Wire {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wire")
            .field("primary", &self.inner.primary)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Control, Message};
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn close_is_idempotent_and_fires_once() {
        let wire = Wire::with_defaults(true);
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        wire.on_close(Arc::new(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        }));

        wire.close();
        wire.close();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(wire.is_closed());
    }

    #[test]
    fn close_closes_both_queues() {
        let wire = Wire::with_defaults(false);
        wire.close();
        assert!(!wire.outbound().offer(Message::Control(Control::Close)));
        assert!(!wire.inbound().offer(Message::Control(Control::Close)));
    }

    #[test]
    fn listener_added_after_close_fires_immediately() {
        let wire = Wire::with_defaults(true);
        wire.close();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        wire.on_close(Arc::new(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn peer_session_round_trip() {
        let wire = Wire::with_defaults(true);
        assert!(wire.peer_session().is_none());
        wire.set_peer_session(PeerSession {
            protocol: "TLSv1.3".to_string(),
            cipher_suite: "TLS13_AES_128_GCM_SHA256".to_string(),
            certificates: vec![vec![0x30]],
        });
        let peer = wire.peer_session().expect("peer session");
        assert_eq!(peer.protocol, "TLSv1.3");
    }
}
