//! Bounded message FIFO with edge-triggered pollable/offerable notifications.
//!
//! The queue is the back-pressure boundary between a transport driver and the
//! session router: `offer` refuses when full, `poll` drains, and the two
//! listener families fire exactly once per empty/non-empty and full/non-full
//! transition. Async producers and consumers use [`push`](MessageQueue::push)
//! and [`pop`](MessageQueue::pop), which suspend instead of refusing.

use std::collections::{HashSet, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::Message;

/// Callback invoked on an empty/non-empty or full/non-full transition.
pub type QueueListener = Arc<dyn Fn(&MessageQueue, bool) + Send + Sync>;

/// Handle used to remove a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

enum Offer {
    Accepted,
    /// Queue at capacity; the message is handed back for a later retry.
    Full(Message),
    Closed,
}

struct QueueState {
    deque: VecDeque<(i8, Message)>,
    closed: bool,
    /// Set once the closed queue has drained and fired its final
    /// `pollable(false)`.
    drained: bool,
    pollable: Vec<(ListenerId, QueueListener)>,
    offerable: Vec<(ListenerId, QueueListener)>,
}

struct QueueInner {
    capacity: usize,
    state: Mutex<QueueState>,
    readable: Notify,
    writable: Notify,
    next_listener: AtomicU64,
}

/// A bounded FIFO of messages, cheap to clone (all clones share state).
///
/// The wire's outbound queue is priority-aware: entries offered through
/// [`offer_prio`](MessageQueue::offer_prio) are polled highest-priority
/// first, FIFO among equals. Per-pipe order is preserved unconditionally:
/// only the eldest queued message of each pipe is eligible on a poll.
#[derive(Clone)]
pub struct MessageQueue {
    inner: Arc<QueueInner>,
}

impl MessageQueue {
    pub fn new(capacity: usize) -> MessageQueue {
        assert!(capacity > 0, "queue capacity must be positive");
        MessageQueue {
            inner: Arc::new(QueueInner {
                capacity,
                state: Mutex::new(QueueState {
                    deque: VecDeque::with_capacity(capacity.min(64)),
                    closed: false,
                    drained: false,
                    pollable: Vec::new(),
                    offerable: Vec::new(),
                }),
                readable: Notify::new(),
                writable: Notify::new(),
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().deque.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Non-blocking enqueue at priority 0. Returns false when full or closed.
    pub fn offer(&self, msg: Message) -> bool {
        matches!(self.try_offer(msg, 0), Offer::Accepted)
    }

    /// Non-blocking enqueue with an explicit scheduling priority.
    pub fn offer_prio(&self, msg: Message, priority: i8) -> bool {
        matches!(self.try_offer(msg, priority), Offer::Accepted)
    }

    fn try_offer(&self, msg: Message, priority: i8) -> Offer {
        let notify;
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Offer::Closed;
            }
            if state.deque.len() >= self.inner.capacity {
                return Offer::Full(msg);
            }
            let was_empty = state.deque.is_empty();
            state.deque.push_back((priority, msg));
            let now_full = state.deque.len() >= self.inner.capacity;
            notify = Notifications {
                pollable: was_empty.then(|| (state.pollable.clone(), true)),
                offerable: now_full.then(|| (state.offerable.clone(), false)),
            };
        }
        self.fire(notify);
        self.inner.readable.notify_waiters();
        Offer::Accepted
    }

    /// Non-blocking removal of the highest-priority message, FIFO among
    /// equals. A closed queue can still be polled until it drains.
    pub fn poll(&self) -> Option<Message> {
        let (msg, notify);
        {
            let mut state = self.inner.state.lock();
            let index = best_index(&state.deque)?;
            let was_full = state.deque.len() >= self.inner.capacity;
            msg = state.deque.remove(index).map(|(_, m)| m)?;
            let now_empty = state.deque.is_empty();
            let final_drain = now_empty && state.closed && !state.drained;
            if final_drain {
                state.drained = true;
            }
            notify = Notifications {
                pollable: (now_empty && (!state.closed || final_drain))
                    .then(|| (state.pollable.clone(), false)),
                offerable: (was_full && !state.closed).then(|| (state.offerable.clone(), true)),
            };
            if final_drain {
                state.pollable.clear();
                state.offerable.clear();
            }
        }
        self.fire(notify);
        self.inner.writable.notify_waiters();
        Some(msg)
    }

    /// Enqueue, suspending while the queue is full. Returns false if the
    /// queue closed before the message was accepted.
    pub async fn push(&self, msg: Message) -> bool {
        self.push_prio(msg, 0).await
    }

    pub async fn push_prio(&self, msg: Message, priority: i8) -> bool {
        let mut msg = msg;
        loop {
            // Register interest before the offer attempt so a poll() racing
            // between the attempt and the await cannot be lost.
            let notified = self.inner.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            match self.try_offer(msg, priority) {
                Offer::Accepted => return true,
                Offer::Closed => return false,
                Offer::Full(returned) => {
                    msg = returned;
                    notified.await;
                }
            }
        }
    }

    /// Dequeue, suspending while the queue is empty. `None` once the queue
    /// is closed and drained.
    pub async fn pop(&self) -> Option<Message> {
        loop {
            let notified = self.inner.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(msg) = self.poll() {
                return Some(msg);
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    /// Close the queue: further offers are refused, waiters wake, and the
    /// remaining contents stay pollable until drained.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            // An already-empty queue fired its pollable(false) when it last
            // drained; otherwise poll() fires the final edge on the last
            // message out.
            if state.deque.is_empty() {
                state.drained = true;
                state.pollable.clear();
                state.offerable.clear();
            }
        }
        self.inner.readable.notify_waiters();
        self.inner.writable.notify_waiters();
    }

    /// Register an empty/non-empty transition listener.
    pub fn on_pollable(&self, listener: QueueListener) -> ListenerId {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        self.inner.state.lock().pollable.push((id, listener));
        id
    }

    /// Register a full/non-full transition listener.
    pub fn on_offerable(&self, listener: QueueListener) -> ListenerId {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        self.inner.state.lock().offerable.push((id, listener));
        id
    }

    /// Remove a listener registered with either family. Safe to call from
    /// inside a listener callback.
    pub fn remove_listener(&self, id: ListenerId) {
        let mut state = self.inner.state.lock();
        state.pollable.retain(|(lid, _)| *lid != id);
        state.offerable.retain(|(lid, _)| *lid != id);
    }

    fn fire(&self, notifications: Notifications) {
        if let Some((listeners, flag)) = notifications.pollable {
            self.fire_list(&listeners, flag);
        }
        if let Some((listeners, flag)) = notifications.offerable {
            self.fire_list(&listeners, flag);
        }
    }

    // Listeners run outside the state lock on a copy of the registration
    // list, so callbacks may add or remove listeners freely. Panics are
    // logged and swallowed.
    fn fire_list(&self, listeners: &[(ListenerId, QueueListener)], flag: bool) {
        for (_, listener) in listeners {
            let result = catch_unwind(AssertUnwindSafe(|| listener(self, flag)));
            if result.is_err() {
                tracing::warn!("queue listener panicked; continuing");
            }
        }
    }

}

struct Notifications {
    pollable: Option<(Vec<(ListenerId, QueueListener)>, bool)>,
    offerable: Option<(Vec<(ListenerId, QueueListener)>, bool)>,
}

/// Index of the highest-priority entry, earliest among equals. Only the
/// eldest queued message of each pipe competes, so messages of one pipe
/// never overtake each other even when the pipe's priority changes
/// mid-stream.
fn best_index(deque: &VecDeque<(i8, Message)>) -> Option<usize> {
    let mut best: Option<(usize, i8)> = None;
    let mut seen_pipes: HashSet<u16> = HashSet::new();
    for (index, (priority, msg)) in deque.iter().enumerate() {
        if let Some(pipe) = msg.pipe_id() {
            if !seen_pipes.insert(pipe) {
                continue;
            }
        }
        match best {
            Some((_, p)) if *priority <= p => {}
            _ => best = Some((index, *priority)),
        }
    }
    best.map(|(index, _)| index)
}
