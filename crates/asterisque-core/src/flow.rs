//! Flow-control primitives: the per-direction pipe [`Latch`] and the
//! [`CircuitBreaker`] that turns queue depth into overload signals.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Cooperative pause gate.
///
/// `open()` clears the lock and wakes every waiter; `lock()` sets the lock
/// and returns true iff this call effected the transition. `exec` runs its
/// body only while unlocked, waiting otherwise. The pending-waiter count is
/// observable for diagnostics but carries no semantics.
pub struct Latch {
    locked: Mutex<bool>,
    waiters: AtomicUsize,
    notify: Notify,
}

impl Default for Latch {
    fn default() -> Latch {
        Latch::new()
    }
}

impl Latch {
    /// A new, unlocked latch.
    pub fn new() -> Latch {
        Latch { locked: Mutex::new(false), waiters: AtomicUsize::new(0), notify: Notify::new() }
    }

    /// Clear the lock and wake all waiters.
    pub fn open(&self) {
        *self.locked.lock() = false;
        self.notify.notify_waiters();
    }

    /// Set the lock. Returns true iff the latch was unlocked before.
    pub fn lock(&self) -> bool {
        let mut locked = self.locked.lock();
        if *locked {
            false
        } else {
            *locked = true;
            true
        }
    }

    pub fn is_locked(&self) -> bool {
        *self.locked.lock()
    }

    /// Number of callers currently suspended in [`exec`](Latch::exec).
    pub fn pending(&self) -> usize {
        self.waiters.load(Ordering::Acquire)
    }

    /// Run `body` once the latch is unlocked.
    pub async fn exec<F, R>(&self, body: F) -> R
    where
        F: FnOnce() -> R,
    {
        self.gate().await;
        body()
    }

    /// Wait until the latch is unlocked.
    pub async fn gate(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_locked() {
                return;
            }
            self.waiters.fetch_add(1, Ordering::AcqRel);
            notified.await;
            self.waiters.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Listener for [`CircuitBreaker`] transitions.
///
/// Callbacks run with the breaker's state lock held, so they must not call
/// back into the breaker.
pub trait BreakerListener: Send + Sync {
    /// Fired once when the load crosses the soft threshold in either
    /// direction.
    fn overload(&self, overloaded: bool);

    /// Fired exactly once when the load reaches the hard threshold. The
    /// breaker is broken from then on.
    fn broken(&self);
}

struct BreakerState {
    count: usize,
    overloaded: bool,
    broken: bool,
}

/// Soft/hard load watermark with edge-triggered notifications.
///
/// Callers bracket work items with `increment()`/`decrement()`. Crossing the
/// soft threshold upward fires `overload(true)`, crossing back down fires
/// `overload(false)`; reaching the hard threshold breaks the breaker
/// terminally and fires `broken()` once. Safe to drive from many threads.
pub struct CircuitBreaker {
    soft: usize,
    hard: usize,
    state: Mutex<BreakerState>,
    listeners: Mutex<Vec<Arc<dyn BreakerListener>>>,
}

impl CircuitBreaker {
    /// Requires `soft < hard`.
    pub fn new(soft: usize, hard: usize) -> CircuitBreaker {
        assert!(soft < hard, "soft threshold must be below hard threshold");
        CircuitBreaker {
            soft,
            hard,
            state: Mutex::new(BreakerState { count: 0, overloaded: false, broken: false }),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn BreakerListener>) {
        self.listeners.lock().push(listener);
    }

    /// Current load.
    pub fn load(&self) -> usize {
        self.state.lock().count
    }

    pub fn is_broken(&self) -> bool {
        self.state.lock().broken
    }

    pub fn is_overloaded(&self) -> bool {
        self.state.lock().overloaded
    }

    /// Record one more in-flight work item.
    pub fn increment(&self) {
        let mut state = self.state.lock();
        state.count += 1;
        if state.count >= self.hard && !state.broken {
            state.broken = true;
            for listener in self.listeners.lock().iter() {
                listener.broken();
            }
        } else if state.count > self.soft && !state.overloaded && !state.broken {
            state.overloaded = true;
            for listener in self.listeners.lock().iter() {
                listener.overload(true);
            }
        }
    }

    /// Record the completion of a work item.
    pub fn decrement(&self) {
        let mut state = self.state.lock();
        state.count = state.count.saturating_sub(1);
        if state.count <= self.soft && state.overloaded && !state.broken {
            state.overloaded = false;
            for listener in self.listeners.lock().iter() {
                listener.overload(false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn lock_reports_the_transition() {
        let latch = Latch::new();
        assert!(!latch.is_locked());
        assert!(latch.lock());
        assert!(!latch.lock());
        latch.open();
        assert!(latch.lock());
    }

    #[tokio::test]
    async fn exec_runs_immediately_when_unlocked() {
        let latch = Latch::new();
        let out = latch.exec(|| 42).await;
        assert_eq!(out, 42);
        assert_eq!(latch.pending(), 0);
    }

    #[tokio::test]
    async fn exec_waits_while_locked() {
        let latch = Arc::new(Latch::new());
        assert!(latch.lock());

        let l = latch.clone();
        let task = tokio::spawn(async move { l.exec(|| 7).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());
        assert_eq!(latch.pending(), 1);

        latch.open();
        assert_eq!(task.await.expect("join"), 7);
        assert_eq!(latch.pending(), 0);
    }

    struct CountingListener {
        overloads: AtomicUsize,
        reliefs: AtomicUsize,
        breaks: AtomicUsize,
    }

    impl CountingListener {
        fn new() -> Arc<CountingListener> {
            Arc::new(CountingListener {
                overloads: AtomicUsize::new(0),
                reliefs: AtomicUsize::new(0),
                breaks: AtomicUsize::new(0),
            })
        }
    }

    impl BreakerListener for CountingListener {
        fn overload(&self, overloaded: bool) {
            if overloaded {
                self.overloads.fetch_add(1, Ordering::SeqCst);
            } else {
                self.reliefs.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn broken(&self) {
            self.breaks.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn breaker_fires_each_soft_edge_once() {
        let breaker = CircuitBreaker::new(2, 10);
        let listener = CountingListener::new();
        breaker.add_listener(listener.clone());

        breaker.increment();
        breaker.increment();
        assert_eq!(listener.overloads.load(Ordering::SeqCst), 0);
        breaker.increment(); // 3 > soft
        assert_eq!(listener.overloads.load(Ordering::SeqCst), 1);
        breaker.increment();
        assert_eq!(listener.overloads.load(Ordering::SeqCst), 1);

        breaker.decrement();
        breaker.decrement(); // 2 <= soft
        assert_eq!(listener.reliefs.load(Ordering::SeqCst), 1);
        breaker.decrement();
        assert_eq!(listener.reliefs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn breaker_breaks_terminally_at_hard() {
        let breaker = CircuitBreaker::new(1, 3);
        let listener = CountingListener::new();
        breaker.add_listener(listener.clone());

        breaker.increment();
        breaker.increment();
        breaker.increment(); // hard
        assert!(breaker.is_broken());
        assert_eq!(listener.breaks.load(Ordering::SeqCst), 1);

        // Terminal: further movement produces no more edges.
        breaker.decrement();
        breaker.decrement();
        breaker.increment();
        assert_eq!(listener.breaks.load(Ordering::SeqCst), 1);
        assert!(breaker.is_broken());
    }

    #[test]
    fn breaker_is_safe_under_concurrent_load() {
        let breaker = Arc::new(CircuitBreaker::new(50, 1_000_000));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let b = breaker.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    b.increment();
                    b.decrement();
                }
            }));
        }
        for handle in handles {
            handle.join().expect("thread");
        }
        assert_eq!(breaker.load(), 0);
        assert!(!breaker.is_broken());
    }
}
