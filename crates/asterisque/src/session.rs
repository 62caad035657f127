//! Sessions: the long-lived, authenticated state attached to one wire.
//!
//! A session owns pipe-id allocation, message routing and service dispatch.
//! Routing runs on a single cooperative task per session so per-pipe
//! ordering holds; service handlers execute on spawned tasks. Pipe
//! back-pressure reaches the wire through the router: delivering into a full
//! pipe buffer suspends the router, which stops polling the wire's inbound
//! queue, which stops the transport driver's reads once that queue fills.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use futures::FutureExt;
use parking_lot::Mutex;

use asterisque_core::{
    CircuitBreaker, Close, Control, DEFAULT_PING_SECS, DEFAULT_SESSION_TIMEOUT_SECS, Message, Open,
    ProtocolError, SyncSession, Value, Wire, close_code, pipe_id,
};

use crate::pipe::{PipeShared, PipeTable};
use crate::{Abort, Pipe, Service};

/// Options negotiated during the handshake: the smaller of the two peers'
/// proposals wins for each value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub ping: Duration,
    pub session_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> SessionOptions {
        SessionOptions {
            ping: Duration::from_secs(DEFAULT_PING_SECS as u64),
            session_timeout: Duration::from_secs(DEFAULT_SESSION_TIMEOUT_SECS as u64),
        }
    }
}

/// Combine both peers' config proposals.
pub(crate) fn negotiate_options(local: &SyncSession, peer: &SyncSession) -> SessionOptions {
    fn secs(sync: &SyncSession, key: &str, default: u64) -> u64 {
        sync.config.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }
    let ping = secs(local, SyncSession::CONFIG_PING, DEFAULT_PING_SECS as u64)
        .min(secs(peer, SyncSession::CONFIG_PING, DEFAULT_PING_SECS as u64));
    let timeout =
        secs(local, SyncSession::CONFIG_SESSION_TIMEOUT, DEFAULT_SESSION_TIMEOUT_SECS as u64).min(
            secs(peer, SyncSession::CONFIG_SESSION_TIMEOUT, DEFAULT_SESSION_TIMEOUT_SECS as u64),
        );
    SessionOptions {
        ping: Duration::from_secs(ping),
        session_timeout: Duration::from_secs(timeout),
    }
}

/// Soft watermark of concurrent pipes before the session logs overload.
const SOFT_LOAD_PIPES: usize = 512;

/// Hard watermark of concurrent pipes; beyond it the breaker trips and the
/// session sheds further calls.
const HARD_LOAD_PIPES: usize = 4096;

struct SessionInner {
    id: u64,
    wire: Wire,
    primary: bool,
    local: SyncSession,
    peer: SyncSession,
    options: SessionOptions,
    /// Local service resolved for the peer's requested service id.
    service: Option<Arc<Service>>,
    pipes: Arc<PipeTable>,
    next_pipe: Mutex<u16>,
    accepting: AtomicBool,
    closed: AtomicBool,
    last_inbound: Mutex<Instant>,
    /// Advisory per-session load signal, one unit per active pipe.
    load: Arc<CircuitBreaker>,
}

struct LoadLogger {
    session: u64,
}

impl asterisque_core::BreakerListener for LoadLogger {
    fn overload(&self, overloaded: bool) {
        if overloaded {
            tracing::warn!(session = self.session, "session overloaded");
        } else {
            tracing::info!(session = self.session, "session load back to normal");
        }
    }

    fn broken(&self) {
        tracing::error!(session = self.session, "session load past hard limit, shedding calls");
    }
}

/// One authenticated session over one wire. Clones share state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Create the session and spawn its router task. Used by the node after
    /// a completed handshake.
    pub(crate) fn start(
        wire: Wire,
        id: u64,
        local: SyncSession,
        peer: SyncSession,
        service: Option<Arc<Service>>,
        options: SessionOptions,
    ) -> Session {
        let primary = wire.is_primary();
        let load = Arc::new(CircuitBreaker::new(SOFT_LOAD_PIPES, HARD_LOAD_PIPES));
        load.add_listener(Arc::new(LoadLogger { session: id }));
        let inner = Arc::new(SessionInner {
            id,
            wire: wire.clone(),
            primary,
            local,
            peer,
            options,
            service,
            pipes: Arc::new(Mutex::new(HashMap::new())),
            next_pipe: Mutex::new(0),
            accepting: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            last_inbound: Mutex::new(Instant::now()),
            load,
        });

        tokio::spawn(run_router(inner.clone()));
        tracing::debug!(session = id, primary, "session started");
        Session { inner }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn is_primary(&self) -> bool {
        self.inner.primary
    }

    pub fn options(&self) -> SessionOptions {
        self.inner.options
    }

    /// Service id this side asked the peer for.
    pub fn service_id(&self) -> &str {
        &self.inner.local.service_id
    }

    /// Service id the peer asked this side for.
    pub fn peer_service_id(&self) -> &str {
        &self.inner.peer.service_id
    }

    /// The peer's sealed certificate envelope, as exchanged.
    pub fn peer_sealed_certificate(&self) -> &[u8] {
        &self.inner.peer.sealed_certificate
    }

    pub fn wire(&self) -> &Wire {
        &self.inner.wire
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn active_pipes(&self) -> usize {
        self.inner.pipes.lock().len()
    }

    /// The session's advisory load signal: one unit per active pipe.
    pub fn load(&self) -> &CircuitBreaker {
        &self.inner.load
    }

    /// Open a pipe at default priority and send `Open` to the peer.
    pub async fn open(&self, function_id: u16, params: Value) -> Result<Pipe, Abort> {
        self.open_with_priority(0, function_id, params).await
    }

    pub async fn open_with_priority(
        &self,
        priority: i8,
        function_id: u16,
        params: Value,
    ) -> Result<Pipe, Abort> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) || !inner.accepting.load(Ordering::Acquire) {
            return Err(Abort::session_closed());
        }
        if inner.load.is_broken() {
            return Err(Abort::unexpected("session load past hard limit"));
        }
        let shared = {
            let mut pipes = inner.pipes.lock();
            let id = allocate_pipe_id(inner, &pipes)
                .ok_or_else(|| Abort::unexpected("pipe id space exhausted"))?;
            let shared = PipeShared::new_originator(
                id,
                priority,
                function_id,
                inner.wire.outbound().clone(),
                Arc::downgrade(&inner.pipes),
                Some(inner.load.clone()),
            );
            pipes.insert(id, shared.clone());
            shared
        };
        let open = Open { pipe_id: shared.id(), priority, function_id, params };
        if !inner.wire.outbound().push_prio(Message::Open(open), priority).await {
            shared.fail_local(Abort::session_closed());
            return Err(Abort::session_closed());
        }
        Ok(Pipe { shared })
    }

    /// Graceful local shutdown: announce `Control(Close)`, resolve every
    /// active pipe with `SessionClosed`, flush and close the wire.
    pub fn close(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            if inner.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            inner.accepting.store(false, Ordering::Release);
            inner.wire.outbound().push(Message::Control(Control::Close)).await;
            fail_all_pipes(&inner, Abort::session_closed());
            inner.wire.close();
            tracing::debug!(session = inner.id, "session closed locally");
        });
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("primary", &self.inner.primary)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Resolve every active pipe with `abort` and drop the table contents.
fn fail_all_pipes(inner: &Arc<SessionInner>, abort: Abort) {
    let pipes: Vec<Arc<PipeShared>> = inner.pipes.lock().drain().map(|(_, p)| p).collect();
    for pipe in pipes {
        pipe.fail_local(abort.clone());
    }
}

fn allocate_pipe_id(
    inner: &SessionInner,
    pipes: &HashMap<u16, Arc<PipeShared>>,
) -> Option<u16> {
    let mask = if inner.primary { pipe_id::PRIMARY_MASK } else { 0 };
    let mut counter = inner.next_pipe.lock();
    // Strictly increasing with wrap-around, skipping ids still active.
    for _ in 0..=0x7FFFu16 {
        let id = (*counter & 0x7FFF) | mask;
        *counter = counter.wrapping_add(1);
        if !pipes.contains_key(&id) {
            return Some(id);
        }
    }
    None
}

async fn run_router(inner: Arc<SessionInner>) {
    loop {
        let deadline = {
            let last = *inner.last_inbound.lock();
            tokio::time::Instant::from_std(last + inner.options.session_timeout)
        };
        tokio::select! {
            msg = inner.wire.inbound().pop() => match msg {
                Some(msg) => {
                    *inner.last_inbound.lock() = Instant::now();
                    match dispatch(&inner, msg).await {
                        Ok(()) => {
                            if inner.closed.load(Ordering::Acquire) {
                                return;
                            }
                        }
                        Err(violation) => {
                            tracing::warn!(
                                session = inner.id,
                                error = %violation,
                                "protocol violation, closing wire"
                            );
                            inner.closed.store(true, Ordering::Release);
                            inner.wire.close();
                            return;
                        }
                    }
                }
                None => {
                    // Wire closed and its inbound queue drained: everything
                    // the peer managed to say has been dispatched. Cancel
                    // whatever is still open.
                    inner.closed.store(true, Ordering::Release);
                    inner.accepting.store(false, Ordering::Release);
                    fail_all_pipes(&inner, Abort::cancelled());
                    return;
                }
            },
            _ = tokio::time::sleep_until(deadline) => {
                timeout_shutdown(&inner).await;
                return;
            }
        }
    }
}

async fn dispatch(inner: &Arc<SessionInner>, msg: Message) -> Result<(), ProtocolError> {
    match msg {
        Message::Open(open) => dispatch_open(inner, open).await,
        Message::Block(block) => {
            let pipe = inner.pipes.lock().get(&block.pipe_id).cloned();
            match pipe {
                Some(pipe) => {
                    // Delivery suspends on a full pipe buffer; a wire death
                    // must still unpark the router.
                    tokio::select! {
                        biased;
                        _ = pipe.deliver_block(block) => {}
                        _ = inner.wire.closed() => {}
                    }
                }
                None => {
                    tracing::trace!(pipe = block.pipe_id, "dropping block for unknown pipe");
                }
            }
            Ok(())
        }
        Message::Close(close) => {
            let pipe = inner.pipes.lock().remove(&close.pipe_id);
            match pipe {
                Some(pipe) => pipe.complete_remote(close),
                None => {
                    tracing::trace!(pipe = close.pipe_id, "dropping close for unknown pipe");
                }
            }
            Ok(())
        }
        Message::Control(Control::Close) => {
            graceful_shutdown(inner).await;
            Ok(())
        }
        Message::Control(Control::SyncSession(_)) => {
            tracing::warn!(session = inner.id, "ignoring SyncSession after handshake");
            Ok(())
        }
    }
}

async fn dispatch_open(inner: &Arc<SessionInner>, open: Open) -> Result<(), ProtocolError> {
    if inner.pipes.lock().contains_key(&open.pipe_id) {
        return Err(ProtocolError::DuplicatePipe(open.pipe_id));
    }
    if !inner.accepting.load(Ordering::Acquire) {
        let close = Close::failure(
            open.pipe_id,
            close_code::SESSION_CLOSED,
            "session closing",
            "",
        );
        inner.wire.outbound().push(Message::Close(close)).await;
        return Ok(());
    }
    if inner.load.is_broken() {
        let close = Close::failure(
            open.pipe_id,
            close_code::UNEXPECTED_ERROR,
            "session overloaded",
            "",
        );
        inner.wire.outbound().push(Message::Close(close)).await;
        return Ok(());
    }

    let handler = match &inner.service {
        None => {
            let close = Close::failure(
                open.pipe_id,
                close_code::SERVICE_NOT_FOUND,
                "service not found",
                &inner.peer.service_id,
            );
            inner.wire.outbound().push(Message::Close(close)).await;
            return Ok(());
        }
        Some(service) => match service.lookup(open.function_id) {
            None => {
                let close = Close::failure(
                    open.pipe_id,
                    close_code::FUNCTION_NOT_FOUND,
                    "function not found",
                    &format!("function {}", open.function_id),
                );
                inner.wire.outbound().push(Message::Close(close)).await;
                return Ok(());
            }
            Some(handler) => handler,
        },
    };

    let shared = PipeShared::new_responder(
        open.pipe_id,
        open.priority,
        open.function_id,
        inner.wire.outbound().clone(),
        Arc::downgrade(&inner.pipes),
        Some(inner.load.clone()),
    );
    inner.pipes.lock().insert(open.pipe_id, shared.clone());

    let pipe = Pipe { shared: shared.clone() };
    let outbound = inner.wire.outbound().clone();
    tokio::spawn(async move {
        let result = std::panic::AssertUnwindSafe(handler(pipe, open.params))
            .catch_unwind()
            .await;
        if shared.is_closed() {
            // Cancelled while running; the originator already observed an
            // end for this pipe.
            return;
        }
        let close = match result {
            Ok(Ok(value)) => Close::success(shared.id(), value),
            Ok(Err(abort)) => {
                Close::failure(shared.id(), abort.code, &abort.message, &abort.description)
            }
            Err(_) => {
                tracing::error!(pipe = shared.id(), "service handler panicked");
                Close::failure(
                    shared.id(),
                    close_code::UNEXPECTED_ERROR,
                    "service handler panicked",
                    "",
                )
            }
        };
        outbound.push_prio(Message::Close(close), shared.priority_value()).await;
        shared.complete_local();
    });
    Ok(())
}

/// Peer asked for a graceful end: resolve every pipe with `SessionClosed`,
/// let the driver flush, close the wire.
async fn graceful_shutdown(inner: &Arc<SessionInner>) {
    if inner.closed.swap(true, Ordering::AcqRel) {
        return;
    }
    inner.accepting.store(false, Ordering::Release);
    let pipes: Vec<Arc<PipeShared>> = inner.pipes.lock().drain().map(|(_, p)| p).collect();
    for pipe in pipes {
        let close =
            Close::failure(pipe.id(), close_code::SESSION_CLOSED, "session closed", "");
        inner.wire.outbound().push_prio(Message::Close(close), pipe.priority_value()).await;
        pipe.fail_local(Abort::session_closed());
    }
    // Closing the wire refuses new messages but lets the driver drain what
    // is already queued.
    inner.wire.close();
    tracing::debug!(session = inner.id, "session closed by peer");
}

async fn timeout_shutdown(inner: &Arc<SessionInner>) {
    if inner.closed.swap(true, Ordering::AcqRel) {
        return;
    }
    inner.accepting.store(false, Ordering::Release);
    tracing::warn!(session = inner.id, "session idle past timeout, closing");
    let pipes: Vec<Arc<PipeShared>> = inner.pipes.lock().drain().map(|(_, p)| p).collect();
    for pipe in pipes {
        let close = Close::failure(pipe.id(), close_code::TIMEOUT, "session timeout", "");
        inner.wire.outbound().push_prio(Message::Close(close), pipe.priority_value()).await;
        pipe.fail_local(Abort::timeout());
    }
    inner.wire.outbound().push(Message::Control(Control::Close)).await;
    inner.wire.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn sync_with(ping: &str, timeout: &str) -> SyncSession {
        let mut sync = SyncSession::new("svc");
        let mut config = BTreeMap::new();
        config.insert(SyncSession::CONFIG_PING.to_string(), ping.to_string());
        config.insert(SyncSession::CONFIG_SESSION_TIMEOUT.to_string(), timeout.to_string());
        sync.config = config;
        sync
    }

    #[test]
    fn negotiation_takes_the_smaller_of_both_proposals() {
        let local = sync_with("10", "30");
        let peer = sync_with("4", "60");
        let options = negotiate_options(&local, &peer);
        assert_eq!(options.ping, Duration::from_secs(4));
        assert_eq!(options.session_timeout, Duration::from_secs(30));
    }

    #[test]
    fn negotiation_falls_back_to_defaults() {
        let local = SyncSession::new("svc");
        let peer = SyncSession::new("svc");
        let options = negotiate_options(&local, &peer);
        assert_eq!(options, SessionOptions::default());
    }

    #[test]
    fn unparseable_config_values_use_defaults() {
        let local = sync_with("not-a-number", "30");
        let peer = sync_with("10", "30");
        let options = negotiate_options(&local, &peer);
        assert_eq!(options.ping, Duration::from_secs(DEFAULT_PING_SECS as u64).min(Duration::from_secs(10)));
    }
}
