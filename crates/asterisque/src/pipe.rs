//! Pipes: one logical call multiplexed over a wire.
//!
//! A pipe carries an ordered block stream in each direction, terminated by
//! an EOF block, plus a single `Close` with the call result. The originator
//! holds the result handle; the responder side is handed to the service
//! handler. Back-pressure is a per-direction [`Latch`] for sends and a
//! bounded inbound buffer whose fullness pauses the session router.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use asterisque_core::{
    Block, CircuitBreaker, Close, Latch, Message, MessageQueue, Value, close_code, priority,
};

use crate::Abort;

/// Capacity of a pipe's inbound block buffer, in blocks.
pub const PIPE_BUFFER_CAPACITY: usize = 8;

/// Lifecycle of a pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeState {
    /// Originator sent `Open`, nothing heard back yet.
    Pending,
    /// Both ends exchanging blocks.
    Running,
    /// A close has been sent or received; streams still draining.
    Closing,
    /// Close observed and streams drained.
    Closed,
    /// Terminated by a protocol or transport failure.
    Failed,
}

pub(crate) type PipeTable = Mutex<HashMap<u16, Arc<PipeShared>>>;

pub(crate) struct PipeShared {
    id: u16,
    function_id: u16,
    originator: bool,
    priority: AtomicI8,
    state: Mutex<PipeState>,
    /// Inbound blocks, bounded; the router suspends on it when full.
    inbound: MessageQueue,
    /// Locked while the peer signals overload on our sending direction.
    send_latch: Latch,
    /// Locked to pause local consumption; advisory.
    recv_latch: Latch,
    eof_sent: AtomicBool,
    eof_received: AtomicBool,
    closed: AtomicBool,
    result_tx: Mutex<Option<oneshot::Sender<Result<Value, Abort>>>>,
    result_rx: Mutex<Option<oneshot::Receiver<Result<Value, Abort>>>>,
    /// The wire's outbound queue.
    outbound: MessageQueue,
    /// Back-reference into the owning session's pipe table; weak to break
    /// the session -> pipe -> session cycle.
    table: Weak<PipeTable>,
    /// Session-level load accounting; decremented exactly once on close.
    load: Option<Arc<CircuitBreaker>>,
}

impl PipeShared {
    pub(crate) fn new_originator(
        id: u16,
        pipe_priority: i8,
        function_id: u16,
        outbound: MessageQueue,
        table: Weak<PipeTable>,
        load: Option<Arc<CircuitBreaker>>,
    ) -> Arc<PipeShared> {
        let (tx, rx) = oneshot::channel();
        if let Some(load) = &load {
            load.increment();
        }
        Arc::new(PipeShared {
            id,
            function_id,
            originator: true,
            priority: AtomicI8::new(pipe_priority),
            state: Mutex::new(PipeState::Pending),
            inbound: MessageQueue::new(PIPE_BUFFER_CAPACITY),
            send_latch: Latch::new(),
            recv_latch: Latch::new(),
            eof_sent: AtomicBool::new(false),
            eof_received: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            result_tx: Mutex::new(Some(tx)),
            result_rx: Mutex::new(Some(rx)),
            outbound,
            table,
            load,
        })
    }

    pub(crate) fn new_responder(
        id: u16,
        pipe_priority: i8,
        function_id: u16,
        outbound: MessageQueue,
        table: Weak<PipeTable>,
        load: Option<Arc<CircuitBreaker>>,
    ) -> Arc<PipeShared> {
        if let Some(load) = &load {
            load.increment();
        }
        Arc::new(PipeShared {
            id,
            function_id,
            originator: false,
            priority: AtomicI8::new(pipe_priority),
            state: Mutex::new(PipeState::Running),
            inbound: MessageQueue::new(PIPE_BUFFER_CAPACITY),
            send_latch: Latch::new(),
            recv_latch: Latch::new(),
            eof_sent: AtomicBool::new(false),
            eof_received: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            result_tx: Mutex::new(None),
            result_rx: Mutex::new(None),
            outbound,
            table,
            load,
        })
    }

    pub(crate) fn id(&self) -> u16 {
        self.id
    }

    pub(crate) fn priority_value(&self) -> i8 {
        self.priority.load(Ordering::Acquire)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Responder-side terminal transition after its own close was sent.
    pub(crate) fn complete_local(&self) {
        self.finish(Ok(Value::Null), false);
    }

    /// Route one inbound block into this pipe.
    ///
    /// Blocks with a non-zero loss hint are dropped instead of waiting when
    /// the buffer is full; everything else suspends the caller (the session
    /// router), which is how pipe back-pressure reaches the wire.
    pub(crate) async fn deliver_block(&self, block: Block) {
        if self.is_closed() {
            tracing::trace!(pipe = self.id, "dropping block for closed pipe");
            return;
        }
        {
            let mut state = self.state.lock();
            if *state == PipeState::Pending {
                *state = PipeState::Running;
            }
        }
        if block.eof {
            self.eof_received.store(true, Ordering::Release);
        } else if block.loss > 0 {
            let accepted = self.inbound.offer(Message::Block(block));
            if !accepted {
                tracing::trace!(pipe = self.id, "dropped lossy block under pressure");
            }
            return;
        }
        self.inbound.push(Message::Block(block)).await;
    }

    /// Terminal close observed from the peer.
    pub(crate) fn complete_remote(&self, close: Close) {
        let result = if close.is_success() {
            Ok(close.body)
        } else {
            Err(Abort::from_close_body(close.code, &close.body))
        };
        self.finish(result, false);
    }

    /// Graceful local cancellation: the close family, not a failure.
    pub(crate) fn cancel_local(&self) {
        self.finish(Err(Abort::cancelled()), false);
    }

    /// Local failure without a peer close (wire death, timeout, shutdown).
    pub(crate) fn fail_local(&self, abort: Abort) {
        self.finish(Err(abort), true);
    }

    fn finish(&self, result: Result<Value, Abort>, failed: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(tx) = self.result_tx.lock().take() {
            let _ = tx.send(result);
        }
        self.send_latch.open();
        self.recv_latch.open();
        self.inbound.close();
        // A close with inbound blocks still buffered parks in Closing until
        // the consumer drains them; recv() promotes to Closed on the final
        // EOF or the drained-empty queue.
        let terminal = if failed {
            PipeState::Failed
        } else if self.inbound.is_empty() {
            PipeState::Closed
        } else {
            PipeState::Closing
        };
        *self.state.lock() = terminal;
        if let Some(load) = &self.load {
            load.decrement();
        }
        self.detach();
    }

    /// Closing -> Closed once the inbound stream has fully drained.
    fn promote_closed(&self) {
        let mut state = self.state.lock();
        if *state == PipeState::Closing {
            *state = PipeState::Closed;
        }
    }

    fn detach(&self) {
        if let Some(table) = self.table.upgrade() {
            table.lock().remove(&self.id);
        }
    }

    pub(crate) fn send_latch(&self) -> &Latch {
        &self.send_latch
    }
}

/// Handle to one running call. Clones share the underlying pipe.
#[derive(Clone)]
pub struct Pipe {
    pub(crate) shared: Arc<PipeShared>,
}

impl Pipe {
    pub fn id(&self) -> u16 {
        self.shared.id
    }

    pub fn function_id(&self) -> u16 {
        self.shared.function_id
    }

    pub fn is_originator(&self) -> bool {
        self.shared.originator
    }

    pub fn priority(&self) -> i8 {
        self.shared.priority.load(Ordering::Acquire)
    }

    /// Escalate this pipe's scheduling priority one step, saturating.
    pub fn raise_priority(&self) -> i8 {
        let p = priority::upper(self.priority());
        self.shared.priority.store(p, Ordering::Release);
        p
    }

    /// Deescalate one step, saturating.
    pub fn lower_priority(&self) -> i8 {
        let p = priority::lower(self.priority());
        self.shared.priority.store(p, Ordering::Release);
        p
    }

    pub fn state(&self) -> PipeState {
        *self.shared.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Count of senders parked behind the overload latch.
    pub fn pending_sends(&self) -> usize {
        self.shared.send_latch.pending()
    }

    /// Cooperatively pause this pipe's sends. Returns true iff this call
    /// effected the transition.
    pub fn pause_sending(&self) -> bool {
        self.shared.send_latch.lock()
    }

    /// Resume sends and wake everything parked in [`send`](Pipe::send).
    pub fn resume_sending(&self) {
        self.shared.send_latch.open();
    }

    /// Send a payload, split into maximum-size blocks as needed.
    pub async fn send(&self, payload: &[u8]) -> Result<(), Abort> {
        if payload.is_empty() {
            return self.send_block(0, Vec::new(), false).await;
        }
        for chunk in payload.chunks(Block::MAX_PAYLOAD) {
            self.send_block(0, chunk.to_vec(), false).await?;
        }
        Ok(())
    }

    /// Send one droppable block: a receiver under pressure may discard it.
    pub async fn send_lossy(&self, loss: u8, payload: &[u8]) -> Result<(), Abort> {
        if payload.len() > Block::MAX_PAYLOAD {
            return Err(Abort::unexpected("lossy block exceeds the block payload limit"));
        }
        self.send_block(loss.min(Block::MAX_LOSS), payload.to_vec(), false).await
    }

    /// Terminate this direction of the stream.
    pub async fn send_eof(&self) -> Result<(), Abort> {
        self.send_block(0, Vec::new(), true).await
    }

    async fn send_block(&self, loss: u8, payload: Vec<u8>, eof: bool) -> Result<(), Abort> {
        let shared = &self.shared;
        if shared.is_closed() {
            return Err(Abort::session_closed());
        }
        if shared.eof_sent.load(Ordering::Acquire) {
            return Err(Abort::unexpected("stream already ended"));
        }
        shared.send_latch.gate().await;
        if shared.is_closed() {
            return Err(Abort::session_closed());
        }
        if eof {
            shared.eof_sent.store(true, Ordering::Release);
        }
        let block = Block { pipe_id: shared.id, loss, payload, eof };
        let accepted =
            shared.outbound.push_prio(Message::Block(block), self.priority()).await;
        if accepted { Ok(()) } else { Err(Abort::session_closed()) }
    }

    /// Receive the next inbound payload; `None` once the peer's EOF (or the
    /// pipe's close) has been observed.
    pub async fn recv(&self) -> Option<Vec<u8>> {
        self.shared.recv_latch.gate().await;
        loop {
            match self.shared.inbound.pop().await {
                Some(Message::Block(block)) => {
                    if block.eof {
                        self.shared.inbound.close();
                        self.shared.promote_closed();
                        return None;
                    }
                    return Some(block.payload);
                }
                Some(_) => continue,
                None => {
                    self.shared.promote_closed();
                    return None;
                }
            }
        }
    }

    /// Await the call result. Only the originator holds a result; the handle
    /// yields it once.
    pub async fn result(&self) -> Result<Value, Abort> {
        let rx = self.shared.result_rx.lock().take();
        match rx {
            Some(rx) => rx.await.unwrap_or_else(|_| Err(Abort::session_closed())),
            None => Err(Abort::unexpected("no pending result on this pipe handle")),
        }
    }

    /// Cancel the call: the peer learns via `Close{Cancelled}`, local
    /// buffers drop, the result handle resolves with a cancellation.
    pub fn cancel(&self) {
        let shared = &self.shared;
        if shared.is_closed() {
            return;
        }
        let close = Close::failure(shared.id, close_code::CANCELLED, "call cancelled", "");
        let outbound = shared.outbound.clone();
        let prio = self.priority();
        if !outbound.offer_prio(Message::Close(close.clone()), prio) {
            tokio::spawn(async move {
                outbound.push_prio(Message::Close(close), prio).await;
            });
        }
        shared.cancel_local();
    }
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("id", &self.shared.id)
            .field("function_id", &self.shared.function_id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pipe() -> (Pipe, MessageQueue) {
        let outbound = MessageQueue::new(16);
        let shared = PipeShared::new_originator(1, 0, 7, outbound.clone(), Weak::new(), None);
        (Pipe { shared }, outbound)
    }

    #[tokio::test]
    async fn send_emits_blocks_on_the_outbound_queue() {
        let (pipe, outbound) = test_pipe();
        pipe.send(b"hello").await.expect("send");
        pipe.send_eof().await.expect("eof");

        match outbound.poll() {
            Some(Message::Block(block)) => {
                assert_eq!(block.payload, b"hello");
                assert!(!block.eof);
            }
            other => panic!("expected block, got {:?}", other),
        }
        match outbound.poll() {
            Some(Message::Block(block)) => assert!(block.eof),
            other => panic!("expected eof block, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn send_splits_oversized_payloads() {
        let (pipe, outbound) = test_pipe();
        let payload = vec![7u8; Block::MAX_PAYLOAD + 10];
        pipe.send(&payload).await.expect("send");

        let mut sizes = Vec::new();
        while let Some(Message::Block(block)) = outbound.poll() {
            sizes.push(block.payload.len());
        }
        assert_eq!(sizes, vec![Block::MAX_PAYLOAD, 10]);
    }

    #[tokio::test]
    async fn send_after_eof_fails() {
        let (pipe, _outbound) = test_pipe();
        pipe.send_eof().await.expect("eof");
        assert!(pipe.send(b"x").await.is_err());
    }

    #[tokio::test]
    async fn recv_sees_blocks_then_eof() {
        let (pipe, _outbound) = test_pipe();
        pipe.shared.deliver_block(Block::new(1, vec![1])).await;
        pipe.shared.deliver_block(Block::new(1, vec![2])).await;
        pipe.shared.deliver_block(Block::eof(1)).await;

        assert_eq!(pipe.recv().await, Some(vec![1]));
        assert_eq!(pipe.recv().await, Some(vec![2]));
        assert_eq!(pipe.recv().await, None);
    }

    #[tokio::test]
    async fn lossy_blocks_are_dropped_when_full() {
        let (pipe, _outbound) = test_pipe();
        for n in 0..PIPE_BUFFER_CAPACITY {
            pipe.shared.deliver_block(Block::new(1, vec![n as u8])).await;
        }
        // Buffer is full: a lossy block vanishes instead of suspending.
        pipe.shared.deliver_block(Block::with_loss(1, 1, vec![0xFF])).await;

        let mut seen = Vec::new();
        for _ in 0..PIPE_BUFFER_CAPACITY {
            seen.push(pipe.recv().await.expect("block"));
        }
        assert!(!seen.contains(&vec![0xFF]));
    }

    #[tokio::test]
    async fn remote_close_resolves_the_result() {
        let (pipe, _outbound) = test_pipe();
        pipe.shared.complete_remote(Close::success(1, Value::Int32(9)));
        assert_eq!(pipe.result().await, Ok(Value::Int32(9)));
        assert!(pipe.is_closed());
        assert_eq!(pipe.state(), PipeState::Closed);
    }

    #[tokio::test]
    async fn cancel_sends_close_and_fails_the_result() {
        let (pipe, outbound) = test_pipe();
        pipe.cancel();

        match outbound.poll() {
            Some(Message::Close(close)) => assert_eq!(close.code, close_code::CANCELLED),
            other => panic!("expected close, got {:?}", other),
        }
        let result = pipe.result().await;
        assert_eq!(result, Err(Abort::cancelled()));
        assert!(pipe.send(b"late").await.is_err());
        // A cancel is a graceful end, not a transport failure.
        assert_eq!(pipe.state(), PipeState::Closed);
    }

    #[tokio::test]
    async fn close_with_buffered_blocks_drains_through_closing() {
        let (pipe, _outbound) = test_pipe();
        pipe.shared.deliver_block(Block::new(1, vec![1])).await;
        pipe.shared.deliver_block(Block::eof(1)).await;
        pipe.shared.complete_remote(Close::success(1, Value::Null));

        // The close landed while the stream was still buffered.
        assert_eq!(pipe.state(), PipeState::Closing);
        assert_eq!(pipe.recv().await, Some(vec![1]));
        assert_eq!(pipe.recv().await, None);
        assert_eq!(pipe.state(), PipeState::Closed);
    }

    #[tokio::test]
    async fn close_without_eof_promotes_on_drained_queue() {
        let (pipe, _outbound) = test_pipe();
        pipe.shared.deliver_block(Block::new(1, vec![9])).await;
        pipe.shared.complete_remote(Close::success(1, Value::Null));

        assert_eq!(pipe.state(), PipeState::Closing);
        assert_eq!(pipe.recv().await, Some(vec![9]));
        // No EOF ever arrived; the drained-empty queue still ends the drain.
        assert_eq!(pipe.recv().await, None);
        assert_eq!(pipe.state(), PipeState::Closed);
    }

    #[tokio::test]
    async fn wire_failure_is_reported_as_failed() {
        let (pipe, _outbound) = test_pipe();
        pipe.shared.fail_local(Abort::session_closed());
        assert_eq!(pipe.state(), PipeState::Failed);
        assert_eq!(pipe.result().await, Err(Abort::session_closed()));
    }

    #[tokio::test]
    async fn blocks_after_close_are_dropped() {
        let (pipe, _outbound) = test_pipe();
        pipe.shared.complete_remote(Close::success(1, Value::Null));
        pipe.shared.deliver_block(Block::new(1, vec![1])).await;
        assert_eq!(pipe.recv().await, None);
    }

    #[tokio::test]
    async fn send_latch_pauses_until_open() {
        let (pipe, outbound) = test_pipe();
        assert!(pipe.shared.send_latch().lock());

        let p = pipe.clone();
        let sender = tokio::spawn(async move { p.send(b"gated").await });
        tokio::task::yield_now().await;
        assert!(outbound.is_empty());

        pipe.shared.send_latch().open();
        sender.await.expect("join").expect("send");
        assert!(!outbound.is_empty());
    }

    #[tokio::test]
    async fn priority_escalation_saturates() {
        let (pipe, _outbound) = test_pipe();
        assert_eq!(pipe.raise_priority(), 1);
        assert_eq!(pipe.lower_priority(), 0);
        for _ in 0..300 {
            pipe.raise_priority();
        }
        assert_eq!(pipe.priority(), i8::MAX);
    }
}
