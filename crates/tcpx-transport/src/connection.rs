use crate::reactor::ReactorShared;
use bytes::Bytes;
use socket2::Socket;
use std::collections::HashMap;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tcpx_core::{
    CompletionResult, CompletionStatus, ConnectionId, EngineError, OperationContext, OperationKind,
    RequestQueueId, Result, Segment,
};
use tokio::sync::oneshot;

static NEXT_CONNECTION: AtomicU32 = AtomicU32::new(1);

pub(crate) fn next_connection_id() -> ConnectionId {
    ConnectionId(NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed))
}

/// Lifecycle of a connection as seen by its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    /// The peer finished sending; sends may still work.
    PeerClosed,
    /// Disconnect requested, operations still in flight.
    Closing,
    /// Every operation completed and the socket is closed.
    Closed,
}

enum Waiter {
    Receive(oneshot::Sender<Result<Bytes>>),
    Send(oneshot::Sender<Result<usize>>),
}

impl Waiter {
    fn kind(&self) -> OperationKind {
        match self {
            Waiter::Receive(_) => OperationKind::Receive,
            Waiter::Send(_) => OperationKind::Send,
        }
    }

    /// True once the caller stopped waiting (its future was dropped).
    fn is_abandoned(&self) -> bool {
        match self {
            Waiter::Receive(tx) => tx.is_closed(),
            Waiter::Send(tx) => tx.is_closed(),
        }
    }

    fn fail(self, err: EngineError) {
        match self {
            Waiter::Receive(tx) => {
                let _ = tx.send(Err(err));
            }
            Waiter::Send(tx) => {
                let _ = tx.send(Err(err));
            }
        }
    }
}

/// One submitted operation. Holds its segment until the reactor observes
/// the completion.
struct PendingOp {
    segment: Segment,
    waiter: Waiter,
}

struct ConnectionInner {
    socket: Option<Socket>,
    phase: ConnectionState,
    next_context: u32,
    pending: HashMap<OperationContext, PendingOp>,
    receive_pending: bool,
    send_pending: bool,
    /// Reactor whose completion queue was lost under this connection.
    fault: Option<usize>,
    /// Outcome of a receive whose caller went away before it completed.
    stashed: Option<Result<Bytes>>,
}

impl ConnectionInner {
    fn next_context(&mut self) -> OperationContext {
        self.next_context = self.next_context.wrapping_add(1);
        OperationContext(self.next_context)
    }

    fn is_pending(&self, kind: OperationKind) -> bool {
        match kind {
            OperationKind::Receive => self.receive_pending,
            OperationKind::Send => self.send_pending,
        }
    }

    fn set_pending(&mut self, kind: OperationKind, on: bool) {
        match kind {
            OperationKind::Receive => self.receive_pending = on,
            OperationKind::Send => self.send_pending = on,
        }
    }

    /// Gives a new receive caller whatever an abandoned receive left behind:
    /// its finished outcome, or the operation itself if still in flight.
    /// Returns the sender back when there is nothing to adopt.
    fn adopt_receive(
        &mut self,
        tx: oneshot::Sender<Result<Bytes>>,
    ) -> Option<oneshot::Sender<Result<Bytes>>> {
        if let Some(outcome) = self.stashed.take() {
            let _ = tx.send(outcome);
            return None;
        }
        let abandoned = self
            .pending
            .values_mut()
            .find(|op| matches!(op.waiter, Waiter::Receive(_)) && op.waiter.is_abandoned());
        match abandoned {
            Some(op) => {
                op.waiter = Waiter::Receive(tx);
                None
            }
            None => Some(tx),
        }
    }

    /// Error for a new operation of `kind`, if it may not start.
    fn refuse(&self, kind: OperationKind) -> Option<EngineError> {
        if let Some(reactor) = self.fault {
            return Some(EngineError::QueueCorrupted { reactor });
        }
        match (self.phase, kind) {
            (ConnectionState::Open, _) | (ConnectionState::PeerClosed, OperationKind::Send) => {}
            _ => return Some(EngineError::ConnectionClosed),
        }
        if self.is_pending(kind) {
            return Some(EngineError::AlreadyPending(kind));
        }
        None
    }
}

pub(crate) struct ConnectionShared {
    id: ConnectionId,
    rq: RequestQueueId,
    peer: Option<SocketAddr>,
    reactor: Arc<ReactorShared>,
    inner: Mutex<ConnectionInner>,
}

impl ConnectionShared {
    pub(crate) fn new(
        id: ConnectionId,
        rq: RequestQueueId,
        socket: Socket,
        peer: Option<SocketAddr>,
        reactor: Arc<ReactorShared>,
    ) -> Self {
        Self {
            id,
            rq,
            peer,
            reactor,
            inner: Mutex::new(ConnectionInner {
                socket: Some(socket),
                phase: ConnectionState::Open,
                next_context: 0,
                pending: HashMap::new(),
                receive_pending: false,
                send_pending: false,
                fault: None,
                stashed: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Checks out a segment, optionally fills it, and submits the operation.
    /// Runs entirely under the connection lock so the completion can never
    /// be dispatched before the pending entry exists.
    fn submit(&self, waiter: Waiter, payload: Option<&[u8]>) -> Result<()> {
        let kind = waiter.kind();
        let mut inner = self.lock();
        let waiter = match waiter {
            Waiter::Receive(tx) => match inner.adopt_receive(tx) {
                Some(tx) => Waiter::Receive(tx),
                None => return Ok(()),
            },
            send => send,
        };
        if let Some(err) = inner.refuse(kind) {
            return Err(err);
        }

        let reactor = &self.reactor;
        let segment = reactor.arena.checkout()?;
        let desc = match payload {
            Some(data) => {
                // Safety: the segment was just checked out; nothing references it.
                unsafe { segment.fill(data) };
                segment.descriptor(data.len() as u32)
            }
            None => segment.descriptor(segment.len() as u32),
        };
        let ctx = inner.next_context();

        reactor.outstanding_inc();
        let submitted = match kind {
            OperationKind::Receive => reactor.provider.submit_receive(self.rq, &desc, ctx),
            OperationKind::Send => reactor.provider.submit_send(self.rq, &desc, ctx),
        };
        if let Err(e) = submitted {
            reactor.outstanding_dec();
            reactor.arena.release(segment.id());
            tracing::warn!("{}: {} submit failed: {}", self.id, kind, e);
            self.disconnect_locked(&mut inner);
            return Err(e);
        }

        inner.pending.insert(ctx, PendingOp { segment, waiter });
        inner.set_pending(kind, true);
        Ok(())
    }

    /// Resolves the pending operation named by `entry`. Returns `false` when
    /// no such operation exists. Reactor thread only.
    pub(crate) fn complete(&self, entry: &CompletionResult) -> bool {
        let mut inner = self.lock();
        let Some(op) = inner.pending.remove(&entry.context) else {
            return false;
        };
        let kind = op.waiter.kind();
        inner.set_pending(kind, false);

        let n = entry.bytes_transferred as usize;
        let failure = match entry.status {
            CompletionStatus::Success => None,
            CompletionStatus::Cancelled => Some(EngineError::ConnectionClosed),
            CompletionStatus::Failed(code) => Some(EngineError::platform(
                match kind {
                    OperationKind::Receive => "receive",
                    OperationKind::Send => "send",
                },
                code,
            )),
        };
        let failed = matches!(entry.status, CompletionStatus::Failed(_));

        match op.waiter {
            Waiter::Receive(tx) => {
                let outcome = match failure {
                    Some(err) => Err(err),
                    // Safety: the kernel finished writing; the segment is still ours.
                    None if n > 0 => Ok(Bytes::copy_from_slice(unsafe { op.segment.bytes(n) })),
                    None if inner.phase == ConnectionState::Open => {
                        tracing::debug!("{}: peer closed", self.id);
                        inner.phase = ConnectionState::PeerClosed;
                        Ok(Bytes::new())
                    }
                    None => Err(EngineError::ConnectionClosed),
                };
                if let Err(outcome) = tx.send(outcome) {
                    tracing::debug!("{}: receive caller gone, keeping its outcome", self.id);
                    inner.stashed = Some(outcome);
                }
            }
            Waiter::Send(tx) => {
                let _ = tx.send(failure.map_or(Ok(n), Err));
            }
        }

        self.reactor.arena.release(op.segment.id());
        self.reactor.outstanding_dec();

        if failed {
            tracing::warn!("{}: {} failed with native code, disconnecting", self.id, kind);
            self.disconnect_locked(&mut inner);
        }
        // A connection already closing retires on its last completion, whatever its status.
        if inner.phase == ConnectionState::Closing && inner.pending.is_empty() {
            self.retire_locked(&mut inner);
        }
        true
    }

    /// Whether an operation of `kind` could start right now.
    fn check(&self, kind: OperationKind) -> Result<()> {
        match self.lock().refuse(kind) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub(crate) fn disconnect(&self) {
        let mut inner = self.lock();
        self.disconnect_locked(&mut inner);
    }

    fn disconnect_locked(&self, inner: &mut ConnectionInner) {
        if matches!(inner.phase, ConnectionState::Closing | ConnectionState::Closed) {
            return;
        }
        inner.phase = ConnectionState::Closing;

        for ctx in inner.pending.keys() {
            if let Err(e) = self.reactor.provider.cancel(self.rq, *ctx) {
                tracing::warn!("{}: cancel of {:?} failed: {}", self.id, ctx, e);
            }
        }
        if let Some(socket) = inner.socket.as_ref() {
            // Wakes operations the cancel could not reach.
            let _ = socket.shutdown(Shutdown::Both);
        }

        if inner.pending.is_empty() {
            self.retire_locked(inner);
        } else {
            tracing::debug!(
                "{}: closing, waiting for {} operation(s)",
                self.id,
                inner.pending.len()
            );
        }
    }

    /// Frees the socket and request queue. Only once nothing is in flight.
    fn retire_locked(&self, inner: &mut ConnectionInner) {
        debug_assert!(inner.pending.is_empty());
        inner.phase = ConnectionState::Closed;
        if let Err(e) = self.reactor.provider.close_request_queue(self.rq) {
            tracing::warn!("{}: closing request queue failed: {}", self.id, e);
        }
        inner.socket = None;
        self.reactor.forget(self.id);
        tracing::debug!("{}: retired from reactor {}", self.id, self.reactor.id);
    }

    /// Force-completes everything with `QueueCorrupted`. The completion
    /// queue is gone, so nothing else ever will.
    pub(crate) fn fail_all(&self, reactor: usize) {
        let mut inner = self.lock();
        let pending: Vec<PendingOp> = inner.pending.drain().map(|(_, op)| op).collect();
        for op in pending {
            self.reactor.arena.release(op.segment.id());
            self.reactor.outstanding_dec();
            op.waiter.fail(EngineError::QueueCorrupted { reactor });
        }
        inner.receive_pending = false;
        inner.send_pending = false;
        inner.fault = Some(reactor);
        inner.phase = ConnectionState::Closed;
        if let Err(e) = self.reactor.provider.close_request_queue(self.rq) {
            tracing::debug!("{}: closing request queue after fault: {}", self.id, e);
        }
        inner.socket = None;
    }
}

/// The handler's view of one accepted socket.
///
/// Pinned to one reactor for its whole life. At most one receive and one
/// send may be outstanding at a time. Dropping the handle disconnects.
pub struct Connection {
    shared: Arc<ConnectionShared>,
}

impl Connection {
    pub(crate) fn new(shared: Arc<ConnectionShared>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn reactor_id(&self) -> usize {
        self.shared.reactor.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().phase
    }

    /// Largest payload a single [`send`](Self::send) accepts.
    pub fn max_send(&self) -> usize {
        self.shared.reactor.arena.segment_length()
    }

    /// Waits for the next chunk from the peer.
    ///
    /// An empty `Bytes` means the peer shut down its side; every later call
    /// fails with [`EngineError::ConnectionClosed`].
    ///
    /// Cancel-safe: if this future is dropped while the receive is in
    /// flight, the operation stays submitted and the next call picks it up,
    /// or its result if it already completed. No received bytes are lost.
    pub async fn receive(&self) -> Result<Bytes> {
        let (tx, rx) = oneshot::channel();
        self.shared.submit(Waiter::Receive(tx), None)?;
        rx.await.unwrap_or(Err(EngineError::ConnectionClosed))
    }

    /// Sends one segment's worth of `payload`. Returns the bytes the kernel
    /// accepted, which may be fewer than `payload.len()`.
    ///
    /// Not cancel-safe: dropping the future does not withdraw the send, and
    /// further sends fail with `AlreadyPending` until it completes.
    pub async fn send(&self, payload: &[u8]) -> Result<usize> {
        let max = self.max_send();
        if payload.len() > max {
            return Err(EngineError::PayloadTooLarge {
                len: payload.len(),
                max,
            });
        }
        if payload.is_empty() {
            self.shared.check(OperationKind::Send)?;
            return Ok(0);
        }
        let (tx, rx) = oneshot::channel();
        self.shared.submit(Waiter::Send(tx), Some(payload))?;
        rx.await.unwrap_or(Err(EngineError::ConnectionClosed))
    }

    /// Sends all of `payload`, one segment at a time.
    pub async fn send_all(&self, payload: &[u8]) -> Result<usize> {
        let max = self.max_send();
        let mut offset = 0;
        while offset < payload.len() {
            let end = (offset + max).min(payload.len());
            let sent = self.send(&payload[offset..end]).await?;
            if sent == 0 {
                return Err(EngineError::ConnectionClosed);
            }
            offset += sent;
        }
        Ok(offset)
    }

    /// Cancels outstanding operations and shuts the socket down. The record
    /// is retired once the last completion has been observed.
    pub fn disconnect(&self) {
        self.shared.disconnect();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.disconnect();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("reactor", &self.shared.reactor.id)
            .field("peer", &self.shared.peer)
            .finish()
    }
}
