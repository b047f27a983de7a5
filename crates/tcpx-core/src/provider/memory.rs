//! In-memory `IoProvider` used to drive the engine without a kernel.
//!
//! Request queues behave like a socket with a user-controlled peer: bytes
//! handed to [`MemoryProvider::deliver`] satisfy pending receives in order,
//! sends stay outstanding until [`MemoryProvider::complete_sends`] (or
//! immediately with auto-complete on), and every completion lands on the
//! owning completion queue exactly like a kernel would post it.

use super::{IoProvider, QueueLimits};
use crate::error::{EngineError, Result};
use crate::types::{
    BufferId, CompletionQueueId, CompletionResult, CompletionStatus, ConnectionId,
    OperationContext, RequestQueueId, SegmentDescriptor,
};
use std::collections::{HashMap, VecDeque};
use std::os::unix::io::RawFd;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// When a cancel request produces its `Cancelled` completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelMode {
    #[default]
    Immediate,
    /// Held back until [`MemoryProvider::flush_cancellations`].
    Deferred,
}

struct FakeCompletionQueue {
    depth: usize,
    entries: VecDeque<CompletionResult>,
    armed: bool,
    corrupted: bool,
    buffers: HashMap<BufferId, usize>,
}

struct FakeRequestQueue {
    cq: CompletionQueueId,
    connection: ConnectionId,
    limits: QueueLimits,
    receives: VecDeque<(OperationContext, SegmentDescriptor)>,
    sends: VecDeque<(OperationContext, SegmentDescriptor)>,
    inbound: VecDeque<u8>,
    peer_closed: bool,
}

#[derive(Default)]
struct MemoryState {
    next_id: u32,
    cqs: HashMap<CompletionQueueId, FakeCompletionQueue>,
    rqs: HashMap<RequestQueueId, FakeRequestQueue>,
    by_connection: HashMap<ConnectionId, RequestQueueId>,
    transmitted: HashMap<ConnectionId, Vec<u8>>,
    deferred_cancels: Vec<(RequestQueueId, OperationContext)>,
    cancel_mode: CancelMode,
    auto_complete_sends: bool,
    fail_submissions: bool,
    cq_budget: Option<usize>,
    registrations: usize,
    deregistrations: usize,
    drain_calls: usize,
    nonempty_drains: usize,
}

impl MemoryState {
    fn alloc_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn post(&mut self, cq: CompletionQueueId, entry: CompletionResult) {
        if let Some(queue) = self.cqs.get_mut(&cq) {
            if queue.entries.len() >= queue.depth {
                tracing::error!("MemoryProvider: completion queue {:?} overflowed", cq);
                queue.corrupted = true;
                return;
            }
            queue.entries.push_back(entry);
        }
    }

    /// Satisfies pending receives of `rq` from its inbound bytes, or with a
    /// zero-byte completion once the peer has closed.
    fn pump_receives(&mut self, rq: RequestQueueId) {
        loop {
            let Some(queue) = self.rqs.get_mut(&rq) else { return };
            if queue.receives.is_empty() || (queue.inbound.is_empty() && !queue.peer_closed) {
                return;
            }
            let Some((ctx, desc)) = queue.receives.pop_front() else { return };
            let take = queue.inbound.len().min(desc.length as usize);
            for i in 0..take {
                let byte = queue.inbound.pop_front().unwrap_or_default();
                // Safety: the descriptor points at a registered, checked-out
                // segment of at least `desc.length` bytes.
                unsafe { desc.ptr.add(i).write(byte) };
            }
            let entry = CompletionResult {
                connection: queue.connection,
                context: ctx,
                bytes_transferred: take as u32,
                status: CompletionStatus::Success,
            };
            let cq = queue.cq;
            self.post(cq, entry);
        }
    }

    fn complete_send(&mut self, rq: RequestQueueId, ctx: OperationContext, desc: SegmentDescriptor) -> Vec<u8> {
        let mut payload = vec![0u8; desc.length as usize];
        // Safety: see `pump_receives`.
        unsafe { std::ptr::copy_nonoverlapping(desc.ptr, payload.as_mut_ptr(), payload.len()) };
        let Some(queue) = self.rqs.get(&rq) else { return payload };
        let (cq, connection) = (queue.cq, queue.connection);
        self.transmitted
            .entry(connection)
            .or_default()
            .extend_from_slice(&payload);
        self.post(
            cq,
            CompletionResult {
                connection,
                context: ctx,
                bytes_transferred: desc.length,
                status: CompletionStatus::Success,
            },
        );
        payload
    }

    fn apply_cancel(&mut self, rq: RequestQueueId, ctx: OperationContext) {
        let Some(queue) = self.rqs.get_mut(&rq) else { return };
        let hit = take_context(&mut queue.receives, ctx).or_else(|| take_context(&mut queue.sends, ctx));
        if hit.is_none() {
            // Already completed; the cancel itself is not routed.
            return;
        }
        let entry = CompletionResult {
            connection: queue.connection,
            context: ctx,
            bytes_transferred: 0,
            status: CompletionStatus::Cancelled,
        };
        let cq = queue.cq;
        self.post(cq, entry);
    }

    fn request_queue(&mut self, rq: RequestQueueId, op: &'static str) -> Result<&mut FakeRequestQueue> {
        if self.fail_submissions {
            return Err(EngineError::platform(op, libc::EIO));
        }
        self.rqs
            .get_mut(&rq)
            .ok_or(EngineError::platform(op, libc::EBADF))
    }
}

fn take_context(
    ops: &mut VecDeque<(OperationContext, SegmentDescriptor)>,
    ctx: OperationContext,
) -> Option<SegmentDescriptor> {
    let pos = ops.iter().position(|(c, _)| *c == ctx)?;
    ops.remove(pos).map(|(_, desc)| desc)
}

/// Deterministic stand-in for the kernel, shared by the engine under test
/// and the test body through an `Arc`.
#[derive(Default)]
pub struct MemoryProvider {
    state: Mutex<MemoryState>,
    signal: Condvar,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel_mode(mode: CancelMode) -> Self {
        let provider = Self::default();
        provider.lock().cancel_mode = mode;
        provider
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bytes arriving from the peer of `connection`. Returns `false` when the
    /// connection has no open request queue.
    pub fn deliver(&self, connection: ConnectionId, data: &[u8]) -> bool {
        let mut state = self.lock();
        let Some(&rq) = state.by_connection.get(&connection) else { return false };
        if let Some(queue) = state.rqs.get_mut(&rq) {
            queue.inbound.extend(data.iter().copied());
        }
        state.pump_receives(rq);
        drop(state);
        self.signal.notify_all();
        true
    }

    /// Orderly shutdown from the peer: pending and future receives complete
    /// with zero bytes once inbound data is exhausted.
    pub fn peer_close(&self, connection: ConnectionId) -> bool {
        let mut state = self.lock();
        let Some(&rq) = state.by_connection.get(&connection) else { return false };
        if let Some(queue) = state.rqs.get_mut(&rq) {
            queue.peer_closed = true;
        }
        state.pump_receives(rq);
        drop(state);
        self.signal.notify_all();
        true
    }

    /// Completes every outstanding send of `connection` and returns their
    /// payloads in submission order.
    pub fn complete_sends(&self, connection: ConnectionId) -> Vec<Vec<u8>> {
        let mut state = self.lock();
        let Some(&rq) = state.by_connection.get(&connection) else { return Vec::new() };
        let sends: Vec<_> = match state.rqs.get_mut(&rq) {
            Some(queue) => queue.sends.drain(..).collect(),
            None => Vec::new(),
        };
        let payloads: Vec<Vec<u8>> = sends
            .into_iter()
            .map(|(ctx, desc)| state.complete_send(rq, ctx, desc))
            .collect();
        drop(state);
        self.signal.notify_all();
        payloads
    }

    pub fn set_auto_complete_sends(&self, on: bool) {
        self.lock().auto_complete_sends = on;
    }

    /// Every byte the engine has sent on `connection` so far.
    pub fn transmitted(&self, connection: ConnectionId) -> Vec<u8> {
        self.lock().transmitted.get(&connection).cloned().unwrap_or_default()
    }

    /// Posts an arbitrary entry, e.g. one for a connection nobody owns.
    pub fn inject(&self, cq: CompletionQueueId, entry: CompletionResult) {
        self.lock().post(cq, entry);
        self.signal.notify_all();
    }

    /// Marks `cq` as having lost entries; the next dequeue fails.
    pub fn corrupt(&self, cq: CompletionQueueId) {
        if let Some(queue) = self.lock().cqs.get_mut(&cq) {
            queue.corrupted = true;
        }
        self.signal.notify_all();
    }

    pub fn fail_submissions(&self, on: bool) {
        self.lock().fail_submissions = on;
    }

    /// Lets `n` more completion queues be created, then fails creation.
    pub fn fail_completion_queue_after(&self, n: usize) {
        self.lock().cq_budget = Some(n);
    }

    pub fn flush_cancellations(&self) {
        let mut state = self.lock();
        let pending = std::mem::take(&mut state.deferred_cancels);
        for (rq, ctx) in pending {
            state.apply_cancel(rq, ctx);
        }
        drop(state);
        self.signal.notify_all();
    }

    pub fn pending_receives(&self, connection: ConnectionId) -> usize {
        let state = self.lock();
        state
            .by_connection
            .get(&connection)
            .and_then(|rq| state.rqs.get(rq))
            .map_or(0, |q| q.receives.len())
    }

    pub fn pending_sends(&self, connection: ConnectionId) -> usize {
        let state = self.lock();
        state
            .by_connection
            .get(&connection)
            .and_then(|rq| state.rqs.get(rq))
            .map_or(0, |q| q.sends.len())
    }

    /// Connections that currently have an open request queue, ascending.
    pub fn open_connections(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.lock().by_connection.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn completion_queues(&self) -> Vec<CompletionQueueId> {
        let mut ids: Vec<_> = self.lock().cqs.keys().copied().collect();
        ids.sort_by_key(|cq| cq.0);
        ids
    }

    pub fn open_request_queues(&self) -> usize {
        self.lock().rqs.len()
    }

    pub fn open_completion_queues(&self) -> usize {
        self.lock().cqs.len()
    }

    pub fn registered_buffers(&self) -> usize {
        self.lock().cqs.values().map(|q| q.buffers.len()).sum()
    }

    pub fn registrations(&self) -> usize {
        self.lock().registrations
    }

    pub fn deregistrations(&self) -> usize {
        self.lock().deregistrations
    }

    pub fn drain_calls(&self) -> usize {
        self.lock().drain_calls
    }

    /// Dequeue calls that returned at least one entry.
    pub fn nonempty_drains(&self) -> usize {
        self.lock().nonempty_drains
    }
}

impl IoProvider for MemoryProvider {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn create_completion_queue(&self, depth: u32) -> Result<CompletionQueueId> {
        let mut state = self.lock();
        if let Some(budget) = state.cq_budget.as_mut() {
            if *budget == 0 {
                return Err(EngineError::platform("create_completion_queue", libc::ENOMEM));
            }
            *budget -= 1;
        }
        let cq = CompletionQueueId(state.alloc_id());
        state.cqs.insert(
            cq,
            FakeCompletionQueue {
                depth: depth as usize,
                entries: VecDeque::new(),
                armed: false,
                corrupted: false,
                buffers: HashMap::new(),
            },
        );
        Ok(cq)
    }

    fn close_completion_queue(&self, cq: CompletionQueueId) -> Result<()> {
        let mut state = self.lock();
        if state.rqs.values().any(|q| q.cq == cq) {
            return Err(EngineError::platform("close_completion_queue", libc::EBUSY));
        }
        state
            .cqs
            .remove(&cq)
            .map(|_| ())
            .ok_or(EngineError::platform("close_completion_queue", libc::EBADF))
    }

    fn register_buffer(&self, cq: CompletionQueueId, ptr: *mut u8, len: usize) -> Result<BufferId> {
        let mut state = self.lock();
        if ptr.is_null() || len == 0 {
            return Err(EngineError::platform("register_buffer", libc::EINVAL));
        }
        let id = BufferId(state.alloc_id());
        let queue = state
            .cqs
            .get_mut(&cq)
            .ok_or(EngineError::platform("register_buffer", libc::EBADF))?;
        queue.buffers.insert(id, len);
        state.registrations += 1;
        Ok(id)
    }

    fn deregister_buffer(&self, cq: CompletionQueueId, buffer: BufferId) -> Result<()> {
        let mut state = self.lock();
        let queue = state
            .cqs
            .get_mut(&cq)
            .ok_or(EngineError::platform("deregister_buffer", libc::EBADF))?;
        queue
            .buffers
            .remove(&buffer)
            .ok_or(EngineError::platform("deregister_buffer", libc::EINVAL))?;
        state.deregistrations += 1;
        Ok(())
    }

    fn create_request_queue(
        &self,
        cq: CompletionQueueId,
        _socket: RawFd,
        connection: ConnectionId,
        limits: QueueLimits,
    ) -> Result<RequestQueueId> {
        let mut state = self.lock();
        if !state.cqs.contains_key(&cq) {
            return Err(EngineError::platform("create_request_queue", libc::EBADF));
        }
        let rq = RequestQueueId(state.alloc_id());
        state.rqs.insert(
            rq,
            FakeRequestQueue {
                cq,
                connection,
                limits,
                receives: VecDeque::new(),
                sends: VecDeque::new(),
                inbound: VecDeque::new(),
                peer_closed: false,
            },
        );
        state.by_connection.insert(connection, rq);
        Ok(rq)
    }

    fn close_request_queue(&self, rq: RequestQueueId) -> Result<()> {
        let mut state = self.lock();
        let queue = state
            .rqs
            .remove(&rq)
            .ok_or(EngineError::platform("close_request_queue", libc::EBADF))?;
        state.by_connection.remove(&queue.connection);
        state.deferred_cancels.retain(|(r, _)| *r != rq);
        Ok(())
    }

    fn submit_receive(&self, rq: RequestQueueId, desc: &SegmentDescriptor, ctx: OperationContext) -> Result<()> {
        let mut state = self.lock();
        let queue = state.request_queue(rq, "submit_receive")?;
        if queue.receives.len() >= queue.limits.max_outstanding_receive as usize {
            return Err(EngineError::platform("submit_receive", libc::ENOBUFS));
        }
        queue.receives.push_back((ctx, *desc));
        state.pump_receives(rq);
        drop(state);
        self.signal.notify_all();
        Ok(())
    }

    fn submit_send(&self, rq: RequestQueueId, desc: &SegmentDescriptor, ctx: OperationContext) -> Result<()> {
        let mut state = self.lock();
        let queue = state.request_queue(rq, "submit_send")?;
        if queue.sends.len() >= queue.limits.max_outstanding_send as usize {
            return Err(EngineError::platform("submit_send", libc::ENOBUFS));
        }
        if state.auto_complete_sends {
            state.complete_send(rq, ctx, *desc);
        } else if let Some(queue) = state.rqs.get_mut(&rq) {
            queue.sends.push_back((ctx, *desc));
        }
        drop(state);
        self.signal.notify_all();
        Ok(())
    }

    fn cancel(&self, rq: RequestQueueId, ctx: OperationContext) -> Result<()> {
        let mut state = self.lock();
        if !state.rqs.contains_key(&rq) {
            return Err(EngineError::platform("cancel", libc::EBADF));
        }
        match state.cancel_mode {
            CancelMode::Immediate => state.apply_cancel(rq, ctx),
            CancelMode::Deferred => state.deferred_cancels.push((rq, ctx)),
        }
        drop(state);
        self.signal.notify_all();
        Ok(())
    }

    fn notify(&self, cq: CompletionQueueId) -> Result<()> {
        let mut state = self.lock();
        let queue = state
            .cqs
            .get_mut(&cq)
            .ok_or(EngineError::platform("notify", libc::EBADF))?;
        queue.armed = true;
        drop(state);
        self.signal.notify_all();
        Ok(())
    }

    fn wait(&self, cq: CompletionQueueId, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            let queue = state
                .cqs
                .get_mut(&cq)
                .ok_or(EngineError::platform("wait", libc::EBADF))?;
            if queue.armed && (queue.corrupted || !queue.entries.is_empty()) {
                queue.armed = false;
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            state = self
                .signal
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn dequeue(&self, cq: CompletionQueueId, out: &mut [CompletionResult]) -> Result<usize> {
        let mut state = self.lock();
        let queue = state
            .cqs
            .get_mut(&cq)
            .ok_or(EngineError::platform("dequeue", libc::EBADF))?;
        if queue.corrupted {
            return Err(EngineError::QueueCorrupted { reactor: cq.0 as usize });
        }
        let n = queue.entries.len().min(out.len());
        for (slot, entry) in out.iter_mut().zip(queue.entries.drain(..n)) {
            *slot = entry;
        }
        state.drain_calls += 1;
        if n > 0 {
            state.nonempty_drains += 1;
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivered_bytes_complete_pending_receive() {
        let provider = MemoryProvider::new();
        let cq = provider.create_completion_queue(16).unwrap();
        let mut backing = vec![0u8; 64];
        let buffer = provider.register_buffer(cq, backing.as_mut_ptr(), 64).unwrap();
        let rq = provider
            .create_request_queue(cq, -1, ConnectionId(3), QueueLimits::default())
            .unwrap();

        let desc = SegmentDescriptor {
            buffer,
            segment: crate::types::SegmentId(0),
            offset: 0,
            length: 64,
            ptr: backing.as_mut_ptr(),
        };
        provider.submit_receive(rq, &desc, OperationContext(9)).unwrap();
        assert!(provider.deliver(ConnectionId(3), b"ping"));

        provider.notify(cq).unwrap();
        assert!(provider.wait(cq, Duration::from_millis(10)).unwrap());

        let mut out = [CompletionResult::EMPTY; 4];
        assert_eq!(provider.dequeue(cq, &mut out).unwrap(), 1);
        assert_eq!(out[0].context, OperationContext(9));
        assert_eq!(out[0].bytes_transferred, 4);
        assert_eq!(&backing[..4], b"ping");
    }

    #[test]
    fn unarmed_queue_times_out() {
        let provider = MemoryProvider::new();
        let cq = provider.create_completion_queue(4).unwrap();
        provider.inject(cq, CompletionResult::EMPTY);
        assert!(!provider.wait(cq, Duration::from_millis(5)).unwrap());
    }

    #[test]
    fn overflow_marks_queue_corrupted() {
        let provider = MemoryProvider::new();
        let cq = provider.create_completion_queue(1).unwrap();
        provider.inject(cq, CompletionResult::EMPTY);
        provider.inject(cq, CompletionResult::EMPTY);
        let mut out = [CompletionResult::EMPTY; 4];
        assert!(matches!(
            provider.dequeue(cq, &mut out),
            Err(EngineError::QueueCorrupted { .. })
        ));
    }
}
