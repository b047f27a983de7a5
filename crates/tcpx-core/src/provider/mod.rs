//! The capability seam between the engine and the kernel's zero-copy I/O
//! entry points.
//!
//! Production binds to io_uring (`tcpx_transport::uring`); tests bind to
//! [`memory::MemoryProvider`]. Every call is synchronous: "submit" means the
//! operation was accepted, its result arrives later through `dequeue`.

pub mod memory;

use crate::error::Result;
use crate::types::{
    BufferId, CompletionQueueId, CompletionResult, ConnectionId, OperationContext,
    RequestQueueId, SegmentDescriptor,
};
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Depth of one request queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    pub max_outstanding_receive: u32,
    pub max_outstanding_send: u32,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            max_outstanding_receive: 24,
            max_outstanding_send: 40,
        }
    }
}

pub trait IoProvider: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn create_completion_queue(&self, depth: u32) -> Result<CompletionQueueId>;

    /// Releases the queue. Callers close every request queue first.
    fn close_completion_queue(&self, cq: CompletionQueueId) -> Result<()>;

    /// Declares `len` bytes at `ptr` for zero-copy use by operations that
    /// complete on `cq`. The memory must stay mapped until deregistered.
    fn register_buffer(&self, cq: CompletionQueueId, ptr: *mut u8, len: usize) -> Result<BufferId>;

    fn deregister_buffer(&self, cq: CompletionQueueId, buffer: BufferId) -> Result<()>;

    /// Binds `socket` to `cq`. Completions of operations submitted on the
    /// returned queue carry `connection`.
    fn create_request_queue(
        &self,
        cq: CompletionQueueId,
        socket: RawFd,
        connection: ConnectionId,
        limits: QueueLimits,
    ) -> Result<RequestQueueId>;

    fn close_request_queue(&self, rq: RequestQueueId) -> Result<()>;

    /// Receives into the whole segment described by `desc`.
    fn submit_receive(
        &self,
        rq: RequestQueueId,
        desc: &SegmentDescriptor,
        ctx: OperationContext,
    ) -> Result<()>;

    /// Sends the first `desc.length` bytes of the segment.
    fn submit_send(&self, rq: RequestQueueId, desc: &SegmentDescriptor, ctx: OperationContext)
        -> Result<()>;

    /// Requests cancellation of one outstanding operation. The operation
    /// still produces exactly one completion (status `Cancelled` unless it
    /// had already finished).
    fn cancel(&self, rq: RequestQueueId, ctx: OperationContext) -> Result<()>;

    /// Arms `cq` so the next completion wakes `wait`.
    fn notify(&self, cq: CompletionQueueId) -> Result<()>;

    /// Blocks until the armed queue signals or `timeout` elapses. Returns
    /// `false` on timeout.
    fn wait(&self, cq: CompletionQueueId, timeout: Duration) -> Result<bool>;

    /// Moves up to `out.len()` completions into `out`. Only the thread that
    /// owns `cq` may call this. Fails with `QueueCorrupted` when the queue
    /// lost entries.
    fn dequeue(&self, cq: CompletionQueueId, out: &mut [CompletionResult]) -> Result<usize>;
}
