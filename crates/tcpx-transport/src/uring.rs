//! io_uring binding of [`IoProvider`].
//!
//! One ring per completion queue. The arena is registered as a single fixed
//! buffer so receives and sends run as `ReadFixed`/`WriteFixed`; when the
//! kernel refuses the registration (usually `RLIMIT_MEMLOCK`) the ring falls
//! back to plain `Recv`/`Send` on the same memory. Each ring carries a
//! registered eventfd that is the blocking point of `wait`.

use io_uring::{opcode, squeue, types, IoUring};
use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tcpx_core::types::{decode_tag, encode_tag, UNROUTED_TAG};
use tcpx_core::{
    BufferId, CompletionQueueId, CompletionResult, CompletionStatus, ConnectionId, EngineError,
    IoProvider, OperationContext, QueueLimits, RequestQueueId, Result, SegmentDescriptor,
};

/// Index of the arena inside the ring's fixed buffer table.
const FIXED_INDEX: u16 = 0;

struct Ring {
    ring: Mutex<IoUring>,
    eventfd: OwnedFd,
    depth: u32,
    buffers: Mutex<HashMap<BufferId, bool>>,
}

impl Ring {
    fn lock(&self) -> MutexGuard<'_, IoUring> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_fixed(&self, buffer: BufferId) -> Option<bool> {
        self.buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&buffer)
            .copied()
    }

    /// Pushes one entry and hands it to the kernel.
    ///
    /// # Safety
    /// Every pointer referenced by `entry` must stay valid until its
    /// completion is reaped.
    unsafe fn push(&self, entry: squeue::Entry, op: &'static str) -> Result<()> {
        let mut ring = self.lock();
        if ring.submission().push(&entry).is_err() {
            // SQ full: flush what is queued and retry once.
            ring.submit().map_err(|e| platform_io(op, e))?;
            ring.submission()
                .push(&entry)
                .map_err(|_| EngineError::platform(op, libc::EBUSY))?;
        }
        ring.submit().map_err(|e| platform_io(op, e))?;
        Ok(())
    }
}

struct UringRequestQueue {
    cq: CompletionQueueId,
    fd: RawFd,
    connection: ConnectionId,
}

pub struct UringProvider {
    next_id: AtomicU32,
    rings: Mutex<HashMap<CompletionQueueId, Arc<Ring>>>,
    queues: Mutex<HashMap<RequestQueueId, UringRequestQueue>>,
}

fn platform_io(op: &'static str, e: std::io::Error) -> EngineError {
    EngineError::platform(op, e.raw_os_error().unwrap_or(-1))
}

impl Default for UringProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl UringProvider {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            rings: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// True when this kernel lets the process create a ring.
    pub fn is_supported() -> bool {
        IoUring::new(8).is_ok()
    }

    fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn ring(&self, cq: CompletionQueueId, op: &'static str) -> Result<Arc<Ring>> {
        self.rings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&cq)
            .cloned()
            .ok_or(EngineError::platform(op, libc::EBADF))
    }

    fn queue(&self, rq: RequestQueueId, op: &'static str) -> Result<(Arc<Ring>, RawFd, ConnectionId)> {
        let (cq, fd, connection) = {
            let queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
            let queue = queues.get(&rq).ok_or(EngineError::platform(op, libc::EBADF))?;
            (queue.cq, queue.fd, queue.connection)
        };
        Ok((self.ring(cq, op)?, fd, connection))
    }
}

impl IoProvider for UringProvider {
    fn name(&self) -> &'static str {
        "io_uring"
    }

    fn create_completion_queue(&self, depth: u32) -> Result<CompletionQueueId> {
        let ring = IoUring::builder()
            .setup_cqsize(depth.saturating_mul(2))
            .build(depth)
            .map_err(|e| platform_io("io_uring_setup", e))?;

        let raw = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if raw < 0 {
            return Err(EngineError::last_os_error("eventfd"));
        }
        // Safety: `raw` is a fresh descriptor owned by nobody else.
        let eventfd = unsafe { OwnedFd::from_raw_fd(raw) };
        ring.submitter()
            .register_eventfd(eventfd.as_raw_fd())
            .map_err(|e| platform_io("register_eventfd", e))?;

        let cq = CompletionQueueId(self.next_id());
        tracing::debug!("UringProvider: ring {:?} created with depth {}", cq, depth);
        self.rings.lock().unwrap_or_else(PoisonError::into_inner).insert(
            cq,
            Arc::new(Ring {
                ring: Mutex::new(ring),
                eventfd,
                depth,
                buffers: Mutex::new(HashMap::new()),
            }),
        );
        Ok(cq)
    }

    fn close_completion_queue(&self, cq: CompletionQueueId) -> Result<()> {
        let busy = self
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .any(|q| q.cq == cq);
        if busy {
            return Err(EngineError::platform("close_completion_queue", libc::EBUSY));
        }
        self.rings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&cq)
            .map(|_| ())
            .ok_or(EngineError::platform("close_completion_queue", libc::EBADF))
    }

    fn register_buffer(&self, cq: CompletionQueueId, ptr: *mut u8, len: usize) -> Result<BufferId> {
        let ring = self.ring(cq, "register_buffer")?;
        let mut buffers = ring.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        let id = BufferId(self.next_id());

        // The fixed table holds one arena per ring.
        let fixed = if buffers.values().any(|fixed| *fixed) {
            false
        } else {
            let iovec = libc::iovec {
                iov_base: ptr as *mut libc::c_void,
                iov_len: len,
            };
            // Safety: the arena keeps the memory mapped until deregistration.
            match unsafe { ring.lock().submitter().register_buffers(&[iovec]) } {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(
                        "UringProvider: fixed buffer registration of {} bytes failed ({}), using plain recv/send",
                        len,
                        e
                    );
                    false
                }
            }
        };
        buffers.insert(id, fixed);
        Ok(id)
    }

    fn deregister_buffer(&self, cq: CompletionQueueId, buffer: BufferId) -> Result<()> {
        let ring = self.ring(cq, "deregister_buffer")?;
        let fixed = ring
            .buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&buffer)
            .ok_or(EngineError::platform("deregister_buffer", libc::EINVAL))?;
        if fixed {
            ring.lock()
                .submitter()
                .unregister_buffers()
                .map_err(|e| platform_io("unregister_buffers", e))?;
        }
        Ok(())
    }

    fn create_request_queue(
        &self,
        cq: CompletionQueueId,
        socket: RawFd,
        connection: ConnectionId,
        limits: QueueLimits,
    ) -> Result<RequestQueueId> {
        let ring = self.ring(cq, "create_request_queue")?;
        let wanted = limits
            .max_outstanding_receive
            .saturating_add(limits.max_outstanding_send);
        // A ring has no per-socket queue; the shared SQ must fit one socket's worth.
        if wanted > ring.depth {
            return Err(EngineError::platform("create_request_queue", libc::EINVAL));
        }
        let rq = RequestQueueId(self.next_id());
        self.queues.lock().unwrap_or_else(PoisonError::into_inner).insert(
            rq,
            UringRequestQueue {
                cq,
                fd: socket,
                connection,
            },
        );
        Ok(rq)
    }

    fn close_request_queue(&self, rq: RequestQueueId) -> Result<()> {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&rq)
            .map(|_| ())
            .ok_or(EngineError::platform("close_request_queue", libc::EBADF))
    }

    fn submit_receive(&self, rq: RequestQueueId, desc: &SegmentDescriptor, ctx: OperationContext) -> Result<()> {
        let (ring, fd, connection) = self.queue(rq, "submit_receive")?;
        let fixed = ring
            .is_fixed(desc.buffer)
            .ok_or(EngineError::platform("submit_receive", libc::EINVAL))?;
        let entry = if fixed {
            opcode::ReadFixed::new(types::Fd(fd), desc.ptr, desc.length, FIXED_INDEX).build()
        } else {
            opcode::Recv::new(types::Fd(fd), desc.ptr, desc.length).build()
        };
        let entry = entry.user_data(encode_tag(connection, ctx));
        // Safety: the segment stays checked out until this completion is reaped.
        unsafe { ring.push(entry, "submit_receive") }
    }

    fn submit_send(&self, rq: RequestQueueId, desc: &SegmentDescriptor, ctx: OperationContext) -> Result<()> {
        let (ring, fd, connection) = self.queue(rq, "submit_send")?;
        let fixed = ring
            .is_fixed(desc.buffer)
            .ok_or(EngineError::platform("submit_send", libc::EINVAL))?;
        let entry = if fixed {
            opcode::WriteFixed::new(types::Fd(fd), desc.ptr, desc.length, FIXED_INDEX).build()
        } else {
            opcode::Send::new(types::Fd(fd), desc.ptr, desc.length).build()
        };
        let entry = entry.user_data(encode_tag(connection, ctx));
        // Safety: see `submit_receive`.
        unsafe { ring.push(entry, "submit_send") }
    }

    fn cancel(&self, rq: RequestQueueId, ctx: OperationContext) -> Result<()> {
        let (ring, _, connection) = self.queue(rq, "cancel")?;
        let entry = opcode::AsyncCancel::new(encode_tag(connection, ctx))
            .build()
            .user_data(UNROUTED_TAG);
        // Safety: cancel references no memory.
        unsafe { ring.push(entry, "cancel") }
    }

    fn notify(&self, cq: CompletionQueueId) -> Result<()> {
        // The registered eventfd fires on every completion; nothing to arm.
        self.ring(cq, "notify").map(|_| ())
    }

    fn wait(&self, cq: CompletionQueueId, timeout: Duration) -> Result<bool> {
        let ring = self.ring(cq, "wait")?;
        if !ring.lock().completion().is_empty() {
            return Ok(true);
        }

        let mut pollfd = libc::pollfd {
            fd: ring.eventfd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        let ready = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
        if ready < 0 {
            return Err(EngineError::last_os_error("poll"));
        }
        if ready == 0 {
            return Ok(false);
        }

        let mut counter = 0u64;
        // Resets the eventfd; a short read only means another waiter beat us.
        unsafe {
            libc::read(
                ring.eventfd.as_raw_fd(),
                &mut counter as *mut u64 as *mut libc::c_void,
                8,
            )
        };
        Ok(true)
    }

    fn dequeue(&self, cq: CompletionQueueId, out: &mut [CompletionResult]) -> Result<usize> {
        let ring = self.ring(cq, "dequeue")?;
        let mut uring = ring.lock();
        let mut completion = uring.completion();
        if completion.overflow() > 0 {
            tracing::error!(
                "UringProvider: ring {:?} dropped {} completion(s)",
                cq,
                completion.overflow()
            );
            return Err(EngineError::QueueCorrupted { reactor: cq.0 as usize });
        }

        let mut n = 0;
        while n < out.len() {
            let Some(cqe) = completion.next() else { break };
            let Some((connection, context)) = decode_tag(cqe.user_data()) else {
                continue;
            };
            let res = cqe.result();
            let (bytes_transferred, status) = if res >= 0 {
                (res as u32, CompletionStatus::Success)
            } else if res == -libc::ECANCELED {
                (0, CompletionStatus::Cancelled)
            } else {
                (0, CompletionStatus::Failed(-res))
            };
            out[n] = CompletionResult {
                connection,
                context,
                bytes_transferred,
                status,
            };
            n += 1;
        }
        Ok(n)
    }
}
