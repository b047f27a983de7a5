use crate::error::{EngineError, Result};
use crate::provider::IoProvider;
use crate::types::{BufferId, CompletionQueueId, SegmentDescriptor, SegmentId};
use core::ptr::NonNull;
use std::sync::{Arc, Mutex, PoisonError};
use tcpx_dsa::{CheckoutError, PinnedBlock, SegmentFreeList};

/// One checked-out slice of the arena.
///
/// Ownership is conceptual: the holder must hand the id back through
/// [`BufferArena::release`] exactly once, after the kernel is done with it.
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    id: SegmentId,
    buffer: BufferId,
    offset: u32,
    length: u32,
    ptr: NonNull<u8>,
}

unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// Capacity of the segment in bytes.
    pub fn len(&self) -> usize {
        self.length as usize
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Descriptor covering the first `len` bytes.
    pub fn descriptor(&self, len: u32) -> SegmentDescriptor {
        SegmentDescriptor {
            buffer: self.buffer,
            segment: self.id,
            offset: self.offset,
            length: len.min(self.length),
            ptr: self.ptr.as_ptr(),
        }
    }

    /// Copies `data` to the start of the segment.
    ///
    /// # Safety
    /// No kernel operation may reference the segment, and `data` must fit.
    pub unsafe fn fill(&self, data: &[u8]) {
        debug_assert!(data.len() <= self.len());
        core::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr(), data.len());
    }

    /// The first `len` bytes of the segment.
    ///
    /// # Safety
    /// The operation that wrote them must have been observed complete.
    pub unsafe fn bytes(&self, len: usize) -> &[u8] {
        core::slice::from_raw_parts(self.ptr.as_ptr(), len.min(self.len()))
    }
}

struct Registration {
    block: PinnedBlock,
    buffer: BufferId,
}

/// Pinned, provider-registered memory sliced into equal segments.
///
/// Acquisition happens entirely in [`BufferArena::create`]; any failure
/// there unwinds what was already acquired. The registration is released
/// exactly once, by [`BufferArena::destroy`] or on drop, and only when no
/// segment is checked out.
pub struct BufferArena {
    provider: Arc<dyn IoProvider>,
    cq: CompletionQueueId,
    base: NonNull<u8>,
    buffer: BufferId,
    segment_length: u32,
    free: SegmentFreeList,
    registration: Mutex<Option<Registration>>,
}

// The base pointer is only dereferenced through segments, which the free
// list hands to one holder at a time.
unsafe impl Send for BufferArena {}
unsafe impl Sync for BufferArena {}

impl BufferArena {
    pub fn create(
        provider: Arc<dyn IoProvider>,
        cq: CompletionQueueId,
        segment_length: u32,
        segment_count: u32,
    ) -> Result<Self> {
        if segment_length == 0 || segment_count == 0 {
            return Err(EngineError::InvalidSettings(
                "arena needs a non-zero segment length and count".into(),
            ));
        }
        let len = (segment_length as usize)
            .checked_mul(segment_count as usize)
            .filter(|len| *len <= u32::MAX as usize)
            .ok_or_else(|| EngineError::InvalidSettings("arena must fit in 4 GiB".into()))?;

        let block = PinnedBlock::new(len).map_err(|e| EngineError::platform("mmap", e as i32))?;
        // On failure the block unmaps itself on the way out.
        let buffer = provider.register_buffer(cq, block.as_ptr(), len)?;
        let base = NonNull::new(block.as_ptr()).ok_or(EngineError::platform("mmap", libc::ENOMEM))?;

        tracing::debug!(
            "BufferArena: {} x {} bytes registered with {} (huge: {}, locked: {})",
            segment_count,
            segment_length,
            provider.name(),
            block.is_huge(),
            block.is_locked()
        );

        Ok(Self {
            provider,
            cq,
            base,
            buffer,
            segment_length,
            free: SegmentFreeList::new(segment_count),
            registration: Mutex::new(Some(Registration { block, buffer })),
        })
    }

    /// Pops a free segment. Never blocks.
    pub fn checkout(&self) -> Result<Segment> {
        let id = self.free.checkout().map_err(|e| match e {
            CheckoutError::Exhausted => EngineError::PoolExhausted {
                capacity: self.free.capacity(),
            },
            CheckoutError::Closed => EngineError::Stopped,
        })?;
        let offset = id * self.segment_length;
        // Safety: id < segment_count, so the offset stays inside the block.
        let ptr = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset as usize)) };
        Ok(Segment {
            id: SegmentId(id),
            buffer: self.buffer,
            offset,
            length: self.segment_length,
            ptr,
        })
    }

    /// Returns a segment. Exactly once per checkout, after its operation
    /// completed.
    pub fn release(&self, id: SegmentId) {
        self.free.release(id.0);
    }

    /// Deregisters the buffer, then unmaps it. Idempotent.
    ///
    /// Refuses (and keeps everything mapped) while segments are checked out.
    pub fn destroy(&self) -> Result<()> {
        let mut registration = self
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(current) = registration.as_ref() else {
            return Ok(());
        };
        if !self.free.close() {
            let outstanding = self.free.checked_out();
            tracing::error!(
                "BufferArena: destroy with {} segment(s) still checked out, keeping memory mapped",
                outstanding
            );
            return Err(EngineError::platform("arena_destroy", libc::EBUSY));
        }
        let buffer = current.buffer;
        let deregistered = self.provider.deregister_buffer(self.cq, buffer);
        tracing::debug!(
            "BufferArena: unmapping {} bytes of {:?}",
            current.block.len(),
            buffer
        );
        // Unmap even if deregistration failed: nothing references the block.
        let _ = registration.take();
        deregistered
    }

    /// Gives up the arena without deregistering or unmapping it.
    ///
    /// For when the provider's completion queue is gone and it can no longer
    /// be proven that the kernel stopped writing into the block. The memory
    /// stays mapped for the life of the process.
    pub fn abandon(&self) {
        let mut registration = self
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let _ = self.free.close();
        if let Some(leaked) = registration.take() {
            tracing::error!(
                "BufferArena: abandoning {} bytes of {:?} with {} segment(s) checked out",
                leaked.block.len(),
                leaked.buffer,
                self.free.checked_out()
            );
            std::mem::forget(leaked);
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    pub fn capacity(&self) -> usize {
        self.free.capacity()
    }

    pub fn checked_out(&self) -> usize {
        self.free.checked_out()
    }

    pub fn free_count(&self) -> usize {
        self.free.free_count()
    }

    pub fn segment_length(&self) -> usize {
        self.segment_length as usize
    }

    pub fn buffer_id(&self) -> BufferId {
        self.buffer
    }
}

impl Drop for BufferArena {
    fn drop(&mut self) {
        if self.destroy().is_err() && self.free.checked_out() > 0 {
            // The kernel may still write into checked-out segments.
            let leaked = self
                .registration
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(registration) = leaked {
                std::mem::forget(registration);
            }
        }
    }
}

static_assertions::assert_impl_all!(BufferArena: Send, Sync);
static_assertions::assert_impl_all!(Segment: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::memory::MemoryProvider;

    fn arena(count: u32) -> (Arc<MemoryProvider>, BufferArena) {
        let provider = Arc::new(MemoryProvider::new());
        let cq = provider.create_completion_queue(64).unwrap();
        let arena = BufferArena::create(provider.clone(), cq, 256, count).unwrap();
        (provider, arena)
    }

    #[test]
    fn segments_do_not_overlap() {
        let (_provider, arena) = arena(4);
        let a = arena.checkout().unwrap();
        let b = arena.checkout().unwrap();
        let (da, db) = (a.descriptor(256), b.descriptor(256));
        assert_eq!(db.ptr as usize - da.ptr as usize, 256);
        assert_eq!(db.offset, 256);
        arena.release(a.id());
        arena.release(b.id());
    }

    #[test]
    fn destroy_refuses_while_checked_out() {
        let (provider, arena) = arena(2);
        let seg = arena.checkout().unwrap();
        assert!(arena.destroy().is_err());
        assert_eq!(provider.registered_buffers(), 1);

        arena.release(seg.id());
        arena.destroy().unwrap();
        arena.destroy().unwrap();
        assert_eq!(provider.deregistrations(), 1);
        assert!(matches!(arena.checkout(), Err(EngineError::Stopped)));
    }

    #[test]
    fn abandon_keeps_memory_and_stops_checkouts() {
        let (provider, arena) = arena(2);
        let seg = arena.checkout().unwrap();
        unsafe { seg.fill(b"late") };
        arena.release(seg.id());

        arena.abandon();
        assert!(arena.is_destroyed());
        assert!(matches!(arena.checkout(), Err(EngineError::Stopped)));
        // Never handed back to the provider.
        assert_eq!(provider.deregistrations(), 0);
        // Still mapped: a write the kernel finishes late lands in live memory.
        unsafe { assert_eq!(seg.bytes(4), b"late") };

        // Nothing left for destroy or drop to release.
        arena.destroy().unwrap();
        drop(arena);
        assert_eq!(provider.deregistrations(), 0);
    }

    #[test]
    fn fill_then_read_back() {
        let (_provider, arena) = arena(1);
        let seg = arena.checkout().unwrap();
        unsafe {
            seg.fill(b"abc");
            assert_eq!(seg.bytes(3), b"abc");
        }
        arena.release(seg.id());
    }
}
