use core::ffi::c_void;
use core::ptr::NonNull;
use nix::errno::Errno;
use nix::libc;

const PAGE_SIZE: usize = 4096;
const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// A contiguous, page-aligned block of memory locked against paging.
///
/// The block is the backing store of one buffer arena. Its address never
/// changes for its whole lifetime, which is what allows the kernel to be
/// handed raw pointers into it for zero-copy I/O.
///
/// ## Layout
/// Blocks of at least 2MB are first attempted on HugeTLB pages (fewer TLB
/// entries on the hot path). Everything else, and any failed huge mapping,
/// falls back to standard 4K pages.
pub struct PinnedBlock {
    base: NonNull<c_void>,
    len: usize,
    mapped_len: usize,
    huge_mode: bool,
    locked: bool,
}

impl PinnedBlock {
    /// Reserves, commits and locks `len` bytes.
    ///
    /// ## Safety Proof
    /// 1. **Resource Reservation**: `mmap` reserves private anonymous memory, so
    ///    no other mapping aliases the block.
    /// 2. **Pinning**: `mlock` keeps the pages resident. Failure (usually
    ///    `RLIMIT_MEMLOCK`) is tolerated because registration with the I/O
    ///    provider pins the pages it uses on its own.
    pub fn new(len: usize) -> Result<Self, Errno> {
        if len == 0 {
            return Err(Errno::EINVAL);
        }

        let mut huge_mode = false;
        let mut mapped_len = round_up(len, PAGE_SIZE);
        let mut addr = libc::MAP_FAILED;

        if len >= HUGE_PAGE_SIZE {
            let huge_len = round_up(len, HUGE_PAGE_SIZE);
            addr = unsafe {
                libc::mmap(
                    core::ptr::null_mut(),
                    huge_len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB,
                    -1,
                    0,
                )
            };
            if addr != libc::MAP_FAILED {
                huge_mode = true;
                mapped_len = huge_len;
            }
        }

        if addr == libc::MAP_FAILED {
            addr = unsafe {
                libc::mmap(
                    core::ptr::null_mut(),
                    mapped_len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_POPULATE,
                    -1,
                    0,
                )
            };
        }

        if addr == libc::MAP_FAILED {
            return Err(Errno::last());
        }

        let base = NonNull::new(addr).ok_or(Errno::ENOMEM)?;

        // # Safety: base/mapped_len describe the mapping created above.
        let locked = unsafe { libc::mlock(base.as_ptr(), mapped_len) } == 0;
        if !locked {
            tracing::warn!(
                "PinnedBlock: mlock of {} bytes failed ({}), relying on provider registration to pin",
                mapped_len,
                Errno::last()
            );
        }

        tracing::debug!(
            "PinnedBlock: mapped {} bytes (requested {}, huge: {}, locked: {})",
            mapped_len,
            len,
            huge_mode,
            locked
        );

        Ok(Self {
            base,
            len,
            mapped_len,
            huge_mode,
            locked,
        })
    }

    /// Base address of the block.
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr() as *mut u8
    }

    /// Usable length (the requested length, not the rounded mapping).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_huge(&self) -> bool {
        self.huge_mode
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Returns a pointer `offset` bytes into the block.
    ///
    /// Panics when `offset + len` runs past the usable length.
    pub fn region(&self, offset: usize, len: usize) -> *mut u8 {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.len),
            "PinnedBlock: region {}+{} out of bounds ({})",
            offset,
            len,
            self.len
        );
        // # Safety: bounds checked above, the mapping is live for &self.
        unsafe { self.as_ptr().add(offset) }
    }
}

impl Drop for PinnedBlock {
    fn drop(&mut self) {
        // # Safety: base and mapped_len are valid and owned by this struct.
        unsafe {
            if self.locked {
                libc::munlock(self.base.as_ptr(), self.mapped_len);
            }
            libc::munmap(self.base.as_ptr(), self.mapped_len);
        }
    }
}

// The block is plain memory; synchronisation of its contents is the job of
// whoever hands out regions of it.
unsafe impl Send for PinnedBlock {}
unsafe impl Sync for PinnedBlock {}

fn round_up(len: usize, align: usize) -> usize {
    (len + align - 1) & !(align - 1)
}
