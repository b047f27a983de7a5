use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

/// Why a checkout produced no segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutError {
    /// Every segment is currently checked out.
    Exhausted,
    /// The list was closed for teardown.
    Closed,
}

struct FreeState {
    /// Stack of free ids. LIFO keeps recently released (cache-warm) segments hot.
    free: Vec<u32>,
    /// `held[id]` is true while `id` is checked out.
    held: Vec<bool>,
    closed: bool,
}

/// Bounded free list of segment ids `0..capacity`.
///
/// ## Invariants
/// - An id is never handed out twice without an intervening `release`.
/// - `free_count() + checked_out() == capacity()` at every observable point.
///
/// The recommended deployment is one list per reactor, so the lock is only
/// ever taken by a single thread on the hot path and never contends.
pub struct SegmentFreeList {
    state: Mutex<FreeState>,
    capacity: usize,
    checked_out: AtomicUsize,
}

impl SegmentFreeList {
    pub fn new(capacity: u32) -> Self {
        // Reversed so the first checkout yields id 0.
        let free: Vec<u32> = (0..capacity).rev().collect();
        Self {
            state: Mutex::new(FreeState {
                free,
                held: vec![false; capacity as usize],
                closed: false,
            }),
            capacity: capacity as usize,
            checked_out: AtomicUsize::new(0),
        }
    }

    /// Pops one id. Never blocks: an empty list fails fast.
    pub fn checkout(&self) -> Result<u32, CheckoutError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return Err(CheckoutError::Closed);
        }
        let id = state.free.pop().ok_or(CheckoutError::Exhausted)?;
        state.held[id as usize] = true;
        self.checked_out.fetch_add(1, Ordering::AcqRel);
        Ok(id)
    }

    /// Returns `id` to the list.
    ///
    /// # Protocol
    /// Exactly once per successful checkout. Releasing an id that is not
    /// checked out is a lifetime violation and panics.
    pub fn release(&self, id: u32) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        assert!((id as usize) < self.capacity, "SegmentFreeList: id {} out of range", id);
        if !state.held[id as usize] {
            panic!("SegmentFreeList: release called on segment {} that is not checked out", id);
        }
        state.held[id as usize] = false;
        state.free.push(id);
        self.checked_out.fetch_sub(1, Ordering::AcqRel);
    }

    /// Closes the list if nothing is checked out. Returns `false` (and stays
    /// open) while any segment is still held.
    pub fn close(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.free.len() != self.capacity {
            return false;
        }
        state.closed = true;
        true
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).closed
    }

    pub fn is_held(&self, id: u32) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.held.get(id as usize).copied().unwrap_or(false)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn checked_out(&self) -> usize {
        self.checked_out.load(Ordering::Acquire)
    }

    pub fn free_count(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).free.len()
    }
}

static_assertions::assert_impl_all!(SegmentFreeList: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hands_out_ascending_ids_then_reuses_released() {
        let list = SegmentFreeList::new(3);
        assert_eq!(list.checkout(), Ok(0));
        assert_eq!(list.checkout(), Ok(1));
        assert_eq!(list.checkout(), Ok(2));
        assert_eq!(list.checkout(), Err(CheckoutError::Exhausted));

        list.release(1);
        assert_eq!(list.checkout(), Ok(1));
        assert_eq!(list.checked_out() + list.free_count(), list.capacity());
    }

    #[test]
    #[should_panic(expected = "not checked out")]
    fn double_release_panics() {
        let list = SegmentFreeList::new(2);
        let id = list.checkout().unwrap();
        list.release(id);
        list.release(id);
    }

    #[test]
    fn close_refuses_while_held() {
        let list = SegmentFreeList::new(2);
        let id = list.checkout().unwrap();
        assert!(!list.close());
        list.release(id);
        assert!(list.close());
        assert_eq!(list.checkout(), Err(CheckoutError::Closed));
    }
}
