//! # tcpx-dsa: Pinned Foundations
//!
//! Page-granular pinned memory and the segment free list that carves it up.
//! Nothing in this crate knows about sockets or completion queues.

pub mod block;
pub mod free_list;

pub use block::PinnedBlock;
pub use free_list::{CheckoutError, SegmentFreeList};
