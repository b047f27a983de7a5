//! # tcpx-core
//!
//! Settings, the error taxonomy, identifier and completion types, the
//! `IoProvider` capability seam, and the `BufferArena` every reactor owns.

pub mod arena;
pub mod config;
pub mod error;
pub mod provider;
pub mod types;

pub use arena::{BufferArena, Segment};
pub use config::{EngineSettings, ShardPolicy};
pub use error::{EngineError, Result};
pub use provider::memory::{CancelMode, MemoryProvider};
pub use provider::{IoProvider, QueueLimits};
pub use types::{
    BufferId, CompletionQueueId, CompletionResult, CompletionStatus, ConnectionId,
    OperationContext, OperationKind, RequestQueueId, SegmentDescriptor, SegmentId,
};
