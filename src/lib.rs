//! # tcp-x
//!
//! Completion-driven TCP engine: pinned segment arenas, one reactor per
//! core, and a supervisor that shards accepted sockets across them.
//!
//! ```no_run
//! use tcp_x::{EngineSettings, Supervisor};
//!
//! # async fn run() -> tcp_x::Result<()> {
//! let supervisor = Supervisor::builder(EngineSettings::default()).start(|conn| async move {
//!     while let Ok(chunk) = conn.receive().await {
//!         if chunk.is_empty() || conn.send_all(&chunk).await.is_err() {
//!             break;
//!         }
//!     }
//! })?;
//! tokio::signal::ctrl_c().await.ok();
//! supervisor.stop();
//! # Ok(())
//! # }
//! ```

pub use tcpx_core::{
    arena, config, error, provider, types, BufferArena, CancelMode, CompletionResult,
    CompletionStatus, ConnectionId, EngineError, EngineSettings, IoProvider, MemoryProvider,
    QueueLimits, Result, Segment, ShardPolicy,
};
pub use tcpx_dsa::{PinnedBlock, SegmentFreeList};
pub use tcpx_transport::{
    AcceptedSocket, Connection, ConnectionState, Listener, QueueListener, Reactor, ReactorFault,
    ReactorState, Supervisor, SupervisorBuilder, TcpListener, UringProvider,
};
