//! # tcpx-transport
//!
//! Per-core reactors that turn kernel completions into resolved
//! [`Connection`] operations, the [`Supervisor`] that shards accepted
//! sockets across them, and the io_uring binding used in production.

pub mod connection;
pub mod listener;
pub mod reactor;
pub mod supervisor;
pub mod uring;

pub use connection::{Connection, ConnectionState};
pub use listener::{AcceptedSocket, Listener, QueueListener, TcpListener};
pub use reactor::{Reactor, ReactorFault, ReactorState};
pub use supervisor::{Supervisor, SupervisorBuilder};
pub use uring::UringProvider;
