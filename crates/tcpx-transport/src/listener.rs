//! Where sockets come from.
//!
//! The supervisor only needs `accept` and `close`; binding, listening and
//! socket-option tuning all happen behind this seam.

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::collections::VecDeque;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use tcpx_core::{EngineError, EngineSettings, Result};

/// A connected socket plus the remote endpoint reported at accept time.
pub struct AcceptedSocket {
    pub socket: Socket,
    pub peer: Option<SocketAddr>,
}

pub trait Listener: Send + Sync + 'static {
    /// Blocks for the next connection. `Ok(None)` once the listener is closed.
    fn accept(&self) -> io::Result<Option<AcceptedSocket>>;

    /// Unblocks `accept` and refuses further connections. Idempotent.
    fn close(&self);

    fn local_addr(&self) -> Option<SocketAddr>;
}

/// Blocking TCP listener built directly on socket2.
pub struct TcpListener {
    socket: Socket,
    local: Option<SocketAddr>,
    use_nagle: bool,
    use_fast_loopback: bool,
    receive_buffer_length: usize,
    send_buffer_length: usize,
    closed: AtomicBool,
}

impl TcpListener {
    pub fn bind(settings: &EngineSettings) -> Result<Self> {
        let addr = settings.bind_addr()?;
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&SockAddr::from(addr))?;
        socket.listen(settings.accept_backlog)?;
        let local = socket.local_addr()?.as_socket();

        tracing::info!("TcpListener: listening on {:?} (backlog {})", local, settings.accept_backlog);

        Ok(Self {
            socket,
            local,
            use_nagle: settings.use_nagle,
            use_fast_loopback: settings.use_fast_loopback,
            receive_buffer_length: settings.receive_buffer_length,
            send_buffer_length: settings.send_buffer_length,
            closed: AtomicBool::new(false),
        })
    }

    fn tune(&self, socket: &Socket) -> io::Result<()> {
        if !self.use_nagle {
            socket.set_nodelay(true)?;
        }
        if self.receive_buffer_length > 0 {
            socket.set_recv_buffer_size(self.receive_buffer_length)?;
        }
        if self.send_buffer_length > 0 {
            socket.set_send_buffer_size(self.send_buffer_length)?;
        }
        if self.use_fast_loopback {
            // Linux has no SIO_LOOPBACK_FAST_PATH equivalent; loopback is already short-circuited.
            tracing::trace!("TcpListener: fast loopback requested, nothing to do on this platform");
        }
        Ok(())
    }
}

impl Listener for TcpListener {
    fn accept(&self) -> io::Result<Option<AcceptedSocket>> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Ok(None);
            }
            match self.socket.accept() {
                Ok((socket, peer)) => {
                    if self.closed.load(Ordering::Acquire) {
                        return Ok(None);
                    }
                    self.tune(&socket)?;
                    return Ok(Some(AcceptedSocket {
                        socket,
                        peer: peer.as_socket(),
                    }));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if self.closed.load(Ordering::Acquire) => {
                    tracing::debug!("TcpListener: accept ended by close ({})", e);
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Wakes a thread blocked in accept(2) with EINVAL.
        if let Err(e) = self.socket.shutdown(Shutdown::Both) {
            tracing::debug!("TcpListener: shutdown on close failed: {}", e);
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }
}

/// In-process listener fed by [`QueueListener::push`].
#[derive(Default)]
pub struct QueueListener {
    state: Mutex<(VecDeque<AcceptedSocket>, bool)>,
    ready: Condvar,
}

impl QueueListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands over a socket. Fails once the listener is closed.
    pub fn push(&self, socket: Socket, peer: Option<SocketAddr>) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.1 {
            return Err(EngineError::Stopped);
        }
        state.0.push_back(AcceptedSocket { socket, peer });
        self.ready.notify_one();
        Ok(())
    }

    /// Convenience for tests: a fresh unconnected TCP socket.
    pub fn push_unconnected(&self, peer: Option<SocketAddr>) -> Result<()> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        self.push(socket, peer)
    }
}

impl Listener for QueueListener {
    fn accept(&self) -> io::Result<Option<AcceptedSocket>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if state.1 {
                return Ok(None);
            }
            if let Some(accepted) = state.0.pop_front() {
                return Ok(Some(accepted));
            }
            state = self.ready.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.1 = true;
        state.0.clear();
        self.ready.notify_all();
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}
