use crate::connection::{next_connection_id, Connection, ConnectionShared};
use crate::listener::AcceptedSocket;
use std::collections::HashMap;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tcpx_core::{
    BufferArena, CompletionQueueId, CompletionResult, ConnectionId, EngineError, EngineSettings,
    IoProvider, QueueLimits, Result,
};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactorState {
    Idle,
    Armed,
    Draining,
    Stopped,
}

impl ReactorState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ReactorState::Idle,
            1 => ReactorState::Armed,
            2 => ReactorState::Draining,
            _ => ReactorState::Stopped,
        }
    }
}

/// Published once when a reactor loses its completion queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactorFault {
    pub reactor: usize,
    /// Connections force-closed with `QueueCorrupted`.
    pub connections: usize,
}

pub(crate) struct ReactorShared {
    pub(crate) id: usize,
    pub(crate) provider: Arc<dyn IoProvider>,
    pub(crate) arena: BufferArena,
    cq: CompletionQueueId,
    limits: QueueLimits,
    connections: Mutex<HashMap<ConnectionId, Arc<ConnectionShared>>>,
    outstanding: AtomicUsize,
    orphaned: AtomicU64,
    state: AtomicU8,
    shutdown: AtomicBool,
    drain_batch: usize,
    poll_interval: Duration,
    faults: Option<mpsc::UnboundedSender<ReactorFault>>,
}

impl ReactorShared {
    fn connections(&self) -> MutexGuard<'_, HashMap<ConnectionId, Arc<ConnectionShared>>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn outstanding_inc(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn outstanding_dec(&self) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn forget(&self, id: ConnectionId) {
        self.connections().remove(&id);
    }

    fn set_state(&self, state: ReactorState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn dispatch(&self, entry: &CompletionResult) {
        // Clone out so the map lock is never held while a connection is locked.
        let connection = self.connections().get(&entry.connection).cloned();
        let routed = match connection {
            Some(connection) => connection.complete(entry),
            None => false,
        };
        if !routed {
            self.orphaned.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                "Reactor {}: dropping completion for unknown {} / {:?}",
                self.id,
                entry.connection,
                entry.context
            );
        }
    }

    /// Dequeues and dispatches until a dequeue comes back short of the cap.
    fn drain(&self, batch: &mut [CompletionResult]) -> Result<usize> {
        let mut total = 0;
        loop {
            let n = self.provider.dequeue(self.cq, batch)?;
            for entry in &batch[..n] {
                self.dispatch(entry);
            }
            total += n;
            if n < batch.len() {
                return Ok(total);
            }
        }
    }

    /// Arms, waits and drains once. `Err` only for queue corruption.
    fn turn(&self, batch: &mut [CompletionResult], armed: &mut bool) -> Result<()> {
        if !*armed {
            if let Err(e) = self.provider.notify(self.cq) {
                tracing::warn!("Reactor {}: arming failed, retrying: {}", self.id, e);
                std::thread::sleep(self.poll_interval);
                return Ok(());
            }
            *armed = true;
            self.set_state(ReactorState::Armed);
        }

        match self.provider.wait(self.cq, self.poll_interval) {
            Ok(false) => return Ok(()),
            Ok(true) => *armed = false,
            Err(e) => {
                tracing::warn!("Reactor {}: wait failed, retrying: {}", self.id, e);
                *armed = false;
                return Ok(());
            }
        }

        self.set_state(ReactorState::Draining);
        let drained = self.drain(batch);
        self.set_state(ReactorState::Idle);
        match drained {
            Ok(_) => Ok(()),
            Err(EngineError::QueueCorrupted { .. }) => Err(EngineError::QueueCorrupted { reactor: self.id }),
            Err(e) => {
                tracing::warn!("Reactor {}: drain failed: {}", self.id, e);
                Ok(())
            }
        }
    }

    fn run(&self) {
        let mut batch = vec![CompletionResult::EMPTY; self.drain_batch];
        let mut armed = false;

        while !self.shutdown.load(Ordering::Acquire) {
            if self.turn(&mut batch, &mut armed).is_err() {
                self.fault();
                return;
            }
        }

        self.drain_for_shutdown(&mut batch, &mut armed);
    }

    /// Disconnects everything, then keeps draining until every operation
    /// has completed and every connection retired.
    fn drain_for_shutdown(&self, batch: &mut [CompletionResult], armed: &mut bool) {
        self.set_state(ReactorState::Draining);
        let live: Vec<_> = self.connections().values().cloned().collect();
        tracing::info!(
            "Reactor {}: stopping, disconnecting {} connection(s)",
            self.id,
            live.len()
        );
        for connection in live {
            connection.disconnect();
        }

        let mut turns = 0u64;
        while self.outstanding.load(Ordering::Acquire) > 0 || !self.connections().is_empty() {
            if self.turn(batch, armed).is_err() {
                self.fault();
                return;
            }
            turns += 1;
            if turns % 100 == 0 {
                tracing::debug!(
                    "Reactor {}: still waiting on {} operation(s)",
                    self.id,
                    self.outstanding.load(Ordering::Acquire)
                );
            }
        }

        self.teardown();
    }

    /// The completion queue can no longer be trusted: fail every pending
    /// operation, close every connection, report, stop.
    fn fault(&self) {
        tracing::error!("Reactor {}: completion queue corrupted, force-closing", self.id);
        self.shutdown.store(true, Ordering::Release);
        let owned: Vec<_> = self.connections().drain().map(|(_, c)| c).collect();
        for connection in &owned {
            connection.fail_all(self.id);
        }
        if let Some(faults) = &self.faults {
            let _ = faults.send(ReactorFault {
                reactor: self.id,
                connections: owned.len(),
            });
        }
        // Operations the kernel still holds were failed above without ever
        // completing. Drop the queue first and never unmap their memory.
        self.close_queue();
        self.arena.abandon();
        self.stopped();
    }

    fn teardown(&self) {
        if let Err(e) = self.arena.destroy() {
            tracing::error!("Reactor {}: arena teardown failed: {}", self.id, e);
        }
        self.close_queue();
        self.stopped();
    }

    fn close_queue(&self) {
        if let Err(e) = self.provider.close_completion_queue(self.cq) {
            tracing::warn!("Reactor {}: closing completion queue failed: {}", self.id, e);
        }
    }

    fn stopped(&self) {
        self.set_state(ReactorState::Stopped);
        tracing::info!("Reactor {}: stopped", self.id);
    }
}

/// One completion queue, one arena, one dedicated thread.
pub struct Reactor {
    shared: Arc<ReactorShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Reactor {
    /// Creates the queue and arena, then starts the loop thread. Anything
    /// acquired before a failure is released before returning.
    pub fn start(
        id: usize,
        provider: Arc<dyn IoProvider>,
        settings: &EngineSettings,
        faults: Option<mpsc::UnboundedSender<ReactorFault>>,
    ) -> Result<Self> {
        let cq = provider.create_completion_queue(settings.completion_queue_depth)?;
        let arena = match BufferArena::create(
            provider.clone(),
            cq,
            settings.segment_length,
            settings.segment_count,
        ) {
            Ok(arena) => arena,
            Err(e) => {
                let _ = provider.close_completion_queue(cq);
                return Err(e);
            }
        };

        let shared = Arc::new(ReactorShared {
            id,
            provider,
            arena,
            cq,
            limits: QueueLimits {
                max_outstanding_receive: settings.max_outstanding_receive,
                max_outstanding_send: settings.max_outstanding_send,
            },
            connections: Mutex::new(HashMap::new()),
            outstanding: AtomicUsize::new(0),
            orphaned: AtomicU64::new(0),
            state: AtomicU8::new(ReactorState::Idle as u8),
            shutdown: AtomicBool::new(false),
            drain_batch: settings.drain_batch.max(1),
            poll_interval: Duration::from_millis(settings.poll_interval_ms.max(1)),
            faults,
        });

        let pin = settings.pin_reactors;
        let worker = shared.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("tcpx-reactor-{}", id))
            .spawn(move || {
                if pin {
                    pin_to_core(id);
                }
                tracing::info!("Reactor {}: running on {}", id, worker.provider.name());
                worker.run();
            });

        match spawned {
            Ok(thread) => Ok(Self {
                shared,
                thread: Mutex::new(Some(thread)),
            }),
            Err(e) => {
                shared.teardown();
                Err(EngineError::from(e))
            }
        }
    }

    /// Binds an accepted socket to this reactor.
    pub fn admit(&self, accepted: AcceptedSocket) -> Result<Connection> {
        let shared = &self.shared;
        let id = next_connection_id();
        let mut connections = shared.connections();
        if shared.shutdown.load(Ordering::Acquire) {
            return Err(EngineError::Stopped);
        }
        let rq = shared.provider.create_request_queue(
            shared.cq,
            accepted.socket.as_raw_fd(),
            id,
            shared.limits,
        )?;
        let connection = Arc::new(ConnectionShared::new(
            id,
            rq,
            accepted.socket,
            accepted.peer,
            shared.clone(),
        ));
        connections.insert(id, connection.clone());
        drop(connections);

        tracing::debug!("Reactor {}: admitted {} from {:?}", shared.id, id, accepted.peer);
        Ok(Connection::new(connection))
    }

    /// Signals shutdown and joins the loop thread, which returns only after
    /// every outstanding operation completed and the arena was released.
    /// Idempotent.
    pub fn stop(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        let thread = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                tracing::error!("Reactor {}: loop thread panicked", self.shared.id);
            }
        }
    }

    pub fn id(&self) -> usize {
        self.shared.id
    }

    pub fn state(&self) -> ReactorState {
        ReactorState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    pub fn completion_queue(&self) -> CompletionQueueId {
        self.shared.cq
    }

    pub fn outstanding_operations(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections().len()
    }

    pub fn arena_checked_out(&self) -> usize {
        self.shared.arena.checked_out()
    }

    pub fn arena_capacity(&self) -> usize {
        self.shared.arena.capacity()
    }

    /// Completions that named no live operation.
    pub fn orphaned_completions(&self) -> u64 {
        self.shared.orphaned.load(Ordering::Relaxed)
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn pin_to_core(id: usize) {
    let Some(cores) = core_affinity::get_core_ids().filter(|c| !c.is_empty()) else {
        tracing::warn!("Reactor {}: core ids unavailable, not pinning", id);
        return;
    };
    let core = cores[id % cores.len()];
    if core_affinity::set_for_current(core) {
        tracing::info!("Reactor {}: pinned to core {}", id, core.id);
    } else {
        tracing::warn!("Reactor {}: pinning to core {} failed", id, core.id);
    }
}
