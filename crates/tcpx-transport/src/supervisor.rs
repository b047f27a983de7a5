use crate::connection::Connection;
use crate::listener::{Listener, TcpListener};
use crate::reactor::{Reactor, ReactorFault};
use crate::uring::UringProvider;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tcpx_core::{EngineError, EngineSettings, IoProvider, Result, ShardPolicy};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::mpsc;

struct SupervisorShared {
    reactors: Vec<Reactor>,
    listener: Arc<dyn Listener>,
    policy: ShardPolicy,
    next: AtomicUsize,
    stopping: AtomicBool,
}

impl SupervisorShared {
    /// Target reactor for the next connection. Stopped reactors are skipped.
    fn pick(&self) -> Option<&Reactor> {
        let live = |r: &&Reactor| !r.is_stopped();
        match self.policy {
            ShardPolicy::RoundRobin => {
                let n = self.reactors.len();
                let start = self.next.fetch_add(1, Ordering::Relaxed);
                (0..n)
                    .map(|i| &self.reactors[(start + i) % n])
                    .find(live)
            }
            ShardPolicy::LeastLoaded => self
                .reactors
                .iter()
                .filter(live)
                .min_by_key(|r| (r.connection_count(), r.id())),
        }
    }

    fn accept_loop<H, Fut>(&self, handler: Arc<H>, runtime: Handle)
    where
        H: Fn(Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        loop {
            let accepted = match self.listener.accept() {
                Ok(Some(accepted)) => accepted,
                Ok(None) => break,
                Err(e) => {
                    if self.stopping.load(Ordering::Acquire) {
                        break;
                    }
                    tracing::warn!("Supervisor: accept failed: {}", e);
                    std::thread::sleep(Duration::from_millis(10));
                    continue;
                }
            };
            if self.stopping.load(Ordering::Acquire) {
                break;
            }

            let Some(reactor) = self.pick() else {
                tracing::warn!("Supervisor: no live reactor, dropping connection from {:?}", accepted.peer);
                continue;
            };
            match reactor.admit(accepted) {
                Ok(connection) => {
                    let handler = handler.clone();
                    runtime.spawn(async move { (*handler)(connection).await });
                }
                Err(e) => tracing::warn!("Supervisor: reactor {} refused connection: {}", reactor.id(), e),
            }
        }
        tracing::debug!("Supervisor: acceptor exiting");
    }
}

pub struct SupervisorBuilder {
    settings: EngineSettings,
    provider: Option<Arc<dyn IoProvider>>,
    listener: Option<Arc<dyn Listener>>,
    runtime: Option<Handle>,
}

impl SupervisorBuilder {
    pub fn with_provider(mut self, provider: Arc<dyn IoProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn Listener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Runtime the handler tasks are spawned on. Defaults to the current
    /// runtime, or a private multi-threaded one when there is none.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Validates settings, starts every reactor, then begins accepting.
    ///
    /// Every failure unwinds what was already built: reactors are stopped
    /// (which releases their arenas and queues) before the error returns.
    pub fn start<H, Fut>(self, handler: H) -> Result<Supervisor>
    where
        H: Fn(Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let settings = self.settings;
        settings.validate()?;

        let provider = self
            .provider
            .unwrap_or_else(|| Arc::new(UringProvider::new()) as Arc<dyn IoProvider>);
        let (faults_tx, faults_rx) = mpsc::unbounded_channel();

        let count = settings.effective_reactor_count();
        tracing::info!(
            "Supervisor: starting {} reactor(s) on {} ({} x {} byte segments each)",
            count,
            provider.name(),
            settings.segment_count,
            settings.segment_length
        );

        let mut reactors = Vec::with_capacity(count);
        for id in 0..count {
            match Reactor::start(id, provider.clone(), &settings, Some(faults_tx.clone())) {
                Ok(reactor) => reactors.push(reactor),
                Err(e) => {
                    tracing::error!("Supervisor: reactor {} failed to start: {}", id, e);
                    stop_all(&reactors);
                    return Err(e);
                }
            }
        }

        let listener = match self.listener {
            Some(listener) => listener,
            None => match TcpListener::bind(&settings) {
                Ok(listener) => Arc::new(listener) as Arc<dyn Listener>,
                Err(e) => {
                    stop_all(&reactors);
                    return Err(e);
                }
            },
        };

        let (runtime, owned) = match self.runtime.or_else(|| Handle::try_current().ok()) {
            Some(handle) => (handle, None),
            None => match tokio::runtime::Builder::new_multi_thread()
                .thread_name("tcpx-handler")
                .enable_all()
                .build()
            {
                Ok(rt) => (rt.handle().clone(), Some(rt)),
                Err(e) => {
                    listener.close();
                    stop_all(&reactors);
                    return Err(EngineError::from(e));
                }
            },
        };

        let shared = Arc::new(SupervisorShared {
            reactors,
            listener,
            policy: settings.shard_policy,
            next: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
        });

        let acceptor_shared = shared.clone();
        let handler = Arc::new(handler);
        let acceptor = std::thread::Builder::new()
            .name("tcpx-acceptor".to_string())
            .spawn(move || acceptor_shared.accept_loop(handler, runtime));
        let acceptor = match acceptor {
            Ok(thread) => thread,
            Err(e) => {
                shared.listener.close();
                stop_all(&shared.reactors);
                return Err(EngineError::from(e));
            }
        };

        Ok(Supervisor {
            shared,
            acceptor: Mutex::new(Some(acceptor)),
            faults: Mutex::new(Some(faults_rx)),
            stopped: Mutex::new(false),
            runtime: owned,
        })
    }
}

fn stop_all(reactors: &[Reactor]) {
    for reactor in reactors {
        reactor.stop();
    }
}

/// Owns the reactors and the listener; hands each accepted connection to
/// the handler exactly once.
pub struct Supervisor {
    shared: Arc<SupervisorShared>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
    faults: Mutex<Option<mpsc::UnboundedReceiver<ReactorFault>>>,
    stopped: Mutex<bool>,
    /// Private runtime for handler tasks, when none was ambient at start.
    runtime: Option<Runtime>,
}

impl Supervisor {
    pub fn builder(settings: EngineSettings) -> SupervisorBuilder {
        SupervisorBuilder {
            settings,
            provider: None,
            listener: None,
            runtime: None,
        }
    }

    /// Stops accepting, then stops every reactor. Returns once every reactor
    /// has drained to zero outstanding operations and released its arena.
    /// Idempotent and callable from any thread.
    pub fn stop(&self) {
        let mut stopped = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        if *stopped {
            return;
        }
        tracing::info!("Supervisor: stopping");
        self.shared.stopping.store(true, Ordering::Release);
        self.shared.listener.close();

        let acceptor = self
            .acceptor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(acceptor) = acceptor {
            if acceptor.join().is_err() {
                tracing::error!("Supervisor: acceptor thread panicked");
            }
        }

        stop_all(&self.shared.reactors);
        *stopped = true;
        tracing::info!("Supervisor: stopped");
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Receiver of reactor faults. Only the first call gets it.
    pub fn take_faults(&self) -> Option<mpsc::UnboundedReceiver<ReactorFault>> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    pub fn reactors(&self) -> &[Reactor] {
        &self.shared.reactors
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.listener.local_addr()
    }

    pub fn outstanding_operations(&self) -> usize {
        self.shared
            .reactors
            .iter()
            .map(Reactor::outstanding_operations)
            .sum()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.reactors.iter().map(Reactor::connection_count).sum()
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop();
        // A blocking runtime shutdown panics inside async code.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
