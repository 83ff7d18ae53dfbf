//! Fixed-size supervised pool of analysis workers.
//!
//! The pool owns one supervision task per worker (see `worker`); callers
//! obtain connected handlers through `next_handler`, which round-robins
//! across live workers and suspends while none are connected. Worker
//! lifecycle events are published on a broadcast stream; the only fatal one
//! is `WorkerFailedToStart`, which means the executable is missing or
//! unrunnable and the pool's owner should treat the pool as unusable.

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::WorkerClient;
use crate::launcher::{Launcher, ProcessLauncher, resolve_executable};
use crate::worker::{WorkerContext, WorkerSlot, WorkerState, supervise};

/// Worker lifecycle notifications. Every subscriber sees each event once.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// A worker connected; the next `next_handler` call will not suspend.
    WorkerConnected { worker: usize },
    /// A worker's executable could not be launched. The worker is
    /// terminated and will not be retried; this usually means the worker
    /// program is not installed.
    WorkerFailedToStart { worker: usize, error: String },
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("worker pool already started")]
    AlreadyStarted,
    #[error("worker pool has shut down")]
    ShutDown,
}

/// Per-worker launch settings, fixed once the pool starts.
pub(crate) struct WorkerSettings {
    pub executable: PathBuf,
    pub args: Vec<OsString>,
    pub rendezvous_prefix: String,
}

/// Pool configuration. Immutable once `WorkerPool::start` is called.
pub struct PoolConfig {
    executable: PathBuf,
    args: Vec<OsString>,
    worker_count: usize,
    rendezvous_prefix: String,
    launcher: Arc<dyn Launcher>,
}

impl PoolConfig {
    /// Configuration for the given worker executable. Bare names are
    /// resolved next to the host executable first, then via `$PATH`.
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            worker_count: default_worker_count(),
            rendezvous_prefix: "ropehost".to_string(),
            launcher: Arc::new(ProcessLauncher),
        }
    }

    /// Extra arguments passed to every worker, before the rendezvous
    /// address (which is always appended last).
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count.max(1);
        self
    }

    /// Prefix for rendezvous socket names; a random token is appended per
    /// worker start.
    pub fn with_rendezvous_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.rendezvous_prefix = prefix.into();
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = launcher;
        self
    }
}

/// Default pool size: half the cores, clamped to 1..=2 (workers hold whole
/// project indexes in memory; more than two rarely pays off).
fn default_worker_count() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cpus / 2).clamp(1, 2)
}

struct PoolShared {
    config: PoolConfig,
    slots: Vec<Arc<WorkerSlot>>,
    cursor: AtomicUsize,
    started: AtomicBool,
    events: broadcast::Sender<PoolEvent>,
    connected_tx: watch::Sender<u64>,
    connected_rx: watch::Receiver<u64>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to the pool. Cheap to clone; all clones share the same workers.
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Self {
        let slots = (0..config.worker_count)
            .map(|_| Arc::new(WorkerSlot::new()))
            .collect();
        let (events, _) = broadcast::channel(32);
        let (connected_tx, connected_rx) = watch::channel(0);

        Self {
            shared: Arc::new(PoolShared {
                config,
                slots,
                cursor: AtomicUsize::new(0),
                started: AtomicBool::new(false),
                events,
                connected_tx,
                connected_rx,
                shutdown: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Starts every worker. Must be called from within the tokio runtime;
    /// errors if the pool was already started.
    pub fn start(&self) -> Result<(), PoolError> {
        let shared = &self.shared;
        if shared.started.swap(true, Ordering::SeqCst) {
            return Err(PoolError::AlreadyStarted);
        }

        let settings = Arc::new(WorkerSettings {
            executable: resolve_executable(&shared.config.executable),
            args: shared.config.args.clone(),
            rendezvous_prefix: shared.config.rendezvous_prefix.clone(),
        });

        tracing::info!(
            executable = %settings.executable.display(),
            workers = shared.slots.len(),
            "Starting worker pool"
        );

        let mut tasks = shared
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for (index, slot) in shared.slots.iter().enumerate() {
            let ctx = WorkerContext {
                index,
                settings: Arc::clone(&settings),
                launcher: Arc::clone(&shared.config.launcher),
                slot: Arc::clone(slot),
                events: shared.events.clone(),
                connected: shared.connected_tx.clone(),
                shutdown: shared.shutdown.clone(),
            };
            tasks.push(tokio::spawn(supervise(ctx)));
        }

        Ok(())
    }

    /// Returns a connected worker's handler, round-robin. Suspends while no
    /// worker is connected and resumes as soon as one is; errors only after
    /// the pool has shut down.
    pub async fn next_handler(&self) -> Result<Arc<WorkerClient>, PoolError> {
        let mut connected = self.shared.connected_rx.clone();
        loop {
            if self.shared.shutdown.is_cancelled() {
                return Err(PoolError::ShutDown);
            }
            // Mark the current generation before scanning so a connection
            // racing the scan wakes us instead of being missed.
            connected.borrow_and_update();
            if let Some(client) = self.try_next_handler() {
                return Ok(client);
            }
            tracing::debug!("No connected workers, waiting");
            if connected.changed().await.is_err() {
                return Err(PoolError::ShutDown);
            }
        }
    }

    /// One scan over the workers starting at the cursor; advances the
    /// cursor past the worker it hands out.
    fn try_next_handler(&self) -> Option<Arc<WorkerClient>> {
        let slots = &self.shared.slots;
        let start = self.shared.cursor.load(Ordering::Relaxed);
        for offset in 0..slots.len() {
            let index = (start + offset) % slots.len();
            if let Some(client) = slots[index].client() {
                self.shared
                    .cursor
                    .store((index + 1) % slots.len(), Ordering::Relaxed);
                return Some(client);
            }
        }
        None
    }

    /// Subscribe to worker lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<PoolEvent> {
        self.shared.events.subscribe()
    }

    pub fn worker_count(&self) -> usize {
        self.shared.slots.len()
    }

    pub fn connected_count(&self) -> usize {
        self.shared
            .slots
            .iter()
            .filter(|slot| slot.state() == WorkerState::Connected)
            .count()
    }

    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.shared.slots.iter().map(|slot| slot.state()).collect()
    }

    /// Tears down every worker and waits for all of them to finish.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down worker pool");
        self.shared.shutdown.cancel();
        // Wake any next_handler waiters so they observe the shutdown.
        self.shared.connected_tx.send_modify(|generation| *generation += 1);

        let tasks = std::mem::take(
            &mut *self
                .shared
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Worker supervision task panicked");
            }
        }
        tracing::debug!("Worker pool shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::JsonCodec;
    use crate::bridge::protocol::{Message, Proposal};
    use crate::launcher::{LaunchError, WorkerCommand, WorkerProcess};
    use futures::{SinkExt, StreamExt};
    use std::io;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::net::UnixStream;
    use tokio::sync::{Semaphore, mpsc};
    use tokio::time::timeout;
    use tokio_util::codec::Framed;

    const WAIT: Duration = Duration::from_secs(5);

    fn canned_response(request: &Message) -> Message {
        match request {
            Message::CreateProjectRequest { .. } => Message::CreateProjectResponse {},
            Message::DestroyProjectRequest { .. } => Message::DestroyProjectResponse {},
            Message::RebuildSymbolIndexRequest { .. } => Message::RebuildSymbolIndexResponse {},
            Message::UpdateSymbolIndexRequest { .. } => Message::UpdateSymbolIndexResponse {},
            Message::CompletionRequest { context } => Message::CompletionResponse {
                insertion_position: context.cursor_position,
                calltip: None,
                proposals: vec![Proposal::named("path"), Proposal::named("getcwd")],
            },
            Message::TooltipRequest { .. } => Message::TooltipResponse {
                rich_text: Some("os module docs".to_string()),
            },
            Message::DefinitionLocationRequest { .. } => Message::DefinitionLocationResponse {
                file_path: None,
                line: None,
            },
            Message::SearchRequest { .. } => Message::SearchResponse {
                results: Vec::new(),
            },
            other => panic!("scripted worker received a response frame: {other:?}"),
        }
    }

    struct LaunchRecord {
        rendezvous_path: std::path::PathBuf,
        exit_tx: mpsc::UnboundedSender<ExitStatus>,
        responder: tokio::task::JoinHandle<()>,
    }

    /// In-process worker: connects back over the real rendezvous socket and
    /// answers every request with a canned response. The returned process
    /// handle "exits" only when the test says so.
    struct ScriptedLauncher {
        gated: bool,
        gate: Semaphore,
        records: StdMutex<Vec<LaunchRecord>>,
    }

    impl ScriptedLauncher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                gated: false,
                gate: Semaphore::new(0),
                records: StdMutex::new(Vec::new()),
            })
        }

        /// Workers connect only after `release_one` is called.
        fn gated() -> Arc<Self> {
            Arc::new(Self {
                gated: true,
                gate: Semaphore::new(0),
                records: StdMutex::new(Vec::new()),
            })
        }

        fn release_one(&self) {
            self.gate.add_permits(1);
        }

        fn launch_count(&self) -> usize {
            self.records.lock().unwrap().len()
        }

        fn rendezvous_path(&self, launch: usize) -> std::path::PathBuf {
            self.records.lock().unwrap()[launch].rendezvous_path.clone()
        }

        /// Simulates a crash of the given launch: the connection drops and
        /// the process handle reports the exit status.
        fn crash(&self, launch: usize, status: ExitStatus) {
            let records = self.records.lock().unwrap();
            let record = &records[launch];
            record.responder.abort();
            let _ = record.exit_tx.send(status);
        }
    }

    impl Launcher for Arc<ScriptedLauncher> {
        fn launch(&self, command: &WorkerCommand) -> Result<Box<dyn WorkerProcess>, LaunchError> {
            let (exit_tx, exit_rx) = mpsc::unbounded_channel();
            let path = command.rendezvous_path.clone();
            let this = Arc::clone(self);
            let responder = tokio::spawn(async move {
                if this.gated {
                    match this.gate.acquire().await {
                        Ok(permit) => permit.forget(),
                        Err(_) => return,
                    }
                }
                let Ok(stream) = UnixStream::connect(&path).await else {
                    return;
                };
                let mut framed = Framed::new(stream, JsonCodec::<Message>::new());
                while let Some(Ok(request)) = framed.next().await {
                    if framed.send(canned_response(&request)).await.is_err() {
                        break;
                    }
                }
            });

            self.records.lock().unwrap().push(LaunchRecord {
                rendezvous_path: command.rendezvous_path.clone(),
                exit_tx,
                responder,
            });
            Ok(Box::new(FakeProcess {
                exit_rx,
                exited: None,
            }))
        }
    }

    struct FakeProcess {
        exit_rx: mpsc::UnboundedReceiver<ExitStatus>,
        exited: Option<ExitStatus>,
    }

    #[async_trait::async_trait]
    impl WorkerProcess for FakeProcess {
        async fn wait(&mut self) -> io::Result<ExitStatus> {
            if let Some(status) = self.exited {
                return Ok(status);
            }
            match self.exit_rx.recv().await {
                Some(status) => {
                    self.exited = Some(status);
                    Ok(status)
                }
                None => std::future::pending::<io::Result<ExitStatus>>().await,
            }
        }

        fn terminate(&mut self) -> io::Result<()> {
            self.exited = Some(ExitStatus::from_raw(0));
            Ok(())
        }

        fn kill(&mut self) -> io::Result<()> {
            self.exited = Some(ExitStatus::from_raw(9));
            Ok(())
        }
    }

    /// Launcher whose executable is never found: every launch is fatal.
    struct FailingLauncher {
        attempts: StdMutex<usize>,
    }

    impl Launcher for Arc<FailingLauncher> {
        fn launch(&self, _command: &WorkerCommand) -> Result<Box<dyn WorkerProcess>, LaunchError> {
            *self.attempts.lock().unwrap() += 1;
            Err(LaunchError::Spawn(io::Error::new(
                io::ErrorKind::NotFound,
                "no such executable",
            )))
        }
    }

    fn pool_with(
        launcher: Arc<ScriptedLauncher>,
        workers: usize,
        prefix: &str,
    ) -> WorkerPool {
        WorkerPool::new(
            PoolConfig::new("analysis-worker")
                .with_worker_count(workers)
                .with_rendezvous_prefix(prefix)
                .with_launcher(Arc::new(launcher)),
        )
    }

    async fn wait_connected(events: &mut broadcast::Receiver<PoolEvent>, n: usize) {
        let mut seen = 0;
        while seen < n {
            match timeout(WAIT, events.recv()).await.unwrap().unwrap() {
                PoolEvent::WorkerConnected { .. } => seen += 1,
                PoolEvent::WorkerFailedToStart { worker, error } => {
                    panic!("worker {worker} failed to start: {error}")
                }
            }
        }
    }

    #[tokio::test]
    async fn round_robin_returns_each_connected_worker_once() {
        let launcher = ScriptedLauncher::new();
        let pool = pool_with(Arc::clone(&launcher), 3, "rh_rr");
        let mut events = pool.events();
        pool.start().unwrap();
        wait_connected(&mut events, 3).await;

        let mut order = Vec::new();
        for _ in 0..3 {
            order.push(pool.next_handler().await.unwrap().worker_index());
        }
        assert_eq!(order, [0, 1, 2]);

        // The cursor wraps: the fourth call starts the rotation over.
        assert_eq!(pool.next_handler().await.unwrap().worker_index(), 0);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn next_handler_suspends_until_the_first_worker_connects() {
        let launcher = ScriptedLauncher::gated();
        let pool = pool_with(Arc::clone(&launcher), 1, "rh_wait");
        pool.start().unwrap();

        let waiting = tokio::spawn({
            let pool = pool.clone();
            async move { pool.next_handler().await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished(), "next_handler returned with no worker");

        launcher.release_one();
        let client = timeout(WAIT, waiting).await.unwrap().unwrap().unwrap();

        // End-to-end: the handler is live and answers a completion.
        let reply = client.completion("a.py", "import os\nos.", 13).await;
        let outcome = timeout(WAIT, reply.wait()).await.unwrap();
        assert!(outcome.is_success());
        match outcome.into_message().unwrap() {
            Message::CompletionResponse { proposals, .. } => {
                let names: Vec<_> = proposals.iter().map(|p| p.name.as_str()).collect();
                assert_eq!(names, ["path", "getcwd"]);
            }
            other => panic!("wrong response: {other:?}"),
        }

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn crashed_worker_restarts_with_a_fresh_rendezvous_address() {
        let launcher = ScriptedLauncher::new();
        let pool = pool_with(Arc::clone(&launcher), 1, "rh_crash");
        let mut events = pool.events();
        pool.start().unwrap();
        wait_connected(&mut events, 1).await;

        let stale = pool.next_handler().await.unwrap();
        launcher.crash(0, ExitStatus::from_raw(139));

        wait_connected(&mut events, 1).await;
        assert_eq!(launcher.launch_count(), 2);
        assert_ne!(launcher.rendezvous_path(0), launcher.rendezvous_path(1));

        // The stale handler fails everything as connection-lost...
        let reply = stale.rebuild_symbol_index("/project").await;
        assert!(!timeout(WAIT, reply.wait()).await.unwrap().is_success());

        // ...while the restarted worker serves requests again.
        let fresh = pool.next_handler().await.unwrap();
        let reply = fresh.tooltip("a.py", "import os", 4).await;
        assert!(timeout(WAIT, reply.wait()).await.unwrap().is_success());

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn crash_of_one_worker_leaves_the_other_connected() {
        let launcher = ScriptedLauncher::new();
        let pool = pool_with(Arc::clone(&launcher), 2, "rh_iso");
        let mut events = pool.events();
        pool.start().unwrap();
        wait_connected(&mut events, 2).await;

        launcher.crash(0, ExitStatus::from_raw(139));
        wait_connected(&mut events, 1).await;

        assert_eq!(launcher.launch_count(), 3);
        assert_eq!(pool.connected_count(), 2);
        assert!(pool
            .worker_states()
            .iter()
            .all(|s| *s == WorkerState::Connected));

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn launch_failure_is_fatal_and_not_retried() {
        let launcher = Arc::new(FailingLauncher {
            attempts: StdMutex::new(0),
        });
        let pool = WorkerPool::new(
            PoolConfig::new("analysis-worker")
                .with_worker_count(1)
                .with_rendezvous_prefix("rh_fatal")
                .with_launcher(Arc::new(Arc::clone(&launcher))),
        );
        let mut events = pool.events();
        pool.start().unwrap();

        match timeout(WAIT, events.recv()).await.unwrap().unwrap() {
            PoolEvent::WorkerFailedToStart { worker, .. } => assert_eq!(worker, 0),
            other => panic!("expected a fatal event, got {other:?}"),
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*launcher.attempts.lock().unwrap(), 1);
        assert_eq!(pool.worker_states(), [WorkerState::Terminated]);
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn start_twice_is_an_error() {
        let launcher = ScriptedLauncher::new();
        let pool = pool_with(Arc::clone(&launcher), 1, "rh_twice");
        pool.start().unwrap();
        assert!(matches!(pool.start(), Err(PoolError::AlreadyStarted)));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_wakes_suspended_next_handler_callers() {
        let launcher = ScriptedLauncher::gated();
        let pool = pool_with(Arc::clone(&launcher), 1, "rh_down");
        pool.start().unwrap();

        let waiting = tokio::spawn({
            let pool = pool.clone();
            async move { pool.next_handler().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        pool.shutdown().await;
        assert!(matches!(
            timeout(WAIT, waiting).await.unwrap().unwrap(),
            Err(PoolError::ShutDown)
        ));
    }

    #[test]
    fn default_worker_count_is_clamped() {
        let count = default_worker_count();
        assert!((1..=2).contains(&count));
    }
}
