//! Worker lifecycle: rendezvous listener, supervision, restart, teardown.
//!
//! Each worker moves through `Starting -> Listening -> Connected ->
//! Terminated`. The pool runs one supervision task per worker; that task is
//! the only writer of the worker's slot. A crash at any point after a
//! successful launch loops back to `Starting` with a fresh rendezvous
//! address; a failed launch is fatal for the worker and is reported to the
//! pool's owner instead of retried.

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::net::UnixListener;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::channel::MessageChannel;
use crate::client::WorkerClient;
use crate::launcher::{Launcher, WorkerCommand, WorkerProcess};
use crate::pool::{PoolEvent, WorkerSettings};

/// How long a worker gets to exit voluntarily at each teardown step.
const EXIT_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Binding the rendezvous listener / launching the process.
    Starting,
    /// Process launched; waiting for it to connect back.
    Listening,
    /// Connected; the slot holds a live handler.
    Connected,
    /// Shut down, or launch failed. Never left.
    Terminated,
}

struct SlotInner {
    state: WorkerState,
    client: Option<Arc<WorkerClient>>,
}

/// One worker's published state, read by `next_handler` and written only by
/// the worker's supervision task.
pub(crate) struct WorkerSlot {
    inner: Mutex<SlotInner>,
}

impl WorkerSlot {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(SlotInner {
                state: WorkerState::Starting,
                client: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SlotInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> WorkerState {
        self.lock().state
    }

    pub(crate) fn client(&self) -> Option<Arc<WorkerClient>> {
        self.lock().client.clone()
    }

    fn set_state(&self, state: WorkerState) {
        self.lock().state = state;
    }

    fn install(&self, client: Arc<WorkerClient>) {
        let mut inner = self.lock();
        inner.client = Some(client);
        inner.state = WorkerState::Connected;
    }

    fn clear(&self) {
        self.lock().client = None;
    }
}

/// A bound rendezvous listener and its socket path. The path is unlinked on
/// drop; exactly one connection is ever accepted.
pub(crate) struct Rendezvous {
    pub(crate) listener: UnixListener,
    pub(crate) path: PathBuf,
}

impl Drop for Rendezvous {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != io::ErrorKind::NotFound
        {
            tracing::debug!(path = %self.path.display(), error = %e, "Failed to remove rendezvous socket");
        }
    }
}

/// Binds a listener on a freshly generated unique address. Names may
/// collide with other pool instances sharing the temp dir, so collisions
/// regenerate and retry.
pub(crate) fn bind_rendezvous(prefix: &str) -> io::Result<Rendezvous> {
    loop {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let path = std::env::temp_dir().join(format!("{}_{}", prefix, &token[..12]));

        match UnixListener::bind(&path) {
            Ok(listener) => {
                tracing::trace!(path = %path.display(), "Bound rendezvous listener");
                return Ok(Rendezvous { listener, path });
            }
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                tracing::debug!(path = %path.display(), "Rendezvous address in use, retrying");
            }
            Err(e) => return Err(e),
        }
    }
}

/// Everything a worker's supervision task needs from the pool.
pub(crate) struct WorkerContext {
    pub index: usize,
    pub settings: Arc<WorkerSettings>,
    pub launcher: Arc<dyn Launcher>,
    pub slot: Arc<WorkerSlot>,
    pub events: broadcast::Sender<PoolEvent>,
    pub connected: watch::Sender<u64>,
    pub shutdown: CancellationToken,
}

impl WorkerContext {
    fn fatal(&self, error: impl std::fmt::Display) {
        tracing::error!(worker = self.index, %error, "Worker failed to start");
        self.slot.set_state(WorkerState::Terminated);
        let _ = self.events.send(PoolEvent::WorkerFailedToStart {
            worker: self.index,
            error: error.to_string(),
        });
    }
}

/// Supervision loop for one worker. Returns when the pool shuts down or the
/// worker hits a fatal launch failure.
pub(crate) async fn supervise(ctx: WorkerContext) {
    loop {
        ctx.slot.set_state(WorkerState::Starting);

        let rendezvous = match bind_rendezvous(&ctx.settings.rendezvous_prefix) {
            Ok(r) => r,
            Err(e) => {
                ctx.fatal(format_args!("rendezvous bind failed: {e}"));
                return;
            }
        };

        let command = WorkerCommand {
            program: ctx.settings.executable.clone(),
            args: ctx.settings.args.clone(),
            rendezvous_path: rendezvous.path.clone(),
        };

        tracing::debug!(
            worker = ctx.index,
            program = %command.program.display(),
            rendezvous = %command.rendezvous_path.display(),
            "Starting worker"
        );

        let mut process = match ctx.launcher.launch(&command) {
            Ok(process) => process,
            Err(e) => {
                ctx.fatal(e);
                return;
            }
        };
        ctx.slot.set_state(WorkerState::Listening);

        enum Listen {
            Accepted(tokio::net::UnixStream),
            Restart,
            Shutdown,
        }

        let outcome = tokio::select! {
            accepted = rendezvous.listener.accept() => match accepted {
                Ok((stream, _)) => Listen::Accepted(stream),
                Err(e) => {
                    tracing::warn!(worker = ctx.index, error = %e, "Rendezvous accept failed, restarting");
                    Listen::Restart
                }
            },
            status = process.wait() => {
                tracing::warn!(worker = ctx.index, ?status, "Worker exited before connecting, restarting");
                Listen::Restart
            }
            _ = ctx.shutdown.cancelled() => Listen::Shutdown,
        };

        // One connection per address: discard the listener immediately.
        drop(rendezvous);

        let stream = match outcome {
            Listen::Accepted(stream) => stream,
            Listen::Restart => continue,
            Listen::Shutdown => {
                teardown(ctx.index, process, None).await;
                ctx.slot.set_state(WorkerState::Terminated);
                return;
            }
        };

        let channel = MessageChannel::new(stream);
        let client = Arc::new(WorkerClient::new(ctx.index, channel.clone()));
        ctx.slot.install(client);

        tracing::info!(worker = ctx.index, "Worker connected");
        let _ = ctx.events.send(PoolEvent::WorkerConnected { worker: ctx.index });
        ctx.connected.send_modify(|generation| *generation += 1);

        let crashed = tokio::select! {
            status = process.wait() => {
                tracing::warn!(worker = ctx.index, ?status, "Worker process exited, restarting");
                true
            }
            _ = ctx.shutdown.cancelled() => false,
        };

        ctx.slot.clear();
        if crashed {
            // Stale handler references fail all operations from here.
            channel.close().await;
            continue;
        }

        teardown(ctx.index, process, Some(channel)).await;
        ctx.slot.set_state(WorkerState::Terminated);
        return;
    }
}

/// Orderly stop: close the connection and give the worker a moment to exit
/// on its own, then terminate, then kill.
async fn teardown(index: usize, mut process: Box<dyn WorkerProcess>, channel: Option<MessageChannel>) {
    if let Some(channel) = channel {
        tracing::debug!(worker = index, "Closing worker connection");
        channel.close().await;
        if tokio::time::timeout(EXIT_GRACE, process.wait()).await.is_ok() {
            return;
        }
    }

    tracing::debug!(worker = index, "Terminating worker process");
    if process.terminate().is_ok()
        && tokio::time::timeout(EXIT_GRACE, process.wait()).await.is_ok()
    {
        return;
    }

    tracing::debug!(worker = index, "Killing worker process");
    let _ = process.kill();
    let _ = process.wait().await;
}
