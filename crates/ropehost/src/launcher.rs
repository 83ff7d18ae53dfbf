//! Worker process launching.
//!
//! `Launcher` is the seam between the pool and the operating system: the
//! default `ProcessLauncher` spawns the configured executable with
//! `tokio::process`, tests substitute an in-process worker. A launch error
//! is the one fatal condition in the pool (the executable is missing or not
//! runnable); everything after a successful launch is recoverable.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use async_trait::async_trait;
use tokio::process::{Child, Command};

/// Everything needed to exec one worker: the resolved program, the
/// configured extra arguments, and the rendezvous socket path that is
/// appended as the final argument.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub rendezvous_path: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("worker executable could not be launched: {0}")]
    Spawn(#[from] io::Error),
}

/// Handle to a launched worker process.
///
/// `wait` may be called again after the process has exited and returns the
/// cached status, matching `tokio::process::Child`.
#[async_trait]
pub trait WorkerProcess: Send {
    async fn wait(&mut self) -> io::Result<ExitStatus>;

    /// Ask the process to stop (SIGTERM on unix).
    fn terminate(&mut self) -> io::Result<()>;

    /// Force-kill the process.
    fn kill(&mut self) -> io::Result<()>;
}

/// Spawn strategy for workers.
pub trait Launcher: Send + Sync + 'static {
    fn launch(&self, command: &WorkerCommand) -> Result<Box<dyn WorkerProcess>, LaunchError>;
}

/// Default launcher: executes the worker as a child process. The child's
/// stdout/stderr are inherited unmodified; the rendezvous socket is the
/// only control path.
pub struct ProcessLauncher;

impl Launcher for ProcessLauncher {
    fn launch(&self, command: &WorkerCommand) -> Result<Box<dyn WorkerProcess>, LaunchError> {
        let child = Command::new(&command.program)
            .args(&command.args)
            .arg(&command.rendezvous_path)
            .spawn()?;
        Ok(Box::new(ChildProcess { child }))
    }
}

struct ChildProcess {
    child: Child,
}

#[async_trait]
impl WorkerProcess for ChildProcess {
    async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }

    fn terminate(&mut self) -> io::Result<()> {
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;
            return kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
                .map_err(|errno| io::Error::from_raw_os_error(errno as i32));
        }
        self.child.start_kill()
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }
}

/// Resolves a configured executable name to the path passed to exec.
///
/// An explicit path (anything with a separator) is used verbatim. A bare
/// name is looked for next to the host executable first; if not found
/// there, it is left for `$PATH` resolution at exec time.
pub(crate) fn resolve_executable(name: &Path) -> PathBuf {
    if name.components().count() > 1 {
        return name.to_path_buf();
    }

    if let Ok(host_exe) = std::env::current_exe()
        && let Some(dir) = host_exe.parent()
    {
        let candidate = dir.join(name);
        if candidate.exists() {
            tracing::debug!(path = %candidate.display(), "Found worker executable next to host");
            return candidate;
        }
    }

    name.to_path_buf()
}
