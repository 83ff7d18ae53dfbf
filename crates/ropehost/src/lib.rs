//! ropehost: supervised worker-process pool and framed RPC transport for
//! Python code analysis.
//!
//! The pool launches external analysis workers, hands each one a unique
//! rendezvous socket address as its final argument, and accepts exactly one
//! connection back per worker. A [`MessageChannel`] over that connection
//! frames requests and correlates responses to [`Reply`] futures in strict
//! FIFO order. [`WorkerPool::next_handler`] round-robins connected workers
//! to callers; crashed workers restart automatically, and the only fatal
//! condition is an executable that cannot be launched.

pub mod bridge;
mod channel;
mod client;
mod launcher;
mod pool;
mod reply;
mod worker;

pub use bridge::Message;
pub use channel::MessageChannel;
pub use client::WorkerClient;
pub use launcher::{LaunchError, Launcher, ProcessLauncher, WorkerCommand, WorkerProcess};
pub use pool::{PoolConfig, PoolError, PoolEvent, WorkerPool};
pub use reply::{Reply, ReplyError, ReplyOutcome};
pub use worker::WorkerState;
