//! One-shot reply futures for in-flight requests.
//!
//! A `Reply` is created when a request is written to a worker channel and
//! completes exactly once: with the decoded response frame, or with
//! `ReplyError::ConnectionLost` when the connection drops first. After
//! completion the outcome is immutable and readable without awaiting.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Notify;

use crate::bridge::Message;

/// Why a reply completed without a response.
///
/// Transient worker failures (crash, disconnect, protocol error) all
/// surface to callers as this single failure kind; the pool handles
/// recovery internally.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReplyError {
    #[error("connection to the worker was lost before a response arrived")]
    ConnectionLost,
}

/// Final state of a reply.
#[derive(Debug, Clone)]
pub enum ReplyOutcome {
    Response(Message),
    Failed(ReplyError),
}

impl ReplyOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Response(_))
    }

    pub fn message(&self) -> Option<&Message> {
        match self {
            Self::Response(msg) => Some(msg),
            Self::Failed(_) => None,
        }
    }

    pub fn into_message(self) -> Result<Message, ReplyError> {
        match self {
            Self::Response(msg) => Ok(msg),
            Self::Failed(err) => Err(err),
        }
    }
}

type Callback = Box<dyn FnOnce(&ReplyOutcome) + Send + 'static>;

enum State {
    Pending(Vec<Callback>),
    Done(ReplyOutcome),
}

struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

impl Shared {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        // A panicking callback must not wedge every other observer.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Caller-side handle to an in-flight request. Cloneable; all clones
/// observe the same completion.
#[derive(Clone)]
pub struct Reply {
    shared: Arc<Shared>,
}

/// Channel-side handle used to resolve a reply. Consumed on completion, so
/// the single-completion guarantee holds by construction.
pub(crate) struct ReplyCompleter {
    shared: Arc<Shared>,
}

/// Creates a pending reply and its completer.
pub(crate) fn reply_pair() -> (Reply, ReplyCompleter) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State::Pending(Vec::new())),
        notify: Notify::new(),
    });
    (
        Reply {
            shared: Arc::clone(&shared),
        },
        ReplyCompleter { shared },
    )
}

/// Creates a reply that is already failed, for sends on a closed channel.
pub(crate) fn failed_reply(error: ReplyError) -> Reply {
    let (reply, completer) = reply_pair();
    completer.complete(ReplyOutcome::Failed(error));
    reply
}

impl Reply {
    pub fn is_finished(&self) -> bool {
        matches!(&*self.shared.lock_state(), State::Done(_))
    }

    /// The outcome, if the reply has completed.
    pub fn outcome(&self) -> Option<ReplyOutcome> {
        match &*self.shared.lock_state() {
            State::Done(outcome) => Some(outcome.clone()),
            State::Pending(_) => None,
        }
    }

    /// Suspends until the reply completes; returns immediately if it
    /// already has. Waiting runs on the reactor, so the read loop that
    /// resolves this reply keeps making progress while callers wait.
    pub async fn wait(&self) -> ReplyOutcome {
        loop {
            // Register for notification before checking state, otherwise a
            // completion between the check and the await would be missed.
            let notified = self.shared.notify.notified();
            if let Some(outcome) = self.outcome() {
                return outcome;
            }
            notified.await;
        }
    }

    /// Registers a callback invoked exactly once, at or after completion.
    /// If the reply already completed the callback runs immediately on the
    /// calling task.
    pub fn on_finished<F>(&self, callback: F)
    where
        F: FnOnce(&ReplyOutcome) + Send + 'static,
    {
        let mut state = self.shared.lock_state();
        match &mut *state {
            State::Pending(callbacks) => callbacks.push(Box::new(callback)),
            State::Done(outcome) => {
                let outcome = outcome.clone();
                drop(state);
                callback(&outcome);
            }
        }
    }
}

impl ReplyCompleter {
    pub(crate) fn complete(self, outcome: ReplyOutcome) {
        let callbacks = {
            let mut state = self.shared.lock_state();
            match std::mem::replace(&mut *state, State::Done(outcome.clone())) {
                State::Pending(callbacks) => callbacks,
                State::Done(_) => return,
            }
        };
        self.shared.notify.notify_waiters();
        for callback in callbacks {
            callback(&outcome);
        }
    }
}
