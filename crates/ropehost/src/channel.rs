//! Correlated request/response channel over one worker connection.
//!
//! Requests are framed and written through a shared sink; a background read
//! loop decodes inbound frames and resolves pending replies. Correlation is
//! strictly ordinal: the channel keeps a FIFO queue of completers, one per
//! request sent, and each inbound frame resolves the oldest outstanding
//! reply. The worker must therefore answer in the order it was asked.
//!
//! A channel lives exactly as long as its connection. When the connection
//! drops, every pending reply resolves as `ConnectionLost`, once, and all
//! later sends fail immediately.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::{JsonCodec, Message};
use crate::reply::{Reply, ReplyCompleter, ReplyError, ReplyOutcome, failed_reply, reply_pair};

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

struct Pending {
    queue: VecDeque<ReplyCompleter>,
    closed: bool,
}

struct ChannelInner {
    writer: tokio::sync::Mutex<FramedWrite<BoxedWrite, JsonCodec<Message>>>,
    pending: Mutex<Pending>,
}

impl ChannelInner {
    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fails every outstanding reply and refuses further sends. Runs at
    /// most once per channel; later calls are no-ops.
    fn drain_pending(&self) {
        let drained = {
            let mut pending = self.lock_pending();
            if pending.closed {
                return;
            }
            pending.closed = true;
            std::mem::take(&mut pending.queue)
        };
        if !drained.is_empty() {
            tracing::debug!(
                pending = drained.len(),
                "Failing pending replies after disconnect"
            );
        }
        for completer in drained {
            completer.complete(ReplyOutcome::Failed(ReplyError::ConnectionLost));
        }
    }
}

/// Framed, FIFO-correlated transport over one worker's connection.
#[derive(Clone)]
pub struct MessageChannel {
    inner: Arc<ChannelInner>,
}

impl MessageChannel {
    /// Wraps a connected byte stream and spawns its read loop.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let reader = FramedRead::new(Box::new(read_half) as BoxedRead, JsonCodec::new());
        let writer = FramedWrite::new(Box::new(write_half) as BoxedWrite, JsonCodec::new());

        let inner = Arc::new(ChannelInner {
            writer: tokio::sync::Mutex::new(writer),
            pending: Mutex::new(Pending {
                queue: VecDeque::new(),
                closed: false,
            }),
        });

        tokio::spawn(read_loop(reader, Arc::clone(&inner)));

        Self { inner }
    }

    /// Frames and writes a request, returning a pending [`Reply`] that
    /// resolves when the worker's answer arrives (or the connection drops).
    /// If the channel is already closed the reply is failed on return.
    pub async fn send(&self, message: Message) -> Reply {
        // The writer lock is held across enqueue + write so concurrent
        // senders keep the pending queue in wire order.
        let mut writer = self.inner.writer.lock().await;

        let (reply, completer) = reply_pair();
        {
            let mut pending = self.inner.lock_pending();
            if pending.closed {
                drop(pending);
                drop(completer);
                return failed_reply(ReplyError::ConnectionLost);
            }
            pending.queue.push_back(completer);
        }

        tracing::trace!(operation = message.operation(), "Sending request");
        if let Err(e) = writer.send(message).await {
            tracing::warn!(error = %e, "Write to worker failed, closing channel");
            self.inner.drain_pending();
        }

        reply
    }

    /// Whether the connection has closed; sends on a closed channel fail
    /// immediately.
    pub fn is_closed(&self) -> bool {
        self.inner.lock_pending().closed
    }

    /// Closes the write side and fails anything still pending. Used during
    /// worker teardown; the worker observes EOF and exits.
    pub async fn close(&self) {
        self.inner.drain_pending();
        let mut writer = self.inner.writer.lock().await;
        if let Err(e) = writer.close().await {
            tracing::debug!(error = %e, "Error closing worker connection");
        }
    }
}

async fn read_loop(mut reader: FramedRead<BoxedRead, JsonCodec<Message>>, inner: Arc<ChannelInner>) {
    loop {
        match reader.next().await {
            Some(Ok(message)) => {
                let completer = inner.lock_pending().queue.pop_front();
                match completer {
                    Some(completer) => {
                        tracing::trace!(operation = message.operation(), "Response received");
                        completer.complete(ReplyOutcome::Response(message));
                    }
                    None => {
                        // A correct worker only ever answers a request.
                        tracing::warn!(
                            operation = message.operation(),
                            "Unsolicited frame from worker, closing channel"
                        );
                        break;
                    }
                }
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Protocol error on worker channel");
                break;
            }
            None => {
                tracing::debug!("Worker connection closed");
                break;
            }
        }
    }
    inner.drain_pending();
}
