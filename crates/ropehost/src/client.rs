//! Typed request surface over one worker's channel.
//!
//! This is the whole contract the editor layer consumes: a constructor per
//! operation, each returning a [`Reply`]. What the worker does with the
//! request is its own business; the client only builds envelopes.

use std::path::PathBuf;

use crate::bridge::Message;
use crate::bridge::protocol::{CompletionContext, SymbolKind};
use crate::channel::MessageChannel;
use crate::reply::Reply;

/// Handler for a connected worker, handed out by the pool. Do not retain
/// one across a worker restart; a restarted worker gets a fresh client and
/// requests on the stale one fail as connection-lost.
pub struct WorkerClient {
    worker: usize,
    channel: MessageChannel,
}

impl WorkerClient {
    pub(crate) fn new(worker: usize, channel: MessageChannel) -> Self {
        Self { worker, channel }
    }

    /// Index of the worker this client talks to.
    pub fn worker_index(&self) -> usize {
        self.worker
    }

    /// The underlying channel, for callers that build envelopes themselves.
    pub fn channel(&self) -> &MessageChannel {
        &self.channel
    }

    pub async fn create_project(&self, project_root: impl Into<PathBuf>) -> Reply {
        self.channel
            .send(Message::CreateProjectRequest {
                project_root: project_root.into(),
            })
            .await
    }

    pub async fn destroy_project(&self, project_root: impl Into<PathBuf>) -> Reply {
        self.channel
            .send(Message::DestroyProjectRequest {
                project_root: project_root.into(),
            })
            .await
    }

    pub async fn rebuild_symbol_index(&self, project_root: impl Into<PathBuf>) -> Reply {
        self.channel
            .send(Message::RebuildSymbolIndexRequest {
                project_root: project_root.into(),
            })
            .await
    }

    pub async fn update_symbol_index(&self, file_path: impl Into<PathBuf>) -> Reply {
        self.channel
            .send(Message::UpdateSymbolIndexRequest {
                file_path: file_path.into(),
            })
            .await
    }

    pub async fn completion(
        &self,
        file_path: impl Into<PathBuf>,
        source_text: impl Into<String>,
        cursor_position: u32,
    ) -> Reply {
        self.channel
            .send(Message::CompletionRequest {
                context: CompletionContext {
                    file_path: file_path.into(),
                    source_text: source_text.into(),
                    cursor_position,
                },
            })
            .await
    }

    pub async fn tooltip(
        &self,
        file_path: impl Into<PathBuf>,
        source_text: impl Into<String>,
        cursor_position: u32,
    ) -> Reply {
        self.channel
            .send(Message::TooltipRequest {
                context: CompletionContext {
                    file_path: file_path.into(),
                    source_text: source_text.into(),
                    cursor_position,
                },
            })
            .await
    }

    pub async fn definition_location(
        &self,
        file_path: impl Into<PathBuf>,
        source_text: impl Into<String>,
        cursor_position: u32,
    ) -> Reply {
        self.channel
            .send(Message::DefinitionLocationRequest {
                context: CompletionContext {
                    file_path: file_path.into(),
                    source_text: source_text.into(),
                    cursor_position,
                },
            })
            .await
    }

    /// Searches the symbol index. With a `file_path`, only the project that
    /// owns that file is searched; `symbol_kind` narrows the result set
    /// (`SymbolKind::All` is the same as no filter).
    pub async fn search(
        &self,
        query: impl Into<String>,
        file_path: Option<PathBuf>,
        symbol_kind: Option<SymbolKind>,
    ) -> Reply {
        let symbol_kind = symbol_kind.filter(|k| *k != SymbolKind::All);
        self.channel
            .send(Message::SearchRequest {
                query: query.into(),
                file_path,
                symbol_kind,
            })
            .await
    }
}
