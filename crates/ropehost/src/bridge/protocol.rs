//! Envelope type for host-worker RPC.
//!
//! A single `Message` enum carries every request and response variant, one
//! pair per operation. There is no request ID on the wire: correlation is
//! strictly ordinal (the worker answers requests in the order it received
//! them, and the channel matches each inbound frame to the oldest pending
//! reply). The variant tag therefore only describes the payload; pairing is
//! a consequence of FIFO ordering.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Cursor context shared by completion, tooltip and definition requests.
///
/// `source_text` is the full (possibly unsaved) buffer contents;
/// `cursor_position` is a byte offset into it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionContext {
    pub file_path: PathBuf,
    pub source_text: String,
    pub cursor_position: u32,
}

/// What kind of thing a completion proposal names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalKind {
    Instance,
    Class,
    Function,
    Module,
}

/// Where a completion proposal was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalScope {
    Local,
    Global,
    Builtin,
    Attribute,
    Imported,
    Keyword,
    ParameterKeyword,
}

/// One completion proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ProposalKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<ProposalScope>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docstring: Option<String>,
}

impl Proposal {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: None,
            scope: None,
            docstring: None,
        }
    }
}

/// Symbol categories in the worker's index. `All` means no filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    All,
    Variable,
    Function,
    Class,
    Module,
}

/// One hit from a symbol index search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub module_name: String,
    pub file_path: PathBuf,
    pub line_number: u32,
    pub symbol_name: String,
    pub symbol_kind: SymbolKind,
}

/// The wire envelope: one request and one response variant per operation.
///
/// Project and index responses carry no payload; they acknowledge that the
/// worker finished the operation, which is what keeps ordinal correlation
/// sound (every request gets exactly one response frame).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    CreateProjectRequest {
        project_root: PathBuf,
    },
    CreateProjectResponse {},

    DestroyProjectRequest {
        project_root: PathBuf,
    },
    DestroyProjectResponse {},

    RebuildSymbolIndexRequest {
        project_root: PathBuf,
    },
    RebuildSymbolIndexResponse {},

    UpdateSymbolIndexRequest {
        file_path: PathBuf,
    },
    UpdateSymbolIndexResponse {},

    CompletionRequest {
        context: CompletionContext,
    },
    CompletionResponse {
        insertion_position: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        calltip: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        proposals: Vec<Proposal>,
    },

    TooltipRequest {
        context: CompletionContext,
    },
    TooltipResponse {
        #[serde(skip_serializing_if = "Option::is_none")]
        rich_text: Option<String>,
    },

    DefinitionLocationRequest {
        context: CompletionContext,
    },
    DefinitionLocationResponse {
        #[serde(skip_serializing_if = "Option::is_none")]
        file_path: Option<PathBuf>,
        #[serde(skip_serializing_if = "Option::is_none")]
        line: Option<u32>,
    },

    SearchRequest {
        query: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        file_path: Option<PathBuf>,
        #[serde(skip_serializing_if = "Option::is_none")]
        symbol_kind: Option<SymbolKind>,
    },
    SearchResponse {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        results: Vec<SearchResult>,
    },
}

impl Message {
    /// Short operation label for logging.
    pub fn operation(&self) -> &'static str {
        match self {
            Self::CreateProjectRequest { .. } | Self::CreateProjectResponse {} => "create_project",
            Self::DestroyProjectRequest { .. } | Self::DestroyProjectResponse {} => {
                "destroy_project"
            }
            Self::RebuildSymbolIndexRequest { .. } | Self::RebuildSymbolIndexResponse {} => {
                "rebuild_symbol_index"
            }
            Self::UpdateSymbolIndexRequest { .. } | Self::UpdateSymbolIndexResponse {} => {
                "update_symbol_index"
            }
            Self::CompletionRequest { .. } | Self::CompletionResponse { .. } => "completion",
            Self::TooltipRequest { .. } | Self::TooltipResponse { .. } => "tooltip",
            Self::DefinitionLocationRequest { .. } | Self::DefinitionLocationResponse { .. } => {
                "definition_location"
            }
            Self::SearchRequest { .. } | Self::SearchResponse { .. } => "search",
        }
    }
}
