//! Error taxonomy for the research pipeline.
//!
//! Library operations return [`HarnessError`] so callers can tell a
//! transient collaborator outage (worth retrying) from an embedding failure,
//! index drift, or a task that cannot be routed. Every variant knows which
//! [`Stage`] it belongs to, which is what the CLI reports to the user.
//!
//! Absence is not an error: lookups return [`Lookup::NotFound`].

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

/// Pipeline stage an error originated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Search,
    Fetch,
    Embed,
    Index,
    Answer,
    Route,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Search => "search",
            Stage::Fetch => "fetch",
            Stage::Embed => "embed",
            Stage::Index => "index",
            Stage::Answer => "answer",
            Stage::Route => "route",
        };
        f.write_str(name)
    }
}

/// Result of a lookup that may legitimately find nothing.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
}

impl<T> Lookup<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Lookup::Found(v) => Some(v),
            Lookup::NotFound => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }
}

impl<T> From<Option<T>> for Lookup<T> {
    fn from(opt: Option<T>) -> Self {
        match opt {
            Some(v) => Lookup::Found(v),
            None => Lookup::NotFound,
        }
    }
}

/// Main error type for ingestion, retrieval, and research operations.
#[derive(Error, Debug)]
pub enum HarnessError {
    /// Backend unreachable or overloaded (network error, 429, 5xx). Retried.
    #[error("{stage} backend unavailable: {message}")]
    CollaboratorUnavailable { stage: Stage, message: String },

    /// Backend answered but refused the request (4xx other than 429).
    #[error("{stage} request rejected: {message}")]
    CollaboratorRejected { stage: Stage, message: String },

    #[error("embedding failed during {operation}: {reason}")]
    EmbeddingFailure { operation: String, reason: String },

    #[error("index corruption detected: {detail}")]
    IndexCorruption { detail: String },

    #[error("task {task_id} has unroutable type '{kind}'")]
    UnroutableTask { task_id: Uuid, kind: String },

    #[error("task {task_id} has an invalid payload: {reason}")]
    InvalidPayload { task_id: Uuid, reason: String },

    #[error("invalid document '{id}': {reason}")]
    InvalidDocument { id: String, reason: String },

    #[error("task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: Uuid,
        from: String,
        to: String,
    },

    #[error("{operation} was cancelled; staged writes were rolled back")]
    Cancelled { operation: String },

    #[error("storage error during {operation}: {source}")]
    Storage {
        operation: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("failed to access '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Process exit codes for the `rh` binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    GeneralError = 1,
    CollaboratorUnreachable = 2,
    NoResults = 3,
    IndexCorrupted = 4,
    InvalidInput = 5,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> i32 {
        code as i32
    }
}

impl HarnessError {
    pub fn storage(operation: impl Into<String>, source: sqlx::Error) -> Self {
        Self::Storage {
            operation: operation.into(),
            source,
        }
    }

    pub fn embedding(operation: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::EmbeddingFailure {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    pub fn unavailable(stage: Stage, message: impl Into<String>) -> Self {
        Self::CollaboratorUnavailable {
            stage,
            message: message.into(),
        }
    }

    pub fn rejected(stage: Stage, message: impl Into<String>) -> Self {
        Self::CollaboratorRejected {
            stage,
            message: message.into(),
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::CollaboratorUnavailable { .. })
    }

    pub fn stage(&self) -> Stage {
        match self {
            Self::CollaboratorUnavailable { stage, .. }
            | Self::CollaboratorRejected { stage, .. } => *stage,
            Self::EmbeddingFailure { .. } => Stage::Embed,
            Self::UnroutableTask { .. }
            | Self::InvalidPayload { .. }
            | Self::InvalidTransition { .. } => Stage::Route,
            Self::IndexCorruption { .. }
            | Self::InvalidDocument { .. }
            | Self::Cancelled { .. }
            | Self::Storage { .. }
            | Self::Io { .. } => Stage::Index,
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::CollaboratorUnavailable { .. } => ExitCode::CollaboratorUnreachable,
            Self::IndexCorruption { .. } => ExitCode::IndexCorrupted,
            Self::UnroutableTask { .. }
            | Self::InvalidPayload { .. }
            | Self::InvalidDocument { .. }
            | Self::InvalidTransition { .. } => ExitCode::InvalidInput,
            _ => ExitCode::GeneralError,
        }
    }
}

pub type Result<T> = std::result::Result<T, HarnessError>;
