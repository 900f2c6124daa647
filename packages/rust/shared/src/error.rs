//! Error types for ledgerflow.
//!
//! Library crates use [`LedgerflowError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics, and every
//! invocation boundary normalizes failures to an [`ErrorPayload`].

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::Stage;

/// Top-level error type for all ledgerflow operations.
#[derive(Debug, thiserror::Error)]
pub enum LedgerflowError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error talking to a remote collaborator.
    #[error("network error: {0}")]
    Network(String),

    /// Non-retryable database error (bad SQL, schema mismatch, corrupt row).
    #[error("storage error: {0}")]
    Storage(String),

    /// The ledger store is unreachable or busy. Safe to retry the invocation.
    #[error("transient store error: {0}")]
    TransientStore(String),

    /// A raw insert raced with a concurrent registration of the same hash.
    #[error("duplicate key: content hash {content_hash} is already registered")]
    DuplicateKey { content_hash: String },

    /// An attempt to overwrite a committed stage output with a different value.
    #[error(
        "stale write on {content_hash}: {stage} output is {existing}, refusing to set {attempted}"
    )]
    StaleWrite {
        content_hash: String,
        stage: Stage,
        existing: String,
        attempted: String,
    },

    /// An attempt to commit a stage before its prerequisite stage.
    #[error("out-of-order commit on {content_hash}: {stage} requires {prerequisite} output first")]
    OutOfOrder {
        content_hash: String,
        stage: Stage,
        prerequisite: Stage,
    },

    /// A lookup that should always succeed did not (usually misconfiguration).
    #[error("not found: {what}")]
    NotFound { what: String },

    /// The stage-specific collaborator failed for a single unit.
    #[error("transform failed for {unit}: {message}")]
    UpstreamTransform { unit: String, message: String },

    /// A remote execution reached a terminal state other than success.
    #[error("execution {execution} ended with status {status}{}", detail_suffix(.error))]
    ExecutionFailure {
        execution: String,
        status: String,
        error: Option<String>,
    },

    /// The caller's cancellation token fired or the wait budget ran out.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (malformed artifact, bad key, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

fn detail_suffix(error: &Option<String>) -> String {
    match error {
        Some(e) => format!(": {e}"),
        None => String::new(),
    }
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, LedgerflowError>;

impl LedgerflowError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a not-found error describing what was missing.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Create a per-unit transform error.
    pub fn upstream(unit: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::UpstreamTransform {
            unit: unit.into(),
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Project the error onto the pipeline error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config { .. } => ErrorKind::Config,
            Self::Network(_) => ErrorKind::Network,
            Self::Storage(_) => ErrorKind::Storage,
            Self::TransientStore(_) => ErrorKind::TransientStore,
            Self::DuplicateKey { .. } => ErrorKind::DuplicateKey,
            Self::StaleWrite { .. } | Self::OutOfOrder { .. } => ErrorKind::StaleWrite,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::UpstreamTransform { .. } => ErrorKind::UpstreamTransform,
            Self::ExecutionFailure { .. } => ErrorKind::ExecutionFailure,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Io { .. } => ErrorKind::Io,
            Self::Validation { .. } => ErrorKind::Validation,
        }
    }

    /// Whether re-running the whole invocation may succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Normalize into the structured payload returned at invocation boundaries.
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            kind: self.kind(),
            message: self.to_string(),
            units: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Structured error payload
// ---------------------------------------------------------------------------

/// Error taxonomy shared by every stage and the execution driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientStore,
    DuplicateKey,
    StaleWrite,
    NotFound,
    UpstreamTransform,
    ExecutionFailure,
    Cancelled,
    Config,
    Network,
    Storage,
    Io,
    Validation,
}

impl ErrorKind {
    /// Transient store and network failures leave no state behind.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::TransientStore | Self::Network)
    }
}

/// A single unit that failed inside a stage invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitFailure {
    /// Content hash or object key identifying the unit.
    pub unit: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl UnitFailure {
    /// Capture a failure for `unit` from any pipeline error.
    pub fn new(unit: impl Into<String>, err: &LedgerflowError) -> Self {
        Self {
            unit: unit.into(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Structured failure returned to the orchestrating workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
    /// Per-unit detail, when the failure came out of a stage batch.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub units: Vec<UnitFailure>,
}

impl From<&LedgerflowError> for ErrorPayload {
    fn from(err: &LedgerflowError) -> Self {
        err.to_payload()
    }
}
