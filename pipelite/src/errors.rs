//! Error types for pipeline construction and execution.

use thiserror::Error;

/// Errors surfaced by the pipeline API.
///
/// Transform failures are not errors of this kind: they are reported
/// per item as [`StageFault`](crate::stage::StageFault)s on the pipeline's
/// fault queue.
#[derive(Debug, Error)]
pub enum PipeliteError {
    /// The pipeline has no registered stage, so there is no head queue to
    /// submit into and nothing to start or collect from.
    #[error("pipeline has no registered stages")]
    NoStages,

    #[error("pipeline already started")]
    AlreadyStarted,

    #[error("pipeline not started")]
    NotStarted,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to spawn worker {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type PipeliteResult<T> = Result<T, PipeliteError>;
