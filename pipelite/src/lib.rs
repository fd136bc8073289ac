//! Pipelite: a linear pipeline of worker-pool stages.
//!
//! ```text
//! Pipeline → Stages → Workers
//!
//! - Pipeline: owns the queues and stages, submits and collects values
//! - Stage: one transform, run by a fixed number of worker threads
//! - Worker: pop → transform → push → mark done
//! ```
//!
//! ## Example
//!
//! ```
//! use pipelite::{Pipeline, functions};
//!
//! let mut pipeline = Pipeline::new(4)
//!     .register(functions::upper)?
//!     .register(functions::replace)?;
//! pipeline.start()?;
//!
//! for word in ["Hello", "wOrld"] {
//!     pipeline.submit(word.to_string())?;
//! }
//! let mut results: Vec<String> = pipeline.collect()?.collect();
//! results.sort();
//! assert_eq!(results, vec!["HOLLE", "WERLD"]);
//! # Ok::<(), pipelite::PipeliteError>(())
//! ```

pub mod arity;
pub mod config;
pub mod errors;
pub mod functions;
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod stage;

pub use config::{PipelineOptions, StageOverride};
pub use errors::{PipeliteError, PipeliteResult};
pub use metrics::{PipelineMetrics, StageMetrics};
pub use pipeline::{Collect, Pipeline, PipelineState, StageInfo};
pub use queue::WorkQueue;
pub use stage::{FaultKind, StageConfig, StageFault};

use tracing_subscriber::EnvFilter;

/// Install a stderr `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over `default_level`. Calling this again
/// after a subscriber is installed is a no-op.
pub fn init_logging(default_level: &str) -> PipeliteResult<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_level).map_err(|e| {
            PipeliteError::InvalidConfig(format!("invalid log level {}: {}", default_level, e))
        })?,
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
    Ok(())
}
