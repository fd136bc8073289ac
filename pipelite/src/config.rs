//! Pipeline configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{PipeliteError, PipeliteResult};
use crate::stage::StageConfig;

/// Worker-count override for a named stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageOverride {
    pub name: String,
    pub workers: usize,
}

/// Options shared by every stage of a pipeline.
///
/// Deserializes from JSON with every field optional:
///
/// ```json
/// { "workers": 4, "stages": [{ "name": "hash", "workers": 8 }] }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    /// Worker threads per stage unless overridden.
    pub workers: usize,
    /// Prefix for worker thread names: `{prefix}-{stage}-{worker}`.
    pub thread_prefix: String,
    pub stages: Vec<StageOverride>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            thread_prefix: "pipelite".to_string(),
            stages: Vec::new(),
        }
    }
}

impl PipelineOptions {
    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers,
            ..Default::default()
        }
    }

    /// Load options from a JSON file and validate them.
    pub fn from_json_file(path: &Path) -> PipeliteResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let options: Self = serde_json::from_str(&raw)?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> PipeliteResult<()> {
        if self.workers == 0 {
            return Err(PipeliteError::InvalidConfig(
                "workers must be at least 1".to_string(),
            ));
        }
        if self.thread_prefix.trim().is_empty() {
            return Err(PipeliteError::InvalidConfig(
                "thread_prefix must not be empty".to_string(),
            ));
        }
        if self.thread_prefix.contains('\0') {
            return Err(PipeliteError::InvalidConfig(
                "thread_prefix must not contain NUL bytes".to_string(),
            ));
        }
        for stage in &self.stages {
            if stage.name.trim().is_empty() {
                return Err(PipeliteError::InvalidConfig(
                    "stage override name must not be empty".to_string(),
                ));
            }
            if stage.workers == 0 {
                return Err(PipeliteError::InvalidConfig(format!(
                    "stage {} must have at least 1 worker",
                    stage.name
                )));
            }
        }
        Ok(())
    }

    /// Worker count for a stage: explicit config, then named override,
    /// then the pipeline default.
    pub(crate) fn workers_for(&self, name: &str, config: &StageConfig) -> usize {
        config
            .workers
            .or_else(|| {
                self.stages
                    .iter()
                    .find(|stage| stage.name == name)
                    .map(|stage| stage.workers)
            })
            .unwrap_or(self.workers)
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_is_valid() {
        let options = PipelineOptions::default();
        assert!(options.workers >= 1);
        options.validate().unwrap();
    }

    #[test]
    fn test_zero_workers_rejected() {
        let result = PipelineOptions::with_workers(0).validate();
        assert!(result.unwrap_err().to_string().contains("at least 1"));
    }

    #[test]
    fn test_nul_in_thread_prefix_rejected() {
        let options = PipelineOptions {
            thread_prefix: "bad\0prefix".to_string(),
            ..PipelineOptions::with_workers(1)
        };
        let result = options.validate();
        assert!(result.unwrap_err().to_string().contains("NUL"));

        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{ "thread_prefix": "a\u0000b" }}"#).unwrap();
        let result = PipelineOptions::from_json_file(file.path());
        assert!(matches!(result, Err(PipeliteError::InvalidConfig(_))));
    }

    #[test]
    fn test_load_partial_json() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "workers": 3, "stages": [{{ "name": "hash", "workers": 8 }}] }}"#
        )
        .unwrap();

        let options = PipelineOptions::from_json_file(file.path()).unwrap();
        assert_eq!(options.workers, 3);
        assert_eq!(options.thread_prefix, "pipelite");
        assert_eq!(options.stages.len(), 1);
    }

    #[test]
    fn test_load_rejects_bad_override() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{ "stages": [{{ "name": "", "workers": 2 }}] }}"#).unwrap();

        let result = PipelineOptions::from_json_file(file.path());
        assert!(matches!(result, Err(PipeliteError::InvalidConfig(_))));
    }

    #[test]
    fn test_workers_resolution_order() {
        let options = PipelineOptions {
            workers: 2,
            thread_prefix: "p".to_string(),
            stages: vec![StageOverride {
                name: "hash".to_string(),
                workers: 6,
            }],
        };

        assert_eq!(options.workers_for("read", &StageConfig::default()), 2);
        assert_eq!(options.workers_for("hash", &StageConfig::default()), 6);
        assert_eq!(
            options.workers_for("hash", &StageConfig::named("hash").with_workers(1)),
            1
        );
    }
}
