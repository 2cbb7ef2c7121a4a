//! Typed error hierarchy for renderforge.
//!
//! Job-level failures (policy violations, render failures, timeouts) are not
//! errors: they are recorded on the job itself. The enums here cover the
//! infrastructure seams around the pipeline:
//! - `ConfigError` — invalid settings detected at startup
//! - `StorageError` — artifact store failures
//! - `PipelineError` — store failures while a job is being processed
//! - `LlmError` — code generation backend failures

use std::path::PathBuf;

use thiserror::Error;

/// Errors from loading and validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value '{value}' for {key}: {message}")]
    InvalidValue {
        key: String,
        value: String,
        message: String,
    },
}

/// Errors from the artifact store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Invalid job id for artifact storage: '{0}'")]
    InvalidJobId(String),

    #[error("Artifact I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Infrastructure failures surfaced to the dispatch boundary.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Job {job_id} not found")]
    JobNotFound { job_id: String },

    #[error("Job store error: {0}")]
    JobStore(#[source] anyhow::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Dispatch queue is closed")]
    QueueClosed,
}

/// Errors from an LLM backend. Never surfaced to clients directly; the
/// code assistant turns them into fallbacks.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM provider '{0}' is not available")]
    Unavailable(String),

    #[error("Unknown LLM provider '{0}'. Valid values: ollama, openai, template")]
    UnknownProvider(String),

    #[error("LLM request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("LLM returned status {status}: {body}")]
    BadStatus { status: u16, body: String },

    #[error("LLM returned an empty response")]
    EmptyResponse,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_invalid_value_names_key() {
        let err = ConfigError::InvalidValue {
            key: "RENDER_TIMEOUT_SEC".to_string(),
            value: "soon".to_string(),
            message: "expected an integer".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("RENDER_TIMEOUT_SEC"));
        assert!(text.contains("soon"));
    }

    #[test]
    fn storage_error_io_carries_path() {
        let path = PathBuf::from("/videos/job_abc.mp4");
        let err = StorageError::Io {
            path: path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        match &err {
            StorageError::Io { path: p, source } => {
                assert_eq!(p, &path);
                assert_eq!(source.kind(), std::io::ErrorKind::PermissionDenied);
            }
            _ => panic!("Expected Io"),
        }
    }

    #[test]
    fn pipeline_error_converts_from_storage_error() {
        let err: PipelineError = StorageError::InvalidJobId("../x".to_string()).into();
        match &err {
            PipelineError::Storage(StorageError::InvalidJobId(id)) => assert_eq!(id, "../x"),
            _ => panic!("Expected PipelineError::Storage(InvalidJobId(..))"),
        }
    }

    #[test]
    fn pipeline_error_job_not_found_carries_id() {
        let err = PipelineError::JobNotFound {
            job_id: "job_123".to_string(),
        };
        assert!(err.to_string().contains("job_123"));
    }

    #[test]
    fn llm_error_unknown_provider_lists_valid_values() {
        let err = LlmError::UnknownProvider("claude".to_string());
        assert!(err.to_string().contains("ollama, openai, template"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&StorageError::InvalidJobId("x".into()));
        assert_std_error(&PipelineError::QueueClosed);
        assert_std_error(&LlmError::EmptyResponse);
        assert_std_error(&ConfigError::InvalidValue {
            key: "k".into(),
            value: "v".into(),
            message: "m".into(),
        });
    }
}
