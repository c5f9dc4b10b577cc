//! Unified error type for a reconciliation run. Maps layer errors onto the
//! failure categories reported to operators.

use thiserror::Error;

use crate::storage::StorageError;

/// Where in the pipeline a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Connectivity,
    Extraction,
    Matching,
    Classification,
    FixGeneration,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connectivity => "connectivity",
            Self::Extraction => "extraction",
            Self::Matching => "matching",
            Self::Classification => "classification",
            Self::FixGeneration => "fix-generation",
        }
    }
}

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Source error: {0}")]
    Source(#[from] crate::source::SourceError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("{worker} failed: {source}")]
    WorkerFailed {
        worker: String,
        source: Box<ReconcileError>,
    },

    #[error("Batch queue: {0}")]
    Queue(String),

    #[error("Matching observer aborted after repeated failures")]
    ObserverAborted,

    #[error("Classification failed: {0}")]
    Classification(#[source] StorageError),

    #[error("Fix generation failed: {0}")]
    Fix(String),

    #[error("Task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl ReconcileError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::WorkerFailed { source, .. } => source.category(),
            // Unreadable stored keys are row-local.
            Self::Storage(StorageError::Key(_)) => ErrorCategory::Extraction,
            Self::Storage(_) | Self::Config(_) => ErrorCategory::Connectivity,
            Self::Source(_) | Self::Queue(_) | Self::Join(_) => ErrorCategory::Extraction,
            Self::ObserverAborted => ErrorCategory::Matching,
            Self::Classification(_) => ErrorCategory::Classification,
            Self::Fix(_) => ErrorCategory::FixGeneration,
        }
    }

    /// Attribute a task's failure to the task, keeping the cause.
    pub fn worker(worker: impl Into<String>, source: ReconcileError) -> Self {
        Self::WorkerFailed {
            worker: worker.into(),
            source: Box::new(source),
        }
    }
}

pub type Result<T> = std::result::Result<T, ReconcileError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceError;

    #[test]
    fn test_categories() {
        assert_eq!(
            ReconcileError::ObserverAborted.category(),
            ErrorCategory::Matching
        );
        assert_eq!(
            ReconcileError::Config("x".into()).category().as_str(),
            "connectivity"
        );
        assert_eq!(
            ReconcileError::Classification(StorageError::UnknownRun(3)).category(),
            ErrorCategory::Classification
        );
        assert_eq!(
            ReconcileError::from(StorageError::Key("{bad".into())).category(),
            ErrorCategory::Extraction
        );
        assert_eq!(
            ReconcileError::Fix("no data columns".into()).category().as_str(),
            "fix-generation"
        );
    }

    #[test]
    fn test_worker_failure_keeps_cause_category() {
        let aborted = ReconcileError::worker("observer 0", ReconcileError::ObserverAborted);
        assert_eq!(aborted.category(), ErrorCategory::Matching);

        let storage = ReconcileError::worker("loader target/0/1", StorageError::UnknownRun(1).into());
        assert_eq!(storage.category(), ErrorCategory::Connectivity);

        let decode = SourceError::Decode {
            column: "qty".into(),
            reason: "bad".into(),
        };
        let extract = ReconcileError::worker("extract source/0", decode.into());
        assert_eq!(extract.category(), ErrorCategory::Extraction);
    }

    #[test]
    fn test_worker_failed_message() {
        let err = ReconcileError::worker("loader 2", ReconcileError::Queue("closed".into()));
        assert_eq!(err.to_string(), "loader 2 failed: Batch queue: closed");
        assert!(std::error::Error::source(&err).is_some());
    }
}
