//! Error types for the mirror engine

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MirrorError {
    /// Malformed filter, index spec or hydration request.
    #[error("Validation error: {0}")]
    Validation(String),

    /// An atomic store primitive was killed by the store's script limits.
    #[error("Store script aborted during {operation}: {reason}")]
    StoreScriptAborted { operation: String, reason: String },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Wrong type for key {key}: expected {expected}")]
    WrongType { key: String, expected: &'static str },

    #[error("Source fetch failed: {0}")]
    SourceFetch(String),
}

impl MirrorError {
    pub fn validation(message: impl Into<String>) -> Self {
        MirrorError::Validation(message.into())
    }

    pub fn script_aborted(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        MirrorError::StoreScriptAborted {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// True when the store itself killed the operation (too many results).
    pub fn is_script_abort(&self) -> bool {
        matches!(self, MirrorError::StoreScriptAborted { .. })
    }
}

impl From<sled::Error> for MirrorError {
    fn from(e: sled::Error) -> Self {
        MirrorError::StoreUnavailable(e.to_string())
    }
}

impl From<datafusion::error::DataFusionError> for MirrorError {
    fn from(e: datafusion::error::DataFusionError) -> Self {
        MirrorError::SourceFetch(e.to_string())
    }
}

impl From<arrow::error::ArrowError> for MirrorError {
    fn from(e: arrow::error::ArrowError) -> Self {
        MirrorError::SourceFetch(e.to_string())
    }
}

impl From<serde_json::Error> for MirrorError {
    fn from(e: serde_json::Error) -> Self {
        MirrorError::Validation(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MirrorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_abort_names_operation() {
        let err = MirrorError::script_aborted("scan_and_collect", "step budget of 10 exceeded");
        assert!(err.is_script_abort());
        assert_eq!(
            err.to_string(),
            "Store script aborted during scan_and_collect: step budget of 10 exceeded"
        );
    }

    #[test]
    fn test_sled_errors_map_to_unavailable() {
        let err: MirrorError = sled::Error::Unsupported("nope".to_string()).into();
        assert!(matches!(err, MirrorError::StoreUnavailable(_)));
        assert!(!err.is_script_abort());
    }
}
