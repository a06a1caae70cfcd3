//! Upload error types.

use multipush_transfer::TransferError;

/// Errors reported by an [`ObjectStore`](crate::ObjectStore) implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("store returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("upload not found: {0}")]
    NotFound(String),

    #[error("invalid store response: {0}")]
    InvalidResponse(String),
}

impl StoreError {
    /// Returns `true` for errors that may clear up on another attempt
    /// (network trouble, throttling, server-side faults).
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Transport(_) | StoreError::InvalidResponse(_) => true,
            StoreError::Status { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            StoreError::Rejected(_) | StoreError::NotFound(_) => false,
        }
    }
}

/// Errors produced by [`UploadCoordinator::upload`](crate::UploadCoordinator::upload).
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("payload is empty, a multipart upload needs at least one part")]
    EmptyPayload,

    #[error("failed to create upload session for {key}: {source}")]
    CreateSession {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("part(s) {failed:?} failed, upload {upload_id} aborted: {source}")]
    PartsFailed {
        upload_id: String,
        failed: Vec<u32>,
        #[source]
        source: StoreError,
    },

    #[error("part worker(s) for {missing:?} exited without reporting, upload {upload_id} aborted")]
    WorkerLost { upload_id: String, missing: Vec<u32> },

    #[error("failed to abort upload {upload_id}, stored parts may remain: {source}")]
    AbortFailed {
        upload_id: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to complete upload {upload_id}: {source}")]
    Finalize {
        upload_id: String,
        #[source]
        source: StoreError,
    },

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
}

impl UploadError {
    /// Returns `true` when the store-side session could not be cleaned up.
    pub fn is_abort_failure(&self) -> bool {
        matches!(self, UploadError::AbortFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(StoreError::Transport("reset".into()).is_retryable());
        assert!(
            StoreError::Status {
                status: 503,
                message: "SlowDown".into()
            }
            .is_retryable()
        );
        assert!(
            StoreError::Status {
                status: 429,
                message: String::new()
            }
            .is_retryable()
        );
        assert!(
            !StoreError::Status {
                status: 403,
                message: "AccessDenied".into()
            }
            .is_retryable()
        );
        assert!(!StoreError::NotFound("u1".into()).is_retryable());
        assert!(!StoreError::Rejected("InvalidPart".into()).is_retryable());
    }

    #[test]
    fn parts_failed_message_lists_parts() {
        let err = UploadError::PartsFailed {
            upload_id: "u1".into(),
            failed: vec![2, 3],
            source: StoreError::Transport("timeout".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("[2, 3]"));
        assert!(msg.contains("timeout"));
        assert!(!err.is_abort_failure());
    }
}
