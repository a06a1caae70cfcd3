//! Data types for the upload flow.

use std::time::Duration;

use multipush_protocol::PartReceipt;
use multipush_protocol::constants::{
    DEFAULT_EXPIRY, DEFAULT_MAX_CONCURRENCY, DEFAULT_PART_SIZE, DEFAULT_RETRIES,
    DEFAULT_RETRY_DELAY,
};

use crate::error::StoreError;

/// How a failing part upload is retried.
///
/// The delay is constant between attempts, not exponential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first failure.
    pub retries: u32,
    /// Pause before each retry.
    pub delay: Duration,
    /// Stop immediately on errors [`StoreError::is_retryable`] rejects.
    pub fail_fast: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            delay: DEFAULT_RETRY_DELAY,
            fail_fast: false,
        }
    }
}

impl RetryPolicy {
    /// Total attempts a part gets, first try included.
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }
}

/// Settings for one coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadConfig {
    pub part_size: u64,
    pub retry: RetryPolicy,
    /// Parts in flight at once. `0` launches every part immediately.
    pub max_concurrency: usize,
    /// Expiry hint passed to the create call.
    pub expiry: Duration,
    /// Abort the session when the complete call fails instead of leaving it open.
    pub abort_on_finalize_failure: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            part_size: DEFAULT_PART_SIZE,
            retry: RetryPolicy::default(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            expiry: DEFAULT_EXPIRY,
            abort_on_finalize_failure: false,
        }
    }
}

/// Result of one part worker. Exactly one is produced per launched part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartOutcome {
    Success(PartReceipt),
    Failure {
        index: u32,
        error: StoreError,
        attempts: u32,
    },
    /// The upload was halted before this part got a slot; nothing was sent.
    Skipped { index: u32 },
}

impl PartOutcome {
    pub fn index(&self) -> u32 {
        match self {
            PartOutcome::Success(receipt) => receipt.index,
            PartOutcome::Failure { index, .. } | PartOutcome::Skipped { index } => *index,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, PartOutcome::Success(_))
    }
}

/// Progress event emitted during an upload.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    /// The store opened a session.
    SessionCreated {
        upload_id: String,
        key: String,
        parts: usize,
    },
    /// A worker began sending a part.
    PartStarted { index: u32, length: u64 },
    /// An attempt failed and will be retried after `delay`.
    PartRetrying {
        index: u32,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    /// The store confirmed a part.
    PartFinished {
        index: u32,
        etag: String,
        parts_done: usize,
        parts_total: usize,
    },
    /// A queued part was dropped because the upload is being aborted.
    PartSkipped { index: u32 },
    /// A part exhausted its attempts.
    PartFailed {
        index: u32,
        attempts: u32,
        error: String,
    },
    /// The session is being aborted.
    Aborting { upload_id: String },
    /// The object was assembled.
    Completed { location: String },
    /// The upload ended without an object.
    Failed { error: String },
}

/// Outcome of a successful upload.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadSummary {
    pub upload_id: String,
    pub key: String,
    pub location: String,
    pub etag: String,
    pub parts: usize,
    pub bytes: u64,
    pub elapsed: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_constants() {
        let config = UploadConfig::default();
        assert_eq!(config.part_size, 50_000_000);
        assert_eq!(config.retry.retries, 2);
        assert_eq!(config.retry.max_attempts(), 3);
        assert_eq!(config.retry.delay, Duration::from_secs(15));
        assert!(!config.retry.fail_fast);
        assert!(!config.abort_on_finalize_failure);
    }

    #[test]
    fn outcome_index() {
        let ok = PartOutcome::Success(PartReceipt {
            index: 4,
            etag: "e".into(),
        });
        let failed = PartOutcome::Failure {
            index: 7,
            error: StoreError::Transport("x".into()),
            attempts: 3,
        };
        assert_eq!(ok.index(), 4);
        assert!(ok.is_success());
        assert_eq!(failed.index(), 7);
        assert!(!failed.is_success());

        let skipped = PartOutcome::Skipped { index: 9 };
        assert_eq!(skipped.index(), 9);
        assert!(!skipped.is_success());
    }
}
