//! Single-part upload with a bounded, fixed-delay retry loop.

use std::sync::Arc;

use bytes::Bytes;
use multipush_protocol::{PartRange, PartReceipt, UploadPartRequest, UploadTarget};
use multipush_transfer::checksum_part;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tracing::{debug, warn};

use crate::store::ObjectStore;
use crate::types::{PartOutcome, RetryPolicy, UploadEvent};

/// Uploads one part, retrying failed attempts per its [`RetryPolicy`].
///
/// Holds no per-part state, so one uploader is shared by every worker of
/// an upload; each call keeps its own attempt counter.
pub struct PartUploader {
    store: Arc<dyn ObjectStore>,
    policy: RetryPolicy,
    events: Option<mpsc::Sender<UploadEvent>>,
}

impl PartUploader {
    pub fn new(store: Arc<dyn ObjectStore>, policy: RetryPolicy) -> Self {
        Self {
            store,
            policy,
            events: None,
        }
    }

    /// Reports retries on `events`.
    pub fn with_events(mut self, events: mpsc::Sender<UploadEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Uploads `data` as part `range.index` of `target`.
    ///
    /// Always yields exactly one outcome: the receipt from the first
    /// successful attempt, or the last error once attempts run out.
    pub async fn upload(&self, target: &UploadTarget, range: PartRange, data: Bytes) -> PartOutcome {
        let index = range.index;
        let checksum = {
            let data = data.clone();
            joined_checksum(index, tokio::task::spawn_blocking(move || checksum_part(&data)).await)
        };

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let req = UploadPartRequest {
                target: target.clone(),
                part_number: index,
                data: data.clone(),
                checksum: checksum.clone(),
            };

            let error = match self.store.upload_part(req).await {
                Ok(etag) => {
                    debug!(part = index, attempt, %etag, "part stored");
                    return PartOutcome::Success(PartReceipt { index, etag });
                }
                Err(e) => e,
            };

            let permanent = self.policy.fail_fast && !error.is_retryable();
            if attempt > self.policy.retries || permanent {
                warn!(
                    part = index,
                    attempt,
                    permanent,
                    error = %error,
                    "part upload failed, giving up"
                );
                return PartOutcome::Failure {
                    index,
                    error,
                    attempts: attempt,
                };
            }

            warn!(
                part = index,
                attempt,
                max_attempts = self.policy.max_attempts(),
                delay_secs = self.policy.delay.as_secs_f64(),
                error = %error,
                "part upload failed, retrying"
            );
            if let Some(events) = &self.events {
                let _ = events.try_send(UploadEvent::PartRetrying {
                    index,
                    attempt,
                    delay: self.policy.delay,
                    error: error.to_string(),
                });
            }
            tokio::time::sleep(self.policy.delay).await;
        }
    }
}

/// The digest from the checksum task, or none if the task died.
fn joined_checksum(index: u32, joined: Result<String, JoinError>) -> String {
    match joined {
        Ok(checksum) => checksum,
        Err(e) => {
            warn!(part = index, error = %e, "checksum task failed, sending part without digest");
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::memory::MemoryStore;
    use chrono::Utc;
    use multipush_protocol::CreateUploadRequest;
    use std::time::Duration;

    async fn setup(policy: RetryPolicy) -> (Arc<MemoryStore>, PartUploader, UploadTarget) {
        let store = Arc::new(MemoryStore::default());
        let upload_id = store
            .create_upload(CreateUploadRequest {
                key: "k".into(),
                expires_at: Utc::now(),
            })
            .await
            .unwrap();
        let uploader = PartUploader::new(store.clone(), policy);
        (store, uploader, UploadTarget::new(upload_id, "k"))
    }

    fn range(index: u32, length: u64) -> PartRange {
        PartRange {
            index,
            offset: 0,
            length,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_attempt_success() {
        let (store, uploader, target) = setup(RetryPolicy::default()).await;

        let outcome = uploader
            .upload(&target, range(1, 3), Bytes::from_static(b"abc"))
            .await;

        assert!(matches!(outcome, PartOutcome::Success(ref r) if r.index == 1));
        assert_eq!(store.part_attempts(1), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_part_gets_retries_plus_one_attempts() {
        let (store, uploader, target) = setup(RetryPolicy::default()).await;
        store.fail_part(2, None, StoreError::Transport("connection reset".into()));

        let started = tokio::time::Instant::now();
        let outcome = uploader
            .upload(&target, range(2, 3), Bytes::from_static(b"abc"))
            .await;

        assert_eq!(
            outcome,
            PartOutcome::Failure {
                index: 2,
                error: StoreError::Transport("connection reset".into()),
                attempts: 3,
            }
        );
        assert_eq!(store.part_attempts(2), 3);
        // Two constant 15 s pauses, no backoff growth.
        assert_eq!(started.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_carries_last_error() {
        let (store, uploader, target) = setup(RetryPolicy {
            retries: 1,
            ..RetryPolicy::default()
        })
        .await;
        store.fail_part(1, Some(1), StoreError::Transport("first".into()));

        // First attempt hits the scripted fault, the second succeeds.
        let outcome = uploader
            .upload(&target, range(1, 1), Bytes::from_static(b"x"))
            .await;
        assert!(outcome.is_success());

        store.fail_part(3, None, StoreError::Status {
            status: 503,
            message: "SlowDown".into(),
        });
        let outcome = uploader
            .upload(&target, range(3, 1), Bytes::from_static(b"y"))
            .await;
        match outcome {
            PartOutcome::Failure { error, attempts, .. } => {
                assert_eq!(attempts, 2);
                assert!(matches!(error, StoreError::Status { status: 503, .. }));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_within_budget() {
        let (store, uploader, target) = setup(RetryPolicy::default()).await;
        store.fail_part(1, Some(2), StoreError::Transport("timeout".into()));
        let (tx, mut rx) = mpsc::channel(8);
        let uploader = uploader.with_events(tx);

        let outcome = uploader
            .upload(&target, range(1, 4), Bytes::from_static(b"data"))
            .await;

        assert!(outcome.is_success());
        assert_eq!(store.part_attempts(1), 3);
        drop(uploader);
        let mut retries = Vec::new();
        while let Some(UploadEvent::PartRetrying { attempt, .. }) = rx.recv().await {
            retries.push(attempt);
        }
        assert_eq!(retries, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn fail_fast_skips_retries_for_permanent_errors() {
        let (store, uploader, target) = setup(RetryPolicy {
            fail_fast: true,
            ..RetryPolicy::default()
        })
        .await;
        store.fail_part(1, None, StoreError::Status {
            status: 403,
            message: "AccessDenied".into(),
        });

        let outcome = uploader
            .upload(&target, range(1, 1), Bytes::from_static(b"x"))
            .await;

        assert!(matches!(outcome, PartOutcome::Failure { attempts: 1, .. }));
        assert_eq!(store.part_attempts(1), 1);
    }

    #[tokio::test]
    async fn panicked_checksum_task_falls_back_to_no_digest() {
        let joined = tokio::task::spawn_blocking(|| -> String { panic!("digest blew up") }).await;
        assert!(joined.is_err());
        assert_eq!(joined_checksum(4, joined), "");

        let joined = tokio::task::spawn_blocking(|| checksum_part(b"abc")).await;
        assert_eq!(joined_checksum(4, joined), checksum_part(b"abc"));
    }

    #[tokio::test(start_paused = true)]
    async fn default_policy_retries_permanent_errors_too() {
        let (store, uploader, target) = setup(RetryPolicy::default()).await;
        store.fail_part(1, None, StoreError::Status {
            status: 403,
            message: "AccessDenied".into(),
        });

        let outcome = uploader
            .upload(&target, range(1, 1), Bytes::from_static(b"x"))
            .await;

        assert!(matches!(outcome, PartOutcome::Failure { attempts: 3, .. }));
    }
}
