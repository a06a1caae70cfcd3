//! Upload coordinator for parallel multipart uploads.
//!
//! Opens a session, fans parts out to spawned workers, collects exactly one
//! outcome per part and either completes the object or aborts the session.

use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use multipush_protocol::{
    AbortUploadRequest, CompleteUploadRequest, CreateUploadRequest, PartRange, PartReceipt,
    UploadTarget,
};
use multipush_transfer::{
    ThroughputMeter, TransferSession, check_part_count, plan_parts, slice_part,
};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{StoreError, UploadError};
use crate::store::ObjectStore;
use crate::types::{PartOutcome, UploadConfig, UploadEvent, UploadSummary};
use crate::uploader::PartUploader;

const EVENT_BUFFER: usize = 256;

type AbortHandle = JoinHandle<Result<(), StoreError>>;

/// Orchestrates one multipart upload at a time against an [`ObjectStore`].
pub struct UploadCoordinator {
    store: Arc<dyn ObjectStore>,
    config: UploadConfig,
    events_tx: mpsc::Sender<UploadEvent>,
    events_rx: Option<mpsc::Receiver<UploadEvent>>,
}

/// Everything the collect phase learned about the workers.
#[derive(Default)]
struct Collected {
    receipts: Vec<PartReceipt>,
    failures: Vec<(u32, StoreError)>,
    skipped: Vec<u32>,
    missing: Vec<u32>,
    abort: Option<AbortHandle>,
}

impl UploadCoordinator {
    pub fn new(store: Arc<dyn ObjectStore>, config: UploadConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        Self {
            store,
            config,
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    /// Takes the event receiver. Can only be called once.
    ///
    /// Events are sent without waiting, so a slow or absent consumer loses
    /// events instead of stalling the upload.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<UploadEvent>> {
        self.events_rx.take()
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Uploads `payload` under `key` as a multipart object.
    ///
    /// Any part that fails after its retries aborts the whole session and
    /// no object is created. Every launched worker is drained before this
    /// returns, whatever the result.
    pub async fn upload(&self, key: &str, payload: Bytes) -> Result<UploadSummary, UploadError> {
        let result = self.run(key, payload).await;
        if let Err(e) = &result {
            self.emit(UploadEvent::Failed {
                error: e.to_string(),
            });
        }
        result
    }

    async fn run(&self, key: &str, payload: Bytes) -> Result<UploadSummary, UploadError> {
        let started = Instant::now();
        if payload.is_empty() {
            return Err(UploadError::EmptyPayload);
        }

        let total = payload.len() as u64;
        check_part_count(total, self.config.part_size)?;
        let plan = plan_parts(total, self.config.part_size);

        let expiry = chrono::Duration::from_std(self.config.expiry)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let upload_id = self
            .store
            .create_upload(CreateUploadRequest {
                key: key.to_string(),
                expires_at: Utc::now() + expiry,
            })
            .await
            .map_err(|source| {
                error!(store = %self.store.name(), key, error = %source, "failed to create upload");
                UploadError::CreateSession {
                    key: key.to_string(),
                    source,
                }
            })?;

        let session = TransferSession::new(UploadTarget::new(upload_id, key), plan.len());
        info!(
            store = %self.store.name(),
            upload_id = %session.upload_id(),
            key,
            parts = plan.len(),
            bytes = total,
            part_size = self.config.part_size,
            "upload session created"
        );
        self.emit(UploadEvent::SessionCreated {
            upload_id: session.upload_id().to_string(),
            key: key.to_string(),
            parts: plan.len(),
        });

        let outcomes = self.dispatch(&session, &payload, &plan);
        let collected = self.collect(&session, outcomes, &plan).await;

        if !collected.failures.is_empty()
            || !collected.missing.is_empty()
            || !collected.skipped.is_empty()
        {
            return Err(self.fail_aborted(&session, collected).await);
        }

        let receipts = order_receipts(collected.receipts);
        let parts = receipts.len();
        session.begin_finalize()?;
        debug!(upload_id = %session.upload_id(), parts, "completing upload");

        let completed = match self
            .store
            .complete_upload(CompleteUploadRequest {
                target: session.target().clone(),
                parts: receipts,
            })
            .await
        {
            Ok(completed) => completed,
            Err(source) => {
                error!(upload_id = %session.upload_id(), error = %source, "failed to complete upload");
                if self.config.abort_on_finalize_failure
                    && let Some(handle) = self.start_abort(&session, "complete failed")
                {
                    self.await_abort(&session, handle).await?;
                }
                return Err(UploadError::Finalize {
                    upload_id: session.upload_id().to_string(),
                    source,
                });
            }
        };
        session.complete()?;

        let elapsed = started.elapsed();
        info!(
            upload_id = %session.upload_id(),
            location = %completed.location,
            parts,
            bytes = total,
            elapsed_ms = elapsed.as_millis() as u64,
            "upload completed"
        );
        self.emit(UploadEvent::Completed {
            location: completed.location.clone(),
        });

        Ok(UploadSummary {
            upload_id: session.upload_id().to_string(),
            key: key.to_string(),
            location: completed.location,
            etag: completed.etag,
            parts,
            bytes: total,
            elapsed,
        })
    }

    /// Spawns one worker per range, in ascending index order.
    ///
    /// Returns the completion channel. The coordinator's own sender is
    /// dropped here, so the channel closes once every worker has finished.
    ///
    /// A worker whose part fails halts the rest before releasing its permit:
    /// parts still waiting for a slot report `Skipped` without touching the
    /// store, while uploads already in flight run to their own outcome.
    fn dispatch(
        &self,
        session: &TransferSession,
        payload: &Bytes,
        plan: &[PartRange],
    ) -> mpsc::Receiver<PartOutcome> {
        let (tx, rx) = mpsc::channel(plan.len().max(1));
        let permits = match self.config.max_concurrency {
            0 => plan.len().max(1),
            n => n,
        };
        let limiter = Arc::new(Semaphore::new(permits));
        let halt = CancellationToken::new();
        let uploader = Arc::new(
            PartUploader::new(self.store.clone(), self.config.retry.clone())
                .with_events(self.events_tx.clone()),
        );

        for range in plan.iter().copied() {
            let tx = tx.clone();
            let limiter = limiter.clone();
            let halt = halt.clone();
            let uploader = uploader.clone();
            let events = self.events_tx.clone();
            let target = session.target().clone();
            let data = slice_part(payload, &range);

            tokio::spawn(async move {
                let index = range.index;
                let _permit = tokio::select! {
                    biased;
                    _ = halt.cancelled() => None,
                    permit = limiter.acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        // Closed semaphore: `tx` drops unreported and the
                        // collector counts the part as lost.
                        Err(_) => return,
                    },
                };
                if halt.is_cancelled() {
                    debug!(part = index, "part skipped, upload halted");
                    let _ = tx.send(PartOutcome::Skipped { index }).await;
                    return;
                }

                debug!(part = range.index, offset = range.offset, length = range.length, "part started");
                let _ = events.try_send(UploadEvent::PartStarted {
                    index: range.index,
                    length: range.length,
                });
                let outcome = uploader.upload(&target, range, data).await;
                if !outcome.is_success() {
                    halt.cancel();
                }
                let _ = tx.send(outcome).await;
            });
        }

        rx
    }

    /// Drains every worker outcome. The first failure starts the abort.
    async fn collect(
        &self,
        session: &TransferSession,
        mut outcomes: mpsc::Receiver<PartOutcome>,
        plan: &[PartRange],
    ) -> Collected {
        let total_parts = plan.len();
        let total_bytes: u64 = plan.iter().map(|r| r.length).sum();
        let meter = ThroughputMeter::default();
        let mut pending: BTreeSet<u32> = plan.iter().map(|r| r.index).collect();
        let mut collected = Collected::default();
        let mut stored: u64 = 0;

        while let Some(outcome) = outcomes.recv().await {
            pending.remove(&outcome.index());
            match outcome {
                PartOutcome::Success(receipt) => {
                    let length = plan
                        .iter()
                        .find(|r| r.index == receipt.index)
                        .map_or(0, |r| r.length);
                    session.record_part(length);
                    meter.record(length);
                    stored += length;

                    let parts_done = collected.receipts.len() + 1;
                    debug!(
                        part = receipt.index,
                        parts_done,
                        parts_total = total_parts,
                        bytes_per_sec = meter.bytes_per_second() as u64,
                        eta_secs = meter.eta(total_bytes - stored).map(|d| d.as_secs()),
                        "part finished"
                    );
                    self.emit(UploadEvent::PartFinished {
                        index: receipt.index,
                        etag: receipt.etag.clone(),
                        parts_done,
                        parts_total: total_parts,
                    });
                    collected.receipts.push(receipt);
                }
                PartOutcome::Failure {
                    index,
                    error,
                    attempts,
                } => {
                    error!(
                        upload_id = %session.upload_id(),
                        part = index,
                        attempts,
                        error = %error,
                        "part failed"
                    );
                    self.emit(UploadEvent::PartFailed {
                        index,
                        attempts,
                        error: error.to_string(),
                    });
                    if collected.abort.is_none() {
                        collected.abort = self.start_abort(session, "part failed");
                    }
                    collected.failures.push((index, error));
                }
                PartOutcome::Skipped { index } => {
                    self.emit(UploadEvent::PartSkipped { index });
                    collected.skipped.push(index);
                }
            }
        }

        if !pending.is_empty() {
            collected.missing = pending.into_iter().collect();
            warn!(
                upload_id = %session.upload_id(),
                missing = ?collected.missing,
                "part workers exited without reporting"
            );
            if collected.abort.is_none() {
                collected.abort = self.start_abort(session, "part worker lost");
            }
        }

        collected
    }

    /// Performs the guarded abort transition and, if this call won it,
    /// spawns the store abort without awaiting it.
    fn start_abort(&self, session: &TransferSession, reason: &str) -> Option<AbortHandle> {
        if !session.try_abort(reason) {
            return None;
        }
        warn!(upload_id = %session.upload_id(), reason, "aborting upload");
        self.emit(UploadEvent::Aborting {
            upload_id: session.upload_id().to_string(),
        });

        let store = self.store.clone();
        let req = AbortUploadRequest {
            target: session.target().clone(),
        };
        Some(tokio::spawn(async move { store.abort_upload(req).await }))
    }

    async fn await_abort(
        &self,
        session: &TransferSession,
        handle: AbortHandle,
    ) -> Result<(), UploadError> {
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => Err(StoreError::Transport(format!("abort task failed: {e}"))),
        };
        match result {
            Ok(()) => {
                info!(upload_id = %session.upload_id(), "upload aborted");
                Ok(())
            }
            Err(source) => {
                error!(upload_id = %session.upload_id(), error = %source, "failed to abort upload");
                Err(UploadError::AbortFailed {
                    upload_id: session.upload_id().to_string(),
                    source,
                })
            }
        }
    }

    async fn fail_aborted(&self, session: &TransferSession, collected: Collected) -> UploadError {
        let Collected {
            receipts,
            mut failures,
            skipped,
            missing,
            abort,
        } = collected;

        if let Some(handle) = abort
            && let Err(e) = self.await_abort(session, handle).await
        {
            return e;
        }
        debug!(
            upload_id = %session.upload_id(),
            discarded = receipts.len(),
            skipped = skipped.len(),
            "discarding stored part receipts"
        );

        let upload_id = session.upload_id().to_string();
        if failures.is_empty() {
            return UploadError::WorkerLost { upload_id, missing };
        }

        // Arrival order decides which error is reported.
        let source = failures[0].1.clone();
        failures.sort_by_key(|(index, _)| *index);
        UploadError::PartsFailed {
            upload_id,
            failed: failures.into_iter().map(|(index, _)| index).collect(),
            source,
        }
    }

    fn emit(&self, event: UploadEvent) {
        let _ = self.events_tx.try_send(event);
    }
}

/// Sorts receipts ascending by part index, whatever order they arrived in.
pub fn order_receipts(mut receipts: Vec<PartReceipt>) -> Vec<PartReceipt> {
    receipts.sort_by_key(|r| r.index);
    receipts
}
