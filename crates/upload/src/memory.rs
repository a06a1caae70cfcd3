//! In-process multipart store.
//!
//! Enforces the same contract as an S3-compatible service: parts are only
//! accepted for open sessions, completion needs every referenced part in
//! ascending order with matching entity tags, and an aborted session
//! rejects further writes. Fault hooks let tests script failures and
//! per-part latency.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use multipush_protocol::{
    AbortUploadRequest, CompleteUploadRequest, CompletedUpload, CreateUploadRequest,
    UploadPartRequest,
};
use multipush_transfer::checksum_part;
use tracing::debug;

use crate::error::StoreError;
use crate::store::{ObjectStore, StoreFuture};

/// Number of calls the store received, per operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub create: u32,
    pub upload_part: u32,
    pub complete: u32,
    pub abort: u32,
}

/// An assembled object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub data: Bytes,
    pub etag: String,
    pub parts: usize,
}

struct PendingUpload {
    key: String,
    expires_at: DateTime<Utc>,
    parts: BTreeMap<u32, StoredPart>,
    aborted: bool,
}

struct StoredPart {
    etag: String,
    digest: Vec<u8>,
    data: Bytes,
}

struct PartFault {
    /// `None` fails every attempt.
    remaining: Option<u32>,
    error: StoreError,
}

#[derive(Default)]
struct MemoryInner {
    uploads: HashMap<String, PendingUpload>,
    objects: HashMap<String, StoredObject>,
    calls: CallCounts,
    part_attempts: HashMap<u32, u32>,
    in_flight: usize,
    max_in_flight: usize,
    last_complete: Option<CompleteUploadRequest>,
    create_fault: Option<StoreError>,
    complete_fault: Option<StoreError>,
    abort_fault: Option<StoreError>,
    part_faults: HashMap<u32, PartFault>,
    part_delays: HashMap<u32, Duration>,
}

/// Multipart store kept entirely in memory.
pub struct MemoryStore {
    name: String,
    inner: Mutex<MemoryInner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new("memory")
    }
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(MemoryInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every create call fail.
    pub fn fail_create(&self, error: StoreError) {
        self.lock().create_fault = Some(error);
    }

    /// Fails uploads of part `index`, `times` times or forever when `None`.
    pub fn fail_part(&self, index: u32, times: Option<u32>, error: StoreError) {
        self.lock().part_faults.insert(
            index,
            PartFault {
                remaining: times,
                error,
            },
        );
    }

    /// Makes every complete call fail.
    pub fn fail_complete(&self, error: StoreError) {
        self.lock().complete_fault = Some(error);
    }

    /// Makes every abort call fail.
    pub fn fail_abort(&self, error: StoreError) {
        self.lock().abort_fault = Some(error);
    }

    /// Delays every upload of part `index` by `delay`.
    pub fn delay_part(&self, index: u32, delay: Duration) {
        self.lock().part_delays.insert(index, delay);
    }

    pub fn calls(&self) -> CallCounts {
        self.lock().calls
    }

    /// Number of upload attempts seen for part `index`.
    pub fn part_attempts(&self, index: u32) -> u32 {
        self.lock().part_attempts.get(&index).copied().unwrap_or(0)
    }

    /// Highest number of part uploads that were in progress at once.
    pub fn max_in_flight(&self) -> usize {
        self.lock().max_in_flight
    }

    /// The most recent complete request, as received.
    pub fn last_complete(&self) -> Option<CompleteUploadRequest> {
        self.lock().last_complete.clone()
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.lock().objects.get(key).cloned()
    }

    /// Sessions that are neither completed nor aborted.
    pub fn open_uploads(&self) -> usize {
        self.lock().uploads.values().filter(|u| !u.aborted).count()
    }

    /// Expiry hint recorded for an upload.
    pub fn expires_at(&self, upload_id: &str) -> Option<DateTime<Utc>> {
        self.lock().uploads.get(upload_id).map(|u| u.expires_at)
    }

    fn store_part(&self, req: &UploadPartRequest) -> Result<String, StoreError> {
        let mut inner = self.lock();
        let index = req.part_number;

        if let Some(fault) = inner.part_faults.get_mut(&index) {
            let error = fault.error.clone();
            match fault.remaining.as_mut() {
                None => return Err(error),
                Some(0) => {}
                Some(n) => {
                    *n -= 1;
                    return Err(error);
                }
            }
        }

        let upload = inner
            .uploads
            .get_mut(&req.target.upload_id)
            .filter(|u| !u.aborted && u.key == req.target.key)
            .ok_or_else(|| StoreError::NotFound(req.target.upload_id.clone()))?;

        if !req.checksum.is_empty() && checksum_part(&req.data) != req.checksum {
            return Err(StoreError::Rejected(format!("BadDigest for part {index}")));
        }

        let digest = Md5::digest(&req.data).to_vec();
        let etag = format!("\"{}\"", hex::encode(&digest));
        upload.parts.insert(
            index,
            StoredPart {
                etag: etag.clone(),
                digest,
                data: req.data.clone(),
            },
        );
        Ok(etag)
    }

    fn assemble(&self, req: &CompleteUploadRequest) -> Result<CompletedUpload, StoreError> {
        let mut inner = self.lock();
        inner.last_complete = Some(req.clone());
        if let Some(error) = inner.complete_fault.clone() {
            return Err(error);
        }

        let upload = inner
            .uploads
            .get(&req.target.upload_id)
            .filter(|u| !u.aborted && u.key == req.target.key)
            .ok_or_else(|| StoreError::NotFound(req.target.upload_id.clone()))?;

        if req.parts.is_empty() {
            return Err(StoreError::Rejected("MalformedXML: no parts".into()));
        }
        if req.parts.windows(2).any(|w| w[0].index >= w[1].index) {
            return Err(StoreError::Rejected("InvalidPartOrder".into()));
        }

        let mut data = BytesMut::new();
        let mut hasher = Md5::new();
        for receipt in &req.parts {
            let part = upload
                .parts
                .get(&receipt.index)
                .filter(|p| p.etag == receipt.etag)
                .ok_or_else(|| StoreError::Rejected(format!("InvalidPart {}", receipt.index)))?;
            data.extend_from_slice(&part.data);
            hasher.update(&part.digest);
        }

        let etag = format!(
            "\"{}-{}\"",
            hex::encode(hasher.finalize()),
            req.parts.len()
        );
        let object = StoredObject {
            data: data.freeze(),
            etag: etag.clone(),
            parts: req.parts.len(),
        };
        inner.uploads.remove(&req.target.upload_id);
        inner.objects.insert(req.target.key.clone(), object);

        Ok(CompletedUpload {
            location: format!("memory://{}/{}", self.name, req.target.key),
            etag,
        })
    }
}

impl ObjectStore for MemoryStore {
    fn create_upload(&self, req: CreateUploadRequest) -> StoreFuture<'_, String> {
        Box::pin(async move {
            let mut inner = self.lock();
            inner.calls.create += 1;
            if let Some(error) = inner.create_fault.clone() {
                return Err(error);
            }
            let upload_id = uuid::Uuid::new_v4().to_string();
            inner.uploads.insert(
                upload_id.clone(),
                PendingUpload {
                    key: req.key,
                    expires_at: req.expires_at,
                    parts: BTreeMap::new(),
                    aborted: false,
                },
            );
            debug!(store = %self.name, %upload_id, "upload created");
            Ok(upload_id)
        })
    }

    fn upload_part(&self, req: UploadPartRequest) -> StoreFuture<'_, String> {
        Box::pin(async move {
            let delay = {
                let mut inner = self.lock();
                inner.calls.upload_part += 1;
                *inner.part_attempts.entry(req.part_number).or_insert(0) += 1;
                inner.in_flight += 1;
                inner.max_in_flight = inner.max_in_flight.max(inner.in_flight);
                inner.part_delays.get(&req.part_number).copied()
            };
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let result = self.store_part(&req);
            self.lock().in_flight -= 1;
            result
        })
    }

    fn complete_upload(&self, req: CompleteUploadRequest) -> StoreFuture<'_, CompletedUpload> {
        Box::pin(async move {
            self.lock().calls.complete += 1;
            self.assemble(&req)
        })
    }

    fn abort_upload(&self, req: AbortUploadRequest) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut inner = self.lock();
            inner.calls.abort += 1;
            if let Some(error) = inner.abort_fault.clone() {
                return Err(error);
            }
            match inner.uploads.get_mut(&req.target.upload_id) {
                Some(upload) => {
                    upload.aborted = true;
                    upload.parts.clear();
                    debug!(store = %self.name, upload_id = %req.target.upload_id, "upload aborted");
                    Ok(())
                }
                None => Err(StoreError::NotFound(req.target.upload_id)),
            }
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}
