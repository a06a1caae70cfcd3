//! Object store trait consumed by the coordinator.
//!
//! The binary implements this on top of an S3-compatible HTTP endpoint;
//! tests use [`MemoryStore`](crate::memory::MemoryStore). Keeping the store
//! behind a trait keeps the upload logic independent of the transport.

use std::future::Future;
use std::pin::Pin;

use multipush_protocol::{
    AbortUploadRequest, CompleteUploadRequest, CompletedUpload, CreateUploadRequest,
    UploadPartRequest,
};

use crate::error::StoreError;

/// Boxed future returned by [`ObjectStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// A store that supports multipart upload semantics.
pub trait ObjectStore: Send + Sync {
    /// Opens a multipart session and returns its upload id.
    fn create_upload(&self, req: CreateUploadRequest) -> StoreFuture<'_, String>;

    /// Stores one part and returns its entity tag.
    fn upload_part(&self, req: UploadPartRequest) -> StoreFuture<'_, String>;

    /// Assembles the stored parts into the final object.
    fn complete_upload(&self, req: CompleteUploadRequest) -> StoreFuture<'_, CompletedUpload>;

    /// Discards the session and its stored parts.
    fn abort_upload(&self, req: AbortUploadRequest) -> StoreFuture<'_, ()>;

    /// Short label used in logs.
    fn name(&self) -> &str;
}
