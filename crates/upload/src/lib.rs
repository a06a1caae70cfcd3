//! Parallel multipart upload against an object store.
//!
//! [`UploadCoordinator`] plans the parts, runs one [`PartUploader`] per part
//! with bounded concurrency and either completes the object with the
//! receipts in part order or aborts the session when any part fails.

pub mod coordinator;
pub mod error;
pub mod memory;
pub mod store;
pub mod types;
pub mod uploader;

pub use coordinator::{UploadCoordinator, order_receipts};
pub use error::{StoreError, UploadError};
pub use memory::{CallCounts, MemoryStore, StoredObject};
pub use store::{ObjectStore, StoreFuture};
pub use types::{PartOutcome, RetryPolicy, UploadConfig, UploadEvent, UploadSummary};
pub use uploader::PartUploader;
