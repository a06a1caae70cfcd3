//! Contract types for multipart uploads.
//!
//! Everything here is plain data: byte ranges produced by the planner,
//! receipts returned by the store, and the request/response messages that
//! cross the `ObjectStore` boundary. No I/O lives in this crate.

pub mod constants;
pub mod messages;
pub mod types;

pub use messages::{
    AbortUploadRequest, CompleteUploadRequest, CompletedUpload, CreateUploadRequest,
    UploadPartRequest,
};
pub use types::{PartRange, PartReceipt, UploadTarget};
