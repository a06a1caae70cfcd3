//! Requests and responses exchanged with a multipart-capable store.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{PartReceipt, UploadTarget};

/// Opens a multipart session for `key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUploadRequest {
    pub key: String,
    /// Hint after which the store may discard the object.
    pub expires_at: DateTime<Utc>,
}

/// Uploads the bytes of one part under an open session.
#[derive(Clone)]
pub struct UploadPartRequest {
    pub target: UploadTarget,
    pub part_number: u32,
    pub data: Bytes,
    /// Hex SHA-256 of `data`. Empty means the store should not verify.
    pub checksum: String,
}

impl UploadPartRequest {
    pub fn content_length(&self) -> u64 {
        self.data.len() as u64
    }
}

// Part payloads are tens of megabytes; never dump them into logs.
impl fmt::Debug for UploadPartRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadPartRequest")
            .field("target", &self.target)
            .field("part_number", &self.part_number)
            .field("content_length", &self.data.len())
            .field("checksum", &self.checksum)
            .finish()
    }
}

/// Finalizes a session. `parts` must be sorted ascending by index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteUploadRequest {
    pub target: UploadTarget,
    pub parts: Vec<PartReceipt>,
}

/// Store response to a successful completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedUpload {
    pub location: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub etag: String,
}

/// Discards a session and every part stored under it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortUploadRequest {
    pub target: UploadTarget,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_request_debug_omits_payload() {
        let req = UploadPartRequest {
            target: UploadTarget::new("u1", "k"),
            part_number: 1,
            data: Bytes::from_static(b"secret-bytes"),
            checksum: String::new(),
        };
        let dbg = format!("{req:?}");
        assert!(dbg.contains("content_length: 12"));
        assert!(!dbg.contains("secret-bytes"));
        assert_eq!(req.content_length(), 12);
    }

    #[test]
    fn completed_upload_skips_empty_etag() {
        let done = CompletedUpload {
            location: "http://store/bucket/key".into(),
            etag: String::new(),
        };
        let json = serde_json::to_string(&done).unwrap();
        assert!(!json.contains("etag"));
    }
}
