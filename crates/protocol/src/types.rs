use serde::{Deserialize, Serialize};

/// A contiguous byte range of the payload uploaded as one part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartRange {
    /// 1-based part number.
    pub index: u32,
    /// Byte offset of the first byte in the payload.
    pub offset: u64,
    /// Number of bytes in this part. Never zero.
    pub length: u64,
}

impl PartRange {
    /// Offset one past the last byte of this range.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Store-issued proof that a part was persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartReceipt {
    pub index: u32,
    /// Entity tag exactly as returned by the store (quotes included).
    pub etag: String,
}

/// Identity of an open multipart session on the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTarget {
    pub upload_id: String,
    pub key: String,
}

impl UploadTarget {
    pub fn new(upload_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            upload_id: upload_id.into(),
            key: key.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_range_end() {
        let range = PartRange {
            index: 2,
            offset: 50,
            length: 20,
        };
        assert_eq!(range.end(), 70);
    }

    #[test]
    fn receipt_json_is_camel_case() {
        let receipt = PartReceipt {
            index: 3,
            etag: "\"abc\"".into(),
        };
        let json = serde_json::to_string(&receipt).unwrap();
        assert_eq!(json, r#"{"index":3,"etag":"\"abc\""}"#);

        let target = UploadTarget::new("u-1", "recordings/a.mp4");
        let json = serde_json::to_string(&target).unwrap();
        assert!(json.contains("\"uploadId\":\"u-1\""));
    }
}
