use std::path::Path;

use bytes::Bytes;
use multipush_protocol::PartRange;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::TransferError;

/// Computes SHA-256 of a part and returns the hex-encoded digest.
pub fn checksum_part(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Reads the whole source file into memory.
///
/// The size must be known before planning, so the payload is buffered up
/// front rather than streamed.
pub async fn load_payload(path: &Path) -> Result<Bytes, TransferError> {
    let data = tokio::fs::read(path).await?;
    debug!(path = %path.display(), bytes = data.len(), "payload loaded");
    Ok(Bytes::from(data))
}

/// Returns the zero-copy window of `payload` covered by `range`.
///
/// # Panics
///
/// Panics if the range lies outside the payload, which means the plan was
/// built for a different payload.
pub fn slice_part(payload: &Bytes, range: &PartRange) -> Bytes {
    let start = range.offset as usize;
    let end = range.end() as usize;
    payload.slice(start..end)
}
