use std::time::Duration;

/// First part number accepted by multipart stores.
pub const FIRST_PART_NUMBER: u32 = 1;

/// Highest part number an S3-compatible store accepts.
pub const MAX_PART_COUNT: u64 = 10_000;

/// Default part size in bytes (50 MB).
pub const DEFAULT_PART_SIZE: u64 = 50_000_000;

/// Extra attempts after the first failed part upload.
pub const DEFAULT_RETRIES: u32 = 2;

/// Constant pause between part upload attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(15);

/// Expiry hint sent with the create call.
pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

/// Default number of parts in flight at once.
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;
