//! Building blocks for a multipart transfer: the part planner, the
//! session state machine, payload slicing and throughput tracking.

mod payload;
mod plan;
mod progress;
mod session;

pub use payload::{checksum_part, load_payload, slice_part};
pub use plan::{check_part_count, part_count, plan_parts};
pub use progress::ThroughputMeter;
pub use session::{SessionProgress, SessionState, TransferSession};

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid session transition: {from} -> {to}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },

    #[error("{size} bytes at part size {part_size} needs {parts} parts, store allows {max}")]
    TooManyParts {
        size: u64,
        part_size: u64,
        parts: u64,
        max: u64,
    },
}
