use multipush_protocol::PartRange;
use multipush_protocol::constants::{FIRST_PART_NUMBER, MAX_PART_COUNT};

use crate::TransferError;

/// Number of parts needed to cover `total_size` bytes.
///
/// # Panics
///
/// Panics if `part_size` is zero.
pub fn part_count(total_size: u64, part_size: u64) -> u64 {
    assert!(part_size > 0, "part size must be positive");
    total_size.div_ceil(part_size)
}

/// Returns the part count, or an error if the store could not accept that many parts.
pub fn check_part_count(total_size: u64, part_size: u64) -> Result<u64, TransferError> {
    let parts = part_count(total_size, part_size);
    if parts > MAX_PART_COUNT {
        return Err(TransferError::TooManyParts {
            size: total_size,
            part_size,
            parts,
            max: MAX_PART_COUNT,
        });
    }
    Ok(parts)
}

/// Splits `total_size` bytes into contiguous ranges of `part_size` bytes.
///
/// Ranges are numbered from 1 in ascending offset order. Only the last range
/// may be shorter than `part_size`; an empty payload produces no ranges.
///
/// # Panics
///
/// Panics if `part_size` is zero or the plan would need more than
/// `u32::MAX` parts.
pub fn plan_parts(total_size: u64, part_size: u64) -> Vec<PartRange> {
    let count = part_count(total_size, part_size);
    assert!(
        count <= u64::from(u32::MAX),
        "{count} parts cannot be numbered"
    );

    let mut ranges = Vec::with_capacity(count as usize);
    let mut index = FIRST_PART_NUMBER;
    let mut offset = 0;
    while offset < total_size {
        let length = part_size.min(total_size - offset);
        ranges.push(PartRange {
            index,
            offset,
            length,
        });
        offset += length;
        index += 1;
    }
    ranges
}
