//! Splitting an object into the byte ranges that are downloaded and uploaded independently.
use crate::Result;
use std::ops::Range;
use tracing::warn;

/// The most parts S3 (and most S3-compatible stores) accept in a single multipart upload
pub const MAX_MULTIPART_PARTS: u64 = 10_000;

/// One contiguous, half-open byte range of the object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChunkRange {
    /// Position of this range in the plan, starting from 0
    pub index: usize,

    /// First byte of the range
    pub start: u64,

    /// One past the last byte of the range
    pub end: u64,
}

impl ChunkRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn byte_range(&self) -> Range<u64> {
        self.start..self.end
    }
}

/// Break up an object of `total_size` bytes into ranges of `chunk_size` bytes each, except the
/// last range which holds whatever is left over.
///
/// The result is deterministic, so re-planning with the same inputs always yields exactly the same
/// ranges.
pub fn plan_chunks(total_size: u64, chunk_size: u64) -> Result<Vec<ChunkRange>> {
    if total_size == 0 || chunk_size == 0 {
        return crate::error::InvalidSizeSnafu {
            total_size,
            chunk_size,
        }
        .fail();
    }

    let count = total_size.div_ceil(chunk_size);
    let mut ranges = Vec::with_capacity(count as usize);
    let mut start = 0u64;

    while start < total_size {
        let end = (start + chunk_size).min(total_size);

        ranges.push(ChunkRange {
            index: ranges.len(),
            start,
            end,
        });

        start = end;
    }

    debug_assert_eq!(count as usize, ranges.len());

    Ok(ranges)
}

/// Plan the parts of a multipart upload.
///
/// This works like [`plan_chunks`], except that if `part_size` would produce more than
/// [`MAX_MULTIPART_PARTS`] parts, the part size is increased so that the part count stays under
/// the limit.
pub fn plan_parts(total_size: u64, part_size: u64) -> Result<Vec<ChunkRange>> {
    if part_size > 0 && total_size.div_ceil(part_size) > MAX_MULTIPART_PARTS {
        let new_part_size = total_size.div_ceil(MAX_MULTIPART_PARTS);
        warn!(
            total_size,
            part_size,
            new_part_size,
            "Object is so large that the requested part size will be overridden to keep the total part count under 10K"
        );

        plan_chunks(total_size, new_part_size)
    } else {
        plan_chunks(total_size, part_size)
    }
}
