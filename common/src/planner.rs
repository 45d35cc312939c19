//! Splitting a file into chunks and regions
//!
//! A chunk is the unit of transfer and verification: `chunk_size` bytes, except possibly the last
//! one. A region is a larger contiguous byte range handed to one concurrent worker. Regions are a
//! byte partition of the file; each chunk belongs to the region its first byte falls into, so
//! chunk boundaries are the same in sequential and concurrent mode.

use crate::error::TransferError;

/// Byte range of a single chunk.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChunkBounds {
    pub index: u64,
    pub offset: u64,
    pub length: u64,
}

impl ChunkBounds {
    #[must_use]
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Half-open byte range `[start, end)` assigned to one worker.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Region {
    pub start: u64,
    pub end: u64,
}

/// Number of chunks needed to cover `file_size` bytes, `ceil(file_size / chunk_size)`.
#[must_use]
pub fn total_chunks(file_size: u64, chunk_size: u64) -> u64 {
    assert!(chunk_size > 0, "chunk size must be positive");
    file_size.div_ceil(chunk_size)
}

pub fn chunk_bounds(index: u64, file_size: u64, chunk_size: u64) -> Result<ChunkBounds, TransferError> {
    assert!(chunk_size > 0, "chunk size must be positive");
    let offset = index
        .checked_mul(chunk_size)
        .filter(|offset| *offset < file_size)
        .ok_or(TransferError::InvalidIndex { index, file_size })?;
    Ok(ChunkBounds {
        index,
        offset,
        length: std::cmp::min(chunk_size, file_size - offset),
    })
}

/// Partitions `[0, file_size)` into exactly `region_count` contiguous regions.
///
/// All regions get `file_size / region_count` bytes, the last one also gets the remainder. When
/// the file is smaller than the region count some regions are empty.
#[must_use]
pub fn split_regions(file_size: u64, region_count: usize) -> Vec<Region> {
    assert!(region_count > 0, "region count must be positive");
    let count = region_count as u64;
    let base_size = file_size / count;
    let remainder = file_size % count;
    let mut regions = Vec::with_capacity(region_count);
    let mut start = 0;
    for i in 0..count {
        let size = if i == count - 1 {
            base_size + remainder
        } else {
            base_size
        };
        regions.push(Region {
            start,
            end: start + size,
        });
        start += size;
    }
    regions
}

/// Indices of the chunks whose first byte lies inside `region`.
#[must_use]
pub fn region_chunks(region: &Region, chunk_size: u64) -> std::ops::Range<u64> {
    assert!(chunk_size > 0, "chunk size must be positive");
    region.start.div_ceil(chunk_size)..region.end.div_ceil(chunk_size)
}

/// Iterates over all chunks of a file in index order.
pub fn chunks(file_size: u64, chunk_size: u64) -> impl Iterator<Item = ChunkBounds> {
    (0..total_chunks(file_size, chunk_size)).map(move |index| ChunkBounds {
        index,
        offset: index * chunk_size,
        length: std::cmp::min(chunk_size, file_size - index * chunk_size),
    })
}
