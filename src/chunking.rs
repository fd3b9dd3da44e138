//! Chunk planning for bounded-memory block access.
//!
//! Given a declared array shape, an element size, and a byte ceiling, the
//! planner partitions every axis into ordered block sizes so that no single
//! chunk exceeds the ceiling. Area-detector series (rank-4 arrays of frames)
//! get a dedicated default that keeps single-frame access cheap without
//! collapsing larger reads into size-1 chunks.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};

/// Default byte ceiling for a single chunk (100 MB).
pub const DEFAULT_CHUNK_BYTE_LIMIT: usize = 100 * 1024 * 1024;

/// Default frame-group size for the leading axes of rank-4 arrays.
pub const DEFAULT_FRAMES_PER_CHUNK: usize = 10;

/// Per-axis chunking suggestion, as carried by a descriptor's `chunks` field
/// (`"auto"` or an explicit block size).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkHint {
    /// Let the planner size this axis under the byte ceiling.
    Auto,
    /// Use blocks of exactly this extent (the last block may be smaller).
    Fixed(usize),
}

impl Serialize for ChunkHint {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            ChunkHint::Auto => serializer.serialize_str("auto"),
            ChunkHint::Fixed(size) => serializer.serialize_u64(*size as u64),
        }
    }
}

impl<'de> Deserialize<'de> for ChunkHint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        match value {
            serde_json::Value::String(s) if s == "auto" => Ok(ChunkHint::Auto),
            serde_json::Value::Number(n) => n
                .as_u64()
                .map(|n| ChunkHint::Fixed(n as usize))
                .ok_or_else(|| de::Error::custom("chunk size must be a non-negative integer")),
            other => Err(de::Error::custom(format!(
                "chunk hint must be \"auto\" or an integer, got {other}"
            ))),
        }
    }
}

/// Partition `shape` into per-axis block sizes.
///
/// Rules, in order:
/// 1. Any zero axis extent or a zero itemsize yields whole-shape chunks.
/// 2. With no explicit `hints`, rank-4 shapes default to
///    `(min(K, s0), min(K, s1), auto, auto)` where K is `frames_per_chunk`;
///    all other ranks default to `auto` on every axis.
/// 3. `auto` axes are sized so the chunk byte size stays at or below
///    `byte_limit`, granting full extent to later axes first.
///
/// Each axis partition sums exactly to the axis extent.
pub fn plan_chunks(
    shape: &[usize],
    itemsize: usize,
    byte_limit: usize,
    hints: Option<&[ChunkHint]>,
    frames_per_chunk: usize,
) -> Vec<Vec<usize>> {
    if itemsize == 0 || shape.iter().any(|&extent| extent == 0) {
        return shape.iter().map(|&extent| vec![extent]).collect();
    }

    let default_hints: Vec<ChunkHint> = if shape.len() == 4 {
        vec![
            ChunkHint::Fixed(frames_per_chunk.min(shape[0]).max(1)),
            ChunkHint::Fixed(frames_per_chunk.min(shape[1]).max(1)),
            ChunkHint::Auto,
            ChunkHint::Auto,
        ]
    } else {
        vec![ChunkHint::Auto; shape.len()]
    };
    let hints = hints.unwrap_or(&default_hints);

    // Fixed axes consume budget first; auto axes share what remains, later
    // axes keeping full extent as long as the ceiling allows.
    let limit_items = (byte_limit / itemsize).max(1);
    let mut extents: Vec<usize> = vec![0; shape.len()];
    let mut budget = limit_items;
    for (axis, &extent) in shape.iter().enumerate() {
        if let Some(ChunkHint::Fixed(size)) = hints.get(axis) {
            let size = (*size).clamp(1, extent);
            extents[axis] = size;
            budget = (budget / size).max(1);
        }
    }
    for (axis, &extent) in shape.iter().enumerate().rev() {
        if matches!(hints.get(axis), Some(ChunkHint::Fixed(_))) {
            continue;
        }
        let size = extent.min(budget).max(1);
        extents[axis] = size;
        budget = (budget / size).max(1);
    }

    shape
        .iter()
        .zip(extents)
        .map(|(&extent, chunk)| partition_axis(extent, chunk))
        .collect()
}

/// Split one axis extent into blocks of `chunk`, the last block absorbing the
/// remainder.
fn partition_axis(extent: usize, chunk: usize) -> Vec<usize> {
    if extent == 0 {
        return vec![0];
    }
    let mut blocks = Vec::with_capacity(extent.div_ceil(chunk));
    let mut remaining = extent;
    while remaining > 0 {
        let take = chunk.min(remaining);
        blocks.push(take);
        remaining -= take;
    }
    blocks
}

/// Number of blocks along each axis of a partition.
pub fn block_counts(partition: &[Vec<usize>]) -> Vec<usize> {
    partition.iter().map(Vec::len).collect()
}

/// Half-open index range covered by `block` along one axis, from the
/// cumulative sum of the preceding blocks.
pub fn block_bounds(axis_partition: &[usize], block: usize) -> (usize, usize) {
    let start: usize = axis_partition[..block].iter().sum();
    (start, start + axis_partition[block])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sums(partition: &[Vec<usize>]) -> Vec<usize> {
        partition.iter().map(|axis| axis.iter().sum()).collect()
    }

    #[test]
    fn partitions_round_trip_to_shape() {
        for shape in [
            vec![3usize],
            vec![1000, 2048, 2048],
            vec![100, 17, 512, 512],
            vec![7, 0, 9],
        ] {
            let partition = plan_chunks(&shape, 8, DEFAULT_CHUNK_BYTE_LIMIT, None, 10);
            assert_eq!(sums(&partition), shape, "shape {shape:?}");
        }
    }

    #[test]
    fn zero_extent_or_itemsize_yields_whole_shape() {
        assert_eq!(
            plan_chunks(&[5, 0, 3], 8, 1024, None, 10),
            vec![vec![5], vec![0], vec![3]]
        );
        assert_eq!(plan_chunks(&[5, 3], 0, 1024, None, 10), vec![vec![5], vec![3]]);
    }

    #[test]
    fn later_axes_keep_full_extent() {
        // 64 KiB ceiling, f8 elements: 8192 items per chunk. The trailing
        // 16x16 plane (256 items) fits whole; the leading axis is cut.
        let partition = plan_chunks(&[100, 16, 16], 8, 64 * 1024, None, 10);
        assert_eq!(partition[1], vec![16]);
        assert_eq!(partition[2], vec![16]);
        assert!(partition[0].len() > 1);
        assert_eq!(partition[0].iter().sum::<usize>(), 100);
        let widest = partition[0].iter().max().copied().unwrap_or(0);
        assert!(widest * 16 * 16 * 8 <= 64 * 1024);
    }

    #[test]
    fn rank_four_uses_frame_groups() {
        let partition = plan_chunks(&[100, 3, 512, 512], 2, DEFAULT_CHUNK_BYTE_LIMIT, None, 10);
        // Leading axes grouped by min(frames_per_chunk, extent).
        assert_eq!(partition[0][0], 10);
        assert_eq!(partition[1], vec![3]);
        // Detector plane fits under the default ceiling in one block.
        assert_eq!(partition[2], vec![512]);
        assert_eq!(partition[3], vec![512]);
    }

    #[test]
    fn explicit_hints_override_defaults() {
        let hints = [ChunkHint::Fixed(4), ChunkHint::Auto];
        let partition = plan_chunks(&[10, 6], 8, DEFAULT_CHUNK_BYTE_LIMIT, Some(&hints), 10);
        assert_eq!(partition[0], vec![4, 4, 2]);
        assert_eq!(partition[1], vec![6]);
    }

    #[test]
    fn block_bounds_follow_cumsum() {
        let axis = vec![4usize, 4, 2];
        assert_eq!(block_bounds(&axis, 0), (0, 4));
        assert_eq!(block_bounds(&axis, 1), (4, 8));
        assert_eq!(block_bounds(&axis, 2), (8, 10));
        assert_eq!(block_counts(&[axis]), vec![3]);
    }

    #[test]
    fn chunk_hint_deserializes_auto_and_sizes() {
        let hints: Vec<ChunkHint> = serde_json::from_str(r#"["auto", 12]"#).unwrap();
        assert_eq!(hints, vec![ChunkHint::Auto, ChunkHint::Fixed(12)]);
        assert!(serde_json::from_str::<ChunkHint>(r#""whole""#).is_err());
    }
}
