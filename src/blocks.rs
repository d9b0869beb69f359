use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::interval::{Interval, IntervalMap};

/// Consecutive blocks whose gap is at most this many seconds belong to one range.
pub const SAME_RANGE_DIFF_S: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BlockError {
    #[error("invalid range: start_ts {start_ts} is greater than end_ts {end_ts}")]
    InvalidRange { start_ts: f64, end_ts: f64 },
    #[error("overlapping ranges for interval {interval}")]
    OverlappingRanges { interval: Interval },
    #[error("unable to prune key {key} for overlap window {interval}")]
    PruneExhausted { interval: Interval, key: String },
    #[error("block range is empty")]
    EmptyRange,
    #[error("invalid window `{0}`")]
    InvalidWindow(String),
}

/// Metadata of one stored block: its time bounds plus storage attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockMeta {
    pub start_ts: f64,
    pub end_ts: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_kb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl BlockMeta {
    pub fn new(start_ts: f64, end_ts: f64) -> Self {
        Self {
            start_ts,
            end_ts,
            path: None,
            size_kb: None,
            hash: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

/// Blocks forming one contiguous range, in time order.
pub type BlockRangeMeta = Vec<BlockMeta>;

pub fn meta_to_interval(meta: &BlockMeta) -> Result<Interval, BlockError> {
    Interval::closed(meta.start_ts, meta.end_ts)
}

pub fn range_meta_to_interval(range: &[BlockMeta]) -> Result<Interval, BlockError> {
    match (range.first(), range.last()) {
        (Some(first), Some(last)) => Interval::closed(first.start_ts, last.end_ts),
        _ => Err(BlockError::EmptyRange),
    }
}

pub fn interval_to_meta(interval: &Interval) -> BlockMeta {
    BlockMeta::new(interval.start_ts(), interval.end_ts())
}

pub fn ranges_to_interval_dict(
    ranges: &[BlockRangeMeta],
) -> Result<IntervalMap<BlockRangeMeta>, BlockError> {
    let mut dict = IntervalMap::new();
    for range in ranges {
        dict.insert_disjoint(range_meta_to_interval(range)?, range.clone())?;
    }
    Ok(dict)
}

/// Splits time-sorted blocks into ranges wherever the gap exceeds [`SAME_RANGE_DIFF_S`].
pub fn make_ranges(blocks: &[BlockMeta]) -> Vec<BlockRangeMeta> {
    make_ranges_with_gap(blocks, SAME_RANGE_DIFF_S)
}

pub fn make_ranges_with_gap(blocks: &[BlockMeta], gap_threshold_s: f64) -> Vec<BlockRangeMeta> {
    let mut ranges = Vec::new();
    let mut current: BlockRangeMeta = Vec::new();
    for (idx, block) in blocks.iter().enumerate() {
        current.push(block.clone());
        let splits = blocks
            .get(idx + 1)
            .is_some_and(|next| next.start_ts - block.end_ts > gap_threshold_s);
        if splits {
            ranges.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        ranges.push(current);
    }
    ranges
}

/// Each dependency block computes exactly one output block over the same interval.
pub fn identity_grouping(blocks: &[BlockMeta]) -> Result<IntervalMap<Vec<BlockMeta>>, BlockError> {
    let mut grouped = IntervalMap::new();
    for block in blocks {
        grouped.insert(meta_to_interval(block)?, vec![block.clone()]);
    }
    Ok(grouped)
}

/// Each block is grouped with the preceding blocks that end within `window_s` of its start.
pub fn windowed_grouping(
    blocks: &[BlockMeta],
    window_s: f64,
) -> Result<IntervalMap<Vec<BlockMeta>>, BlockError> {
    if window_s.is_nan() || window_s < 0.0 {
        return Err(BlockError::InvalidWindow(window_s.to_string()));
    }

    let mut grouped = IntervalMap::new();
    for (idx, block) in blocks.iter().enumerate() {
        let lookback = blocks[..idx]
            .iter()
            .rev()
            .take_while(|prev| block.start_ts - prev.end_ts <= window_s)
            .count();
        grouped.insert(meta_to_interval(block)?, blocks[idx - lookback..=idx].to_vec());
    }
    Ok(grouped)
}

/// Start of the fixed bucket of width `window_s` containing `ts`, aligned to the epoch.
pub fn bucket_start_ts(ts: f64, window_s: f64) -> f64 {
    (ts / window_s).floor() * window_s
}

/// Groups blocks into epoch-aligned buckets spanning `bucket_count` windows.
///
/// A bucket is emitted only when its blocks fully cover it; otherwise the cursor slides
/// forward by one window.
pub fn fixed_bucket_grouping(
    blocks: &[BlockMeta],
    window_s: f64,
    bucket_count: u32,
) -> Result<IntervalMap<Vec<BlockMeta>>, BlockError> {
    if window_s.is_nan() || window_s <= 0.0 || bucket_count == 0 {
        return Err(BlockError::InvalidWindow(format!(
            "{window_s}s x {bucket_count}"
        )));
    }

    let mut grouped = IntervalMap::new();
    let (Some(first), Some(last)) = (blocks.first(), blocks.last()) else {
        return Ok(grouped);
    };

    // bucket edges are always origin + k * window_s
    let origin = bucket_start_ts(first.start_ts, window_s);
    let last_end_ts = last.end_ts;
    let mut step: u64 = 0;
    loop {
        let group_start = origin + step as f64 * window_s;
        if group_start > last_end_ts {
            break;
        }
        let group_end = origin + (step + u64::from(bucket_count)) as f64 * window_s;
        let group: Vec<BlockMeta> = blocks
            .iter()
            .filter(|block| touches_bucket(block, group_start, group_end))
            .cloned()
            .collect();

        let covered = match (group.first(), group.last()) {
            (Some(head), Some(tail)) => head.start_ts <= group_start && tail.end_ts >= group_end,
            _ => false,
        };
        if covered {
            grouped.insert(Interval::closed(group_start, group_end)?, group);
            step += u64::from(bucket_count);
        } else {
            step += 1;
        }
    }
    Ok(grouped)
}

fn touches_bucket(block: &BlockMeta, group_start: f64, group_end: f64) -> bool {
    let inside = group_start <= block.start_ts && block.end_ts <= group_end;
    let holds_start = block.start_ts <= group_start && group_start <= block.end_ts;
    let holds_end = block.start_ts <= group_end && group_end <= block.end_ts;
    inside || holds_start || holds_end
}

/// Parses `<n>s`, `<n>m`, `<n>h`, `<n>d` or a bare number of seconds.
pub fn parse_window_seconds(raw: &str) -> Result<f64, BlockError> {
    let trimmed = raw.trim();
    let (number, multiplier) = match trimmed.char_indices().last() {
        Some((idx, 's')) => (&trimmed[..idx], 1.0),
        Some((idx, 'm')) => (&trimmed[..idx], 60.0),
        Some((idx, 'h')) => (&trimmed[..idx], 3_600.0),
        Some((idx, 'd')) => (&trimmed[..idx], 86_400.0),
        Some(_) => (trimmed, 1.0),
        None => return Err(BlockError::InvalidWindow(raw.to_string())),
    };

    let value = number
        .trim()
        .parse::<f64>()
        .map_err(|_| BlockError::InvalidWindow(raw.to_string()))?;
    if !value.is_finite() || value < 0.0 {
        return Err(BlockError::InvalidWindow(raw.to_string()));
    }
    Ok(value * multiplier)
}
