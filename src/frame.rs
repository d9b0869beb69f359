//! Columnar time-series blocks and the frame operations the executor needs.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const TIMESTAMP_COLUMN: &str = "timestamp";
pub const RECEIPT_TIMESTAMP_COLUMN: &str = "receipt_timestamp";
pub const LABEL_PREFIX: &str = "label_";

const MERGE_COLLISION_SUFFIX: &str = "_y";
const MIN_LOOKAHEAD_S: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FrameError {
    #[error("column {column} has {found} values, expected {expected}")]
    ColumnLength {
        column: String,
        expected: usize,
        found: usize,
    },
    #[error("duplicate column {0}")]
    DuplicateColumn(String),
    #[error("column {0} is reserved")]
    ReservedColumn(String),
    #[error("cannot concat blocks with columns {left:?} and {right:?}")]
    ColumnMismatch {
        left: Vec<String>,
        right: Vec<String>,
    },
    #[error("block is not sorted by timestamp")]
    UnsortedBlock,
    #[error("lookahead must be at least 1s, got {0}s")]
    InvalidLookahead(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub values: Vec<f64>,
}

impl Column {
    pub fn new(name: impl Into<String>, values: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }
}

/// A time-bounded table: one timestamp per row plus named `f64` columns.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Block {
    timestamps: Vec<f64>,
    columns: Vec<Column>,
}

impl Block {
    pub fn new(timestamps: Vec<f64>, columns: Vec<Column>) -> Result<Self, FrameError> {
        let mut seen = BTreeSet::new();
        for column in &columns {
            if column.name == TIMESTAMP_COLUMN {
                return Err(FrameError::ReservedColumn(column.name.clone()));
            }
            if !seen.insert(column.name.as_str()) {
                return Err(FrameError::DuplicateColumn(column.name.clone()));
            }
            if column.values.len() != timestamps.len() {
                return Err(FrameError::ColumnLength {
                    column: column.name.clone(),
                    expected: timestamps.len(),
                    found: column.values.len(),
                });
            }
        }
        Ok(Self {
            timestamps,
            columns,
        })
    }

    /// Zero-row block carrying the given column names.
    pub fn empty<S: AsRef<str>>(names: &[S]) -> Self {
        Self {
            timestamps: Vec::new(),
            columns: names
                .iter()
                .map(|name| Column::new(name.as_ref(), Vec::new()))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn timestamps(&self) -> &[f64] {
        &self.timestamps
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns
            .iter()
            .find(|column| column.name == name)
            .map(|column| column.values.as_slice())
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|column| column.name.clone()).collect()
    }

    pub fn is_ts_sorted(&self) -> bool {
        self.timestamps.windows(2).all(|pair| pair[0] <= pair[1])
    }

    /// First and last timestamp.
    pub fn time_range(&self) -> Option<(f64, f64)> {
        Some((*self.timestamps.first()?, *self.timestamps.last()?))
    }

    /// Rows with `start_ts <= timestamp <= end_ts`. Assumes timestamp order.
    pub fn sub_block_ts(&self, start_ts: f64, end_ts: f64) -> Block {
        let from = self.timestamps.partition_point(|ts| *ts < start_ts);
        let to = self.timestamps.partition_point(|ts| *ts <= end_ts).max(from);
        self.slice_rows(from, to)
    }

    fn slice_rows(&self, from: usize, to: usize) -> Block {
        Block {
            timestamps: self.timestamps[from..to].to_vec(),
            columns: self
                .columns
                .iter()
                .map(|column| Column::new(column.name.clone(), column.values[from..to].to_vec()))
                .collect(),
        }
    }

    /// Row-wise concatenation. Blocks with no rows and no columns are skipped.
    pub fn concat<'a, I>(blocks: I) -> Result<Block, FrameError>
    where
        I: IntoIterator<Item = &'a Block>,
    {
        let mut parts = blocks
            .into_iter()
            .filter(|block| !(block.is_empty() && block.columns.is_empty()));
        let Some(first) = parts.next() else {
            return Ok(Block::default());
        };

        let mut out = first.clone();
        for block in parts {
            let left = out.column_names();
            let right = block.column_names();
            if left != right {
                return Err(FrameError::ColumnMismatch { left, right });
            }
            out.timestamps.extend_from_slice(&block.timestamps);
            for (column, other) in out.columns.iter_mut().zip(&block.columns) {
                column.values.extend_from_slice(&other.values);
            }
        }
        Ok(out)
    }

    /// Backward as-of join: every row of `self` takes the latest row of `right` whose
    /// timestamp is not after its own, or NaN when none exists.
    ///
    /// The left `receipt_timestamp` wins; other name collisions get a `_y` suffix.
    pub fn merge_asof(&self, right: &Block) -> Result<Block, FrameError> {
        if !self.is_ts_sorted() || !right.is_ts_sorted() {
            return Err(FrameError::UnsortedBlock);
        }

        let matches = asof_indices(&self.timestamps, &right.timestamps);
        let mut columns = self.columns.clone();
        for column in &right.columns {
            if column.name == RECEIPT_TIMESTAMP_COLUMN && self.column(&column.name).is_some() {
                continue;
            }
            let mut name = column.name.clone();
            while columns.iter().any(|existing| existing.name == name) {
                name.push_str(MERGE_COLLISION_SUFFIX);
            }
            let values = matches
                .iter()
                .map(|idx| idx.map_or(f64::NAN, |idx| column.values[idx]))
                .collect();
            columns.push(Column::new(name, values));
        }
        Block::new(self.timestamps.clone(), columns)
    }

    /// Left-to-right [`Block::merge_asof`] of all frames onto the first one.
    pub fn merge_asof_multi(frames: &[Block]) -> Result<Block, FrameError> {
        let Some((first, rest)) = frames.split_first() else {
            return Ok(Block::default());
        };
        rest.iter()
            .try_fold(first.clone(), |merged, frame| merged.merge_asof(frame))
    }

    /// Replaces each row's values with those observed `lookahead_s` later, then drops
    /// the trailing rows that have no full lookahead horizon.
    pub fn lookahead_shift(&self, lookahead_s: f64) -> Result<Block, FrameError> {
        if !self.is_ts_sorted() {
            return Err(FrameError::UnsortedBlock);
        }
        if lookahead_s.is_nan() || lookahead_s < MIN_LOOKAHEAD_S {
            return Err(FrameError::InvalidLookahead(lookahead_s));
        }
        let Some((first_ts, last_ts)) = self.time_range() else {
            return Ok(self.clone());
        };

        let shifted_ts: Vec<f64> = self.timestamps.iter().map(|ts| ts + lookahead_s).collect();
        let matches = asof_indices(&shifted_ts, &self.timestamps);
        let columns = self
            .columns
            .iter()
            .map(|column| {
                if column.name == RECEIPT_TIMESTAMP_COLUMN {
                    return column.clone();
                }
                let values = matches
                    .iter()
                    .map(|idx| idx.map_or(f64::NAN, |idx| column.values[idx]))
                    .collect();
                Column::new(column.name.clone(), values)
            })
            .collect();

        let shifted = Block {
            timestamps: self.timestamps.clone(),
            columns,
        };
        Ok(shifted.sub_block_ts(first_ts, last_ts - lookahead_s))
    }

    /// Prefixes every value column except `receipt_timestamp`.
    pub fn with_prefix(mut self, prefix: &str) -> Block {
        for column in &mut self.columns {
            if column.name != RECEIPT_TIMESTAMP_COLUMN {
                column.name = format!("{prefix}{}", column.name);
            }
        }
        self
    }

    /// Keeps every `nth_row`-th row starting from the first; `0` and `1` keep all rows.
    pub fn downsample_uniform(&self, nth_row: usize) -> Block {
        if nth_row <= 1 {
            return self.clone();
        }
        Block {
            timestamps: self.timestamps.iter().step_by(nth_row).copied().collect(),
            columns: self
                .columns
                .iter()
                .map(|column| {
                    Column::new(
                        column.name.clone(),
                        column.values.iter().step_by(nth_row).copied().collect(),
                    )
                })
                .collect(),
        }
    }

    pub fn size_kb(&self) -> f64 {
        let cells = self.len() * (self.columns.len() + 1);
        (cells * std::mem::size_of::<f64>()) as f64 / 1024.0
    }

    /// Hex sha256 over column names and the bit patterns of all values.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(TIMESTAMP_COLUMN.as_bytes());
        for ts in &self.timestamps {
            hasher.update(ts.to_bits().to_le_bytes());
        }
        for column in &self.columns {
            hasher.update([0u8]);
            hasher.update(column.name.as_bytes());
            for value in &column.values {
                hasher.update(value.to_bits().to_le_bytes());
            }
        }
        hex::encode(hasher.finalize())
    }
}

/// For each left timestamp, index of the last right timestamp `<=` it.
fn asof_indices(left: &[f64], right: &[f64]) -> Vec<Option<usize>> {
    let mut out = Vec::with_capacity(left.len());
    let mut cursor = 0;
    for ts in left {
        while cursor < right.len() && right[cursor] <= *ts {
            cursor += 1;
        }
        out.push(cursor.checked_sub(1));
    }
    out
}

/// Row-at-a-time builder used by the built-in definitions.
#[derive(Debug, Clone)]
pub struct BlockBuilder {
    timestamps: Vec<f64>,
    columns: Vec<Column>,
}

impl BlockBuilder {
    pub fn new<S: AsRef<str>>(names: &[S]) -> Self {
        let Block {
            timestamps,
            columns,
        } = Block::empty(names);
        Self {
            timestamps,
            columns,
        }
    }

    /// Appends one row; `values` must follow the column order given to [`BlockBuilder::new`].
    pub fn push(&mut self, ts: f64, values: &[f64]) {
        self.timestamps.push(ts);
        for (column, value) in self.columns.iter_mut().zip(values) {
            column.values.push(*value);
        }
    }

    pub fn finish(self) -> Result<Block, FrameError> {
        Block::new(self.timestamps, self.columns)
    }
}
