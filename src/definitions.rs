//! Built-in data sources and feature definitions.

use std::sync::Arc;

use serde_json::Value;

use crate::blocks::{
    bucket_start_ts, fixed_bucket_grouping, parse_window_seconds, windowed_grouping, BlockError,
    BlockMeta,
};
use crate::definition::{
    event_field, EventSchema, FeatureDefinition, FieldType, Params, StreamError,
};
use crate::feature_tree::FeatureNode;
use crate::frame::{Block, BlockBuilder, RECEIPT_TIMESTAMP_COLUMN};
use crate::interval::{Interval, IntervalMap};

pub const L2_BOOK_SNAPSHOT: &str = "l2_book_snapshot";
pub const TRADES: &str = "trades";
pub const MID_PRICE: &str = "mid_price";
pub const OHLCV: &str = "ohlcv";
pub const ROLLING_MEAN: &str = "rolling_mean";

const DEFAULT_OHLCV_WINDOW: &str = "1m";
const DEFAULT_ROLLING_LOOKBACK: &str = "1m";

pub fn builtin_definitions() -> Vec<Arc<dyn FeatureDefinition>> {
    vec![
        Arc::new(DataSourceDefinition::l2_book_snapshot()),
        Arc::new(DataSourceDefinition::trades()),
        Arc::new(MidPrice),
        Arc::new(Ohlcv),
        Arc::new(RollingMean),
    ]
}

/// A leaf whose blocks already exist in the block store.
#[derive(Debug, Clone)]
pub struct DataSourceDefinition {
    name: String,
    schema: EventSchema,
}

impl DataSourceDefinition {
    pub fn new(name: impl Into<String>, schema: EventSchema) -> Self {
        Self {
            name: name.into(),
            schema,
        }
    }

    pub fn l2_book_snapshot() -> Self {
        Self::new(
            L2_BOOK_SNAPSHOT,
            vec![
                event_field("bid", FieldType::F64),
                event_field("ask", FieldType::F64),
            ],
        )
    }

    pub fn trades() -> Self {
        Self::new(
            TRADES,
            vec![
                event_field("price", FieldType::F64),
                event_field("amount", FieldType::F64),
            ],
        )
    }
}

impl FeatureDefinition for DataSourceDefinition {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_data_source(&self) -> bool {
        true
    }

    fn event_schema(&self) -> EventSchema {
        self.schema.clone()
    }

    fn dependency_schema(&self, _params: &Params) -> Vec<String> {
        Vec::new()
    }

    fn stream(
        &self,
        _upstreams: &[Block],
        _params: &Params,
        _interval: &Interval,
    ) -> Result<Block, StreamError> {
        Err(StreamError::NotComputable(self.name.clone()))
    }
}

/// `(bid + ask) / 2` per book snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct MidPrice;

impl FeatureDefinition for MidPrice {
    fn name(&self) -> &str {
        MID_PRICE
    }

    fn event_schema(&self) -> EventSchema {
        vec![event_field(MID_PRICE, FieldType::F64)]
    }

    fn dependency_schema(&self, _params: &Params) -> Vec<String> {
        vec![L2_BOOK_SNAPSHOT.to_string()]
    }

    fn stream(
        &self,
        upstreams: &[Block],
        _params: &Params,
        _interval: &Interval,
    ) -> Result<Block, StreamError> {
        let book = upstream(upstreams, 0)?;
        let bids = required_column(book, "bid")?;
        let asks = required_column(book, "ask")?;

        let mut out = BlockBuilder::new(&[MID_PRICE]);
        for ((ts, bid), ask) in book.timestamps().iter().zip(bids).zip(asks) {
            out.push(*ts, &[(bid + ask) / 2.0]);
        }
        Ok(out.finish()?)
    }
}

/// Fixed-window trade bars. Params: `window` (default `1m`) and `num_grouped_windows`
/// (bars per output block, default 1).
#[derive(Debug, Clone, Copy, Default)]
pub struct Ohlcv;

const OHLCV_COLUMNS: [&str; 7] = ["open", "high", "low", "close", "volume", "vwap", "num_trades"];

impl FeatureDefinition for Ohlcv {
    fn name(&self) -> &str {
        OHLCV
    }

    fn event_schema(&self) -> EventSchema {
        OHLCV_COLUMNS
            .iter()
            .map(|name| {
                let dtype = if *name == "num_trades" {
                    FieldType::I64
                } else {
                    FieldType::F64
                };
                event_field(name, dtype)
            })
            .collect()
    }

    fn dependency_schema(&self, _params: &Params) -> Vec<String> {
        vec![TRADES.to_string()]
    }

    fn stream(
        &self,
        upstreams: &[Block],
        params: &Params,
        interval: &Interval,
    ) -> Result<Block, StreamError> {
        let window_s = window_param(params, "window", DEFAULT_OHLCV_WINDOW)?;
        let trades = upstream(upstreams, 0)?;
        let prices = required_column(trades, "price")?;
        let amounts = required_column(trades, "amount")?;

        let mut out = BlockBuilder::new(&OHLCV_COLUMNS);
        let mut bar: Option<Bar> = None;
        for ((ts, price), amount) in trades.timestamps().iter().zip(prices).zip(amounts) {
            let bucket = bucket_start_ts(*ts, window_s);
            match bar.as_mut() {
                Some(current) if current.bucket_ts == bucket => current.add(*price, *amount),
                _ => {
                    if let Some(done) = bar.take() {
                        done.emit_within(&mut out, interval, window_s);
                    }
                    bar = Some(Bar::open(bucket, *price, *amount));
                }
            }
        }
        if let Some(done) = bar {
            done.emit_within(&mut out, interval, window_s);
        }
        Ok(out.finish()?)
    }

    fn group_dep_ranges(
        &self,
        dep_blocks: &[BlockMeta],
        feature: &FeatureNode,
        _dependency: &FeatureNode,
    ) -> Result<IntervalMap<Vec<BlockMeta>>, BlockError> {
        let window_s = window_param(feature.params(), "window", DEFAULT_OHLCV_WINDOW)?;
        let bucket_count = count_param(feature.params(), "num_grouped_windows", 1)?;
        fixed_bucket_grouping(dep_blocks, window_s, bucket_count)
    }
}

struct Bar {
    bucket_ts: f64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    notional: f64,
    num_trades: u64,
}

impl Bar {
    fn open(bucket_ts: f64, price: f64, amount: f64) -> Self {
        Self {
            bucket_ts,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: amount,
            notional: price * amount,
            num_trades: 1,
        }
    }

    fn add(&mut self, price: f64, amount: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.volume += amount;
        self.notional += price * amount;
        self.num_trades += 1;
    }

    /// Only bars whose whole window lies inside the output block are complete.
    fn emit_within(&self, out: &mut BlockBuilder, interval: &Interval, window_s: f64) {
        let bar_end_ts = self.bucket_ts + window_s;
        if self.bucket_ts < interval.start_ts() || bar_end_ts > interval.end_ts() {
            return;
        }
        let vwap = if self.volume > 0.0 {
            self.notional / self.volume
        } else {
            self.close
        };
        out.push(
            self.bucket_ts,
            &[
                self.open,
                self.high,
                self.low,
                self.close,
                self.volume,
                vwap,
                self.num_trades as f64,
            ],
        );
    }
}

/// Trailing mean of one upstream column. Params: `dep_schema` (default `mid_price`),
/// `lookback` (default `1m`) and `column` (default: first value column).
#[derive(Debug, Clone, Copy, Default)]
pub struct RollingMean;

impl FeatureDefinition for RollingMean {
    fn name(&self) -> &str {
        ROLLING_MEAN
    }

    fn event_schema(&self) -> EventSchema {
        vec![event_field(ROLLING_MEAN, FieldType::F64)]
    }

    fn dependency_schema(&self, params: &Params) -> Vec<String> {
        let dep = params
            .get("dep_schema")
            .and_then(Value::as_str)
            .unwrap_or(MID_PRICE);
        vec![dep.to_string()]
    }

    fn stream(
        &self,
        upstreams: &[Block],
        params: &Params,
        _interval: &Interval,
    ) -> Result<Block, StreamError> {
        let lookback_s = window_param(params, "lookback", DEFAULT_ROLLING_LOOKBACK)?;
        let source = upstream(upstreams, 0)?;
        let values = match params.get("column") {
            Some(Value::String(name)) => required_column(source, name)?,
            Some(other) => {
                return Err(StreamError::InvalidParam {
                    name: "column".to_string(),
                    reason: format!("expected a string, got {other}"),
                })
            }
            None => source
                .columns()
                .iter()
                .find(|column| column.name != RECEIPT_TIMESTAMP_COLUMN)
                .map(|column| column.values.as_slice())
                .ok_or_else(|| StreamError::MissingColumn("<value column>".to_string()))?,
        };

        let timestamps = source.timestamps();
        let mut out = BlockBuilder::new(&[ROLLING_MEAN]);
        let mut window_start = 0;
        let mut sum = 0.0;
        for (idx, ts) in timestamps.iter().enumerate() {
            sum += values[idx];
            while timestamps[window_start] < ts - lookback_s {
                sum -= values[window_start];
                window_start += 1;
            }
            out.push(*ts, &[sum / (idx + 1 - window_start) as f64]);
        }
        Ok(out.finish()?)
    }

    fn group_dep_ranges(
        &self,
        dep_blocks: &[BlockMeta],
        feature: &FeatureNode,
        _dependency: &FeatureNode,
    ) -> Result<IntervalMap<Vec<BlockMeta>>, BlockError> {
        let lookback_s = window_param(feature.params(), "lookback", DEFAULT_ROLLING_LOOKBACK)?;
        windowed_grouping(dep_blocks, lookback_s)
    }
}

fn upstream(upstreams: &[Block], idx: usize) -> Result<&Block, StreamError> {
    upstreams.get(idx).ok_or(StreamError::MissingInput {
        expected: idx + 1,
        found: upstreams.len(),
    })
}

fn required_column<'a>(block: &'a Block, name: &str) -> Result<&'a [f64], StreamError> {
    block
        .column(name)
        .ok_or_else(|| StreamError::MissingColumn(name.to_string()))
}

pub(crate) fn window_param(params: &Params, name: &str, default: &str) -> Result<f64, BlockError> {
    match params.get(name) {
        None => parse_window_seconds(default),
        Some(Value::String(raw)) => parse_window_seconds(raw),
        Some(Value::Number(seconds)) => seconds
            .as_f64()
            .filter(|seconds| *seconds >= 0.0)
            .ok_or_else(|| BlockError::InvalidWindow(seconds.to_string())),
        Some(other) => Err(BlockError::InvalidWindow(other.to_string())),
    }
}

fn count_param(params: &Params, name: &str, default: u32) -> Result<u32, BlockError> {
    match params.get(name) {
        None => Ok(default),
        Some(value) => value
            .as_u64()
            .and_then(|count| u32::try_from(count).ok())
            .filter(|count| *count > 0)
            .ok_or_else(|| BlockError::InvalidWindow(format!("{name}={value}"))),
    }
}
