//! Closed time intervals and the multi-way interval join used by the graph builder.
//!
//! Timestamps are floating-point seconds. All comparisons use closed bounds.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::blocks::{meta_to_interval, BlockError, BlockMeta};

/// Tolerance for [`intervals_almost_equal`]; verification only, never used for matching.
pub const ALMOST_EQUAL_EPSILON_S: f64 = 0.15;

#[derive(Debug, Clone, Copy)]
pub struct Interval {
    start_ts: f64,
    end_ts: f64,
}

impl Interval {
    pub fn closed(start_ts: f64, end_ts: f64) -> Result<Self, BlockError> {
        if start_ts.is_nan() || end_ts.is_nan() || start_ts > end_ts {
            return Err(BlockError::InvalidRange { start_ts, end_ts });
        }

        // `+ 0.0` folds -0.0 into 0.0 so bitwise equality and hashing agree.
        Ok(Self {
            start_ts: start_ts + 0.0,
            end_ts: end_ts + 0.0,
        })
    }

    pub fn start_ts(&self) -> f64 {
        self.start_ts
    }

    pub fn end_ts(&self) -> f64 {
        self.end_ts
    }

    pub fn duration_s(&self) -> f64 {
        self.end_ts - self.start_ts
    }

    pub fn is_point(&self) -> bool {
        self.start_ts == self.end_ts
    }

    pub fn overlaps(&self, other: &Interval) -> bool {
        self.start_ts <= other.end_ts && other.start_ts <= self.end_ts
    }

    pub fn contains(&self, other: &Interval) -> bool {
        self.start_ts <= other.start_ts && other.end_ts <= self.end_ts
    }

    pub fn contains_ts(&self, ts: f64) -> bool {
        self.start_ts <= ts && ts <= self.end_ts
    }

    pub fn intersection(&self, other: &Interval) -> Option<Interval> {
        let start_ts = self.start_ts.max(other.start_ts);
        let end_ts = self.end_ts.min(other.end_ts);
        if start_ts > end_ts {
            return None;
        }
        Some(Interval { start_ts, end_ts })
    }

    /// Intersection as seen by [`get_overlaps`]: two non-degenerate intervals that only
    /// share an endpoint do not produce a window.
    fn join_window(&self, other: &Interval) -> Option<Interval> {
        let common = self.intersection(other)?;
        if common.is_point() && !(self.is_point() || other.is_point()) {
            return None;
        }
        Some(common)
    }
}

impl PartialEq for Interval {
    fn eq(&self, other: &Self) -> bool {
        self.start_ts.to_bits() == other.start_ts.to_bits()
            && self.end_ts.to_bits() == other.end_ts.to_bits()
    }
}

impl Eq for Interval {}

impl Hash for Interval {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.start_ts.to_bits().hash(state);
        self.end_ts.to_bits().hash(state);
    }
}

impl PartialOrd for Interval {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Interval {
    fn cmp(&self, other: &Self) -> Ordering {
        self.start_ts
            .total_cmp(&other.start_ts)
            .then_with(|| self.end_ts.total_cmp(&other.end_ts))
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start_ts, self.end_ts)
    }
}

/// Ordered mapping from [`Interval`] to a value, sorted by interval start.
#[derive(Debug, Clone, PartialEq)]
pub struct IntervalMap<V> {
    entries: Vec<(Interval, V)>,
}

impl<V> Default for IntervalMap<V> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<V> IntervalMap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inserts or replaces the value stored under exactly `interval`.
    pub fn insert(&mut self, interval: Interval, value: V) -> Option<V> {
        match self.entries.binary_search_by(|(key, _)| key.cmp(&interval)) {
            Ok(idx) => Some(std::mem::replace(&mut self.entries[idx].1, value)),
            Err(idx) => {
                self.entries.insert(idx, (interval, value));
                None
            }
        }
    }

    /// Inserts `interval` only if it overlaps none of the existing keys.
    pub fn insert_disjoint(&mut self, interval: Interval, value: V) -> Result<(), BlockError> {
        if overlaps_keys(&interval, self) {
            return Err(BlockError::OverlappingRanges { interval });
        }
        self.insert(interval, value);
        Ok(())
    }

    pub fn get(&self, interval: &Interval) -> Option<&V> {
        self.position(interval).map(|idx| &self.entries[idx].1)
    }

    pub fn contains_key(&self, interval: &Interval) -> bool {
        self.position(interval).is_some()
    }

    pub fn position(&self, interval: &Interval) -> Option<usize> {
        self.entries
            .binary_search_by(|(key, _)| key.cmp(interval))
            .ok()
    }

    pub fn entry_at(&self, idx: usize) -> Option<(&Interval, &V)> {
        self.entries.get(idx).map(|(key, value)| (key, value))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Interval, &V)> {
        self.entries.iter().map(|(key, value)| (key, value))
    }

    pub fn keys(&self) -> impl Iterator<Item = &Interval> {
        self.entries.iter().map(|(key, _)| key)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.iter().map(|(_, value)| value)
    }

    pub fn first(&self) -> Option<(&Interval, &V)> {
        self.entry_at(0)
    }

    pub fn last(&self) -> Option<(&Interval, &V)> {
        self.entries.last().map(|(key, value)| (key, value))
    }

    /// Union of all keys as one closed interval, if any.
    pub fn span(&self) -> Option<Interval> {
        let start_ts = self.entries.first()?.0.start_ts;
        let end_ts = self
            .entries
            .iter()
            .map(|(key, _)| key.end_ts)
            .fold(f64::MIN, f64::max);
        Some(Interval { start_ts, end_ts })
    }
}

impl<V> FromIterator<(Interval, V)> for IntervalMap<V> {
    fn from_iter<I: IntoIterator<Item = (Interval, V)>>(iter: I) -> Self {
        let mut map = IntervalMap::new();
        for (interval, value) in iter {
            map.insert(interval, value);
        }
        map
    }
}

impl<V> IntoIterator for IntervalMap<V> {
    type Item = (Interval, V);
    type IntoIter = std::vec::IntoIter<(Interval, V)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Anything that occupies a time interval and can witness an overlap.
pub trait HasInterval {
    fn interval(&self) -> Result<Interval, BlockError>;
}

impl HasInterval for BlockMeta {
    fn interval(&self) -> Result<Interval, BlockError> {
        meta_to_interval(self)
    }
}

impl<T> HasInterval for (Interval, T) {
    fn interval(&self) -> Result<Interval, BlockError> {
        Ok(self.0)
    }
}

pub fn overlaps_keys<V>(interval: &Interval, map: &IntervalMap<V>) -> bool {
    map.keys().any(|key| key.overlaps(interval))
}

/// Inner join of every key's interval domain.
///
/// The first key (in key order) is the pivot; each other key is combined onto it and
/// the result restricted to windows covered by all keys. One key returns its mapping
/// unchanged, no keys return an empty mapping.
pub fn get_overlaps<K, V>(per_key: &BTreeMap<K, IntervalMap<V>>) -> IntervalMap<BTreeMap<K, V>>
where
    K: Ord + Clone,
    V: Clone,
{
    let mut keys = per_key.iter();
    let Some((pivot_key, pivot)) = keys.next() else {
        return IntervalMap::new();
    };

    let mut joined: Vec<(Interval, BTreeMap<K, V>)> = pivot
        .iter()
        .map(|(interval, value)| {
            let mut values = BTreeMap::new();
            values.insert(pivot_key.clone(), value.clone());
            (*interval, values)
        })
        .collect();

    for (key, other) in keys {
        let mut next = Vec::new();
        for (interval, values) in &joined {
            for (other_interval, value) in other.iter() {
                if other_interval.start_ts > interval.end_ts {
                    break;
                }
                if let Some(window) = interval.join_window(other_interval) {
                    let mut combined = values.clone();
                    combined.insert(key.clone(), value.clone());
                    next.push((window, combined));
                }
            }
        }
        joined = next;
    }

    joined.into_iter().collect()
}

/// Keeps, per overlap window and key, only the elements that actually overlap the window.
///
/// Idempotent. Fails with [`BlockError::PruneExhausted`] when a key is left without a
/// single witnessing element.
pub fn prune_overlaps<K, E>(
    overlaps: IntervalMap<BTreeMap<K, Vec<E>>>,
) -> Result<IntervalMap<BTreeMap<K, Vec<E>>>, BlockError>
where
    K: Ord + fmt::Debug,
    E: HasInterval,
{
    let mut pruned = IntervalMap::new();
    for (interval, per_key) in overlaps {
        let mut kept_per_key = BTreeMap::new();
        for (key, elements) in per_key {
            let mut kept = Vec::with_capacity(elements.len());
            for element in elements {
                if interval.overlaps(&element.interval()?) {
                    kept.push(element);
                }
            }
            if kept.is_empty() {
                return Err(BlockError::PruneExhausted {
                    interval,
                    key: format!("{key:?}"),
                });
            }
            kept_per_key.insert(key, kept);
        }
        pruned.insert(interval, kept_per_key);
    }
    Ok(pruned)
}

pub fn is_sorted_intervals(intervals: &[Interval]) -> bool {
    intervals
        .windows(2)
        .all(|pair| pair[0].end_ts <= pair[1].start_ts)
}

pub fn intervals_almost_equal(a: &Interval, b: &Interval) -> bool {
    (a.start_ts - b.start_ts).abs() <= ALMOST_EQUAL_EPSILON_S
        && (a.end_ts - b.end_ts).abs() <= ALMOST_EQUAL_EPSILON_S
}
