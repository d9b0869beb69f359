//! Task bodies run by the executor: load, compute, store and join blocks.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::blocks::BlockError;
use crate::cache::{CacheKey, ObjectCache};
use crate::catalog::{CatalogError, FeatureCatalog, FeatureCatalogEntry};
use crate::definition::StreamError;
use crate::feature_tree::{FeatureArena, FeatureId, FeatureNode};
use crate::frame::{Block, FrameError, LABEL_PREFIX};
use crate::interval::Interval;
use crate::store::{BlockStore, StoreError};
use crate::task_graph::{TaskGraph, TaskId, TaskNode};

/// Shared handle to a produced block.
pub type BlockRef = Arc<Block>;
pub type BlockCache = ObjectCache<BlockRef>;

const CATALOG_OWNER_ID: &str = "0";
const FEATURE_BLOCK_ROOT: &str = "features";

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("block loaded from {0} is not sorted by timestamp")]
    UnsortedBlock(String),
    #[error("feature block spans {start_date} to {end_date}; blocks must stay within one UTC date")]
    DateSpanMismatch {
        start_date: String,
        end_date: String,
    },
    #[error("cannot catalog an empty block")]
    EmptyBlock,
    #[error("timestamp {0} is out of range")]
    InvalidTimestamp(f64),
    #[error("task {0:?} is not in the graph")]
    MissingTask(TaskId),
    #[error("join task has no block for its label feature")]
    MissingLabel,
    #[error("stream failed for {feature}: {source}")]
    Stream {
        feature: String,
        #[source]
        source: StreamError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Block(#[from] BlockError),
}

/// Everything a task needs at run time. Cheap to clone into worker closures.
#[derive(Clone)]
pub struct ExecutionEnv {
    graph: Arc<TaskGraph>,
    features: Arc<FeatureArena>,
    cache: Arc<BlockCache>,
    store: Arc<dyn BlockStore>,
    catalog: Arc<dyn FeatureCatalog>,
}

impl ExecutionEnv {
    pub fn new(
        graph: Arc<TaskGraph>,
        features: Arc<FeatureArena>,
        cache: Arc<BlockCache>,
        store: Arc<dyn BlockStore>,
        catalog: Arc<dyn FeatureCatalog>,
    ) -> Self {
        Self {
            graph,
            features,
            cache,
            store,
            catalog,
        }
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    /// Runs `root` and every task it transitively depends on, dependencies first.
    pub fn evaluate(&self, root: TaskId) -> Result<BlockRef, TaskError> {
        let mut resolved: HashMap<TaskId, BlockRef> = HashMap::new();
        for id in self.dependency_order(root)? {
            let task = self.graph.task(id).ok_or(TaskError::MissingTask(id))?;
            let block = self.run_task(task, &resolved)?;
            resolved.insert(id, block);
        }
        resolved.remove(&root).ok_or(TaskError::MissingTask(root))
    }

    fn dependency_order(&self, root: TaskId) -> Result<Vec<TaskId>, TaskError> {
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![(root, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                order.push(id);
                continue;
            }
            if !visited.insert(id) {
                continue;
            }
            let task = self.graph.task(id).ok_or(TaskError::MissingTask(id))?;
            stack.push((id, true));
            for dep in task.dependencies().into_iter().rev() {
                if !visited.contains(&dep) {
                    stack.push((dep, false));
                }
            }
        }
        Ok(order)
    }

    fn run_task(
        &self,
        task: &TaskNode,
        resolved: &HashMap<TaskId, BlockRef>,
    ) -> Result<BlockRef, TaskError> {
        match task {
            TaskNode::Load {
                key,
                path,
                is_feature,
            } => load_if_needed(&self.cache, self.store.as_ref(), key, path, *is_feature),
            TaskNode::Compute {
                key,
                feature,
                interval,
                deps,
                store,
            } => {
                let node = self.features.node(*feature);
                let mut upstreams = Vec::with_capacity(deps.len());
                for child in unique(node.children()) {
                    let tasks = deps.get(&child).map(Vec::as_slice).unwrap_or_default();
                    let blocks = resolve_all(tasks, resolved)?;
                    upstreams.push(Block::concat(blocks.iter().map(|block| &**block))?);
                }
                calculate_feature(
                    &self.cache,
                    self.store.as_ref(),
                    self.catalog.as_ref(),
                    node,
                    key,
                    interval,
                    &upstreams,
                    *store,
                )
            }
            TaskNode::Join {
                interval,
                label,
                label_lookahead_s,
                blocks,
                prev_blocks,
                next_blocks,
            } => {
                let mut frames = BTreeMap::new();
                for (feature, task) in blocks {
                    let mut parts = Vec::with_capacity(2);
                    if let Some(prev) = prev_blocks.get(feature) {
                        parts.push(resolve(*prev, resolved)?);
                    }
                    parts.push(resolve(*task, resolved)?);
                    frames.insert(*feature, Block::concat(parts.iter().map(|block| &**block))?);
                }
                let label_horizon = next_blocks
                    .get(label)
                    .map(|next| resolve(*next, resolved))
                    .transpose()?;
                point_in_time_join_block(
                    interval,
                    frames,
                    *label,
                    *label_lookahead_s,
                    label_horizon.as_deref(),
                )
            }
        }
    }
}

fn unique(ids: &[FeatureId]) -> Vec<FeatureId> {
    let mut seen = HashSet::new();
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

fn resolve(id: TaskId, resolved: &HashMap<TaskId, BlockRef>) -> Result<BlockRef, TaskError> {
    resolved.get(&id).cloned().ok_or(TaskError::MissingTask(id))
}

fn resolve_all(
    ids: &[TaskId],
    resolved: &HashMap<TaskId, BlockRef>,
) -> Result<Vec<BlockRef>, TaskError> {
    ids.iter().map(|id| resolve(*id, resolved)).collect()
}

/// Returns the cached block for `key` or loads it from `path` and caches it.
pub fn load_if_needed(
    cache: &BlockCache,
    store: &dyn BlockStore,
    key: &CacheKey,
    path: &str,
    is_feature: bool,
) -> Result<BlockRef, TaskError> {
    let (cached, should_cache) = cache.check_and_consume(key);
    if let Some(block) = cached {
        return Ok(block);
    }

    let started = Instant::now();
    let block = store.load(path)?;
    if !block.is_ts_sorted() {
        return Err(TaskError::UnsortedBlock(path.to_string()));
    }
    let block = Arc::new(block);
    if should_cache {
        cache.populate(key, Arc::clone(&block));
    }
    debug!(
        component = "tasks",
        event = "task.load.finish",
        path,
        is_feature,
        rows = block.len(),
        elapsed_ms = started.elapsed().as_millis() as u64
    );
    Ok(block)
}

/// Computes one feature block from its concatenated upstream blocks, truncated to
/// `interval`, and writes it back to the store when requested.
#[allow(clippy::too_many_arguments)]
pub fn calculate_feature(
    cache: &BlockCache,
    store: &dyn BlockStore,
    catalog: &dyn FeatureCatalog,
    feature: &FeatureNode,
    key: &CacheKey,
    interval: &Interval,
    upstreams: &[Block],
    store_block: bool,
) -> Result<BlockRef, TaskError> {
    let (cached, should_cache) = cache.check_and_consume(key);
    if let Some(block) = cached {
        return Ok(block);
    }

    let started = Instant::now();
    let computed = feature
        .definition()
        .stream(upstreams, feature.params(), interval)
        .map_err(|source| TaskError::Stream {
            feature: feature.to_string(),
            source,
        })?;
    if !computed.is_ts_sorted() {
        return Err(TaskError::UnsortedBlock(feature.to_string()));
    }
    let block = Arc::new(computed.sub_block_ts(interval.start_ts(), interval.end_ts()));
    if should_cache {
        cache.populate(key, Arc::clone(&block));
    }
    debug!(
        component = "tasks",
        event = "task.compute.finish",
        feature = %feature,
        interval = %interval,
        rows = block.len(),
        elapsed_ms = started.elapsed().as_millis() as u64
    );

    if store_block {
        store_feature_block(store, catalog, feature, &block, interval)?;
    }
    Ok(block)
}

fn store_feature_block(
    store: &dyn BlockStore,
    catalog: &dyn FeatureCatalog,
    feature: &FeatureNode,
    block: &Block,
    interval: &Interval,
) -> Result<(), TaskError> {
    if block.is_empty() {
        warn!(
            component = "tasks",
            event = "task.store.skipped",
            feature = %feature,
            interval = %interval,
            reason = "empty block"
        );
        return Ok(());
    }

    let entry = catalog_feature_block(feature, block, interval)?;
    if catalog.contains(&entry)? {
        debug!(
            component = "tasks",
            event = "task.store.exists",
            path = %entry.path
        );
        return Ok(());
    }
    store.store(&entry.path, block)?;
    catalog.write_batch(std::slice::from_ref(&entry))?;
    info!(
        component = "tasks",
        event = "task.store.finish",
        feature = %feature,
        path = %entry.path,
        rows = entry.num_rows
    );
    Ok(())
}

/// Catalog entry describing a computed feature block. The block's rows must all fall
/// on one UTC date.
pub fn catalog_feature_block(
    feature: &FeatureNode,
    block: &Block,
    interval: &Interval,
) -> Result<FeatureCatalogEntry, TaskError> {
    let (first_ts, last_ts) = block.time_range().ok_or(TaskError::EmptyBlock)?;
    let start_date = utc_date(first_ts)?;
    let end_date = utc_date(last_ts)?;
    if start_date != end_date {
        return Err(TaskError::DateSpanMismatch {
            start_date,
            end_date,
        });
    }

    let feature_def = feature.name().to_string();
    let feature_key = feature.key().as_str().to_string();
    let path = format!(
        "{FEATURE_BLOCK_ROOT}/{feature_def}/{feature_key}/{start_date}/{}-{}.csv",
        ts_millis(interval.start_ts()),
        ts_millis(interval.end_ts())
    );
    Ok(FeatureCatalogEntry {
        owner_id: CATALOG_OWNER_ID.to_string(),
        feature_def,
        feature_key,
        start_ts: interval.start_ts(),
        end_ts: interval.end_ts(),
        size_in_memory_kb: block.size_kb(),
        num_rows: block.len() as u64,
        date: start_date,
        hash: block.content_hash(),
        path,
    })
}

fn utc_date(ts: f64) -> Result<String, TaskError> {
    let millis = ts_millis(ts);
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .ok_or(TaskError::InvalidTimestamp(ts))
}

fn ts_millis(ts: f64) -> i64 {
    (ts * 1_000.0).round() as i64
}

/// As-of joins every feature frame onto the label frame and keeps rows in `interval`.
///
/// With a lookahead the label frame is shifted forward and its columns prefixed with
/// `label_`. `label_horizon` (the label's following block) only supplies values for the
/// shift; its rows never become join keys.
pub fn point_in_time_join_block(
    interval: &Interval,
    mut frames: BTreeMap<FeatureId, Block>,
    label: FeatureId,
    label_lookahead_s: Option<f64>,
    label_horizon: Option<&Block>,
) -> Result<BlockRef, TaskError> {
    let label_frame = frames.remove(&label).ok_or(TaskError::MissingLabel)?;
    let label_frame = match label_lookahead_s {
        Some(lookahead_s) => shift_label(&label_frame, lookahead_s, label_horizon)?,
        None => label_frame,
    };

    let mut ordered = Vec::with_capacity(frames.len() + 1);
    ordered.push(label_frame);
    ordered.extend(frames.into_values());
    let merged = Block::merge_asof_multi(&ordered)?;
    Ok(Arc::new(
        merged.sub_block_ts(interval.start_ts(), interval.end_ts()),
    ))
}

fn shift_label(
    label_frame: &Block,
    lookahead_s: f64,
    horizon: Option<&Block>,
) -> Result<Block, TaskError> {
    let Some((first_ts, last_ts)) = label_frame.time_range() else {
        return Ok(label_frame.lookahead_shift(lookahead_s)?.with_prefix(LABEL_PREFIX));
    };
    let extended = match horizon {
        Some(next) => Block::concat([label_frame, next])?,
        None => label_frame.clone(),
    };
    Ok(extended
        .lookahead_shift(lookahead_s)?
        .sub_block_ts(first_ts, last_ts)
        .with_prefix(LABEL_PREFIX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryFeatureCatalog;
    use crate::definition::DefinitionRegistry;
    use crate::definitions::MID_PRICE;
    use crate::feature_tree::{construct_feature_tree, ParamsTable};
    use crate::frame::Column;
    use crate::store::InMemoryBlockStore;

    // 2024-01-01T23:59:59Z
    const LAST_SECOND_OF_DAY: f64 = 1_704_153_599.0;

    fn mid_price_node() -> (FeatureArena, FeatureId) {
        let registry = DefinitionRegistry::with_builtins();
        let mut arena = FeatureArena::new();
        let empty = ParamsTable::Empty;
        let id = construct_feature_tree(&mut arena, &registry, MID_PRICE, &empty, &empty).unwrap();
        (arena, id)
    }

    fn iv(start: f64, end: f64) -> Interval {
        Interval::closed(start, end).unwrap()
    }

    fn series(timestamps: Vec<f64>, name: &str, values: Vec<f64>) -> Block {
        Block::new(timestamps, vec![Column::new(name, values)]).unwrap()
    }

    #[test]
    fn catalog_entry_rejects_blocks_crossing_midnight() {
        let (arena, id) = mid_price_node();
        let node = arena.node(id);
        let block = series(
            vec![LAST_SECOND_OF_DAY, LAST_SECOND_OF_DAY + 2.0],
            MID_PRICE,
            vec![1.0, 2.0],
        );

        let err = catalog_feature_block(
            node,
            &block,
            &iv(LAST_SECOND_OF_DAY, LAST_SECOND_OF_DAY + 2.0),
        )
        .unwrap_err();
        match err {
            TaskError::DateSpanMismatch {
                start_date,
                end_date,
            } => {
                assert_eq!(start_date, "2024-01-01");
                assert_eq!(end_date, "2024-01-02");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn catalog_entry_encodes_date_and_interval_in_path() {
        let (arena, id) = mid_price_node();
        let node = arena.node(id);
        let start = LAST_SECOND_OF_DAY - 9.0;
        let block = series(vec![start, start + 1.0], MID_PRICE, vec![1.0, 2.0]);

        let entry = catalog_feature_block(node, &block, &iv(start, LAST_SECOND_OF_DAY)).unwrap();
        assert_eq!(entry.date, "2024-01-01");
        assert_eq!(entry.num_rows, 2);
        assert_eq!(
            entry.path,
            format!(
                "features/mid_price/{}/2024-01-01/1704153590000-1704153599000.csv",
                node.key().as_str()
            )
        );
        assert!(matches!(
            catalog_feature_block(node, &Block::empty(&[MID_PRICE]), &iv(0.0, 1.0)),
            Err(TaskError::EmptyBlock)
        ));
    }

    #[test]
    fn loading_an_unsorted_block_fails() {
        let (arena, id) = mid_price_node();
        let store = InMemoryBlockStore::new()
            .with_block("l2/unsorted.csv", series(vec![2.0, 1.0], "bid", vec![1.0, 1.0]));
        let cache = BlockCache::new();
        let key = CacheKey::new(arena.node(id).key().clone(), iv(1.0, 2.0));
        cache.bind(&key);

        let err = load_if_needed(&cache, &store, &key, "l2/unsorted.csv", false).unwrap_err();
        assert!(matches!(err, TaskError::UnsortedBlock(path) if path == "l2/unsorted.csv"));
        assert!(cache.entry(&key).and_then(|entry| entry.handle).is_none());
    }

    #[test]
    fn computing_from_unsorted_upstream_fails() {
        let (arena, id) = mid_price_node();
        let node = arena.node(id);
        let book = Block::new(
            vec![3.0, 1.0, 2.0],
            vec![
                Column::new("bid", vec![1.0, 2.0, 3.0]),
                Column::new("ask", vec![2.0, 3.0, 4.0]),
            ],
        )
        .unwrap();
        let cache = BlockCache::new();
        let store = InMemoryBlockStore::new();
        let catalog = InMemoryFeatureCatalog::new();
        let interval = iv(0.0, 5.0);
        let key = CacheKey::new(node.key().clone(), interval);

        let err = calculate_feature(&cache, &store, &catalog, node, &key, &interval, &[book], true)
            .unwrap_err();
        assert!(matches!(err, TaskError::UnsortedBlock(_)));
        assert!(store.paths().is_empty());
        assert!(catalog.entries().is_empty());
    }

    #[test]
    fn lookahead_horizon_supplies_values_but_not_rows() {
        let label = FeatureId(0);
        let other = FeatureId(1);
        let mut frames = BTreeMap::new();
        frames.insert(
            label,
            series(vec![0.0, 1.0, 2.0, 3.0, 4.0], "price", vec![0.0, 1.0, 2.0, 3.0, 4.0]),
        );
        frames.insert(other, series(vec![0.0, 5.0], "volume", vec![7.0, 8.0]));
        let horizon = series(vec![5.0, 6.0], "price", vec![5.0, 6.0]);

        let joined = point_in_time_join_block(&iv(0.0, 5.0), frames, label, Some(1.0), Some(&horizon))
            .unwrap();
        assert_eq!(joined.timestamps(), &[0.0, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(
            joined.column("label_price").unwrap(),
            &[1.0, 2.0, 3.0, 4.0, 5.0]
        );
        assert_eq!(joined.column("volume").unwrap(), &[7.0; 5]);
    }

    #[test]
    fn join_without_label_frame_fails() {
        let frames = BTreeMap::from([(FeatureId(1), series(vec![0.0], "v", vec![1.0]))]);
        assert!(matches!(
            point_in_time_join_block(&iv(0.0, 1.0), frames, FeatureId(0), None, None),
            Err(TaskError::MissingLabel)
        ));
    }
}
