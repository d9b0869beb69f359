//! Compiles feature trees and block metadata into a graph of load/compute tasks.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;
use tracing::{debug, info};

use crate::blocks::{
    interval_to_meta, meta_to_interval, range_meta_to_interval, ranges_to_interval_dict,
    BlockError, BlockMeta, BlockRangeMeta,
};
use crate::cache::{CacheKey, ObjectCache};
use crate::feature_tree::{FeatureArena, FeatureId};
use crate::interval::{get_overlaps, prune_overlaps, Interval, IntervalMap};

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("no task for dependency {feature} block {interval} in range {range}")]
    MissingDependencyNode {
        feature: String,
        range: Interval,
        interval: Interval,
    },
    #[error("no data ranges for data source {0}")]
    MissingDataRanges(String),
    #[error("data source {feature} block {interval} has no storage path")]
    MissingBlockPath { feature: String, interval: Interval },
    #[error("feature {0} is not in the task graph")]
    FeatureNotInGraph(String),
    #[error(transparent)]
    Block(#[from] BlockError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(usize);

impl TaskId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskNode {
    /// Read a stored block, from the cache when possible.
    Load {
        key: CacheKey,
        path: String,
        is_feature: bool,
    },
    /// Run a feature's transform over its dependency blocks.
    Compute {
        key: CacheKey,
        feature: FeatureId,
        interval: Interval,
        deps: BTreeMap<FeatureId, Vec<TaskId>>,
        store: bool,
    },
    /// As-of join of several features' blocks onto the label feature's timeline.
    Join {
        interval: Interval,
        label: FeatureId,
        label_lookahead_s: Option<f64>,
        blocks: BTreeMap<FeatureId, TaskId>,
        prev_blocks: BTreeMap<FeatureId, TaskId>,
        next_blocks: BTreeMap<FeatureId, TaskId>,
    },
}

impl TaskNode {
    pub fn cache_key(&self) -> Option<&CacheKey> {
        match self {
            TaskNode::Load { key, .. } | TaskNode::Compute { key, .. } => Some(key),
            TaskNode::Join { .. } => None,
        }
    }

    pub fn dependencies(&self) -> Vec<TaskId> {
        match self {
            TaskNode::Load { .. } => Vec::new(),
            TaskNode::Compute { deps, .. } => deps.values().flatten().copied().collect(),
            TaskNode::Join {
                blocks,
                prev_blocks,
                next_blocks,
                ..
            } => prev_blocks
                .values()
                .chain(blocks.values())
                .chain(next_blocks.values())
                .copied()
                .collect(),
        }
    }
}

/// Tasks of one feature: range interval -> block interval -> task.
pub type FeatureTasks = IntervalMap<IntervalMap<TaskId>>;

#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    tasks: Vec<TaskNode>,
    features: BTreeMap<FeatureId, FeatureTasks>,
    ranges_meta: BTreeMap<FeatureId, Vec<BlockRangeMeta>>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_task(&mut self, task: TaskNode) -> TaskId {
        let id = TaskId(self.tasks.len());
        self.tasks.push(task);
        id
    }

    pub fn task(&self, id: TaskId) -> Option<&TaskNode> {
        self.tasks.get(id.0)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn contains_feature(&self, feature: FeatureId) -> bool {
        self.features.contains_key(&feature)
    }

    pub fn feature_tasks(&self, feature: FeatureId) -> Option<&FeatureTasks> {
        self.features.get(&feature)
    }

    /// Output block ranges of a built feature, as consumed by its parents.
    pub fn ranges_meta(&self, feature: FeatureId) -> Option<&[BlockRangeMeta]> {
        self.ranges_meta.get(&feature).map(Vec::as_slice)
    }

    /// All tasks of a feature in time order.
    pub fn final_tasks(&self, feature: FeatureId) -> Vec<TaskId> {
        self.features
            .get(&feature)
            .map(|ranges| ranges.values().flat_map(|nodes| nodes.values().copied()).collect())
            .unwrap_or_default()
    }
}

/// Metadata the builder reads but never owns.
#[derive(Debug, Clone, Default)]
pub struct GraphBuildInputs {
    /// Block ranges of every data-source leaf.
    pub data_ranges_meta: BTreeMap<FeatureId, Vec<BlockRangeMeta>>,
    /// Features whose computed blocks are written back to the store.
    pub features_to_store: BTreeSet<FeatureId>,
    /// Already-materialized feature blocks, keyed by their exact interval.
    pub stored_feature_blocks_meta: BTreeMap<FeatureId, IntervalMap<BlockMeta>>,
}

impl GraphBuildInputs {
    fn stored_block(&self, feature: FeatureId, interval: &Interval) -> Option<&BlockMeta> {
        self.stored_feature_blocks_meta
            .get(&feature)?
            .get(interval)
            .filter(|meta| meta.path.is_some())
    }
}

/// Adds the tasks of `root`'s tree to `graph`, children before parents.
///
/// Features already in the graph are not rebuilt; every task of their subtree gets one
/// more cache reference instead, for the new consumer.
pub fn build_feature_task_graph<H: Clone>(
    graph: &mut TaskGraph,
    arena: &FeatureArena,
    root: FeatureId,
    inputs: &GraphBuildInputs,
    cache: &ObjectCache<H>,
) -> Result<(), GraphError> {
    let mut stack = vec![(root, false)];
    while let Some((id, expanded)) = stack.pop() {
        if !expanded {
            if graph.contains_feature(id) {
                rebind_feature(graph, arena, id, cache);
                continue;
            }
            stack.push((id, true));
            for child in arena.node(id).children().iter().rev() {
                stack.push((*child, false));
            }
            continue;
        }

        if arena.node(id).is_data_source() {
            build_data_source_tasks(graph, arena, id, inputs, cache)?;
        } else {
            build_feature_tasks(graph, arena, id, inputs, cache)?;
        }
    }
    Ok(())
}

pub fn build_feature_set_task_graph<H: Clone>(
    arena: &FeatureArena,
    roots: &[FeatureId],
    inputs: &GraphBuildInputs,
    cache: &ObjectCache<H>,
) -> Result<TaskGraph, GraphError> {
    let mut graph = TaskGraph::new();
    for root in roots {
        build_feature_task_graph(&mut graph, arena, *root, inputs, cache)?;
    }
    info!(
        component = "task_graph",
        event = "graph.built",
        roots = roots.len(),
        features = graph.features.len(),
        tasks = graph.task_count()
    );
    Ok(graph)
}

fn rebind_feature<H: Clone>(
    graph: &TaskGraph,
    arena: &FeatureArena,
    feature: FeatureId,
    cache: &ObjectCache<H>,
) {
    // every block of the reused subtree gains one consumer, leaves included
    for id in arena.postorder(feature) {
        for task in graph.final_tasks(id) {
            if let Some(key) = graph.task(task).and_then(TaskNode::cache_key) {
                cache.bind(key);
            }
        }
    }
    debug!(
        component = "task_graph",
        event = "graph.feature.reused",
        feature = %arena.node(feature)
    );
}

fn build_data_source_tasks<H: Clone>(
    graph: &mut TaskGraph,
    arena: &FeatureArena,
    id: FeatureId,
    inputs: &GraphBuildInputs,
    cache: &ObjectCache<H>,
) -> Result<(), GraphError> {
    let node = arena.node(id);
    let ranges = inputs
        .data_ranges_meta
        .get(&id)
        .ok_or_else(|| GraphError::MissingDataRanges(node.to_string()))?;

    let mut feature_tasks = FeatureTasks::new();
    for range in ranges.iter().filter(|range| !range.is_empty()) {
        let mut nodes = IntervalMap::new();
        for block in range {
            let interval = meta_to_interval(block)?;
            let path = block.path.clone().ok_or_else(|| GraphError::MissingBlockPath {
                feature: node.to_string(),
                interval,
            })?;
            let key = CacheKey::new(node.key().clone(), interval);
            cache.bind(&key);
            let task = graph.add_task(TaskNode::Load {
                key,
                path,
                is_feature: false,
            });
            nodes.insert(interval, task);
        }
        feature_tasks.insert_disjoint(range_meta_to_interval(range)?, nodes)?;
    }

    debug!(
        component = "task_graph",
        event = "graph.feature.built",
        feature = %node,
        ranges = feature_tasks.len()
    );
    graph.features.insert(id, feature_tasks);
    graph.ranges_meta.insert(id, ranges.clone());
    Ok(())
}

fn build_feature_tasks<H: Clone>(
    graph: &mut TaskGraph,
    arena: &FeatureArena,
    id: FeatureId,
    inputs: &GraphBuildInputs,
    cache: &ObjectCache<H>,
) -> Result<(), GraphError> {
    let node = arena.node(id);
    let mut dep_ranges = BTreeMap::new();
    for child in node.children() {
        let ranges = graph
            .ranges_meta(*child)
            .ok_or_else(|| GraphError::FeatureNotInGraph(arena.node(*child).to_string()))?;
        dep_ranges.insert(*child, ranges_to_interval_dict(ranges)?);
    }
    let range_overlaps = prune_overlaps(get_overlaps(&dep_ranges))?;

    let store = inputs.features_to_store.contains(&id);
    let mut feature_tasks = FeatureTasks::new();
    let mut output_ranges = Vec::new();
    let mut stored_hits = 0usize;
    for (range, dep_blocks) in range_overlaps.iter() {
        let mut grouped = BTreeMap::new();
        for (dep, blocks) in dep_blocks {
            let groups = node
                .definition()
                .group_dep_ranges(blocks, node, arena.node(*dep))?;
            grouped.insert(*dep, groups);
        }

        let mut nodes = IntervalMap::new();
        let mut output_blocks = Vec::new();
        for (interval, groups) in get_overlaps(&grouped).iter() {
            let mut deps = BTreeMap::new();
            for (dep, blocks) in groups {
                let mut dep_tasks = Vec::with_capacity(blocks.len());
                for block in blocks {
                    let block_interval = meta_to_interval(block)?;
                    dep_tasks.push(lookup_dependency_task(
                        graph,
                        arena,
                        *dep,
                        range,
                        &block_interval,
                    )?);
                }
                deps.insert(*dep, dep_tasks);
            }

            let key = CacheKey::new(node.key().clone(), *interval);
            cache.bind(&key);
            let task = match inputs.stored_block(id, interval).and_then(|meta| meta.path.clone()) {
                Some(path) => {
                    stored_hits += 1;
                    TaskNode::Load {
                        key,
                        path,
                        is_feature: true,
                    }
                }
                None => TaskNode::Compute {
                    key,
                    feature: id,
                    interval: *interval,
                    deps,
                    store,
                },
            };
            nodes.insert(*interval, graph.add_task(task));
            output_blocks.push(interval_to_meta(interval));
        }

        if nodes.is_empty() {
            continue;
        }
        feature_tasks.insert_disjoint(*range, nodes)?;
        output_ranges.push(output_blocks);
    }

    info!(
        component = "task_graph",
        event = "graph.feature.built",
        feature = %node,
        ranges = feature_tasks.len(),
        blocks = output_ranges.iter().map(Vec::len).sum::<usize>(),
        stored_hits
    );
    graph.features.insert(id, feature_tasks);
    graph.ranges_meta.insert(id, output_ranges);
    Ok(())
}

/// Finds the task producing `interval` of `dep`, preferring the range being processed
/// and falling back to whichever of the dependency's ranges contains the block.
fn lookup_dependency_task(
    graph: &TaskGraph,
    arena: &FeatureArena,
    dep: FeatureId,
    range: &Interval,
    interval: &Interval,
) -> Result<TaskId, GraphError> {
    let missing = || GraphError::MissingDependencyNode {
        feature: arena.node(dep).to_string(),
        range: *range,
        interval: *interval,
    };
    let dep_tasks = graph.features.get(&dep).ok_or_else(missing)?;
    if let Some(task) = dep_tasks.get(range).and_then(|nodes| nodes.get(interval)) {
        return Ok(*task);
    }
    dep_tasks
        .iter()
        .filter(|(dep_range, _)| dep_range.contains(interval))
        .find_map(|(_, nodes)| nodes.get(interval).copied())
        .ok_or_else(missing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::DefinitionRegistry;
    use crate::definitions::{L2_BOOK_SNAPSHOT, MID_PRICE};
    use crate::feature_tree::{construct_feature_tree, ParamsTable};

    fn blocks(bounds: &[(f64, f64)]) -> Vec<BlockMeta> {
        bounds
            .iter()
            .map(|(start, end)| BlockMeta::new(*start, *end).with_path(format!("l2/{start}-{end}.csv")))
            .collect()
    }

    #[test]
    fn data_source_gets_one_load_task_per_block() {
        let registry = DefinitionRegistry::with_builtins();
        let mut arena = FeatureArena::new();
        let empty = ParamsTable::Empty;
        let leaf =
            construct_feature_tree(&mut arena, &registry, L2_BOOK_SNAPSHOT, &empty, &empty).unwrap();

        let mut inputs = GraphBuildInputs::default();
        inputs
            .data_ranges_meta
            .insert(leaf, vec![blocks(&[(0.0, 5.0), (5.0, 10.0)]), blocks(&[(20.0, 25.0)])]);
        let cache: ObjectCache<()> = ObjectCache::new();

        let graph = build_feature_set_task_graph(&arena, &[leaf], &inputs, &cache).unwrap();
        assert_eq!(graph.task_count(), 3);
        let ranges = graph.feature_tasks(leaf).unwrap();
        assert_eq!(ranges.len(), 2);
        for task in graph.final_tasks(leaf) {
            assert!(matches!(
                graph.task(task),
                Some(TaskNode::Load {
                    is_feature: false,
                    ..
                })
            ));
        }
    }

    #[test]
    fn dependency_lookup_fails_when_child_block_is_missing() {
        let registry = DefinitionRegistry::with_builtins();
        let mut arena = FeatureArena::new();
        let empty = ParamsTable::Empty;
        let leaf =
            construct_feature_tree(&mut arena, &registry, L2_BOOK_SNAPSHOT, &empty, &empty).unwrap();

        let mut inputs = GraphBuildInputs::default();
        inputs
            .data_ranges_meta
            .insert(leaf, vec![blocks(&[(0.0, 5.0), (5.0, 10.0)])]);
        let cache: ObjectCache<()> = ObjectCache::new();
        let graph = build_feature_set_task_graph(&arena, &[leaf], &inputs, &cache).unwrap();

        let range = Interval::closed(0.0, 10.0).unwrap();
        let present = Interval::closed(5.0, 10.0).unwrap();
        assert!(lookup_dependency_task(&graph, &arena, leaf, &range, &present).is_ok());

        let absent = Interval::closed(2.0, 7.0).unwrap();
        let err = lookup_dependency_task(&graph, &arena, leaf, &range, &absent).unwrap_err();
        match err {
            GraphError::MissingDependencyNode {
                range: err_range,
                interval,
                ..
            } => {
                assert_eq!(err_range, range);
                assert_eq!(interval, absent);
            }
            other => panic!("unexpected error: {other}"),
        }

        let unbuilt = construct_feature_tree(&mut arena, &registry, MID_PRICE, &empty, &empty).unwrap();
        assert!(matches!(
            lookup_dependency_task(&graph, &arena, unbuilt, &range, &present),
            Err(GraphError::MissingDependencyNode { .. })
        ));
    }

    #[test]
    fn missing_data_ranges_is_an_error() {
        let registry = DefinitionRegistry::with_builtins();
        let mut arena = FeatureArena::new();
        let empty = ParamsTable::Empty;
        let root = construct_feature_tree(&mut arena, &registry, MID_PRICE, &empty, &empty).unwrap();
        let cache: ObjectCache<()> = ObjectCache::new();

        let err = build_feature_set_task_graph(&arena, &[root], &GraphBuildInputs::default(), &cache)
            .unwrap_err();
        assert!(matches!(err, GraphError::MissingDataRanges(_)));
    }
}
