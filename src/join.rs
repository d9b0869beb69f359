//! Plans point-in-time joins of several features' blocks.

use std::collections::BTreeMap;

use tracing::info;

use crate::feature_tree::{FeatureArena, FeatureId};
use crate::interval::{get_overlaps, prune_overlaps, Interval, IntervalMap};
use crate::task_graph::{GraphError, TaskGraph, TaskId, TaskNode};

/// Adds one join task per overlap window of `features` and returns them by range.
///
/// Each feature contributes its block for the window plus the block before it, so rows
/// near the window start can see the latest earlier value. With a lookahead the label
/// feature also contributes the following block.
pub fn point_in_time_join_dag(
    graph: &mut TaskGraph,
    arena: &FeatureArena,
    features: &[FeatureId],
    label: FeatureId,
    label_lookahead_s: Option<f64>,
) -> Result<IntervalMap<IntervalMap<TaskId>>, GraphError> {
    let mut to_join: Vec<FeatureId> = features.to_vec();
    if !to_join.contains(&label) {
        to_join.push(label);
    }

    let mut ranges_per_feature = BTreeMap::new();
    for feature in &to_join {
        let tasks = graph
            .feature_tasks(*feature)
            .ok_or_else(|| GraphError::FeatureNotInGraph(arena.node(*feature).to_string()))?;
        let mut ranges = IntervalMap::new();
        for (range, nodes) in tasks.iter() {
            let blocks: Vec<(Interval, TaskId)> =
                nodes.iter().map(|(interval, task)| (*interval, *task)).collect();
            ranges.insert_disjoint(*range, blocks)?;
        }
        ranges_per_feature.insert(*feature, ranges);
    }

    let mut joined = IntervalMap::new();
    let mut join_count = 0usize;
    for (range, per_feature) in prune_overlaps(get_overlaps(&ranges_per_feature))? {
        let per_feature: BTreeMap<FeatureId, IntervalMap<TaskId>> = per_feature
            .into_iter()
            .map(|(feature, blocks)| (feature, blocks.into_iter().collect()))
            .collect();

        let mut nodes = IntervalMap::new();
        for (interval, current) in get_overlaps(&per_feature).iter() {
            let mut prev_blocks = BTreeMap::new();
            let mut next_blocks = BTreeMap::new();
            for (feature, task) in current {
                let Some(blocks) = per_feature.get(feature) else {
                    continue;
                };
                let Some(position) = blocks.values().position(|candidate| candidate == task) else {
                    continue;
                };
                if let Some((_, prev)) = position.checked_sub(1).and_then(|idx| blocks.entry_at(idx)) {
                    prev_blocks.insert(*feature, *prev);
                }
                if *feature == label && label_lookahead_s.is_some() {
                    if let Some((_, next)) = blocks.entry_at(position + 1) {
                        next_blocks.insert(*feature, *next);
                    }
                }
            }

            let task = graph.add_task(TaskNode::Join {
                interval: *interval,
                label,
                label_lookahead_s,
                blocks: current.clone(),
                prev_blocks,
                next_blocks,
            });
            nodes.insert(*interval, task);
            join_count += 1;
        }
        joined.insert(range, nodes);
    }

    info!(
        component = "join",
        event = "join.planned",
        features = to_join.len(),
        label = %arena.node(label),
        ranges = joined.len(),
        joins = join_count
    );
    Ok(joined)
}
