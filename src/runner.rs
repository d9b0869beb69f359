//! End-to-end runs: config in, joined or per-feature blocks out.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::blocks::{make_ranges, parse_window_seconds, BlockError};
use crate::catalog::{CatalogError, DataCatalog, FeatureCatalog};
use crate::definition::DefinitionRegistry;
use crate::executor::{execute_graph, Executor, ExecutorConfig, ExecutorError, Job};
use crate::feature_tree::{
    construct_feature_tree, FeatureArena, FeatureId, FeatureTreeError, ParamsTable,
};
use crate::frame::{Block, FrameError, LABEL_PREFIX, RECEIPT_TIMESTAMP_COLUMN};
use crate::join::point_in_time_join_dag;
use crate::observability::{log_run_finish, log_run_start};
use crate::store::BlockStore;
use crate::task_graph::{build_feature_set_task_graph, GraphBuildInputs, GraphError, TaskId};
use crate::tasks::{BlockCache, BlockRef, ExecutionEnv};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("feature index {index} out of range for {len} feature configs")]
    InvalidFeatureIndex { index: usize, len: usize },
    #[error("config has no feature configs")]
    NoFeatures,
    #[error("label lookahead requires a label feature")]
    LookaheadWithoutLabel,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    FeatureTree(#[from] FeatureTreeError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Block(#[from] BlockError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DatasetError {
    #[error("dataset has no label column")]
    MissingLabelColumn,
    #[error("dataset has several label columns: {0:?}")]
    MultipleLabelColumns(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureConfig {
    pub feature_definition: String,
    #[serde(default)]
    pub data_params: Value,
    #[serde(default)]
    pub feature_params: Value,
}

impl FeatureConfig {
    pub fn new(feature_definition: impl Into<String>) -> Self {
        Self {
            feature_definition: feature_definition.into(),
            data_params: Value::Null,
            feature_params: Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FeaturizerConfig {
    pub feature_configs: Vec<FeatureConfig>,
    /// Index into `feature_configs` of the feature every other one is joined onto.
    #[serde(default)]
    pub label_feature: Option<usize>,
    /// Window string such as `30s`; shifts the label forward and prefixes it with `label_`.
    #[serde(default)]
    pub label_lookahead: Option<String>,
    /// Indices into `feature_configs` whose computed blocks are written back.
    #[serde(default)]
    pub features_to_store: Vec<usize>,
    #[serde(default)]
    pub max_concurrent: Option<usize>,
}

impl FeaturizerConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: FeaturizerConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let len = self.feature_configs.len();
        if len == 0 {
            return Err(ConfigError::NoFeatures);
        }
        for index in self.label_feature.iter().chain(&self.features_to_store) {
            if *index >= len {
                return Err(ConfigError::InvalidFeatureIndex { index: *index, len });
            }
        }
        if self.label_lookahead.is_some() && self.label_feature.is_none() {
            return Err(ConfigError::LookaheadWithoutLabel);
        }
        Ok(())
    }
}

pub fn load_config(path: impl AsRef<Path>) -> Result<FeaturizerConfig, ConfigError> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    FeaturizerConfig::from_json_str(&raw)
}

/// Builds one tree per config, sharing identical subtrees.
pub fn construct_features_from_configs(
    arena: &mut FeatureArena,
    registry: &DefinitionRegistry,
    configs: &[FeatureConfig],
) -> Result<Vec<FeatureId>, FeatureTreeError> {
    configs
        .iter()
        .map(|config| {
            construct_feature_tree(
                arena,
                registry,
                &config.feature_definition,
                &ParamsTable::from_value(&config.data_params)?,
                &ParamsTable::from_value(&config.feature_params)?,
            )
        })
        .collect()
}

/// Blocks produced by a run, ordered by their first timestamp.
#[derive(Debug, Clone, Default)]
pub struct FeaturizerResult {
    blocks: Vec<BlockRef>,
}

impl FeaturizerResult {
    pub fn new(mut blocks: Vec<BlockRef>) -> Self {
        blocks.sort_by(|a, b| first_ts(a).total_cmp(&first_ts(b)));
        Self { blocks }
    }

    pub fn blocks(&self) -> &[BlockRef] {
        &self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// All rows in one block, keeping every `nth_row`-th.
    pub fn materialize(&self, nth_row: usize) -> Result<Block, FrameError> {
        let merged = Block::concat(self.blocks.iter().map(|block| &**block))?;
        Ok(merged.downsample_uniform(nth_row))
    }

    pub fn columns(&self) -> Vec<String> {
        self.blocks
            .iter()
            .find(|block| !block.columns().is_empty())
            .map(|block| block.column_names())
            .unwrap_or_default()
    }

    pub fn label_column(&self) -> Result<String, DatasetError> {
        let mut labels: Vec<String> = self
            .columns()
            .into_iter()
            .filter(|name| name.starts_with(LABEL_PREFIX))
            .collect();
        match labels.len() {
            0 => Err(DatasetError::MissingLabelColumn),
            1 => Ok(labels.remove(0)),
            _ => Err(DatasetError::MultipleLabelColumns(labels)),
        }
    }

    pub fn feature_columns(&self) -> Vec<String> {
        self.columns()
            .into_iter()
            .filter(|name| name != RECEIPT_TIMESTAMP_COLUMN && !name.starts_with(LABEL_PREFIX))
            .collect()
    }
}

fn first_ts(block: &Block) -> f64 {
    block.timestamps().first().copied().unwrap_or(f64::INFINITY)
}

/// Compiles a config into a task graph and executes it.
#[derive(Debug, Clone, Copy, Default)]
pub struct Featurizer;

impl Featurizer {
    pub fn run<E: Executor>(
        config: &FeaturizerConfig,
        registry: &DefinitionRegistry,
        data_catalog: &dyn DataCatalog,
        store: Arc<dyn BlockStore>,
        catalog: Arc<dyn FeatureCatalog>,
        executor: &E,
    ) -> Result<FeaturizerResult, RunError> {
        config.validate()?;
        let started = Instant::now();
        let max_concurrent = config
            .max_concurrent
            .unwrap_or_else(|| ExecutorConfig::default().max_concurrent);
        log_run_start(
            config.feature_configs.len(),
            config.label_feature.is_some(),
            max_concurrent,
        );

        let mut arena = FeatureArena::new();
        let roots = construct_features_from_configs(&mut arena, registry, &config.feature_configs)?;
        let inputs = collect_build_inputs(config, &arena, &roots, data_catalog, catalog.as_ref())?;

        let cache = Arc::new(BlockCache::new());
        let mut graph = build_feature_set_task_graph(&arena, &roots, &inputs, cache.as_ref())?;

        let final_tasks: Vec<TaskId> = match config.label_feature {
            Some(label_idx) => {
                let label_lookahead_s = config
                    .label_lookahead
                    .as_deref()
                    .map(parse_window_seconds)
                    .transpose()?;
                let joined = point_in_time_join_dag(
                    &mut graph,
                    &arena,
                    &roots,
                    roots[label_idx],
                    label_lookahead_s,
                )?;
                joined
                    .values()
                    .flat_map(|nodes| nodes.values().copied())
                    .collect()
            }
            None => {
                let mut seen = BTreeSet::new();
                roots
                    .iter()
                    .filter(|root| seen.insert(**root))
                    .flat_map(|root| graph.final_tasks(*root))
                    .collect()
            }
        };

        let env = ExecutionEnv::new(
            Arc::new(graph),
            Arc::new(arena),
            Arc::clone(&cache),
            store,
            catalog,
        );
        let jobs: Vec<Job> = final_tasks
            .into_iter()
            .map(|task| {
                let env = env.clone();
                Box::new(move || env.evaluate(task)) as Job
            })
            .collect();

        let outcome = execute_graph(executor, jobs, max_concurrent);
        drop(env);
        let refs = match outcome {
            Ok(refs) => refs,
            Err(err) => {
                cache.shutdown();
                return Err(err.into());
            }
        };
        cache.record_final_refs(refs);
        let result = FeaturizerResult::new(cache.shutdown());

        log_run_finish(result.len(), started.elapsed().as_millis() as u64);
        Ok(result)
    }
}

fn collect_build_inputs(
    config: &FeaturizerConfig,
    arena: &FeatureArena,
    roots: &[FeatureId],
    data_catalog: &dyn DataCatalog,
    catalog: &dyn FeatureCatalog,
) -> Result<GraphBuildInputs, RunError> {
    let mut inputs = GraphBuildInputs {
        features_to_store: config
            .features_to_store
            .iter()
            .map(|idx| roots[*idx])
            .collect(),
        ..Default::default()
    };

    let mut stored = BTreeMap::new();
    for root in roots {
        for id in arena.postorder(*root) {
            let node = arena.node(id);
            if node.is_data_source() {
                if !inputs.data_ranges_meta.contains_key(&id) {
                    let blocks = data_catalog.data_source_blocks(node)?;
                    inputs.data_ranges_meta.insert(id, make_ranges(&blocks));
                }
            } else if !stored.contains_key(&id) {
                let blocks = catalog.stored_blocks(node.key())?;
                if !blocks.is_empty() {
                    stored.insert(id, blocks);
                }
            }
        }
    }
    inputs.stored_feature_blocks_meta = stored;
    Ok(inputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Column;

    #[test]
    fn config_parses_with_defaults() {
        let config = FeaturizerConfig::from_json_str(
            r#"{"feature_configs": [{"feature_definition": "mid_price"}]}"#,
        )
        .unwrap();
        assert_eq!(config.feature_configs[0], FeatureConfig::new("mid_price"));
        assert_eq!(config.label_feature, None);
        assert!(config.features_to_store.is_empty());
    }

    #[test]
    fn config_rejects_out_of_range_indices() {
        let err = FeaturizerConfig::from_json_str(
            r#"{"feature_configs": [{"feature_definition": "mid_price"}], "label_feature": 2}"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidFeatureIndex { index: 2, len: 1 }
        ));
        assert!(matches!(
            FeaturizerConfig::from_json_str(r#"{"feature_configs": []}"#),
            Err(ConfigError::NoFeatures)
        ));
    }

    #[test]
    fn load_config_reports_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let err = load_config(dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn result_splits_label_and_feature_columns() {
        let late = Block::new(
            vec![5.0],
            vec![
                Column::new("label_mid_price", vec![1.0]),
                Column::new("mid_price", vec![2.0]),
            ],
        )
        .unwrap();
        let early = Block::new(
            vec![1.0, 2.0],
            vec![
                Column::new("label_mid_price", vec![3.0, 4.0]),
                Column::new("mid_price", vec![5.0, 6.0]),
            ],
        )
        .unwrap();

        let result = FeaturizerResult::new(vec![Arc::new(late), Arc::new(early)]);
        assert_eq!(result.blocks()[0].timestamps(), &[1.0, 2.0]);
        assert_eq!(result.label_column().unwrap(), "label_mid_price");
        assert_eq!(result.feature_columns(), vec!["mid_price"]);
        assert_eq!(result.materialize(2).unwrap().timestamps(), &[1.0, 5.0]);
    }

    #[test]
    fn result_without_label_reports_it() {
        let block = Block::new(vec![1.0], vec![Column::new("mid_price", vec![1.0])]).unwrap();
        let result = FeaturizerResult::new(vec![Arc::new(block)]);
        assert_eq!(result.label_column(), Err(DatasetError::MissingLabelColumn));
    }
}
