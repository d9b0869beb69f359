//! Feature computation over time-partitioned market data.
//!
//! - interval algebra and block grouping (`interval`, `blocks`)
//! - feature dependency trees keyed by content (`feature_tree`)
//! - compilation into a load/compute/join task graph (`task_graph`, `join`)
//! - bounded-concurrency execution with a shared reference-counted cache
//!   (`executor`, `tasks`, `cache`)

mod blocks;
mod cache;
mod catalog;
mod definition;
mod definitions;
mod executor;
mod feature_tree;
mod frame;
mod interval;
mod join;
mod observability;
mod runner;
mod store;
mod task_graph;
mod tasks;

pub use blocks::{
    bucket_start_ts, fixed_bucket_grouping, identity_grouping, interval_to_meta, make_ranges,
    make_ranges_with_gap, meta_to_interval, parse_window_seconds, range_meta_to_interval,
    ranges_to_interval_dict, windowed_grouping, BlockError, BlockMeta, BlockRangeMeta,
    SAME_RANGE_DIFF_S,
};
pub use cache::{CacheEntry, CacheKey, ObjectCache};
pub use catalog::{
    CatalogError, DataCatalog, FeatureCatalog, FeatureCatalogEntry, InMemoryDataCatalog,
    InMemoryFeatureCatalog, SqliteFeatureCatalog,
};
pub use definition::{
    event_field, DefinitionRegistry, EventField, EventSchema, FeatureDefinition, FieldType,
    Params, StreamError,
};
pub use definitions::{
    builtin_definitions, DataSourceDefinition, MidPrice, Ohlcv, RollingMean, L2_BOOK_SNAPSHOT,
    MID_PRICE, OHLCV, ROLLING_MEAN, TRADES,
};
pub use executor::{
    execute_graph, executor_config_from_env, Executor, ExecutorConfig, ExecutorError,
    InlineExecutor, Job, TokioExecutor,
};
pub use feature_tree::{
    construct_feature_tree, feature_key, FeatureArena, FeatureId, FeatureKey, FeatureNode,
    FeatureTreeError, ParamsTable,
};
pub use frame::{
    Block, BlockBuilder, Column, FrameError, LABEL_PREFIX, RECEIPT_TIMESTAMP_COLUMN,
    TIMESTAMP_COLUMN,
};
pub use interval::{
    get_overlaps, intervals_almost_equal, is_sorted_intervals, overlaps_keys, prune_overlaps,
    HasInterval, Interval, IntervalMap, ALMOST_EQUAL_EPSILON_S,
};
pub use join::point_in_time_join_dag;
pub use observability::{
    init_logging, log_logging_ready, log_run_finish, log_run_start, logging_config_from_env,
    LogFormat, LoggingConfig, LoggingInitError, LOG_FORMAT_ENV, LOG_LEVEL_ENV, LOG_TARGET_ENV,
};
pub use runner::{
    construct_features_from_configs, load_config, ConfigError, DatasetError, FeatureConfig,
    Featurizer, FeaturizerConfig, FeaturizerResult, RunError,
};
pub use store::{BlockStore, CsvDirBlockStore, InMemoryBlockStore, StoreError};
pub use task_graph::{
    build_feature_set_task_graph, build_feature_task_graph, FeatureTasks, GraphBuildInputs,
    GraphError, TaskGraph, TaskId, TaskNode,
};
pub use tasks::{
    calculate_feature, catalog_feature_block, load_if_needed, point_in_time_join_block,
    BlockCache, BlockRef, ExecutionEnv, TaskError,
};
