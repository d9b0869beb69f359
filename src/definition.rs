//! The feature definition seam and the registry that resolves definitions by name.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::blocks::{identity_grouping, BlockError, BlockMeta};
use crate::feature_tree::{FeatureNode, FeatureTreeError};
use crate::frame::{Block, FrameError};
use crate::interval::{Interval, IntervalMap};

/// Parameters of one node, keyed by name.
pub type Params = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    F64,
    I64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventField {
    pub name: String,
    pub dtype: FieldType,
}

pub type EventSchema = Vec<EventField>;

pub fn event_field(name: &str, dtype: FieldType) -> EventField {
    EventField {
        name: name.to_string(),
        dtype,
    }
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("expected {expected} upstream blocks, got {found}")]
    MissingInput { expected: usize, found: usize },
    #[error("upstream block has no column {0}")]
    MissingColumn(String),
    #[error("invalid param {name}: {reason}")]
    InvalidParam { name: String, reason: String },
    #[error("{0} is a data source and cannot be computed")]
    NotComputable(String),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Block(#[from] BlockError),
}

/// A named transform: which upstream definitions it consumes, which columns it emits,
/// and how its dependency blocks are grouped into output blocks.
pub trait FeatureDefinition: fmt::Debug + Send + Sync {
    fn name(&self) -> &str;

    /// Data sources are the leaves of every feature tree; they are loaded, never computed.
    fn is_data_source(&self) -> bool {
        false
    }

    fn event_schema(&self) -> EventSchema;

    /// Names of upstream definitions, in child order.
    fn dependency_schema(&self, params: &Params) -> Vec<String>;

    /// Computes output rows from the concatenated upstream blocks, one per child.
    ///
    /// `interval` is the output block being produced; rows outside it are dropped by
    /// the caller.
    fn stream(
        &self,
        upstreams: &[Block],
        params: &Params,
        interval: &Interval,
    ) -> Result<Block, StreamError>;

    fn group_dep_ranges(
        &self,
        dep_blocks: &[BlockMeta],
        _feature: &FeatureNode,
        _dependency: &FeatureNode,
    ) -> Result<IntervalMap<Vec<BlockMeta>>, BlockError> {
        identity_grouping(dep_blocks)
    }
}

/// Definitions known to a run, resolved by name.
#[derive(Debug, Clone, Default)]
pub struct DefinitionRegistry {
    definitions: HashMap<String, Arc<dyn FeatureDefinition>>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for definition in crate::definitions::builtin_definitions() {
            registry.register(definition);
        }
        registry
    }

    pub fn register(&mut self, definition: Arc<dyn FeatureDefinition>) {
        self.definitions
            .insert(definition.name().to_string(), definition);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn FeatureDefinition>, FeatureTreeError> {
        self.definitions
            .get(name)
            .cloned()
            .ok_or_else(|| FeatureTreeError::UnknownDefinition(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.definitions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
