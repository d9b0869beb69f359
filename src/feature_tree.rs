//! Feature dependency trees: construction from configs, content keys and traversals.
//!
//! Nodes live in a [`FeatureArena`] and are interned by [`FeatureKey`], so identical
//! subtrees reached from different roots resolve to one node.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::definition::{DefinitionRegistry, FeatureDefinition, Params};

const SHORT_KEY_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeatureTreeError {
    #[error("unknown params type: {0}")]
    UnknownParamsType(String),
    #[error("no params at position {position} ({available} positional entries)")]
    OutOfRange { position: usize, available: usize },
    #[error("unknown feature definition {0}")]
    UnknownDefinition(String),
    #[error("no feature matches {0}")]
    UnknownFeature(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FeatureId(pub(crate) usize);

impl FeatureId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Content hash of a node's definition and the parameters of its whole subtree.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FeatureKey(String);

impl FeatureKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..SHORT_KEY_LEN.min(self.0.len())]
    }
}

impl fmt::Display for FeatureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FeatureKey {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct FeatureNode {
    id: FeatureId,
    key: FeatureKey,
    definition: Arc<dyn FeatureDefinition>,
    params: Params,
    position: usize,
    children: Vec<FeatureId>,
}

impl FeatureNode {
    pub fn id(&self) -> FeatureId {
        self.id
    }

    pub fn key(&self) -> &FeatureKey {
        &self.key
    }

    pub fn definition(&self) -> &Arc<dyn FeatureDefinition> {
        &self.definition
    }

    pub fn name(&self) -> &str {
        self.definition.name()
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn children(&self) -> &[FeatureId] {
        &self.children
    }

    pub fn is_data_source(&self) -> bool {
        self.definition.is_data_source()
    }
}

impl fmt::Display for FeatureNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_data_source() {
            "data-source"
        } else {
            "feature"
        };
        write!(
            f,
            "{kind}-{}-{}-{}",
            self.name(),
            self.position,
            self.key.short()
        )
    }
}

/// Per-position parameter overrides, as written in a feature config.
///
/// An object maps positions (as strings) to params, an array is indexed by position,
/// and `null` means "no params anywhere".
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ParamsTable {
    #[default]
    Empty,
    ByPosition(BTreeMap<usize, Params>),
    Positional(Vec<Params>),
}

impl ParamsTable {
    pub fn from_value(value: &Value) -> Result<Self, FeatureTreeError> {
        match value {
            Value::Null => Ok(Self::Empty),
            Value::Object(entries) => {
                let mut by_position = BTreeMap::new();
                for (raw_position, params) in entries {
                    let position = raw_position.trim().parse::<usize>().map_err(|_| {
                        FeatureTreeError::UnknownParamsType(format!("position key `{raw_position}`"))
                    })?;
                    by_position.insert(position, params_from_value(params)?);
                }
                Ok(Self::ByPosition(by_position))
            }
            Value::Array(items) => Ok(Self::Positional(
                items
                    .iter()
                    .map(params_from_value)
                    .collect::<Result<_, _>>()?,
            )),
            other => Err(FeatureTreeError::UnknownParamsType(value_kind(other).to_string())),
        }
    }

    pub fn params_at(&self, position: usize) -> Result<Params, FeatureTreeError> {
        match self {
            Self::Empty => Ok(Params::new()),
            Self::ByPosition(by_position) => {
                Ok(by_position.get(&position).cloned().unwrap_or_default())
            }
            Self::Positional(items) => {
                items
                    .get(position)
                    .cloned()
                    .ok_or(FeatureTreeError::OutOfRange {
                        position,
                        available: items.len(),
                    })
            }
        }
    }
}

fn params_from_value(value: &Value) -> Result<Params, FeatureTreeError> {
    match value {
        Value::Null => Ok(Params::new()),
        Value::Object(entries) => Ok(entries
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()),
        other => Err(FeatureTreeError::UnknownParamsType(value_kind(other).to_string())),
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub fn feature_key(
    definition_name: &str,
    data_params: &[&Params],
    feature_params: &[&Params],
) -> FeatureKey {
    // serde_json objects serialize with sorted keys, so the encoding is canonical.
    let canonical = json!([definition_name, data_params, feature_params]).to_string();
    FeatureKey(hex::encode(Sha256::digest(canonical.as_bytes())))
}

#[derive(Debug, Default, Clone)]
pub struct FeatureArena {
    nodes: Vec<FeatureNode>,
    by_key: HashMap<FeatureKey, FeatureId>,
}

impl FeatureArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Panics when `id` came from another arena; use [`FeatureArena::get`] for ids of
    /// unknown origin.
    pub fn node(&self, id: FeatureId) -> &FeatureNode {
        &self.nodes[id.0]
    }

    pub fn get(&self, id: FeatureId) -> Option<&FeatureNode> {
        self.nodes.get(id.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FeatureNode> {
        self.nodes.iter()
    }

    pub fn find_by_key(&self, key: &FeatureKey) -> Option<FeatureId> {
        self.by_key.get(key).copied()
    }

    /// Returns the existing node with the same key, or adds a new one.
    pub fn intern(
        &mut self,
        definition: Arc<dyn FeatureDefinition>,
        params: Params,
        position: usize,
        children: Vec<FeatureId>,
    ) -> FeatureId {
        let key = if definition.is_data_source() {
            feature_key(definition.name(), &[&params], &[])
        } else {
            let data_params: Vec<&Params> = children
                .iter()
                .flat_map(|child| self.data_deps(*child))
                .map(|id| self.node(id).params())
                .collect();
            let mut feature_params = vec![&params];
            feature_params.extend(
                children
                    .iter()
                    .flat_map(|child| self.inorder_feature_deps(*child))
                    .map(|id| self.node(id).params()),
            );
            feature_key(definition.name(), &data_params, &feature_params)
        };

        if let Some(existing) = self.by_key.get(&key) {
            return *existing;
        }

        let id = FeatureId(self.nodes.len());
        self.by_key.insert(key.clone(), id);
        self.nodes.push(FeatureNode {
            id,
            key,
            definition,
            params,
            position,
            children,
        });
        id
    }

    pub fn postorder(&self, root: FeatureId) -> Vec<FeatureId> {
        let mut out = Vec::new();
        let mut stack = vec![(root, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                out.push(id);
                continue;
            }
            stack.push((id, true));
            for child in self.node(id).children.iter().rev() {
                stack.push((*child, false));
            }
        }
        out
    }

    pub fn preorder(&self, root: FeatureId) -> Vec<FeatureId> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            out.push(id);
            stack.extend(self.node(id).children.iter().rev().copied());
        }
        out
    }

    /// Data-source leaves in postorder.
    pub fn data_deps(&self, root: FeatureId) -> Vec<FeatureId> {
        self.postorder(root)
            .into_iter()
            .filter(|id| self.node(*id).is_data_source())
            .collect()
    }

    /// Non-leaf nodes, parent before children.
    pub fn inorder_feature_deps(&self, root: FeatureId) -> Vec<FeatureId> {
        self.preorder(root)
            .into_iter()
            .filter(|id| !self.node(*id).is_data_source())
            .collect()
    }

    /// Resolves a full key, a display form or a definition name against the given roots.
    pub fn get_feature_by_key_or_name(
        &self,
        roots: &[FeatureId],
        key_or_name: &str,
    ) -> Result<FeatureId, FeatureTreeError> {
        for root in roots {
            for id in self.postorder(*root) {
                let node = self.node(id);
                if node.key().as_str() == key_or_name
                    || node.to_string() == key_or_name
                    || (*root == id && node.name() == key_or_name)
                {
                    return Ok(id);
                }
            }
        }
        Err(FeatureTreeError::UnknownFeature(key_or_name.to_string()))
    }
}

struct PendingNode {
    definition: Arc<dyn FeatureDefinition>,
    params: Params,
    position: usize,
    deps: Vec<String>,
    next_dep: usize,
    children: Vec<FeatureId>,
}

impl PendingNode {
    fn new(
        definition: Arc<dyn FeatureDefinition>,
        position: usize,
        feature_params: &ParamsTable,
    ) -> Result<Self, FeatureTreeError> {
        let params = feature_params.params_at(position)?;
        let deps = definition.dependency_schema(&params);
        Ok(Self {
            definition,
            params,
            position,
            deps,
            next_dep: 0,
            children: Vec::new(),
        })
    }
}

/// Builds the tree rooted at `definition_name`.
///
/// Feature nodes are positioned by depth among feature nodes (root is 0); data-source
/// leaves are numbered in discovery order. Params are looked up by those positions.
pub fn construct_feature_tree(
    arena: &mut FeatureArena,
    registry: &DefinitionRegistry,
    definition_name: &str,
    data_params: &ParamsTable,
    feature_params: &ParamsTable,
) -> Result<FeatureId, FeatureTreeError> {
    let root = registry.get(definition_name)?;
    if root.is_data_source() {
        let params = data_params.params_at(0)?;
        return Ok(arena.intern(root, params, 0, Vec::new()));
    }

    let mut data_position = 0;
    let mut stack = vec![PendingNode::new(root, 0, feature_params)?];
    while let Some(frame) = stack.last_mut() {
        if let Some(dep_name) = frame.deps.get(frame.next_dep).cloned() {
            frame.next_dep += 1;
            let dep = registry.get(&dep_name)?;
            if dep.is_data_source() {
                let params = data_params.params_at(data_position)?;
                let leaf = arena.intern(dep, params, data_position, Vec::new());
                frame.children.push(leaf);
                data_position += 1;
            } else {
                let child = PendingNode::new(dep, frame.position + 1, feature_params)?;
                stack.push(child);
            }
            continue;
        }

        let Some(done) = stack.pop() else {
            break;
        };
        let id = arena.intern(done.definition, done.params, done.position, done.children);
        match stack.last_mut() {
            Some(parent) => parent.children.push(id),
            None => return Ok(id),
        }
    }
    unreachable!("the root frame returns when it is popped")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definitions::{L2_BOOK_SNAPSHOT, MID_PRICE, ROLLING_MEAN};
    use serde_json::json;

    fn build(name: &str, data: Value, feature: Value) -> (FeatureArena, FeatureId) {
        let registry = DefinitionRegistry::with_builtins();
        let mut arena = FeatureArena::new();
        let root = construct_feature_tree(
            &mut arena,
            &registry,
            name,
            &ParamsTable::from_value(&data).unwrap(),
            &ParamsTable::from_value(&feature).unwrap(),
        )
        .unwrap();
        (arena, root)
    }

    #[test]
    fn ids_from_another_arena_are_not_found() {
        let (large, root) = build(ROLLING_MEAN, Value::Null, Value::Null);
        let (small, leaf) = build(L2_BOOK_SNAPSHOT, Value::Null, Value::Null);
        assert!(large.len() > small.len());

        assert_eq!(large.get(root).map(FeatureNode::name), Some(ROLLING_MEAN));
        assert_eq!(small.get(leaf).map(FeatureNode::name), Some(L2_BOOK_SNAPSHOT));
        assert!(small.get(root).is_none());
    }

    #[test]
    fn params_table_resolves_by_position() {
        let table = ParamsTable::from_value(&json!({"0": {"a": 1}, "2": {"b": 2}})).unwrap();
        assert_eq!(table.params_at(0).unwrap()["a"], json!(1));
        assert!(table.params_at(1).unwrap().is_empty());

        let positional = ParamsTable::from_value(&json!([{"a": 1}])).unwrap();
        assert_eq!(
            positional.params_at(3),
            Err(FeatureTreeError::OutOfRange {
                position: 3,
                available: 1
            })
        );
        assert!(matches!(
            ParamsTable::from_value(&json!("nope")),
            Err(FeatureTreeError::UnknownParamsType(_))
        ));
    }

    #[test]
    fn assigns_depth_positions_to_features_and_counter_to_leaves() {
        let (arena, root) = build(
            ROLLING_MEAN,
            json!({"0": {"exchange": "BINANCE"}}),
            json!({"0": {"lookback": "5s"}}),
        );

        let postorder = arena.postorder(root);
        let rendered: Vec<String> = postorder
            .iter()
            .map(|id| {
                let node = arena.node(*id);
                format!("{}@{}", node.name(), node.position())
            })
            .collect();
        assert_eq!(
            rendered,
            vec!["l2_book_snapshot@0", "mid_price@1", "rolling_mean@0"]
        );

        let leaf = arena.node(arena.data_deps(root)[0]);
        assert_eq!(leaf.params()["exchange"], json!("BINANCE"));
        assert!(leaf.to_string().starts_with("data-source-l2_book_snapshot-0-"));
        assert!(arena.node(root).to_string().starts_with("feature-rolling_mean-0-"));
    }

    #[test]
    fn identical_subtrees_share_one_node() {
        let registry = DefinitionRegistry::with_builtins();
        let mut arena = FeatureArena::new();
        let empty = ParamsTable::Empty;
        let mid = construct_feature_tree(&mut arena, &registry, MID_PRICE, &empty, &empty).unwrap();
        let rolling =
            construct_feature_tree(&mut arena, &registry, ROLLING_MEAN, &empty, &empty).unwrap();

        assert_eq!(arena.node(rolling).children(), &[mid]);
        assert_eq!(arena.len(), 3);
    }

    #[test]
    fn key_depends_on_subtree_params_only() {
        let (a, root_a) = build(MID_PRICE, json!({"0": {"symbol": "BTC"}}), Value::Null);
        let (b, root_b) = build(MID_PRICE, json!({"0": {"symbol": "ETH"}}), Value::Null);
        let (c, root_c) = build(MID_PRICE, json!([{"symbol": "BTC"}]), Value::Null);

        assert_ne!(a.node(root_a).key(), b.node(root_b).key());
        assert_eq!(a.node(root_a).key(), c.node(root_c).key());
        assert_eq!(a.node(root_a).key().as_str().len(), 64);
    }

    #[test]
    fn unknown_definition_is_reported() {
        let registry = DefinitionRegistry::with_builtins();
        let mut arena = FeatureArena::new();
        let err = construct_feature_tree(
            &mut arena,
            &registry,
            "spread",
            &ParamsTable::Empty,
            &ParamsTable::Empty,
        )
        .unwrap_err();
        assert_eq!(err, FeatureTreeError::UnknownDefinition("spread".to_string()));
    }

    #[test]
    fn finds_features_by_key_display_or_root_name() {
        let (arena, root) = build(ROLLING_MEAN, Value::Null, Value::Null);
        let leaf = arena.data_deps(root)[0];

        assert_eq!(arena.get_feature_by_key_or_name(&[root], ROLLING_MEAN), Ok(root));
        let key = arena.node(leaf).key().as_str().to_string();
        assert_eq!(arena.get_feature_by_key_or_name(&[root], &key), Ok(leaf));
        let display = arena.node(leaf).to_string();
        assert_eq!(arena.get_feature_by_key_or_name(&[root], &display), Ok(leaf));
        assert!(arena
            .get_feature_by_key_or_name(&[root], L2_BOOK_SNAPSHOT)
            .is_err());
    }
}
