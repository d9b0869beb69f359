//! Catalogs of stored blocks: materialized feature blocks and data-source blocks.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, RwLock};

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::blocks::{meta_to_interval, BlockError, BlockMeta};
use crate::feature_tree::{FeatureKey, FeatureNode};
use crate::interval::IntervalMap;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Block(#[from] BlockError),
    #[error("no blocks cataloged for data source {0}")]
    UnknownDataSource(String),
}

/// One row of the feature catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureCatalogEntry {
    pub owner_id: String,
    pub feature_def: String,
    pub feature_key: String,
    pub start_ts: f64,
    pub end_ts: f64,
    pub size_in_memory_kb: f64,
    pub num_rows: u64,
    pub date: String,
    pub hash: String,
    pub path: String,
}

impl FeatureCatalogEntry {
    pub fn to_block_meta(&self) -> BlockMeta {
        BlockMeta {
            start_ts: self.start_ts,
            end_ts: self.end_ts,
            path: Some(self.path.clone()),
            size_kb: Some(self.size_in_memory_kb),
            hash: Some(self.hash.clone()),
        }
    }
}

pub trait FeatureCatalog: Send + Sync {
    fn contains(&self, entry: &FeatureCatalogEntry) -> Result<bool, CatalogError>;

    /// Inserts entries not yet present; returns how many were new.
    fn write_batch(&self, entries: &[FeatureCatalogEntry]) -> Result<usize, CatalogError>;

    /// Stored blocks of one feature, keyed by their exact interval.
    fn stored_blocks(&self, feature_key: &FeatureKey)
        -> Result<IntervalMap<BlockMeta>, CatalogError>;
}

fn blocks_by_interval<'a, I>(entries: I) -> Result<IntervalMap<BlockMeta>, CatalogError>
where
    I: IntoIterator<Item = &'a FeatureCatalogEntry>,
{
    let mut blocks = IntervalMap::new();
    for entry in entries {
        let meta = entry.to_block_meta();
        blocks.insert(meta_to_interval(&meta)?, meta);
    }
    Ok(blocks)
}

#[derive(Debug, Default)]
pub struct InMemoryFeatureCatalog {
    entries: RwLock<Vec<FeatureCatalogEntry>>,
}

impl InMemoryFeatureCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<FeatureCatalogEntry> {
        self.entries
            .read()
            .expect("in-memory catalog lock should not be poisoned")
            .clone()
    }
}

impl FeatureCatalog for InMemoryFeatureCatalog {
    fn contains(&self, entry: &FeatureCatalogEntry) -> Result<bool, CatalogError> {
        Ok(self
            .entries
            .read()
            .expect("in-memory catalog lock should not be poisoned")
            .iter()
            .any(|existing| existing.path == entry.path))
    }

    fn write_batch(&self, entries: &[FeatureCatalogEntry]) -> Result<usize, CatalogError> {
        let mut stored = self
            .entries
            .write()
            .expect("in-memory catalog lock should not be poisoned");
        let mut inserted = 0;
        for entry in entries {
            if stored.iter().any(|existing| existing.path == entry.path) {
                continue;
            }
            stored.push(entry.clone());
            inserted += 1;
        }
        Ok(inserted)
    }

    fn stored_blocks(
        &self,
        feature_key: &FeatureKey,
    ) -> Result<IntervalMap<BlockMeta>, CatalogError> {
        let stored = self
            .entries
            .read()
            .expect("in-memory catalog lock should not be poisoned");
        blocks_by_interval(
            stored
                .iter()
                .filter(|entry| entry.feature_key == feature_key.as_str()),
        )
    }
}

const CREATE_FEATURE_CATALOG: &str = "CREATE TABLE IF NOT EXISTS feature_catalog (
    path TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    feature_def TEXT NOT NULL,
    feature_key TEXT NOT NULL,
    start_ts REAL NOT NULL,
    end_ts REAL NOT NULL,
    size_in_memory_kb REAL NOT NULL,
    num_rows INTEGER NOT NULL,
    date TEXT NOT NULL,
    hash TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS feature_catalog_key_idx ON feature_catalog (feature_key, start_ts);";

/// Feature catalog persisted in a SQLite database.
#[derive(Debug)]
pub struct SqliteFeatureCatalog {
    conn: Mutex<Connection>,
}

impl SqliteFeatureCatalog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, CatalogError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, CatalogError> {
        conn.execute_batch(CREATE_FEATURE_CATALOG)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .expect("sqlite catalog lock should not be poisoned")
    }
}

impl FeatureCatalog for SqliteFeatureCatalog {
    fn contains(&self, entry: &FeatureCatalogEntry) -> Result<bool, CatalogError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare_cached("SELECT 1 FROM feature_catalog WHERE path = ?1")?;
        Ok(stmt.exists(params![entry.path])?)
    }

    fn write_batch(&self, entries: &[FeatureCatalogEntry]) -> Result<usize, CatalogError> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO feature_catalog
                 (path, owner_id, feature_def, feature_key, start_ts, end_ts,
                  size_in_memory_kb, num_rows, date, hash)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for entry in entries {
                inserted += stmt.execute(params![
                    entry.path,
                    entry.owner_id,
                    entry.feature_def,
                    entry.feature_key,
                    entry.start_ts,
                    entry.end_ts,
                    entry.size_in_memory_kb,
                    entry.num_rows as i64,
                    entry.date,
                    entry.hash,
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    fn stored_blocks(
        &self,
        feature_key: &FeatureKey,
    ) -> Result<IntervalMap<BlockMeta>, CatalogError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare_cached(
            "SELECT path, owner_id, feature_def, feature_key, start_ts, end_ts,
                    size_in_memory_kb, num_rows, date, hash
             FROM feature_catalog WHERE feature_key = ?1 ORDER BY start_ts",
        )?;
        let rows = stmt.query_map(params![feature_key.as_str()], |row| {
            Ok(FeatureCatalogEntry {
                path: row.get(0)?,
                owner_id: row.get(1)?,
                feature_def: row.get(2)?,
                feature_key: row.get(3)?,
                start_ts: row.get(4)?,
                end_ts: row.get(5)?,
                size_in_memory_kb: row.get(6)?,
                num_rows: row.get::<_, i64>(7)?.max(0) as u64,
                date: row.get(8)?,
                hash: row.get(9)?,
            })
        })?;
        let entries = rows.collect::<Result<Vec<_>, _>>()?;
        blocks_by_interval(&entries)
    }
}

/// Where data-source block metadata comes from.
pub trait DataCatalog: Send + Sync {
    /// Time-sorted blocks of one data-source leaf.
    fn data_source_blocks(&self, source: &FeatureNode) -> Result<Vec<BlockMeta>, CatalogError>;
}

/// Data-source blocks registered by definition name, optionally overridden per key.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDataCatalog {
    by_name: HashMap<String, Vec<BlockMeta>>,
    by_key: HashMap<FeatureKey, Vec<BlockMeta>>,
}

impl InMemoryDataCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blocks(mut self, definition_name: &str, blocks: Vec<BlockMeta>) -> Self {
        self.by_name.insert(definition_name.to_string(), sorted(blocks));
        self
    }

    pub fn with_blocks_for_key(mut self, key: FeatureKey, blocks: Vec<BlockMeta>) -> Self {
        self.by_key.insert(key, sorted(blocks));
        self
    }
}

fn sorted(mut blocks: Vec<BlockMeta>) -> Vec<BlockMeta> {
    blocks.sort_by(|a, b| a.start_ts.total_cmp(&b.start_ts));
    blocks
}

impl DataCatalog for InMemoryDataCatalog {
    fn data_source_blocks(&self, source: &FeatureNode) -> Result<Vec<BlockMeta>, CatalogError> {
        self.by_key
            .get(source.key())
            .or_else(|| self.by_name.get(source.name()))
            .cloned()
            .ok_or_else(|| CatalogError::UnknownDataSource(source.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interval::Interval;

    fn entry(key: &str, start_ts: f64, end_ts: f64) -> FeatureCatalogEntry {
        FeatureCatalogEntry {
            owner_id: "0".to_string(),
            feature_def: "mid_price".to_string(),
            feature_key: key.to_string(),
            start_ts,
            end_ts,
            size_in_memory_kb: 1.5,
            num_rows: 10,
            date: "2024-01-01".to_string(),
            hash: format!("hash-{start_ts}"),
            path: format!("features/mid_price/{key}/{start_ts}-{end_ts}.csv"),
        }
    }

    fn exercise(catalog: &dyn FeatureCatalog) {
        let first = entry("k1", 0.0, 5.0);
        assert!(!catalog.contains(&first).unwrap());

        let inserted = catalog
            .write_batch(&[first.clone(), entry("k1", 5.0, 10.0), entry("k2", 0.0, 5.0)])
            .unwrap();
        assert_eq!(inserted, 3);
        assert_eq!(catalog.write_batch(&[first.clone()]).unwrap(), 0);
        assert!(catalog.contains(&first).unwrap());

        let stored = catalog.stored_blocks(&FeatureKey::from("k1")).unwrap();
        assert_eq!(stored.len(), 2);
        let meta = stored.get(&Interval::closed(5.0, 10.0).unwrap()).unwrap();
        assert_eq!(meta.path.as_deref(), Some("features/mid_price/k1/5-10.csv"));
        assert!(catalog
            .stored_blocks(&FeatureKey::from("k3"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn in_memory_catalog_dedupes_by_path() {
        exercise(&InMemoryFeatureCatalog::new());
    }

    #[test]
    fn sqlite_catalog_dedupes_by_path() {
        exercise(&SqliteFeatureCatalog::open_in_memory().unwrap());
    }

    #[test]
    fn sqlite_catalog_persists_across_connections() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let db_path = dir.path().join("catalog.sqlite");
        {
            let catalog = SqliteFeatureCatalog::open(&db_path).unwrap();
            catalog.write_batch(&[entry("k1", 0.0, 5.0)]).unwrap();
        }
        let reopened = SqliteFeatureCatalog::open(&db_path).unwrap();
        let stored = reopened.stored_blocks(&FeatureKey::from("k1")).unwrap();
        assert_eq!(stored.len(), 1);
    }
}
