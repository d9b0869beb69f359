//! Block storage: where data-source and feature blocks are read from and written to.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use csv::StringRecord;
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::frame::{Block, Column, FrameError, TIMESTAMP_COLUMN};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no block stored at {0}")]
    NotFound(String),
    #[error("invalid block path: {0}")]
    InvalidPath(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("block at {0} has no leading timestamp column")]
    MissingTimestampColumn(String),
    #[error("failed to parse field {field} value '{value}'")]
    ParseField { field: String, value: String },
    #[error(transparent)]
    Frame(#[from] FrameError),
}

pub trait BlockStore: Send + Sync {
    fn load(&self, path: &str) -> Result<Block, StoreError>;
    fn store(&self, path: &str, block: &Block) -> Result<(), StoreError>;
    fn contains(&self, path: &str) -> bool;
}

#[derive(Debug, Default)]
pub struct InMemoryBlockStore {
    blocks: RwLock<HashMap<String, Block>>,
}

impl InMemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_block(self, path: impl Into<String>, block: Block) -> Self {
        self.insert(path, block);
        self
    }

    pub fn insert(&self, path: impl Into<String>, block: Block) {
        self.blocks
            .write()
            .expect("in-memory block store lock should not be poisoned")
            .insert(path.into(), block);
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .blocks
            .read()
            .expect("in-memory block store lock should not be poisoned")
            .keys()
            .cloned()
            .collect();
        paths.sort();
        paths
    }
}

impl BlockStore for InMemoryBlockStore {
    fn load(&self, path: &str) -> Result<Block, StoreError> {
        self.blocks
            .read()
            .expect("in-memory block store lock should not be poisoned")
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(path.to_string()))
    }

    fn store(&self, path: &str, block: &Block) -> Result<(), StoreError> {
        self.insert(path, block.clone());
        Ok(())
    }

    fn contains(&self, path: &str) -> bool {
        self.blocks
            .read()
            .expect("in-memory block store lock should not be poisoned")
            .contains_key(path)
    }
}

/// Blocks as CSV files under a root directory: a `timestamp` header followed by one
/// column per value.
#[derive(Debug, Clone)]
pub struct CsvDirBlockStore {
    root: PathBuf,
}

impl CsvDirBlockStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(path);
        let escapes = relative.components().any(|component| {
            !matches!(
                component,
                std::path::Component::Normal(_) | std::path::Component::CurDir
            )
        });
        if path.is_empty() || escapes {
            return Err(StoreError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

impl BlockStore for CsvDirBlockStore {
    fn load(&self, path: &str) -> Result<Block, StoreError> {
        let full_path = self.resolve(path)?;
        if !full_path.is_file() {
            return Err(StoreError::NotFound(path.to_string()));
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(&full_path)?;
        let headers = reader.headers()?.clone();
        if headers.get(0) != Some(TIMESTAMP_COLUMN) {
            return Err(StoreError::MissingTimestampColumn(path.to_string()));
        }

        let names: Vec<String> = headers.iter().skip(1).map(str::to_string).collect();
        let mut timestamps = Vec::new();
        let mut values: Vec<Vec<f64>> = vec![Vec::new(); names.len()];
        for record in reader.records() {
            let record = record?;
            timestamps.push(parse_field(&record, 0, TIMESTAMP_COLUMN)?);
            for (idx, name) in names.iter().enumerate() {
                values[idx].push(parse_field(&record, idx + 1, name)?);
            }
        }

        let columns = names
            .into_iter()
            .zip(values)
            .map(|(name, values)| Column::new(name, values))
            .collect();
        Ok(Block::new(timestamps, columns)?)
    }

    fn store(&self, path: &str, block: &Block) -> Result<(), StoreError> {
        let full_path = self.resolve(path)?;
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut writer = csv::Writer::from_writer(Vec::new());
        let mut header = vec![TIMESTAMP_COLUMN.to_string()];
        header.extend(block.column_names());
        writer.write_record(&header)?;
        for (row, ts) in block.timestamps().iter().enumerate() {
            let mut record = vec![ts.to_string()];
            record.extend(block.columns().iter().map(|column| column.values[row].to_string()));
            writer.write_record(&record)?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|err| StoreError::Io(err.into_error()))?;
        write_atomic(&full_path, &bytes)
    }

    fn contains(&self, path: &str) -> bool {
        self.resolve(path)
            .map(|full_path| full_path.is_file())
            .unwrap_or(false)
    }
}

fn parse_field(record: &StringRecord, idx: usize, field: &str) -> Result<f64, StoreError> {
    let raw = record.get(idx).unwrap_or_default();
    raw.trim().parse::<f64>().map_err(|_| StoreError::ParseField {
        field: field.to_string(),
        value: raw.to_string(),
    })
}

/// Writes through a uniquely named temp file in the target directory, so concurrent
/// writers of the same path never share a temp file; the last rename wins.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path
        .parent()
        .ok_or_else(|| StoreError::InvalidPath(path.display().to_string()))?;
    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| StoreError::Io(err.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn csv_store_round_trips_nan_and_rejects_escaping_paths() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let store = CsvDirBlockStore::new(dir.path());
        let block = Block::new(
            vec![1.0, 2.5],
            vec![
                Column::new("bid", vec![100.0, f64::NAN]),
                Column::new("ask", vec![101.0, 102.25]),
            ],
        )
        .unwrap();

        store.store("l2/BTC/2024-01-01/0-10.csv", &block).unwrap();
        assert!(store.contains("l2/BTC/2024-01-01/0-10.csv"));
        assert_eq!(
            fs::read_dir(dir.path().join("l2/BTC/2024-01-01")).unwrap().count(),
            1
        );

        let loaded = store.load("l2/BTC/2024-01-01/0-10.csv").unwrap();
        assert_eq!(loaded.timestamps(), &[1.0, 2.5]);
        assert_eq!(loaded.column("ask").unwrap(), &[101.0, 102.25]);
        assert!(loaded.column("bid").unwrap()[1].is_nan());

        assert!(matches!(
            store.load("../outside.csv"),
            Err(StoreError::InvalidPath(_))
        ));
        assert!(matches!(
            store.load("missing.csv"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn concurrent_writers_of_one_path_all_succeed() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let store = Arc::new(CsvDirBlockStore::new(dir.path()));
        let block = Block::new(vec![1.0, 2.0], vec![Column::new("v", vec![3.0, 4.0])]).unwrap();

        for _ in 0..20 {
            let writers: Vec<_> = (0..4)
                .map(|_| {
                    let store = Arc::clone(&store);
                    let block = block.clone();
                    thread::spawn(move || store.store("features/x/0-10.csv", &block))
                })
                .collect();
            for writer in writers {
                writer
                    .join()
                    .expect("writer thread should not panic")
                    .expect("every concurrent write should succeed");
            }
        }

        assert_eq!(store.load("features/x/0-10.csv").unwrap(), block);
        let leftovers: Vec<_> = fs::read_dir(dir.path().join("features/x"))
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name() != "0-10.csv")
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn csv_store_requires_timestamp_header() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        fs::write(dir.path().join("bad.csv"), "ts,bid\n1,2\n").unwrap();
        let store = CsvDirBlockStore::new(dir.path());
        assert!(matches!(
            store.load("bad.csv"),
            Err(StoreError::MissingTimestampColumn(_))
        ));
    }

    #[test]
    fn in_memory_store_reports_missing_paths() {
        let store = InMemoryBlockStore::new().with_block("a", Block::default());
        assert!(store.contains("a"));
        assert!(store.load("a").unwrap().is_empty());
        assert!(matches!(store.load("b"), Err(StoreError::NotFound(_))));
    }
}
