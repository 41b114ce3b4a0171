//! JSONL-based storage implementation with in-memory caching.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Serialize, de::DeserializeOwned};

use super::traits::{Filter, HasId, Storage};
use crate::error::{CodeloopError, Result};

type Cache = HashMap<String, Vec<serde_json::Value>>;

/// JSONL-based storage with in-memory caching.
///
/// Each collection is one `<collection>.jsonl` file holding one record per line.
/// Every mutation hits the file before the call returns.
pub struct JsonlStorage {
    base_path: PathBuf,
    cache: RwLock<Cache>,
}

impl std::fmt::Debug for JsonlStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonlStorage")
            .field("base_path", &self.base_path)
            .finish_non_exhaustive()
    }
}

fn record_id(record: &serde_json::Value) -> Option<&str> {
    record.get("id").and_then(|v| v.as_str())
}

fn poisoned<E: std::fmt::Display>(e: E) -> CodeloopError {
    CodeloopError::Storage(e.to_string())
}

impl JsonlStorage {
    /// Create a new JsonlStorage at the given path.
    pub fn new(base_path: impl AsRef<Path>) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;
        Ok(Self {
            base_path,
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Directory holding the collection files.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Get the file path for a collection.
    fn collection_path(&self, collection: &str) -> PathBuf {
        self.base_path.join(format!("{}.jsonl", collection))
    }

    /// Load a collection into cache if not already loaded.
    fn ensure_loaded(&self, collection: &str) -> Result<()> {
        {
            let cache = self.cache.read().map_err(poisoned)?;
            if cache.contains_key(collection) {
                return Ok(());
            }
        }

        let mut cache = self.cache.write().map_err(poisoned)?;
        if cache.contains_key(collection) {
            return Ok(());
        }

        let path = self.collection_path(collection);
        let mut records = Vec::new();
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for line in reader.lines() {
                let line = line?;
                if !line.trim().is_empty() {
                    records.push(serde_json::from_str(&line)?);
                }
            }
        }

        cache.insert(collection.to_string(), records);
        Ok(())
    }

    /// Append a record to the JSONL file.
    fn append_to_file(&self, collection: &str, record: &serde_json::Value) -> Result<()> {
        let path = self.collection_path(collection);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{}", serde_json::to_string(record)?)?;
        Ok(())
    }

    /// Rewrite the entire collection file. Caller holds the cache write lock.
    fn rewrite_file(&self, collection: &str, records: &[serde_json::Value]) -> Result<()> {
        let path = self.collection_path(collection);
        let tmp = path.with_extension("jsonl.tmp");
        {
            let mut file = File::create(&tmp)?;
            for record in records {
                writeln!(file, "{}", serde_json::to_string(record)?)?;
            }
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Run `f` against a loaded collection under the write lock.
    fn with_collection_mut<R>(
        &self,
        collection: &str,
        f: impl FnOnce(&mut Vec<serde_json::Value>) -> Result<R>,
    ) -> Result<R> {
        self.ensure_loaded(collection)?;
        let mut cache = self.cache.write().map_err(poisoned)?;
        let records = cache
            .get_mut(collection)
            .ok_or_else(|| CodeloopError::Storage(format!("Collection not loaded: {}", collection)))?;
        f(records)
    }
}

impl Storage for JsonlStorage {
    fn create<T: Serialize + DeserializeOwned + HasId>(&self, collection: &str, record: &T) -> Result<()> {
        let value = serde_json::to_value(record)?;
        self.with_collection_mut(collection, |records| {
            if records.iter().any(|r| record_id(r) == Some(record.id())) {
                return Err(CodeloopError::Storage(format!(
                    "Duplicate id in {}: {}",
                    collection,
                    record.id()
                )));
            }
            // Append to file first (source of truth)
            self.append_to_file(collection, &value)?;
            records.push(value);
            Ok(())
        })
    }

    fn get<T: DeserializeOwned>(&self, collection: &str, id: &str) -> Result<Option<T>> {
        self.ensure_loaded(collection)?;

        let cache = self.cache.read().map_err(poisoned)?;
        let records = cache
            .get(collection)
            .ok_or_else(|| CodeloopError::Storage(format!("Collection not loaded: {}", collection)))?;

        match records.iter().find(|r| record_id(r) == Some(id)) {
            Some(record) => Ok(Some(serde_json::from_value(record.clone())?)),
            None => Ok(None),
        }
    }

    fn update<T: Serialize + DeserializeOwned + HasId>(&self, collection: &str, record: &T) -> Result<()> {
        let value = serde_json::to_value(record)?;
        self.with_collection_mut(collection, |records| {
            let idx = records
                .iter()
                .position(|r| record_id(r) == Some(record.id()))
                .ok_or_else(|| CodeloopError::Storage(format!("Record not found in {}: {}", collection, record.id())))?;
            let previous = std::mem::replace(&mut records[idx], value);
            if let Err(e) = self.rewrite_file(collection, records) {
                // Keep the cache consistent with what is on disk.
                records[idx] = previous;
                return Err(e);
            }
            Ok(())
        })
    }

    fn upsert<T: Serialize + DeserializeOwned + HasId>(&self, collection: &str, record: &T) -> Result<()> {
        let value = serde_json::to_value(record)?;
        self.with_collection_mut(collection, |records| {
            match records.iter().position(|r| record_id(r) == Some(record.id())) {
                Some(idx) => {
                    records[idx] = value;
                    self.rewrite_file(collection, records)
                }
                None => {
                    self.append_to_file(collection, &value)?;
                    records.push(value);
                    Ok(())
                }
            }
        })
    }

    fn delete(&self, collection: &str, id: &str) -> Result<()> {
        self.with_collection_mut(collection, |records| {
            let original_len = records.len();
            records.retain(|r| record_id(r) != Some(id));

            if records.len() == original_len {
                return Err(CodeloopError::Storage(format!("Record not found in {}: {}", collection, id)));
            }
            self.rewrite_file(collection, records)
        })
    }

    fn query<T: DeserializeOwned>(&self, collection: &str, filters: &[Filter]) -> Result<Vec<T>> {
        self.ensure_loaded(collection)?;

        let cache = self.cache.read().map_err(poisoned)?;
        let records = cache
            .get(collection)
            .ok_or_else(|| CodeloopError::Storage(format!("Collection not loaded: {}", collection)))?;

        let mut results = Vec::new();
        for record in records {
            if filters.iter().all(|f| f.matches(record)) {
                results.push(serde_json::from_value(record.clone())?);
            }
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Row {
        id: String,
        session_id: String,
        status: String,
    }

    impl HasId for Row {
        fn id(&self) -> &str {
            &self.id
        }
    }

    fn row(id: &str, session_id: &str, status: &str) -> Row {
        Row {
            id: id.to_string(),
            session_id: session_id.to_string(),
            status: status.to_string(),
        }
    }

    fn create_test_storage() -> (JsonlStorage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = JsonlStorage::new(temp_dir.path()).unwrap();
        (storage, temp_dir)
    }

    #[test]
    fn test_create_and_get() {
        let (storage, _temp) = create_test_storage();
        let record = row("1", "s1", "created");

        storage.create("rows", &record).unwrap();
        let retrieved: Option<Row> = storage.get("rows", "1").unwrap();

        assert_eq!(retrieved, Some(record));
    }

    #[test]
    fn test_create_duplicate_rejected() {
        let (storage, _temp) = create_test_storage();
        storage.create("rows", &row("1", "s1", "created")).unwrap();
        assert!(storage.create("rows", &row("1", "s1", "created")).is_err());
    }

    #[test]
    fn test_update() {
        let (storage, _temp) = create_test_storage();
        storage.create("rows", &row("1", "s1", "created")).unwrap();

        let updated = row("1", "s1", "delegated");
        storage.update("rows", &updated).unwrap();

        let retrieved: Option<Row> = storage.get("rows", "1").unwrap();
        assert_eq!(retrieved, Some(updated));
    }

    #[test]
    fn test_update_not_found() {
        let (storage, _temp) = create_test_storage();
        assert!(storage.update("rows", &row("1", "s1", "created")).is_err());
    }

    #[test]
    fn test_upsert_creates_then_replaces() {
        let (storage, _temp) = create_test_storage();
        storage.upsert("rows", &row("1", "s1", "created")).unwrap();
        storage.upsert("rows", &row("1", "s1", "executed")).unwrap();

        let all: Vec<Row> = storage.list("rows").unwrap();
        assert_eq!(all, vec![row("1", "s1", "executed")]);
    }

    #[test]
    fn test_delete() {
        let (storage, _temp) = create_test_storage();
        storage.create("rows", &row("1", "s1", "created")).unwrap();
        storage.delete("rows", "1").unwrap();

        let retrieved: Option<Row> = storage.get("rows", "1").unwrap();
        assert_eq!(retrieved, None);
        assert!(storage.delete("rows", "1").is_err());
    }

    #[test]
    fn test_query_with_filters() {
        let (storage, _temp) = create_test_storage();
        storage.create("rows", &row("1", "s1", "created")).unwrap();
        storage.create("rows", &row("2", "s2", "created")).unwrap();
        storage.create("rows", &row("3", "s1", "consumed")).unwrap();

        let s1: Vec<Row> = storage.query("rows", &[Filter::eq("session_id", "s1")]).unwrap();
        assert_eq!(s1.len(), 2);

        let open: Vec<Row> = storage
            .query(
                "rows",
                &[Filter::eq("session_id", "s1"), Filter::one_of("status", &["created", "delegated"])],
            )
            .unwrap();
        assert_eq!(open, vec![row("1", "s1", "created")]);
    }

    #[test]
    fn test_persistence_across_instances() {
        let temp_dir = TempDir::new().unwrap();

        {
            let storage = JsonlStorage::new(temp_dir.path()).unwrap();
            storage.create("rows", &row("1", "s1", "created")).unwrap();
            storage.update("rows", &row("1", "s1", "delegated")).unwrap();
        }

        {
            let storage = JsonlStorage::new(temp_dir.path()).unwrap();
            let retrieved: Option<Row> = storage.get("rows", "1").unwrap();
            assert_eq!(retrieved.unwrap().status, "delegated");
        }
    }

    #[test]
    fn test_empty_collection() {
        let (storage, _temp) = create_test_storage();
        let all: Vec<Row> = storage.list("empty").unwrap();
        assert!(all.is_empty());
    }

    #[test]
    fn test_multiple_collections() {
        let (storage, _temp) = create_test_storage();
        storage.create("collection_a", &row("1", "in_a", "created")).unwrap();
        storage.create("collection_b", &row("1", "in_b", "created")).unwrap();

        let a: Option<Row> = storage.get("collection_a", "1").unwrap();
        let b: Option<Row> = storage.get("collection_b", "1").unwrap();

        assert_eq!(a.unwrap().session_id, "in_a");
        assert_eq!(b.unwrap().session_id, "in_b");
    }
}
