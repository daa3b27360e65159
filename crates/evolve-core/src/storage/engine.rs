//! Storage engine implementation.

use std::ops::Bound;

use super::key::{collection_prefix, record_key, SEPARATOR};
use super::schema::CollectionDef;
use super::{StorageConfig, Transaction};
use crate::error::Error;
use sled::{Db, IVec, Tree};

/// Tree name for record payloads.
const RECORDS_TREE: &str = "records";

/// Tree name for the schema catalog.
const SCHEMA_TREE: &str = "schema";

/// Tree name for migration metadata (history, checkpoints, lineage, locks).
const META_TREE: &str = "migration:meta";

/// The target store wrapping sled.
///
/// Records live in a single tree keyed by `collection\0key`, which keeps the
/// set of trees fixed so that every unit of work can span records, catalog
/// and migration metadata in one atomic sled transaction.
#[derive(Debug)]
pub struct StorageEngine {
    /// The underlying sled database.
    db: Db,

    /// Tree for record payloads.
    records: Tree,

    /// Tree for collection definitions.
    schema: Tree,

    /// Tree for migration metadata.
    meta: Tree,
}

impl StorageEngine {
    /// Open or create a storage engine with the given configuration.
    pub fn open(config: StorageConfig) -> Result<Self, Error> {
        let db = config.to_sled_config().open()?;
        let records = db.open_tree(RECORDS_TREE)?;
        let schema = db.open_tree(SCHEMA_TREE)?;
        let meta = db.open_tree(META_TREE)?;

        Ok(Self {
            db,
            records,
            schema,
            meta,
        })
    }

    /// Check if the database was recovered from a previous crash.
    pub fn was_recovered(&self) -> bool {
        self.db.was_recovered()
    }

    /// Begin a unit of work.
    pub fn begin(&self) -> Transaction<'_> {
        Transaction::new(self)
    }

    /// Get a collection definition.
    pub fn collection(&self, name: &str) -> Result<Option<CollectionDef>, Error> {
        match self.schema.get(name.as_bytes())? {
            Some(bytes) => Ok(Some(CollectionDef::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// List every collection definition, ordered by name.
    pub fn collections(&self) -> Result<Vec<CollectionDef>, Error> {
        let mut defs = Vec::new();
        for result in self.schema.iter() {
            let (_, value) = result?;
            defs.push(CollectionDef::from_bytes(&value)?);
        }
        Ok(defs)
    }

    /// Get a record payload.
    pub fn get_record(
        &self,
        collection: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, Error> {
        match self.records.get(record_key(collection, key))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Scan records of a collection in key order, strictly after `after`.
    ///
    /// Resumption is keyed, not positional: items inserted or removed before
    /// the cursor between two calls do not shift the next page.
    pub fn scan_records(
        &self,
        collection: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, serde_json::Value)>, Error> {
        let prefix = collection_prefix(collection);
        let start = match after {
            Some(key) => Bound::Excluded(record_key(collection, key)),
            None => Bound::Included(prefix.clone()),
        };
        let mut end = collection.as_bytes().to_vec();
        end.push(SEPARATOR + 1);

        let mut items = Vec::with_capacity(limit.min(1024));
        for result in self.records.range((start, Bound::Excluded(end))) {
            if items.len() >= limit {
                break;
            }
            let (key, value) = result?;
            let item_key = std::str::from_utf8(&key[prefix.len()..])
                .map_err(|_| Error::InvalidKey)?
                .to_string();
            items.push((item_key, serde_json::from_slice(&value)?));
        }
        Ok(items)
    }

    /// Count the records of a collection.
    pub fn count_records(&self, collection: &str) -> Result<u64, Error> {
        let mut count = 0;
        for key in self.record_keys(collection) {
            key?;
            count += 1;
        }
        Ok(count)
    }

    /// Write a single record in its own transaction.
    pub fn insert_record(
        &self,
        collection: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), Error> {
        let mut tx = self.begin();
        tx.put_record(collection, key, value)?;
        tx.commit()
    }

    /// Content fingerprint of the whole schema catalog.
    pub fn schema_fingerprint(&self) -> Result<String, Error> {
        fingerprint(self.schema.iter())
    }

    /// Content fingerprint of every record in a collection.
    pub fn collection_fingerprint(&self, collection: &str) -> Result<String, Error> {
        fingerprint(self.records.scan_prefix(collection_prefix(collection)))
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> Result<(), Error> {
        self.db.flush()?;
        Ok(())
    }

    /// Iterate the encoded keys of a collection's records.
    pub(crate) fn record_keys(
        &self,
        collection: &str,
    ) -> impl Iterator<Item = Result<Vec<u8>, Error>> + '_ {
        self.records
            .scan_prefix(collection_prefix(collection))
            .keys()
            .map(|result| result.map(|k| k.to_vec()).map_err(Error::from))
    }

    /// Read a metadata entry.
    pub(crate) fn meta_get(&self, key: &[u8]) -> Result<Option<IVec>, Error> {
        Ok(self.meta.get(key)?)
    }

    /// Scan metadata entries sharing a prefix, in key order.
    pub(crate) fn meta_scan_prefix(
        &self,
        prefix: &[u8],
    ) -> impl Iterator<Item = Result<(IVec, IVec), Error>> + '_ {
        self.meta.scan_prefix(prefix).map(|r| r.map_err(Error::from))
    }

    /// Scan metadata entries with keys in `(after, prefix end)`.
    pub(crate) fn meta_scan_after(
        &self,
        prefix: &[u8],
        after: Option<&[u8]>,
    ) -> impl Iterator<Item = Result<(IVec, IVec), Error>> + '_ {
        let start = match after {
            Some(key) => Bound::Excluded(key.to_vec()),
            None => Bound::Included(prefix.to_vec()),
        };
        let owned_prefix = prefix.to_vec();
        self.meta
            .range((start, Bound::Unbounded))
            .take_while(move |r| match r {
                Ok((k, _)) => k.starts_with(&owned_prefix),
                Err(_) => true,
            })
            .map(|r| r.map_err(Error::from))
    }

    /// Write a metadata entry outside of a transaction.
    pub(crate) fn meta_insert(&self, key: &[u8], value: Vec<u8>) -> Result<(), Error> {
        self.meta.insert(key, value)?;
        Ok(())
    }

    /// Remove a metadata entry outside of a transaction.
    pub(crate) fn meta_remove(&self, key: &[u8]) -> Result<(), Error> {
        self.meta.remove(key)?;
        Ok(())
    }

    /// Atomically replace a metadata entry if it still holds `old`.
    ///
    /// Returns `false` when the current value differs.
    pub(crate) fn meta_compare_and_swap(
        &self,
        key: &[u8],
        old: Option<&[u8]>,
        new: Option<Vec<u8>>,
    ) -> Result<bool, Error> {
        Ok(self.meta.compare_and_swap(key, old, new)?.is_ok())
    }

    pub(crate) fn records_tree(&self) -> &Tree {
        &self.records
    }

    pub(crate) fn schema_tree(&self) -> &Tree {
        &self.schema
    }

    pub(crate) fn meta_tree(&self) -> &Tree {
        &self.meta
    }
}

fn fingerprint(iter: sled::Iter) -> Result<String, Error> {
    let mut hasher = blake3::Hasher::new();
    for result in iter {
        let (key, value) = result?;
        hasher.update(&(key.len() as u64).to_be_bytes());
        hasher.update(&key);
        hasher.update(&(value.len() as u64).to_be_bytes());
        hasher.update(&value);
    }
    Ok(hex::encode(hasher.finalize().as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema::{FieldDef, FieldKind, SchemaStatement};
    use serde_json::json;
    use tempfile::tempdir;

    fn engine_with_documents() -> StorageEngine {
        let engine = StorageEngine::open(StorageConfig::temporary()).unwrap();
        let mut tx = engine.begin();
        tx.execute(&SchemaStatement::CreateCollection {
            name: "documents".into(),
            fields: vec![FieldDef::new("title", FieldKind::String)],
        })
        .unwrap();
        tx.commit().unwrap();
        engine
    }

    #[test]
    fn test_open_close_reopen() {
        let dir = tempdir().unwrap();
        {
            let engine = StorageEngine::open(StorageConfig::new(dir.path())).unwrap();
            let mut tx = engine.begin();
            tx.execute(&SchemaStatement::CreateCollection {
                name: "documents".into(),
                fields: vec![],
            })
            .unwrap();
            tx.commit().unwrap();
            engine.insert_record("documents", "a", &json!({"n": 1})).unwrap();
            engine.flush().unwrap();
        }
        let engine = StorageEngine::open(StorageConfig::new(dir.path())).unwrap();
        assert_eq!(engine.get_record("documents", "a").unwrap(), Some(json!({"n": 1})));
    }

    #[test]
    fn test_scan_records_cursor() {
        let engine = engine_with_documents();
        for i in 0..10 {
            engine
                .insert_record("documents", &format!("doc-{:02}", i), &json!({ "i": i }))
                .unwrap();
        }

        let first = engine.scan_records("documents", None, 4).unwrap();
        assert_eq!(first.len(), 4);
        assert_eq!(first[0].0, "doc-00");

        let next = engine
            .scan_records("documents", Some(&first[3].0), 4)
            .unwrap();
        assert_eq!(next[0].0, "doc-04");

        let tail = engine.scan_records("documents", Some("doc-08"), 4).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].0, "doc-09");
    }

    #[test]
    fn test_scan_does_not_cross_collections() {
        let engine = engine_with_documents();
        let mut tx = engine.begin();
        tx.execute(&SchemaStatement::CreateCollection {
            name: "documents_archive".into(),
            fields: vec![],
        })
        .unwrap();
        tx.commit().unwrap();

        engine.insert_record("documents", "a", &json!(1)).unwrap();
        engine.insert_record("documents_archive", "a", &json!(2)).unwrap();

        let items = engine.scan_records("documents", None, 100).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(engine.count_records("documents_archive").unwrap(), 1);
    }

    #[test]
    fn test_fingerprints_track_content() {
        let engine = engine_with_documents();
        let empty = engine.collection_fingerprint("documents").unwrap();
        engine.insert_record("documents", "a", &json!({"t": "x"})).unwrap();
        let one = engine.collection_fingerprint("documents").unwrap();
        assert_ne!(empty, one);

        let mut tx = engine.begin();
        tx.delete_record("documents", "a").unwrap();
        tx.commit().unwrap();
        assert_eq!(engine.collection_fingerprint("documents").unwrap(), empty);
    }

    #[test]
    fn test_meta_compare_and_swap() {
        let engine = engine_with_documents();
        assert!(engine.meta_compare_and_swap(b"lock:a", None, Some(vec![1])).unwrap());
        assert!(!engine.meta_compare_and_swap(b"lock:a", None, Some(vec![2])).unwrap());
        assert!(engine
            .meta_compare_and_swap(b"lock:a", Some(&[1u8][..]), None)
            .unwrap());
        assert!(engine.meta_get(b"lock:a").unwrap().is_none());
    }

    #[test]
    fn test_meta_scan_after() {
        let engine = engine_with_documents();
        for k in [&b"p:a"[..], &b"p:b"[..], &b"p:c"[..], &b"q:a"[..]] {
            engine.meta_insert(k, vec![0]).unwrap();
        }
        let keys: Vec<Vec<u8>> = engine
            .meta_scan_after(b"p:", Some(b"p:a"))
            .map(|r| r.unwrap().0.to_vec())
            .collect();
        assert_eq!(keys, vec![b"p:b".to_vec(), b"p:c".to_vec()]);
    }
}
