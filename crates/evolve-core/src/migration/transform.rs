//! Item sources and per-item transforms for data migrations.
//!
//! A source yields candidate items in a stable key order and resumes from the
//! last key it returned. A transform maps one item to a mutation, a skip, or a
//! failure. Both are pure from the engine's point of view: the engine decides
//! how results are batched and committed.

use std::fmt;
use std::sync::Arc;

use crate::error::Error;
use crate::storage::StorageEngine;
use serde_json::Value;

/// A candidate item produced by an [`ItemSource`].
#[derive(Debug, Clone, PartialEq)]
pub struct SourceItem {
    /// Stable, unique key. Cursors are resumed from this value.
    pub key: String,
    /// Current payload.
    pub value: Value,
}

impl SourceItem {
    /// Create a new source item.
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// A write produced by a transform.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Insert or replace a record.
    Upsert {
        /// Target collection.
        collection: String,
        /// Record key.
        key: String,
        /// New payload.
        value: Value,
    },
    /// Delete a record.
    Delete {
        /// Target collection.
        collection: String,
        /// Record key.
        key: String,
    },
}

impl Mutation {
    /// Build an upsert.
    pub fn upsert(collection: impl Into<String>, key: impl Into<String>, value: Value) -> Self {
        Mutation::Upsert {
            collection: collection.into(),
            key: key.into(),
            value,
        }
    }

    /// Build a delete.
    pub fn delete(collection: impl Into<String>, key: impl Into<String>) -> Self {
        Mutation::Delete {
            collection: collection.into(),
            key: key.into(),
        }
    }

    /// Target collection.
    pub fn collection(&self) -> &str {
        match self {
            Mutation::Upsert { collection, .. } | Mutation::Delete { collection, .. } => {
                collection
            }
        }
    }

    /// Target record key.
    pub fn key(&self) -> &str {
        match self {
            Mutation::Upsert { key, .. } | Mutation::Delete { key, .. } => key,
        }
    }
}

/// Result of transforming a single item.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformOutcome {
    /// Apply the mutation.
    Apply(Mutation),
    /// Leave the item untouched.
    Skip,
    /// The item could not be transformed.
    Fail(String),
}

/// Per-item transform.
pub trait Transform: Send + Sync {
    /// Transform one item.
    fn apply(&self, item: &SourceItem) -> TransformOutcome;
}

impl<F> Transform for F
where
    F: Fn(&SourceItem) -> TransformOutcome + Send + Sync,
{
    fn apply(&self, item: &SourceItem) -> TransformOutcome {
        self(item)
    }
}

/// Producer of candidate items for a data migration.
pub trait ItemSource: Send + Sync {
    /// Fetch up to `limit` items with keys strictly greater than `after`.
    ///
    /// Items must be returned in ascending key order. An empty result means
    /// the source is exhausted.
    fn fetch(&self, after: Option<&str>, limit: usize) -> Result<Vec<SourceItem>, Error>;

    /// Estimated number of items, if cheaply known.
    fn estimate_total(&self) -> Option<u64> {
        None
    }

    /// Stable description of the source, part of the migration checksum.
    fn describe(&self) -> String;
}

type ItemFilter = Arc<dyn Fn(&SourceItem) -> bool + Send + Sync>;

/// Source over the records of one collection, in key order.
#[derive(Clone)]
pub struct CollectionSource {
    engine: Arc<StorageEngine>,
    collection: String,
    filter: Option<(String, ItemFilter)>,
}

impl CollectionSource {
    /// Yield every record of `collection`.
    pub fn new(engine: Arc<StorageEngine>, collection: impl Into<String>) -> Self {
        Self {
            engine,
            collection: collection.into(),
            filter: None,
        }
    }

    /// Only yield records accepted by `filter`.
    ///
    /// `label` names the filter in the source description, so changing the
    /// selection of a registered migration changes its checksum.
    pub fn with_filter<F>(mut self, label: impl Into<String>, filter: F) -> Self
    where
        F: Fn(&SourceItem) -> bool + Send + Sync + 'static,
    {
        self.filter = Some((label.into(), Arc::new(filter)));
        self
    }

    /// Name of the collection being read.
    pub fn collection(&self) -> &str {
        &self.collection
    }
}

impl fmt::Debug for CollectionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionSource")
            .field("collection", &self.collection)
            .field("filter", &self.filter.as_ref().map(|(label, _)| label))
            .finish()
    }
}

impl ItemSource for CollectionSource {
    fn fetch(&self, after: Option<&str>, limit: usize) -> Result<Vec<SourceItem>, Error> {
        if self.engine.collection(&self.collection)?.is_none() {
            return Err(Error::Source(format!(
                "collection '{}' does not exist",
                self.collection
            )));
        }

        let Some((_, filter)) = &self.filter else {
            return Ok(self
                .engine
                .scan_records(&self.collection, after, limit)?
                .into_iter()
                .map(|(key, value)| SourceItem { key, value })
                .collect());
        };

        let page = limit.max(1);
        let mut cursor = after.map(str::to_string);
        let mut items = Vec::new();
        while items.len() < limit {
            let scanned = self
                .engine
                .scan_records(&self.collection, cursor.as_deref(), page)?;
            let exhausted = scanned.len() < page;
            for (key, value) in scanned {
                cursor = Some(key.clone());
                let item = SourceItem { key, value };
                if filter(&item) {
                    items.push(item);
                    if items.len() == limit {
                        break;
                    }
                }
            }
            if exhausted {
                break;
            }
        }
        Ok(items)
    }

    fn estimate_total(&self) -> Option<u64> {
        if self.filter.is_some() {
            return None;
        }
        self.engine.count_records(&self.collection).ok()
    }

    fn describe(&self) -> String {
        match &self.filter {
            Some((label, _)) => format!("collection:{}?{}", self.collection, label),
            None => format!("collection:{}", self.collection),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FieldDef, FieldKind, SchemaStatement, StorageConfig};
    use serde_json::json;

    fn engine_with(n: usize) -> Arc<StorageEngine> {
        let engine = StorageEngine::open(StorageConfig::temporary()).unwrap();
        let mut tx = engine.begin();
        tx.execute(&SchemaStatement::CreateCollection {
            name: "documents".into(),
            fields: vec![FieldDef::new("body", FieldKind::String)],
        })
        .unwrap();
        tx.commit().unwrap();
        for i in 0..n {
            engine
                .insert_record("documents", &format!("doc-{:03}", i), &json!({ "n": i }))
                .unwrap();
        }
        Arc::new(engine)
    }

    #[test]
    fn test_closure_transform() {
        let transform = |item: &SourceItem| {
            if item.value["n"].as_u64() == Some(0) {
                TransformOutcome::Skip
            } else {
                TransformOutcome::Apply(Mutation::delete("documents", item.key.clone()))
            }
        };
        let skip = SourceItem::new("a", json!({"n": 0}));
        let del = SourceItem::new("b", json!({"n": 1}));
        assert_eq!(transform.apply(&skip), TransformOutcome::Skip);
        match transform.apply(&del) {
            TransformOutcome::Apply(m) => {
                assert_eq!(m.collection(), "documents");
                assert_eq!(m.key(), "b");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_collection_source_pages() {
        let source = CollectionSource::new(engine_with(25), "documents");
        assert_eq!(source.estimate_total(), Some(25));

        let mut cursor: Option<String> = None;
        let mut seen = 0;
        loop {
            let items = source.fetch(cursor.as_deref(), 10).unwrap();
            if items.is_empty() {
                break;
            }
            seen += items.len();
            cursor = items.last().map(|i| i.key.clone());
        }
        assert_eq!(seen, 25);
    }

    #[test]
    fn test_filtered_source() {
        let source = CollectionSource::new(engine_with(30), "documents")
            .with_filter("even", |item| item.value["n"].as_u64().unwrap_or(1) % 2 == 0);
        assert_eq!(source.estimate_total(), None);
        assert_eq!(source.describe(), "collection:documents?even");

        let first = source.fetch(None, 4).unwrap();
        let keys: Vec<_> = first.iter().map(|i| i.key.as_str()).collect();
        assert_eq!(keys, vec!["doc-000", "doc-002", "doc-004", "doc-006"]);

        let rest = source.fetch(Some("doc-006"), 100).unwrap();
        assert_eq!(rest.len(), 11);
    }

    #[test]
    fn test_missing_collection_is_source_error() {
        let source = CollectionSource::new(engine_with(0), "nothing");
        assert!(matches!(source.fetch(None, 10), Err(Error::Source(_))));
    }
}
