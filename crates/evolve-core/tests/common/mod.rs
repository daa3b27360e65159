//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use evolve_core::migration::{
    MigrationEngine, MigrationRegistry, MigrationUnit, SourceItem, Transform, TransformOutcome,
};
use evolve_core::storage::{FieldDef, FieldKind, SchemaStatement, StorageConfig, StorageEngine};
use serde_json::{json, Value};

pub struct TestContext {
    pub storage: Arc<StorageEngine>,
    _dir: tempfile::TempDir,
}

impl TestContext {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageEngine::open(StorageConfig::new(dir.path())).unwrap();
        Self {
            storage: Arc::new(storage),
            _dir: dir,
        }
    }

    /// Create `documents` with `n` records `doc-00000..` carrying `{"n": i}`.
    pub fn with_documents(n: usize) -> Self {
        let ctx = Self::new();
        let mut tx = ctx.storage.begin();
        tx.execute(&create_documents()).unwrap();
        tx.commit().unwrap();
        for i in 0..n {
            ctx.storage
                .insert_record("documents", &doc_key(i), &json!({ "n": i }))
                .unwrap();
        }
        ctx
    }

    pub fn engine(&self, units: Vec<MigrationUnit>) -> MigrationEngine {
        MigrationEngine::new(self.storage.clone(), MigrationRegistry::from_manifest(units).unwrap())
    }

    pub fn documents(&self) -> HashMap<String, Value> {
        self.storage
            .scan_records("documents", None, usize::MAX)
            .unwrap()
            .into_iter()
            .collect()
    }
}

pub fn doc_key(i: usize) -> String {
    format!("doc-{:05}", i)
}

pub fn create_documents() -> SchemaStatement {
    SchemaStatement::CreateCollection {
        name: "documents".into(),
        fields: vec![FieldDef::new("n", FieldKind::Int)],
    }
}

pub fn add_field(collection: &str, field: &str) -> SchemaStatement {
    SchemaStatement::AddField {
        collection: collection.into(),
        field: FieldDef::optional(field, FieldKind::String),
    }
}

pub fn drop_field(collection: &str, field: &str) -> SchemaStatement {
    SchemaStatement::DropField {
        collection: collection.into(),
        field: field.into(),
    }
}

pub fn create_collection(name: &str) -> SchemaStatement {
    SchemaStatement::CreateCollection {
        name: name.into(),
        fields: Vec::new(),
    }
}

pub fn drop_collection(name: &str) -> SchemaStatement {
    SchemaStatement::DropCollection { name: name.into() }
}

pub fn n_of(item: &SourceItem) -> u64 {
    item.value["n"].as_u64().unwrap_or(0)
}

/// Adds `"tagged": true` to every document.
pub fn tag(item: &SourceItem) -> TransformOutcome {
    let mut value = item.value.clone();
    value["tagged"] = json!(true);
    TransformOutcome::Apply(evolve_core::migration::Mutation::upsert(
        "documents",
        item.key.clone(),
        value,
    ))
}

/// Removes the `tagged` field again.
pub fn untag(item: &SourceItem) -> TransformOutcome {
    let mut value = item.value.clone();
    if let Some(fields) = value.as_object_mut() {
        fields.remove("tagged");
    }
    TransformOutcome::Apply(evolve_core::migration::Mutation::upsert(
        "documents",
        item.key.clone(),
        value,
    ))
}

/// Shared state of a [`Tripwire`] transform.
#[derive(Default)]
pub struct TripwireState {
    pub calls: AtomicUsize,
    pub armed: AtomicBool,
    pub trigger: parking_lot::Mutex<Option<String>>,
}

impl TripwireState {
    pub fn arm(&self, key: impl Into<String>) {
        *self.trigger.lock() = Some(key.into());
        self.armed.store(true, Ordering::SeqCst);
    }

    pub fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.calls.store(0, Ordering::SeqCst);
    }

    fn triggered(&self, key: &str) -> bool {
        self.armed.load(Ordering::SeqCst) && self.trigger.lock().as_deref() == Some(key)
    }
}

/// What a [`Tripwire`] does when its trigger key comes up.
#[derive(Clone, Copy)]
pub enum TripwireAction {
    Panic,
    Fail,
}

/// Wraps a transform, counting calls and misbehaving on an armed key.
pub struct Tripwire {
    pub state: Arc<TripwireState>,
    pub action: TripwireAction,
    pub inner: fn(&SourceItem) -> TransformOutcome,
}

impl Tripwire {
    pub fn new(
        state: Arc<TripwireState>,
        action: TripwireAction,
        inner: fn(&SourceItem) -> TransformOutcome,
    ) -> Self {
        Self {
            state,
            action,
            inner,
        }
    }
}

impl Transform for Tripwire {
    fn apply(&self, item: &SourceItem) -> TransformOutcome {
        if self.state.triggered(&item.key) {
            match self.action {
                TripwireAction::Panic => panic!("simulated crash at {}", item.key),
                TripwireAction::Fail => {
                    return TransformOutcome::Fail(format!("refused {}", item.key))
                }
            }
        }
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        (self.inner)(item)
    }
}
