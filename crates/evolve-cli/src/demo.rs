//! Built-in demo manifest.
//!
//! A small user directory that exercises every migration kind: schema
//! creation, an additive field, a resumable backfill with an inverse, and an
//! in-place rewrite protected by a snapshot.

use std::sync::Arc;

use evolve_core::migration::{
    CollectionSource, DataOperations, MigrationBuilder, MigrationError, MigrationUnit, Mutation,
    SchemaOperations, SourceItem, TransformOutcome,
};
use evolve_core::storage::{FieldDef, FieldKind, SchemaStatement, StorageEngine};
use serde_json::json;

/// Collection the demo migrations operate on.
pub const USERS: &str = "users";

/// The demo migrations, in declaration order.
pub fn manifest(storage: &Arc<StorageEngine>) -> Result<Vec<MigrationUnit>, MigrationError> {
    let create_users = MigrationBuilder::new("001_create_users", "Create users")
        .description("Create the users collection")
        .version("1.0.0")
        .author("evolve")
        .created_at(1_700_000_000_000_000)
        .schema(
            vec![SchemaStatement::CreateCollection {
                name: USERS.into(),
                fields: vec![
                    FieldDef::new("name", FieldKind::String),
                    FieldDef::new("email", FieldKind::String),
                ],
            }],
            vec![SchemaStatement::DropCollection { name: USERS.into() }],
        )
        .build()?;

    let display_name = MigrationBuilder::new("002_display_name", "Add and backfill display name")
        .description("Add users.display_name and derive it from the full name")
        .version("1.1.0")
        .author("evolve")
        .created_at(1_700_000_100_000_000)
        .depends_on("001_create_users")
        .hybrid(
            SchemaOperations::new(
                vec![SchemaStatement::AddField {
                    collection: USERS.into(),
                    field: FieldDef::optional("display_name", FieldKind::String),
                }],
                vec![SchemaStatement::DropField {
                    collection: USERS.into(),
                    field: "display_name".into(),
                }],
            ),
            DataOperations::new(CollectionSource::new(storage.clone(), USERS), derive_display_name)
                .with_inverse(clear_display_name)
                .with_parallel_safe(true),
        )
        .build()?;

    let normalize_emails = MigrationBuilder::new("003_normalize_emails", "Normalize emails")
        .description("Lower-case and trim every email address")
        .version("1.2.0")
        .author("evolve")
        .created_at(1_700_000_200_000_000)
        .depends_on("001_create_users")
        .data(
            DataOperations::new(CollectionSource::new(storage.clone(), USERS), normalize_email)
                .with_snapshot([USERS]),
        )
        .build()?;

    Ok(vec![create_users, display_name, normalize_emails])
}

/// Insert `count` demo users. The users collection must exist.
pub fn seed(storage: &StorageEngine, count: usize) -> Result<usize, MigrationError> {
    if storage.collection(USERS)?.is_none() {
        return Err(evolve_core::Error::Schema(format!(
            "collection '{}' does not exist; run 001_create_users first",
            USERS
        ))
        .into());
    }
    for i in 0..count {
        let user = json!({
            "name": format!("user number {}", i),
            "email": if i % 17 == 0 {
                format!("  User{}@Example.COM ", i)
            } else {
                format!("user{}@example.com", i)
            },
        });
        storage.insert_record(USERS, &format!("user-{:06}", i), &user)?;
    }
    Ok(count)
}

fn derive_display_name(item: &SourceItem) -> TransformOutcome {
    let Some(name) = item.value.get("name").and_then(|v| v.as_str()) else {
        return TransformOutcome::Fail("user has no name".to_string());
    };
    if item.value.get("display_name").is_some() {
        return TransformOutcome::Skip;
    }
    let display: Vec<String> = name
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect();

    let mut value = item.value.clone();
    value["display_name"] = json!(display.join(" "));
    TransformOutcome::Apply(Mutation::upsert(USERS, item.key.clone(), value))
}

fn clear_display_name(item: &SourceItem) -> TransformOutcome {
    let mut value = item.value.clone();
    match value.as_object_mut() {
        Some(fields) => {
            fields.remove("display_name");
        }
        None => return TransformOutcome::Skip,
    }
    TransformOutcome::Apply(Mutation::upsert(USERS, item.key.clone(), value))
}

fn normalize_email(item: &SourceItem) -> TransformOutcome {
    let Some(email) = item.value.get("email").and_then(|v| v.as_str()) else {
        return TransformOutcome::Fail("user has no email".to_string());
    };
    let normalized = email.trim().to_lowercase();
    if !normalized.contains('@') {
        return TransformOutcome::Fail(format!("malformed email '{}'", email));
    }
    if normalized == email {
        return TransformOutcome::Skip;
    }
    let mut value = item.value.clone();
    value["email"] = json!(normalized);
    TransformOutcome::Apply(Mutation::upsert(USERS, item.key.clone(), value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use evolve_core::migration::{ExecutionConfig, HistoryStatus, MigrationEngine, MigrationRegistry};
    use evolve_core::storage::StorageConfig;

    fn open() -> (Arc<StorageEngine>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageEngine::open(StorageConfig::new(dir.path())).unwrap();
        (Arc::new(storage), dir)
    }

    #[test]
    fn test_display_name_is_title_cased() {
        let item = SourceItem::new("user-000001", json!({ "name": "ada lovelace" }));
        match derive_display_name(&item) {
            TransformOutcome::Apply(Mutation::Upsert { value, .. }) => {
                assert_eq!(value["display_name"], json!("Ada Lovelace"));
            }
            _ => panic!("expected an upsert"),
        }
    }

    #[test]
    fn test_normalized_email_is_skipped() {
        let item = SourceItem::new("user-000001", json!({ "email": "a@b.c" }));
        assert!(matches!(normalize_email(&item), TransformOutcome::Skip));
        let item = SourceItem::new("user-000002", json!({ "email": "nobody" }));
        assert!(matches!(normalize_email(&item), TransformOutcome::Fail(_)));
    }

    #[test]
    fn test_seed_requires_collection() {
        let (storage, _dir) = open();
        assert!(seed(&storage, 3).is_err());
    }

    #[test]
    fn test_manifest_runs_end_to_end() {
        let (storage, _dir) = open();
        let registry = MigrationRegistry::from_manifest(manifest(&storage).unwrap()).unwrap();
        let engine = MigrationEngine::new(storage.clone(), registry);
        let config = ExecutionConfig::default().with_batch_size(16);

        engine.execute("001_create_users", &config).unwrap();
        seed(&storage, 40).unwrap();
        let records = engine.execute_all(None, &config).unwrap();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.status == HistoryStatus::Succeeded));

        let emails = engine.latest_record("003_normalize_emails").unwrap().unwrap();
        // Users 0, 17 and 34 carry untidy emails
        assert_eq!(emails.items_processed, 3);
        assert_eq!(emails.items_skipped, 37);

        engine.rollback("003_normalize_emails").unwrap();
        let user = storage.get_record(USERS, "user-000017").unwrap().unwrap();
        assert_eq!(user["email"], json!("  User17@Example.COM "));
    }
}
