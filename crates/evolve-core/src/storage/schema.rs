//! Schema catalog definitions and the statements that evolve them.
//!
//! Statements are applied against a single collection definition at a time,
//! which keeps them independent of any SQL dialect and lets a transaction
//! stage a whole statement list before anything is committed.

use super::key::is_valid_segment;
use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Type of a field in a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    /// UTF-8 string.
    String,
    /// 64-bit signed integer.
    Int,
    /// 64-bit float.
    Float,
    /// Boolean.
    Bool,
    /// Timestamp in microseconds since epoch.
    Timestamp,
    /// Arbitrary JSON document (classification metadata, extracted entities).
    Json,
    /// Fixed-width float vector (embeddings).
    Vector {
        /// Number of dimensions.
        dimensions: u32,
    },
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldKind::String => write!(f, "string"),
            FieldKind::Int => write!(f, "int"),
            FieldKind::Float => write!(f, "float"),
            FieldKind::Bool => write!(f, "bool"),
            FieldKind::Timestamp => write!(f, "timestamp"),
            FieldKind::Json => write!(f, "json"),
            FieldKind::Vector { dimensions } => write!(f, "vector({})", dimensions),
        }
    }
}

/// Definition of a single field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Field name.
    pub name: String,
    /// Field type.
    pub kind: FieldKind,
    /// Whether the field may be absent or null.
    pub nullable: bool,
    /// Default value for readers of records written before the field existed.
    pub default: Option<serde_json::Value>,
    /// Whether the field has a secondary index.
    pub indexed: bool,
}

impl FieldDef {
    /// Create a required field.
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            nullable: false,
            default: None,
            indexed: false,
        }
    }

    /// Create a nullable field.
    pub fn optional(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            nullable: true,
            ..Self::new(name, kind)
        }
    }

    /// Set the default value.
    pub fn with_default(mut self, value: serde_json::Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// Definition of a record collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionDef {
    /// Collection name.
    pub name: String,
    /// Fields in declaration order.
    pub fields: Vec<FieldDef>,
}

impl CollectionDef {
    /// Create an empty collection definition.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Add a field (builder style).
    pub fn with_field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    /// Look up a field by name.
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    fn field_mut(&mut self, name: &str) -> Option<&mut FieldDef> {
        self.fields.iter_mut().find(|f| f.name == name)
    }

    /// Serialize the definition.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize a definition.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// An atomic schema statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SchemaStatement {
    /// Create a new collection.
    CreateCollection {
        /// Collection name.
        name: String,
        /// Initial fields.
        fields: Vec<FieldDef>,
    },
    /// Drop a collection and all of its records.
    DropCollection {
        /// Collection name.
        name: String,
    },
    /// Add a field to a collection.
    AddField {
        /// Target collection.
        collection: String,
        /// Field to add.
        field: FieldDef,
    },
    /// Remove a field from a collection.
    DropField {
        /// Target collection.
        collection: String,
        /// Field name.
        field: String,
    },
    /// Rename a field.
    RenameField {
        /// Target collection.
        collection: String,
        /// Current name.
        from: String,
        /// New name.
        to: String,
    },
    /// Add a secondary index on a field.
    CreateIndex {
        /// Target collection.
        collection: String,
        /// Field name.
        field: String,
    },
    /// Remove a secondary index.
    DropIndex {
        /// Target collection.
        collection: String,
        /// Field name.
        field: String,
    },
}

impl SchemaStatement {
    /// Name of the collection the statement targets.
    pub fn collection(&self) -> &str {
        match self {
            SchemaStatement::CreateCollection { name, .. }
            | SchemaStatement::DropCollection { name } => name,
            SchemaStatement::AddField { collection, .. }
            | SchemaStatement::DropField { collection, .. }
            | SchemaStatement::RenameField { collection, .. }
            | SchemaStatement::CreateIndex { collection, .. }
            | SchemaStatement::DropIndex { collection, .. } => collection,
        }
    }

    /// Returns `true` if applying the statement discards stored data.
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            SchemaStatement::DropCollection { .. } | SchemaStatement::DropField { .. }
        )
    }

    /// Apply the statement to the current definition of its collection.
    ///
    /// Returns the new definition, or `None` when the collection is dropped.
    pub fn apply_to(&self, current: Option<CollectionDef>) -> Result<Option<CollectionDef>, Error> {
        match self {
            SchemaStatement::CreateCollection { name, fields } => {
                if current.is_some() {
                    return Err(Error::Schema(format!("collection '{}' already exists", name)));
                }
                if !is_valid_segment(name) {
                    return Err(Error::Schema(format!("invalid collection name {:?}", name)));
                }
                let mut def = CollectionDef::new(name.clone());
                for field in fields {
                    if def.field(&field.name).is_some() {
                        return Err(Error::Schema(format!(
                            "duplicate field '{}' in collection '{}'",
                            field.name, name
                        )));
                    }
                    def.fields.push(field.clone());
                }
                Ok(Some(def))
            }
            SchemaStatement::DropCollection { name } => match current {
                Some(_) => Ok(None),
                None => Err(Error::Schema(format!("collection '{}' does not exist", name))),
            },
            SchemaStatement::AddField { collection, field } => {
                let mut def = require(current, collection)?;
                if def.field(&field.name).is_some() {
                    return Err(Error::Schema(format!(
                        "field '{}.{}' already exists",
                        collection, field.name
                    )));
                }
                if !field.nullable && field.default.is_none() {
                    return Err(Error::Schema(format!(
                        "required field '{}.{}' needs a default",
                        collection, field.name
                    )));
                }
                def.fields.push(field.clone());
                Ok(Some(def))
            }
            SchemaStatement::DropField { collection, field } => {
                let mut def = require(current, collection)?;
                let before = def.fields.len();
                def.fields.retain(|f| &f.name != field);
                if def.fields.len() == before {
                    return Err(missing_field(collection, field));
                }
                Ok(Some(def))
            }
            SchemaStatement::RenameField {
                collection,
                from,
                to,
            } => {
                let mut def = require(current, collection)?;
                if def.field(to).is_some() {
                    return Err(Error::Schema(format!(
                        "field '{}.{}' already exists",
                        collection, to
                    )));
                }
                let field = def
                    .field_mut(from)
                    .ok_or_else(|| missing_field(collection, from))?;
                field.name = to.clone();
                Ok(Some(def))
            }
            SchemaStatement::CreateIndex { collection, field } => {
                let mut def = require(current, collection)?;
                let target = def
                    .field_mut(field)
                    .ok_or_else(|| missing_field(collection, field))?;
                if target.indexed {
                    return Err(Error::Schema(format!(
                        "field '{}.{}' is already indexed",
                        collection, field
                    )));
                }
                target.indexed = true;
                Ok(Some(def))
            }
            SchemaStatement::DropIndex { collection, field } => {
                let mut def = require(current, collection)?;
                let target = def
                    .field_mut(field)
                    .ok_or_else(|| missing_field(collection, field))?;
                if !target.indexed {
                    return Err(Error::Schema(format!(
                        "field '{}.{}' is not indexed",
                        collection, field
                    )));
                }
                target.indexed = false;
                Ok(Some(def))
            }
        }
    }
}

impl fmt::Display for SchemaStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaStatement::CreateCollection { name, fields } => {
                write!(f, "CREATE COLLECTION {} ({} fields)", name, fields.len())
            }
            SchemaStatement::DropCollection { name } => write!(f, "DROP COLLECTION {}", name),
            SchemaStatement::AddField { collection, field } => {
                write!(f, "ADD FIELD {}.{} {}", collection, field.name, field.kind)
            }
            SchemaStatement::DropField { collection, field } => {
                write!(f, "DROP FIELD {}.{}", collection, field)
            }
            SchemaStatement::RenameField {
                collection,
                from,
                to,
            } => write!(f, "RENAME FIELD {}.{} TO {}", collection, from, to),
            SchemaStatement::CreateIndex { collection, field } => {
                write!(f, "CREATE INDEX ON {}.{}", collection, field)
            }
            SchemaStatement::DropIndex { collection, field } => {
                write!(f, "DROP INDEX ON {}.{}", collection, field)
            }
        }
    }
}

fn require(current: Option<CollectionDef>, collection: &str) -> Result<CollectionDef, Error> {
    current.ok_or_else(|| Error::Schema(format!("collection '{}' does not exist", collection)))
}

fn missing_field(collection: &str, field: &str) -> Error {
    Error::Schema(format!("field '{}.{}' does not exist", collection, field))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn documents() -> CollectionDef {
        CollectionDef::new("documents")
            .with_field(FieldDef::new("title", FieldKind::String))
            .with_field(FieldDef::new("body", FieldKind::String))
    }

    #[test]
    fn test_create_and_drop_collection() {
        let create = SchemaStatement::CreateCollection {
            name: "documents".into(),
            fields: vec![FieldDef::new("title", FieldKind::String)],
        };
        let def = create.apply_to(None).unwrap().unwrap();
        assert_eq!(def.fields.len(), 1);

        assert!(create.apply_to(Some(def.clone())).is_err());

        let drop = SchemaStatement::DropCollection {
            name: "documents".into(),
        };
        assert!(drop.apply_to(Some(def)).unwrap().is_none());
        assert!(drop.apply_to(None).is_err());
    }

    #[test]
    fn test_add_field_requires_default_when_not_nullable() {
        let add = SchemaStatement::AddField {
            collection: "documents".into(),
            field: FieldDef::new("sentiment", FieldKind::Float),
        };
        let err = add.apply_to(Some(documents())).unwrap_err();
        assert!(err.to_string().contains("needs a default"));

        let add = SchemaStatement::AddField {
            collection: "documents".into(),
            field: FieldDef::new("sentiment", FieldKind::Float).with_default(0.0.into()),
        };
        let def = add.apply_to(Some(documents())).unwrap().unwrap();
        assert!(def.field("sentiment").is_some());
    }

    #[test]
    fn test_add_then_drop_field_restores_definition() {
        let original = documents();
        let add = SchemaStatement::AddField {
            collection: "documents".into(),
            field: FieldDef::optional("embedding", FieldKind::Vector { dimensions: 384 }),
        };
        let drop = SchemaStatement::DropField {
            collection: "documents".into(),
            field: "embedding".into(),
        };
        let expanded = add.apply_to(Some(original.clone())).unwrap();
        let restored = drop.apply_to(expanded).unwrap().unwrap();
        assert_eq!(restored, original);
    }

    #[test]
    fn test_rename_and_index() {
        let rename = SchemaStatement::RenameField {
            collection: "documents".into(),
            from: "body".into(),
            to: "content".into(),
        };
        let def = rename.apply_to(Some(documents())).unwrap().unwrap();
        assert!(def.field("content").is_some());
        assert!(def.field("body").is_none());

        let index = SchemaStatement::CreateIndex {
            collection: "documents".into(),
            field: "content".into(),
        };
        let def = index.apply_to(Some(def)).unwrap().unwrap();
        assert!(def.field("content").unwrap().indexed);
        assert!(index.apply_to(Some(def.clone())).is_err());

        let unindex = SchemaStatement::DropIndex {
            collection: "documents".into(),
            field: "content".into(),
        };
        let def = unindex.apply_to(Some(def)).unwrap().unwrap();
        assert!(!def.field("content").unwrap().indexed);
    }

    #[test]
    fn test_statement_on_missing_collection() {
        let stmt = SchemaStatement::DropField {
            collection: "ghost".into(),
            field: "x".into(),
        };
        assert!(matches!(stmt.apply_to(None), Err(Error::Schema(_))));
    }

    #[test]
    fn test_display() {
        let stmt = SchemaStatement::AddField {
            collection: "documents".into(),
            field: FieldDef::optional("embedding", FieldKind::Vector { dimensions: 3 }),
        };
        assert_eq!(stmt.to_string(), "ADD FIELD documents.embedding vector(3)");
    }
}
