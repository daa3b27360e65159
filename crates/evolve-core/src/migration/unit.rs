//! Migration units: metadata plus schema and data operations.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use super::error::MigrationError;
use super::transform::{ItemSource, Transform};
use super::validation::Validator;
use crate::storage::key::is_valid_segment;
use crate::storage::SchemaStatement;
use rkyv::{Archive, Deserialize, Serialize};

/// Kind of a migration unit, derived from its operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, Serialize, Deserialize)]
pub enum MigrationKind {
    /// Schema statements only.
    Schema,
    /// Data transform only.
    Data,
    /// Schema statements followed by a data transform.
    Hybrid,
}

impl fmt::Display for MigrationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationKind::Schema => write!(f, "schema"),
            MigrationKind::Data => write!(f, "data"),
            MigrationKind::Hybrid => write!(f, "hybrid"),
        }
    }
}

impl FromStr for MigrationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "schema" => Ok(MigrationKind::Schema),
            "data" => Ok(MigrationKind::Data),
            "hybrid" => Ok(MigrationKind::Hybrid),
            other => Err(format!("unknown migration kind '{}'", other)),
        }
    }
}

/// Semantic version of a migration definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MigrationVersion {
    /// Major version.
    pub major: u32,
    /// Minor version.
    pub minor: u32,
    /// Patch version.
    pub patch: u32,
}

impl MigrationVersion {
    /// Create a version.
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for MigrationVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for MigrationVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() != 3 {
            return Err(format!("version '{}' is not MAJOR.MINOR.PATCH", s));
        }
        let parse = |p: &str| {
            p.parse::<u32>()
                .map_err(|_| format!("version '{}' has a non-numeric component", s))
        };
        Ok(Self {
            major: parse(parts[0])?,
            minor: parse(parts[1])?,
            patch: parse(parts[2])?,
        })
    }
}

/// Descriptive metadata of a migration unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationMetadata {
    /// Unique id.
    pub id: String,
    /// Short name.
    pub name: String,
    /// Longer description.
    pub description: String,
    /// Definition version.
    pub version: MigrationVersion,
    /// Kind, derived from the operations.
    pub kind: MigrationKind,
    /// Author.
    pub author: String,
    /// Creation time (microseconds since epoch). Breaks ordering ties.
    pub created_at: u64,
    /// Ids of migrations that must be applied first.
    pub dependencies: Vec<String>,
    /// Whether the unit can be rolled back.
    pub reversible: bool,
    /// Content checksum of the definition.
    pub checksum: String,
}

/// Forward and rollback schema statements.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SchemaOperations {
    /// Statements applied in order, in one transaction.
    pub forward: Vec<SchemaStatement>,
    /// Statements that undo `forward`, applied in order.
    pub rollback: Vec<SchemaStatement>,
}

impl SchemaOperations {
    /// Create schema operations.
    pub fn new(forward: Vec<SchemaStatement>, rollback: Vec<SchemaStatement>) -> Self {
        Self { forward, rollback }
    }

    fn is_reversible(&self) -> bool {
        !self.rollback.is_empty()
    }
}

/// How the data part of a unit is undone.
#[derive(Clone, Default)]
pub enum DataRollback {
    /// No rollback declared.
    #[default]
    None,
    /// Replay an inverse transform over every item the forward run touched.
    InverseTransform(Arc<dyn Transform>),
    /// Restore the touched items of these collections to their values before
    /// the migration started.
    Snapshot {
        /// Collections covered by the snapshot.
        collections: Vec<String>,
    },
}

impl DataRollback {
    /// Returns `true` unless no strategy is declared.
    pub fn is_declared(&self) -> bool {
        !matches!(self, DataRollback::None)
    }

    /// Stable description, part of the checksum.
    pub fn describe(&self) -> String {
        match self {
            DataRollback::None => "none".to_string(),
            DataRollback::InverseTransform(_) => "inverse".to_string(),
            DataRollback::Snapshot { collections } => {
                format!("snapshot:{}", collections.join(","))
            }
        }
    }
}

impl fmt::Debug for DataRollback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.describe())
    }
}

/// Source, transform and rollback strategy of a data migration.
#[derive(Clone)]
pub struct DataOperations {
    /// Candidate items.
    pub source: Arc<dyn ItemSource>,
    /// Per-item transform.
    pub transform: Arc<dyn Transform>,
    /// Rollback strategy.
    pub rollback: DataRollback,
    /// Version label of the transform code; closures cannot be hashed.
    pub transform_revision: String,
    /// Whether batches may be processed concurrently.
    pub parallel_safe: bool,
}

impl DataOperations {
    /// Create data operations with no rollback strategy.
    pub fn new<S, T>(source: S, transform: T) -> Self
    where
        S: ItemSource + 'static,
        T: Transform + 'static,
    {
        Self {
            source: Arc::new(source),
            transform: Arc::new(transform),
            rollback: DataRollback::None,
            transform_revision: "1".to_string(),
            parallel_safe: false,
        }
    }

    /// Undo with an inverse transform.
    pub fn with_inverse<T: Transform + 'static>(mut self, inverse: T) -> Self {
        self.rollback = DataRollback::InverseTransform(Arc::new(inverse));
        self
    }

    /// Undo by restoring a snapshot of `collections`.
    pub fn with_snapshot<I, C>(mut self, collections: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<String>,
    {
        self.rollback = DataRollback::Snapshot {
            collections: collections.into_iter().map(Into::into).collect(),
        };
        self
    }

    /// Set the transform revision.
    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.transform_revision = revision.into();
        self
    }

    /// Allow concurrent batch processing.
    pub fn with_parallel_safe(mut self, parallel_safe: bool) -> Self {
        self.parallel_safe = parallel_safe;
        self
    }
}

impl fmt::Debug for DataOperations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataOperations")
            .field("source", &self.source.describe())
            .field("rollback", &self.rollback)
            .field("transform_revision", &self.transform_revision)
            .field("parallel_safe", &self.parallel_safe)
            .finish()
    }
}

/// Operations of a unit. Exactly one shape per kind.
#[derive(Debug, Clone)]
pub enum MigrationOperations {
    /// Schema statements only.
    Schema(SchemaOperations),
    /// Data transform only.
    Data(DataOperations),
    /// Schema statements, then a data transform.
    Hybrid {
        /// Schema part, committed before the data part starts.
        schema: SchemaOperations,
        /// Data part.
        data: DataOperations,
    },
}

impl MigrationOperations {
    /// Kind implied by the shape.
    pub fn kind(&self) -> MigrationKind {
        match self {
            MigrationOperations::Schema(_) => MigrationKind::Schema,
            MigrationOperations::Data(_) => MigrationKind::Data,
            MigrationOperations::Hybrid { .. } => MigrationKind::Hybrid,
        }
    }

    /// Schema part, if any.
    pub fn schema(&self) -> Option<&SchemaOperations> {
        match self {
            MigrationOperations::Schema(schema) | MigrationOperations::Hybrid { schema, .. } => {
                Some(schema)
            }
            MigrationOperations::Data(_) => None,
        }
    }

    /// Data part, if any.
    pub fn data(&self) -> Option<&DataOperations> {
        match self {
            MigrationOperations::Data(data) | MigrationOperations::Hybrid { data, .. } => {
                Some(data)
            }
            MigrationOperations::Schema(_) => None,
        }
    }

    fn has_rollback(&self) -> bool {
        let schema_ok = self.schema().map_or(true, SchemaOperations::is_reversible);
        let data_ok = self.data().map_or(true, |d| d.rollback.is_declared());
        schema_ok && data_ok
    }
}

/// A registered migration.
#[derive(Clone)]
pub struct MigrationUnit {
    metadata: MigrationMetadata,
    operations: MigrationOperations,
    pre_conditions: Vec<Arc<dyn Validator>>,
    post_conditions: Vec<Arc<dyn Validator>>,
}

impl MigrationUnit {
    /// Unique id.
    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    /// Metadata.
    pub fn metadata(&self) -> &MigrationMetadata {
        &self.metadata
    }

    /// Operations.
    pub fn operations(&self) -> &MigrationOperations {
        &self.operations
    }

    /// Kind.
    pub fn kind(&self) -> MigrationKind {
        self.metadata.kind
    }

    /// Declared dependencies.
    pub fn dependencies(&self) -> &[String] {
        &self.metadata.dependencies
    }

    /// Whether the unit can be rolled back.
    pub fn is_reversible(&self) -> bool {
        self.metadata.reversible
    }

    /// Content checksum.
    pub fn checksum(&self) -> &str {
        &self.metadata.checksum
    }

    /// User preconditions.
    pub fn pre_conditions(&self) -> &[Arc<dyn Validator>] {
        &self.pre_conditions
    }

    /// User postconditions.
    pub fn post_conditions(&self) -> &[Arc<dyn Validator>] {
        &self.post_conditions
    }
}

impl fmt::Debug for MigrationUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationUnit")
            .field("metadata", &self.metadata)
            .field("operations", &self.operations)
            .field("pre_conditions", &self.pre_conditions.len())
            .field("post_conditions", &self.post_conditions.len())
            .finish()
    }
}

/// Canonical content hashed into the checksum. Descriptive fields (name,
/// description, author) are excluded so editing them is not a definition change.
#[derive(serde::Serialize)]
struct ChecksumInput<'a> {
    id: &'a str,
    version: String,
    kind: String,
    dependencies: Vec<&'a str>,
    reversible: bool,
    schema_forward: Option<&'a [SchemaStatement]>,
    schema_rollback: Option<&'a [SchemaStatement]>,
    source: Option<String>,
    transform_revision: Option<&'a str>,
    data_rollback: Option<String>,
}

fn compute_checksum(
    id: &str,
    version: MigrationVersion,
    dependencies: &[String],
    reversible: bool,
    operations: &MigrationOperations,
) -> Result<String, MigrationError> {
    let mut deps: Vec<&str> = dependencies.iter().map(String::as_str).collect();
    deps.sort_unstable();

    let schema = operations.schema();
    let data = operations.data();
    let input = ChecksumInput {
        id,
        version: version.to_string(),
        kind: operations.kind().to_string(),
        dependencies: deps,
        reversible,
        schema_forward: schema.map(|s| s.forward.as_slice()),
        schema_rollback: schema.map(|s| s.rollback.as_slice()),
        source: data.map(|d| d.source.describe()),
        transform_revision: data.map(|d| d.transform_revision.as_str()),
        data_rollback: data.map(|d| d.rollback.describe()),
    };

    let bytes =
        serde_json::to_vec(&input).map_err(|e| MigrationError::Serialization(e.to_string()))?;
    Ok(hex::encode(blake3::hash(&bytes).as_bytes()))
}

/// Builder for [`MigrationUnit`].
pub struct MigrationBuilder {
    id: String,
    name: String,
    description: String,
    version: String,
    author: String,
    created_at: u64,
    dependencies: Vec<String>,
    reversible: Option<bool>,
    operations: Option<MigrationOperations>,
    pre_conditions: Vec<Arc<dyn Validator>>,
    post_conditions: Vec<Arc<dyn Validator>>,
}

impl MigrationBuilder {
    /// Start a unit definition.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            version: "1.0.0".to_string(),
            author: String::new(),
            created_at: 0,
            dependencies: Vec::new(),
            reversible: None,
            operations: None,
            pre_conditions: Vec::new(),
            post_conditions: Vec::new(),
        }
    }

    /// Set the description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the version (`MAJOR.MINOR.PATCH`).
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Set the author.
    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    /// Set the creation time in microseconds since epoch.
    pub fn created_at(mut self, created_at: u64) -> Self {
        self.created_at = created_at;
        self
    }

    /// Add a dependency.
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    /// Override reversibility.
    ///
    /// By default a unit is reversible when every part declares rollback
    /// operations. Declaring `true` without them is rejected by [`build`](Self::build).
    pub fn reversible(mut self, reversible: bool) -> Self {
        self.reversible = Some(reversible);
        self
    }

    /// Schema-only operations.
    pub fn schema(mut self, forward: Vec<SchemaStatement>, rollback: Vec<SchemaStatement>) -> Self {
        self.operations = Some(MigrationOperations::Schema(SchemaOperations::new(
            forward, rollback,
        )));
        self
    }

    /// Data-only operations.
    pub fn data(mut self, data: DataOperations) -> Self {
        self.operations = Some(MigrationOperations::Data(data));
        self
    }

    /// Schema statements followed by a data transform.
    pub fn hybrid(mut self, schema: SchemaOperations, data: DataOperations) -> Self {
        self.operations = Some(MigrationOperations::Hybrid { schema, data });
        self
    }

    /// Add a precondition.
    pub fn pre_condition<V: Validator + 'static>(mut self, validator: V) -> Self {
        self.pre_conditions.push(Arc::new(validator));
        self
    }

    /// Add a postcondition.
    pub fn post_condition<V: Validator + 'static>(mut self, validator: V) -> Self {
        self.post_conditions.push(Arc::new(validator));
        self
    }

    /// Validate the definition and compute its checksum.
    pub fn build(self) -> Result<MigrationUnit, MigrationError> {
        let invalid = |reason: String| MigrationError::InvalidDefinition {
            migration_id: self.id.clone(),
            reason,
        };

        if !is_valid_segment(&self.id) {
            return Err(invalid(
                "id must be non-empty and must not contain NUL".to_string(),
            ));
        }
        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty".to_string()));
        }
        let version = MigrationVersion::from_str(&self.version).map_err(&invalid)?;
        for dep in &self.dependencies {
            if !is_valid_segment(dep) {
                return Err(invalid(format!("invalid dependency id {:?}", dep)));
            }
        }

        let operations = self
            .operations
            .clone()
            .ok_or_else(|| invalid("no operations declared".to_string()))?;

        if let Some(schema) = operations.schema() {
            if schema.forward.is_empty() {
                return Err(invalid("schema part has no statements".to_string()));
            }
        }
        if let Some(DataRollback::Snapshot { collections }) = operations.data().map(|d| &d.rollback)
        {
            if collections.is_empty() {
                return Err(invalid("snapshot rollback names no collections".to_string()));
            }
        }

        let has_rollback = operations.has_rollback();
        let reversible = match self.reversible {
            Some(true) if !has_rollback => {
                return Err(invalid(
                    "declared reversible but rollback operations are missing".to_string(),
                ));
            }
            Some(flag) => flag,
            None => has_rollback,
        };

        let checksum = compute_checksum(
            &self.id,
            version,
            &self.dependencies,
            reversible,
            &operations,
        )?;

        Ok(MigrationUnit {
            metadata: MigrationMetadata {
                id: self.id,
                name: self.name,
                description: self.description,
                version,
                kind: operations.kind(),
                author: self.author,
                created_at: self.created_at,
                dependencies: self.dependencies,
                reversible,
                checksum,
            },
            operations,
            pre_conditions: self.pre_conditions,
            post_conditions: self.post_conditions,
        })
    }
}
