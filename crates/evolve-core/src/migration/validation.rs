//! Pre- and post-execution validation.

use std::fmt;

use super::unit::{MigrationOperations, MigrationUnit};
use crate::storage::{SchemaStatement, StorageEngine};
use rkyv::{Archive, Deserialize, Serialize};

/// Severity of a validation issue. Ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Archive, Serialize, Deserialize,
)]
pub enum Severity {
    /// Informational note.
    Info,
    /// Suspicious but allowed.
    Warning,
    /// Blocks execution.
    Error,
    /// Blocks execution; the store may be at risk.
    Critical,
}

impl Severity {
    /// Returns `true` for severities that block execution.
    pub fn is_blocking(self) -> bool {
        matches!(self, Severity::Error | Severity::Critical)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// When a validation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, Serialize, Deserialize)]
pub enum ValidationPhase {
    /// Before any side effect.
    Pre,
    /// After all operations committed.
    Post,
}

impl fmt::Display for ValidationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationPhase::Pre => write!(f, "pre"),
            ValidationPhase::Post => write!(f, "post"),
        }
    }
}

/// A single finding reported by a validator.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// How serious the finding is.
    pub severity: Severity,
    /// Phase the issue was reported in. Set by the stage, not the validator.
    pub phase: ValidationPhase,
    /// Short machine-readable code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl ValidationIssue {
    /// Create an issue.
    pub fn new(severity: Severity, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            phase: ValidationPhase::Pre,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Create an info issue.
    pub fn info(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Info, code, message)
    }

    /// Create a warning issue.
    pub fn warning(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, code, message)
    }

    /// Create an error issue.
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, code, message)
    }

    /// Create a critical issue.
    pub fn critical(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Critical, code, message)
    }

    /// One-line summary of the blocking issues in a list.
    pub fn summarize(issues: &[ValidationIssue]) -> String {
        let blocking: Vec<String> = issues
            .iter()
            .filter(|i| i.severity.is_blocking())
            .map(|i| i.to_string())
            .collect();
        if blocking.is_empty() {
            "no blocking issues".to_string()
        } else {
            blocking.join("; ")
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.code, self.message)
    }
}

/// What a validator can inspect.
pub struct ValidationContext<'a> {
    /// Target store. Validators must not write to it.
    pub storage: &'a StorageEngine,
    /// Unit being validated.
    pub unit: &'a MigrationUnit,
    /// Phase being run.
    pub phase: ValidationPhase,
    /// Attempt number the validation belongs to.
    pub attempt: u32,
    /// Checksum recorded by the latest attempt, if any.
    pub recorded_checksum: Option<&'a str>,
    /// Schema part already committed by an earlier attempt.
    pub schema_committed: bool,
    /// Statements of earlier units simulated in the same dry run, applied
    /// before this unit's statements are checked.
    pub preamble: &'a [SchemaStatement],
}

/// A user-supplied precondition or postcondition.
pub trait Validator: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str {
        "custom"
    }

    /// Inspect the context and report findings.
    fn check(&self, ctx: &ValidationContext<'_>) -> Vec<ValidationIssue>;
}

impl<F> Validator for F
where
    F: Fn(&ValidationContext<'_>) -> Vec<ValidationIssue> + Send + Sync,
{
    fn check(&self, ctx: &ValidationContext<'_>) -> Vec<ValidationIssue> {
        self(ctx)
    }
}

/// Runs built-in and user-supplied checks for one phase.
pub struct ValidationStage;

impl ValidationStage {
    /// Collect every issue for the context's phase.
    ///
    /// Issues are returned in the order built-in checks, then user validators.
    pub fn check(ctx: &ValidationContext<'_>) -> Vec<ValidationIssue> {
        let mut issues = match ctx.phase {
            ValidationPhase::Pre => Self::builtin_pre(ctx),
            ValidationPhase::Post => Self::builtin_post(ctx),
        };

        let validators = match ctx.phase {
            ValidationPhase::Pre => ctx.unit.pre_conditions(),
            ValidationPhase::Post => ctx.unit.post_conditions(),
        };
        for validator in validators {
            let found = validator.check(ctx);
            if !found.is_empty() {
                tracing::debug!(
                    migration_id = %ctx.unit.id(),
                    validator = validator.name(),
                    phase = %ctx.phase,
                    issues = found.len(),
                    "validator reported issues"
                );
            }
            issues.extend(found);
        }

        for issue in &mut issues {
            issue.phase = ctx.phase;
        }
        issues
    }

    /// Returns `true` if any issue blocks execution.
    pub fn is_blocking(issues: &[ValidationIssue]) -> bool {
        issues.iter().any(|i| i.severity.is_blocking())
    }

    fn builtin_pre(ctx: &ValidationContext<'_>) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        let (schema, data) = match ctx.unit.operations() {
            MigrationOperations::Schema(schema) => (Some(schema), None),
            MigrationOperations::Data(data) => (None, Some(data)),
            MigrationOperations::Hybrid { schema, data } => (Some(schema), Some(data)),
        };

        if let Some(schema) = schema {
            if ctx.schema_committed {
                issues.push(ValidationIssue::info(
                    "schema_committed",
                    "schema part committed by an earlier attempt; statements not re-checked",
                ));
            } else {
                let mut tx = ctx.storage.begin();
                if let Err(e) = ctx.preamble.iter().try_for_each(|s| tx.execute(s)) {
                    issues.push(ValidationIssue::error(
                        "preamble_invalid",
                        format!("simulated dependency statements no longer apply: {}", e),
                    ));
                }
                for (index, statement) in schema.forward.iter().enumerate() {
                    if let Err(e) = tx.execute(statement) {
                        issues.push(ValidationIssue::error(
                            "statement_invalid",
                            format!("statement {} ({}): {}", index, statement, e),
                        ));
                        break;
                    }
                    if statement.is_destructive() {
                        issues.push(ValidationIssue::warning(
                            "destructive_statement",
                            format!("statement {} ({}) discards data", index, statement),
                        ));
                    }
                }
                tx.rollback();
            }
        }

        // The schema part of a hybrid unit may create what the source reads,
        // so an unreadable source only blocks data-only units.
        if let Some(data) = data {
            if let Err(e) = data.source.fetch(None, 1) {
                let creates_source = schema.is_some() && !ctx.schema_committed;
                let issue = if creates_source {
                    ValidationIssue::warning(
                        "source_unreadable",
                        format!("{} is not readable yet: {}", data.source.describe(), e),
                    )
                } else {
                    ValidationIssue::critical(
                        "source_unreadable",
                        format!("{} is not readable: {}", data.source.describe(), e),
                    )
                };
                issues.push(issue);
            }
        }
        issues
    }

    fn builtin_post(ctx: &ValidationContext<'_>) -> Vec<ValidationIssue> {
        match ctx.recorded_checksum {
            Some(recorded) if recorded != ctx.unit.checksum() => {
                vec![ValidationIssue::critical(
                    "checksum_mismatch",
                    format!(
                        "recorded checksum {} does not match registered {}",
                        recorded,
                        ctx.unit.checksum()
                    ),
                )]
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::unit::MigrationBuilder;
    use crate::storage::{FieldDef, FieldKind, SchemaStatement, StorageConfig};

    fn context<'a>(
        storage: &'a StorageEngine,
        unit: &'a MigrationUnit,
        phase: ValidationPhase,
    ) -> ValidationContext<'a> {
        ValidationContext {
            storage,
            unit,
            phase,
            attempt: 1,
            recorded_checksum: None,
            schema_committed: false,
            preamble: &[],
        }
    }

    fn create_documents() -> SchemaStatement {
        SchemaStatement::CreateCollection {
            name: "documents".into(),
            fields: vec![FieldDef::new("body", FieldKind::String)],
        }
    }

    fn documents_exist(ctx: &ValidationContext<'_>) -> Vec<ValidationIssue> {
        if ctx.storage.collection("documents").ok().flatten().is_none() {
            vec![ValidationIssue::error("missing", "documents not created")]
        } else {
            Vec::new()
        }
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::Error);
        assert!(Severity::Warning < Severity::Error);
        assert!(!Severity::Warning.is_blocking());
        assert!(Severity::Error.is_blocking());
    }

    #[test]
    fn test_invalid_statement_blocks() {
        let storage = StorageEngine::open(StorageConfig::temporary()).unwrap();
        let unit = MigrationBuilder::new("add_summary", "Add summary")
            .schema(
                vec![SchemaStatement::AddField {
                    collection: "documents".into(),
                    field: FieldDef::optional("summary", FieldKind::String),
                }],
                vec![],
            )
            .build()
            .unwrap();

        let issues = ValidationStage::check(&context(&storage, &unit, ValidationPhase::Pre));
        assert!(ValidationStage::is_blocking(&issues));
        assert_eq!(issues[0].code, "statement_invalid");
        assert_eq!(issues[0].phase, ValidationPhase::Pre);

        // Dry validation never touches the catalog
        assert!(storage.collections().unwrap().is_empty());
    }

    #[test]
    fn test_preamble_applies_before_statements() {
        let storage = StorageEngine::open(StorageConfig::temporary()).unwrap();
        let unit = MigrationBuilder::new("add_summary", "Add summary")
            .schema(
                vec![SchemaStatement::AddField {
                    collection: "documents".into(),
                    field: FieldDef::optional("summary", FieldKind::String),
                }],
                vec![],
            )
            .build()
            .unwrap();
        let preamble = [create_documents()];

        let mut ctx = context(&storage, &unit, ValidationPhase::Pre);
        ctx.preamble = &preamble;
        let issues = ValidationStage::check(&ctx);
        assert!(!ValidationStage::is_blocking(&issues));
        assert!(storage.collections().unwrap().is_empty());
    }

    #[test]
    fn test_destructive_statement_warns() {
        let storage = StorageEngine::open(StorageConfig::temporary()).unwrap();
        let mut tx = storage.begin();
        tx.execute(&create_documents()).unwrap();
        tx.commit().unwrap();

        let unit = MigrationBuilder::new("drop_body", "Drop body")
            .schema(
                vec![SchemaStatement::DropField {
                    collection: "documents".into(),
                    field: "body".into(),
                }],
                vec![],
            )
            .build()
            .unwrap();

        let issues = ValidationStage::check(&context(&storage, &unit, ValidationPhase::Pre));
        assert!(!ValidationStage::is_blocking(&issues));
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, Severity::Warning);
    }

    #[test]
    fn test_user_validator_phase_is_overridden() {
        let storage = StorageEngine::open(StorageConfig::temporary()).unwrap();
        let unit = MigrationBuilder::new("create", "Create documents")
            .schema(vec![create_documents()], vec![])
            .post_condition(documents_exist)
            .build()
            .unwrap();

        let issues = ValidationStage::check(&context(&storage, &unit, ValidationPhase::Post));
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].phase, ValidationPhase::Post);
        assert!(ValidationIssue::summarize(&issues).contains("documents not created"));
    }

    #[test]
    fn test_checksum_consistency() {
        let storage = StorageEngine::open(StorageConfig::temporary()).unwrap();
        let unit = MigrationBuilder::new("create", "Create documents")
            .schema(vec![create_documents()], vec![])
            .build()
            .unwrap();
        let mut ctx = context(&storage, &unit, ValidationPhase::Post);
        ctx.recorded_checksum = Some("0000");
        let issues = ValidationStage::check(&ctx);
        assert_eq!(issues[0].severity, Severity::Critical);
    }
}
