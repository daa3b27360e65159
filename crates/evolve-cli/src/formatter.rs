//! Output formatters for engine reports.

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use comfy_table::{Cell, Table};
use evolve_core::migration::{
    HistoryRecord, ItemFailure, ProgressSnapshot, PurgeEntry, RollbackResult, StatusEntry,
    ValidationIssue,
};
use serde_json::{json, Value};

/// Output format for reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format
    Table,
    /// JSON format
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Table => write!(f, "table"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

/// Trait for formatting output.
pub trait Formatter {
    /// Status of every registered migration.
    fn format_status(&self, entries: &[StatusEntry<'_>]) -> String;

    /// Records returned by a run, or the attempts of one migration.
    fn format_records(&self, records: &[HistoryRecord]) -> String;

    /// Progress report.
    fn format_progress(&self, progress: &ProgressSnapshot) -> String;

    /// Validation findings.
    fn format_issues(&self, issues: &[ValidationIssue]) -> String;

    /// Tolerated item failures.
    fn format_failures(&self, failures: &[ItemFailure]) -> String;

    /// Rollback outcome.
    fn format_rollback(&self, result: &RollbackResult) -> String;

    /// Purge audit log.
    fn format_purges(&self, purges: &[PurgeEntry]) -> String;

    /// A simple message.
    fn format_message(&self, message: &str) -> String;
}

/// Create a formatter for the given output format.
pub fn create_formatter(format: OutputFormat) -> Box<dyn Formatter> {
    match format {
        OutputFormat::Table => Box::new(TableFormatter),
        OutputFormat::Json => Box::new(JsonFormatter),
    }
}

/// Table formatter using comfy-table.
pub struct TableFormatter;

impl Formatter for TableFormatter {
    fn format_status(&self, entries: &[StatusEntry<'_>]) -> String {
        let mut table = Table::new();
        table.set_header(vec!["Id", "Kind", "Status", "Attempt", "Items", "Updated", "Notes"]);

        for entry in entries {
            let mut notes = Vec::new();
            if entry.checksum_drift {
                notes.push("definition changed".to_string());
            }
            if let Some(cp) = &entry.checkpoint {
                notes.push(format!("resumable after {}", cp.cursor.as_deref().unwrap_or("start")));
            }
            if entry.latest.as_ref().is_some_and(|r| r.rollback_in_progress) {
                notes.push("rollback in progress".to_string());
            }

            let (status, attempt, items, updated) = match &entry.latest {
                Some(record) => (
                    record.status.to_string(),
                    record.attempt.to_string(),
                    record.items_processed.to_string(),
                    format_timestamp(record.updated_at),
                ),
                None => ("pending".to_string(), "-".to_string(), "-".to_string(), "-".to_string()),
            };
            table.add_row(vec![
                Cell::new(entry.unit.id()),
                Cell::new(entry.unit.kind()),
                Cell::new(status),
                Cell::new(attempt),
                Cell::new(items),
                Cell::new(updated),
                Cell::new(notes.join("; ")),
            ]);
        }

        format!("{}\n{} migration(s)", table, entries.len())
    }

    fn format_records(&self, records: &[HistoryRecord]) -> String {
        if records.is_empty() {
            return "No history".to_string();
        }
        let mut table = Table::new();
        table.set_header(vec![
            "Id", "Attempt", "Status", "Processed", "Skipped", "Failed", "Batches", "Started",
            "Finished", "Summary",
        ]);

        for record in records {
            let status = if record.simulated {
                format!("{} (dry run)", record.status)
            } else {
                record.status.to_string()
            };
            table.add_row(vec![
                Cell::new(&record.migration_id),
                Cell::new(record.attempt),
                Cell::new(status),
                Cell::new(record.items_processed),
                Cell::new(record.items_skipped),
                Cell::new(record.items_failed),
                Cell::new(record.batches_committed),
                Cell::new(record.started_at.map_or_else(|| "-".to_string(), format_timestamp)),
                Cell::new(record.finished_at.map_or_else(|| "-".to_string(), format_timestamp)),
                Cell::new(record.error_summary.as_deref().unwrap_or("")),
            ]);
        }

        table.to_string()
    }

    fn format_progress(&self, progress: &ProgressSnapshot) -> String {
        let mut lines = vec![format!(
            "{} [{}] attempt {}{}",
            progress.migration_id,
            progress.phase,
            progress.attempt,
            if progress.live { " (live)" } else { "" }
        )];
        let total = progress
            .total_items
            .map_or_else(|| "?".to_string(), |t| t.to_string());
        lines.push(format!(
            "  items: {} processed, {} skipped, {} failed of {}",
            progress.items_processed, progress.items_skipped, progress.items_failed, total
        ));
        lines.push(format!("  batches: {}", progress.current_batch));
        if let Some(percent) = progress.percent_complete {
            lines.push(format!("  complete: {:.1}%", percent));
        }
        if progress.live {
            lines.push(format!("  rate: {:.1} items/s", progress.items_per_sec));
            if let Some(eta) = progress.eta_secs {
                lines.push(format!("  eta: {}s", eta));
            }
        }
        lines.join("\n")
    }

    fn format_issues(&self, issues: &[ValidationIssue]) -> String {
        if issues.is_empty() {
            return "No issues".to_string();
        }
        let mut table = Table::new();
        table.set_header(vec!["Severity", "Phase", "Code", "Message"]);
        for issue in issues {
            table.add_row(vec![
                Cell::new(issue.severity.to_string()),
                Cell::new(issue.phase.to_string()),
                Cell::new(&issue.code),
                Cell::new(&issue.message),
            ]);
        }
        table.to_string()
    }

    fn format_failures(&self, failures: &[ItemFailure]) -> String {
        if failures.is_empty() {
            return "No failures".to_string();
        }
        let mut table = Table::new();
        table.set_header(vec!["Key", "Failed at", "Message"]);
        for failure in failures {
            table.add_row(vec![
                Cell::new(&failure.key),
                Cell::new(format_timestamp(failure.timestamp)),
                Cell::new(&failure.message),
            ]);
        }
        format!("{}\n{} failure(s)", table, failures.len())
    }

    fn format_rollback(&self, result: &RollbackResult) -> String {
        let mut output = format!(
            "Rolled back {} (attempt {}): {} item(s), {} statement(s) in {}ms [{}]",
            result.migration_id,
            result.attempt,
            result.items_reverted,
            result.statements_reverted,
            result.duration_ms,
            result.rollback_id
        );
        for warning in &result.warnings {
            output.push_str(&format!("\nwarning: {}", warning));
        }
        output
    }

    fn format_purges(&self, purges: &[PurgeEntry]) -> String {
        let mut table = Table::new();
        table.set_header(vec!["Id", "Attempts", "Purged at", "Reason"]);
        for purge in purges {
            table.add_row(vec![
                Cell::new(&purge.migration_id),
                Cell::new(purge.attempts_removed),
                Cell::new(format_timestamp(purge.purged_at)),
                Cell::new(&purge.reason),
            ]);
        }
        table.to_string()
    }

    fn format_message(&self, message: &str) -> String {
        message.to_string()
    }
}

/// JSON formatter.
pub struct JsonFormatter;

impl Formatter for JsonFormatter {
    fn format_status(&self, entries: &[StatusEntry<'_>]) -> String {
        let rows: Vec<Value> = entries
            .iter()
            .map(|entry| {
                json!({
                    "id": entry.unit.id(),
                    "name": entry.unit.metadata().name,
                    "kind": entry.unit.kind().to_string(),
                    "version": entry.unit.metadata().version.to_string(),
                    "dependencies": entry.unit.dependencies(),
                    "reversible": entry.unit.is_reversible(),
                    "checksum": entry.unit.checksum(),
                    "checksum_drift": entry.checksum_drift,
                    "latest": entry.latest.as_ref().map(record_to_json),
                    "resumable_after": entry.checkpoint.as_ref().map(|cp| cp.cursor.clone()),
                })
            })
            .collect();
        pretty(&Value::Array(rows))
    }

    fn format_records(&self, records: &[HistoryRecord]) -> String {
        pretty(&Value::Array(records.iter().map(record_to_json).collect()))
    }

    fn format_progress(&self, progress: &ProgressSnapshot) -> String {
        pretty(&json!({
            "migration_id": progress.migration_id,
            "phase": progress.phase.to_string(),
            "attempt": progress.attempt,
            "live": progress.live,
            "total_items": progress.total_items,
            "items_processed": progress.items_processed,
            "items_skipped": progress.items_skipped,
            "items_failed": progress.items_failed,
            "current_batch": progress.current_batch,
            "percent_complete": progress.percent_complete,
            "items_per_sec": progress.items_per_sec,
            "eta_secs": progress.eta_secs,
            "elapsed_ms": progress.elapsed_ms,
        }))
    }

    fn format_issues(&self, issues: &[ValidationIssue]) -> String {
        pretty(&Value::Array(issues.iter().map(issue_to_json).collect()))
    }

    fn format_failures(&self, failures: &[ItemFailure]) -> String {
        let rows: Vec<Value> = failures
            .iter()
            .map(|f| {
                json!({
                    "key": f.key,
                    "message": f.message,
                    "failed_at": format_timestamp(f.timestamp),
                })
            })
            .collect();
        pretty(&Value::Array(rows))
    }

    fn format_rollback(&self, result: &RollbackResult) -> String {
        pretty(&json!({
            "migration_id": result.migration_id,
            "attempt": result.attempt,
            "rollback_id": result.rollback_id,
            "items_reverted": result.items_reverted,
            "statements_reverted": result.statements_reverted,
            "duration_ms": result.duration_ms,
            "warnings": result.warnings,
            "record": record_to_json(&result.record),
        }))
    }

    fn format_purges(&self, purges: &[PurgeEntry]) -> String {
        let rows: Vec<Value> = purges
            .iter()
            .map(|p| {
                json!({
                    "migration_id": p.migration_id,
                    "attempts_removed": p.attempts_removed,
                    "purged_at": format_timestamp(p.purged_at),
                    "reason": p.reason,
                })
            })
            .collect();
        pretty(&Value::Array(rows))
    }

    fn format_message(&self, message: &str) -> String {
        json!({ "message": message }).to_string()
    }
}

fn record_to_json(record: &HistoryRecord) -> Value {
    json!({
        "migration_id": record.migration_id,
        "attempt": record.attempt,
        "status": record.status.to_string(),
        "kind": record.kind.to_string(),
        "checksum": record.checksum,
        "started_at": record.started_at.map(format_timestamp),
        "finished_at": record.finished_at.map(format_timestamp),
        "items_processed": record.items_processed,
        "items_skipped": record.items_skipped,
        "items_failed": record.items_failed,
        "batches_committed": record.batches_committed,
        "statements_applied": record.statements_applied,
        "halt_reason": record.halt_reason.map(|r| r.to_string()),
        "error_summary": record.error_summary,
        "issues": record.issues.iter().map(issue_to_json).collect::<Vec<_>>(),
        "simulated": record.simulated,
        "rollback_id": record.rollback_id,
    })
}

fn issue_to_json(issue: &ValidationIssue) -> Value {
    json!({
        "severity": issue.severity.to_string(),
        "phase": issue.phase.to_string(),
        "code": issue.code,
        "message": issue.message,
    })
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "null".to_string())
}

/// Format microseconds since epoch as UTC, falling back to the raw number.
fn format_timestamp(micros: u64) -> String {
    i64::try_from(micros)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_micros)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| micros.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0), "1970-01-01 00:00:00");
        assert_eq!(format_timestamp(1_700_000_000_000_000), "2023-11-14 22:13:20");
        assert_eq!(format_timestamp(u64::MAX), u64::MAX.to_string());
    }

    #[test]
    fn test_json_message() {
        assert_eq!(JsonFormatter.format_message("done"), r#"{"message":"done"}"#);
    }

    #[test]
    fn test_empty_tables() {
        assert_eq!(TableFormatter.format_records(&[]), "No history");
        assert_eq!(TableFormatter.format_issues(&[]), "No issues");
        assert_eq!(TableFormatter.format_failures(&[]), "No failures");
    }
}
