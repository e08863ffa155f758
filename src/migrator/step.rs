//! Step definitions

use crate::db::ColumnSpec;
use crate::migrator::backfill::SplitRule;
use serde::Serialize;

/// One old → new table name pair of a rename batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameMapping {
    pub from: String,
    pub to: String,
}

impl RenameMapping {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// Derive `targets` from `source`, row by row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillSpec {
    pub table: String,
    /// Integer key identifying rows
    pub key: String,
    pub source: String,
    /// Receives the part before the delimiter
    pub first: String,
    /// Receives the remainder (empty when there is no delimiter)
    pub rest: String,
    pub rule: SplitRule,
}

impl BackfillSpec {
    pub fn targets(&self) -> [String; 2] {
        [self.first.clone(), self.rest.clone()]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    AddColumns { table: String, columns: Vec<ColumnSpec> },
    RenameTables { mapping: Vec<RenameMapping> },
    Backfill(BackfillSpec),
    RemoveColumns { table: String, columns: Vec<String> },
}

/// A named, idempotent unit of schema change
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStep {
    pub name: String,
    pub description: String,
    #[serde(flatten)]
    pub kind: StepKind,
}

impl MigrationStep {
    pub fn new(name: &str, description: &str, kind: StepKind) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            kind,
        }
    }

    /// Renames and drops can lose data if a later step runs on top of a failure.
    pub fn is_destructive(&self) -> bool {
        matches!(
            self.kind,
            StepKind::RenameTables { .. } | StepKind::RemoveColumns { .. }
        )
    }
}
