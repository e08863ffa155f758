//! Database access layer
//!
//! The migrator never talks to PostgreSQL directly. Everything it needs
//! (catalog probes, DDL, transactions, constraint toggling, row updates)
//! goes through the [`Database`] trait so that step logic can be exercised
//! against an in-memory store in tests.

pub mod pool;
pub mod postgres;
pub mod queries;

#[cfg(test)]
pub mod memory;

pub use pool::create_pool;
pub use postgres::PgDatabase;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A failed statement, with enough context for an operator to re-run it by hand.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("`{statement}` failed: {reason}")]
pub struct DbError {
    pub statement: String,
    pub reason: String,
    /// SQLSTATE, when the server reported one
    pub code: Option<String>,
}

impl DbError {
    pub fn new(statement: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            statement: statement.into(),
            reason: reason.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Integrity constraint violations live in SQLSTATE class 23.
    pub fn is_constraint_violation(&self) -> bool {
        self.code.as_deref().is_some_and(|c| c.starts_with("23"))
    }
}

/// Column to add during a migration step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnSpec {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    /// Placement hint; backends without positional columns append instead.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
}

impl ColumnSpec {
    /// Nullable column with no default, so existing rows stay valid.
    pub fn nullable(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            default_value: None,
            after: None,
        }
    }

    pub fn after(mut self, column: impl Into<String>) -> Self {
        self.after = Some(column.into());
        self
    }
}

/// Column as reported by the live catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    pub is_identity: bool,
}

impl ColumnInfo {
    /// True for identity columns and legacy `serial` columns alike.
    pub fn auto_increments(&self) -> bool {
        self.is_identity
            || self
                .default_value
                .as_deref()
                .is_some_and(|d| d.starts_with("nextval("))
    }
}

/// Foreign key that points at, or out of, a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKey {
    pub name: String,
    /// Table the constraint is declared on
    pub table: String,
    pub referenced_table: String,
    /// Constraint body as the catalog prints it, e.g. `FOREIGN KEY (student_id) REFERENCES students(id)`
    pub definition: String,
}

/// A row awaiting backfill: its key and the raw source text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillRow {
    pub id: i64,
    pub value: String,
}

/// Connection provider consumed by the migrator.
///
/// One value wraps one live connection; transactions and constraint
/// toggles are session state on that connection.
#[async_trait]
pub trait Database: Send {
    async fn table_exists(&mut self, table: &str) -> Result<bool, DbError>;

    async fn column_exists(&mut self, table: &str, column: &str) -> Result<bool, DbError>;

    /// Columns in ordinal order; empty when the table is absent.
    async fn columns(&mut self, table: &str) -> Result<Vec<ColumnInfo>, DbError>;

    /// Table names starting with `prefix`, sorted ascending.
    async fn tables_with_prefix(&mut self, prefix: &str) -> Result<Vec<String>, DbError>;

    async fn primary_key(&mut self, table: &str) -> Result<Vec<String>, DbError>;

    async fn row_count(&mut self, table: &str) -> Result<i64, DbError>;

    async fn begin(&mut self) -> Result<(), DbError>;

    async fn commit(&mut self) -> Result<(), DbError>;

    async fn rollback(&mut self) -> Result<(), DbError>;

    /// Turn referential-integrity enforcement on or off for this session.
    async fn set_constraint_checks(&mut self, enabled: bool) -> Result<(), DbError>;

    async fn add_column(&mut self, table: &str, column: &ColumnSpec) -> Result<(), DbError>;

    async fn rename_table(&mut self, from: &str, to: &str) -> Result<(), DbError>;

    /// Create `target` as a full copy (columns and rows) of `source`.
    async fn copy_table(&mut self, source: &str, target: &str) -> Result<(), DbError>;

    async fn drop_table(&mut self, table: &str) -> Result<(), DbError>;

    /// Foreign keys declared on `table` or referencing it, including self references.
    async fn foreign_keys(&mut self, table: &str) -> Result<Vec<ForeignKey>, DbError>;

    async fn drop_foreign_key(&mut self, fk: &ForeignKey) -> Result<(), DbError>;

    /// Re-create a foreign key from its catalog definition; existing rows are validated.
    async fn add_foreign_key(&mut self, fk: &ForeignKey) -> Result<(), DbError>;

    /// Drop every listed column in one statement.
    async fn drop_columns(&mut self, table: &str, columns: &[String]) -> Result<(), DbError>;

    /// Re-create the primary key (and the auto-increment column, if any)
    /// that a plain table copy does not carry over.
    async fn restore_primary_key(
        &mut self,
        table: &str,
        keys: &[String],
        identity: Option<&str>,
    ) -> Result<(), DbError>;

    /// Rows whose `source` is non-empty and whose `targets` are all empty.
    async fn backfill_candidates(
        &mut self,
        table: &str,
        key: &str,
        source: &str,
        targets: &[String],
    ) -> Result<Vec<BackfillRow>, DbError>;

    /// Set `values` on the row identified by `key = id`; returns rows touched.
    async fn update_row(
        &mut self,
        table: &str,
        key: &str,
        id: i64,
        values: &[(String, String)],
    ) -> Result<u64, DbError>;
}
