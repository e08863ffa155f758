//! Backups, destructive column removal, and rollback
//!
//! A backup is a plain full copy named `<table>_backup_<YYYYMMDD_HHMMSS>`
//! (UTC), with a `_NN` suffix when that second is already taken. It is
//! always committed before anything is dropped and it is never removed
//! automatically.

use crate::db::queries::is_valid_identifier;
use crate::db::{Database, ForeignKey};
use crate::error::MigrationError;
use crate::migrator::Migrator;
use crate::report::{ReportSink, StepEvent, StepOutcome};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{error, info, warn};

const BACKUP_INFIX: &str = "_backup_";
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
/// Same-second backups get `_02` through `_99`
const MAX_SAME_SECOND: u32 = 99;

static BACKUP_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)_backup_(\d{8}_\d{6}(?:_\d{2})?)$").expect("backup pattern is valid")
});

/// Split a backup table name into `(table, timestamp)`.
pub fn parse_backup_name(name: &str) -> Option<(&str, &str)> {
    let caps = BACKUP_NAME.captures(name)?;
    Some((caps.get(1)?.as_str(), caps.get(2)?.as_str()))
}

fn check_identifier(name: &str) -> Result<(), MigrationError> {
    if is_valid_identifier(name) {
        Ok(())
    } else {
        Err(MigrationError::InvalidIdentifier(name.to_string()))
    }
}

/// Result of a successful rollback
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackResult {
    pub table: String,
    pub backup: String,
    pub rows: i64,
    pub primary_key: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    /// Foreign keys re-created on or against the restored table
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub foreign_keys: Vec<String>,
}

impl Migrator {
    /// Name the next backup of `table` after the migrator's clock.
    pub fn backup_name(&self, table: &str) -> String {
        format!("{}{}{}", table, BACKUP_INFIX, self.now().format(TIMESTAMP_FORMAT))
    }

    /// First unused backup name for `table` at the current second.
    async fn free_backup_name<D: Database>(
        &self,
        db: &mut D,
        table: &str,
    ) -> Result<String, MigrationError> {
        let base = self.backup_name(table);
        if !self.inspect_table(db, &base).await? {
            return Ok(base);
        }
        for n in 2..=MAX_SAME_SECOND {
            let candidate = format!("{}_{:02}", base, n);
            if !self.inspect_table(db, &candidate).await? {
                warn!("{} already taken, backing up to {}", base, candidate);
                return Ok(candidate);
            }
        }
        Err(MigrationError::Statement {
            statement: format!("CREATE TABLE {}_NN", base),
            reason: format!("all {} backup names for this second are taken", MAX_SAME_SECOND),
        })
    }

    /// Backups of `table`, oldest first.
    pub async fn list_backups<D: Database>(
        &self,
        db: &mut D,
        table: &str,
    ) -> Result<Vec<String>, MigrationError> {
        check_identifier(table)?;
        let prefix = format!("{}{}", table, BACKUP_INFIX);
        let mut names: Vec<String> = db
            .tables_with_prefix(&prefix)
            .await?
            .into_iter()
            .filter(|n| parse_backup_name(n).is_some_and(|(t, _)| t == table))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Drop a backup table. Only names that look like backups are accepted.
    pub async fn purge_backup<D: Database>(
        &self,
        db: &mut D,
        sink: &mut dyn ReportSink,
        name: &str,
    ) -> Result<(), MigrationError> {
        check_identifier(name)?;
        if parse_backup_name(name).is_none() {
            return Err(MigrationError::InvalidIdentifier(name.to_string()));
        }
        if !self.inspect_table(db, name).await? {
            return Err(MigrationError::BackupMissing(name.to_string()));
        }

        db.drop_table(name).await?;
        info!("Purged backup {}", name);
        sink.record(StepEvent::new(
            "purge_backup",
            name,
            StepOutcome::applied("backup dropped"),
        ));
        Ok(())
    }

    /// Copy `table` into a fresh backup and check nothing was lost.
    pub async fn create_backup<D: Database>(
        &self,
        db: &mut D,
        table: &str,
    ) -> Result<String, MigrationError> {
        if !self.inspect_table(db, table).await? {
            return Err(MigrationError::SourceMissing(format!("table `{}`", table)));
        }
        let backup = self.free_backup_name(db, table).await?;

        db.begin().await?;
        let copied = async {
            db.copy_table(table, &backup).await?;
            let table_rows = db.row_count(table).await?;
            let backup_rows = db.row_count(&backup).await?;
            if table_rows != backup_rows {
                return Err(MigrationError::BackupIncomplete {
                    table: table.to_string(),
                    backup: backup.clone(),
                    table_rows,
                    backup_rows,
                });
            }
            Ok::<_, MigrationError>(table_rows)
        }
        .await;

        match copied {
            Ok(rows) => {
                db.commit().await?;
                info!("Backed up {} ({} rows) to {}", table, rows, backup);
                Ok(backup)
            }
            Err(e) => {
                if let Err(rb) = db.rollback().await {
                    error!("Rollback of backup {} failed: {}", backup, rb);
                }
                Err(e)
            }
        }
    }

    /// Drop the listed columns that exist, after taking a backup of the table.
    ///
    /// Columns already gone are reported as such. If the drop fails it is
    /// rolled back and the backup stays in place.
    pub async fn remove_columns_with_backup<D: Database>(
        &self,
        db: &mut D,
        sink: &mut dyn ReportSink,
        step: &str,
        table: &str,
        columns: &[String],
    ) -> Result<StepOutcome, MigrationError> {
        if !self.inspect_table(db, table).await? {
            warn!("Cannot remove columns: {} does not exist", table);
            let outcome = StepOutcome::skipped(format!("table `{}` does not exist", table));
            sink.record(StepEvent::new(step, format!("drop columns from {}", table), outcome.clone()));
            return Ok(outcome);
        }

        let mut present = Vec::new();
        for column in columns {
            if self.inspect_column(db, table, column).await? {
                present.push(column.clone());
            }
        }

        if present.is_empty() {
            for column in columns {
                sink.record(StepEvent::new(
                    step,
                    format!("drop column {}.{}", table, column),
                    StepOutcome::already_applied("column already absent"),
                ));
            }
            return Ok(StepOutcome::already_applied("columns already removed"));
        }

        let backup = match self.create_backup(db, table).await {
            Ok(name) => name,
            Err(e) => {
                error!("Backup of {} failed, nothing dropped: {}", table, e);
                sink.record(StepEvent::new(
                    step,
                    format!("backup {}", table),
                    StepOutcome::failed(e.to_string()),
                ));
                return Err(e);
            }
        };
        sink.record(StepEvent::new(
            step,
            format!("backup {}", table),
            StepOutcome::applied(format!("copied to `{}`", backup)),
        ));

        db.begin().await?;
        let dropped = async {
            // Someone may have changed the table since the probe above
            let mut still_present = Vec::with_capacity(present.len());
            for column in &present {
                if db.column_exists(table, column).await? {
                    still_present.push(column.clone());
                }
            }
            if !still_present.is_empty() {
                db.drop_columns(table, &still_present).await?;
            }
            Ok::<_, MigrationError>(still_present)
        }
        .await;

        let dropped = match dropped {
            Ok(dropped) => {
                db.commit().await?;
                dropped
            }
            Err(e) => {
                if let Err(rb) = db.rollback().await {
                    error!("Rollback of column drop on {} failed: {}", table, rb);
                }
                error!("Dropping columns from {} failed; backup {} retained", table, backup);
                sink.record(StepEvent::new(
                    step,
                    format!("drop columns from {}", table),
                    StepOutcome::failed(format!("{}; backup `{}` retained", e, backup)),
                ));
                return Err(e);
            }
        };

        for column in columns {
            let outcome = if dropped.contains(column) {
                StepOutcome::applied("dropped")
            } else {
                StepOutcome::already_applied("column already absent")
            };
            sink.record(StepEvent::new(step, format!("drop column {}.{}", table, column), outcome));
        }

        info!("Dropped {:?} from {}; backup {}", dropped, table, backup);
        Ok(StepOutcome::applied(format!(
            "dropped {} of {} columns; backup `{}`",
            dropped.len(),
            columns.len(),
            backup
        )))
    }

    /// Replace `table` with a copy of a backup.
    ///
    /// `backup` defaults to the most recent one. The primary key and the
    /// auto-increment attribute, which a plain copy loses, are rebuilt from
    /// what the live table had. Foreign keys declared on other tables against
    /// this one are dropped first and, with the table's own, re-created
    /// afterwards. Everything runs in one transaction; if that
    /// fails and the live table is nonetheless gone, the distinct
    /// [`MigrationError::PostDropIrrecoverable`] is returned.
    pub async fn rollback<D: Database>(
        &self,
        db: &mut D,
        sink: &mut dyn ReportSink,
        table: &str,
        backup: Option<&str>,
    ) -> Result<RollbackResult, MigrationError> {
        check_identifier(table)?;
        let backup = self.resolve_backup(db, table, backup).await?;

        let existed = self.inspect_table(db, table).await?;
        let live_columns = if existed { db.columns(table).await? } else { Vec::new() };
        let mut keys = if existed { db.primary_key(table).await? } else { Vec::new() };
        if keys.is_empty() && db.column_exists(&backup, "id").await? {
            keys.push("id".to_string());
        }

        let identity = match keys.as_slice() {
            [key] if existed => live_columns
                .iter()
                .find(|c| &c.name == key)
                .filter(|c| c.auto_increments())
                .map(|c| c.name.clone()),
            [key] => Some(key.clone()),
            _ => None,
        };

        let foreign_keys: Vec<ForeignKey> = if existed {
            db.foreign_keys(table).await?
        } else {
            Vec::new()
        };

        info!(
            "Rolling back {} from {} (key {:?}, identity {:?}, {} foreign keys)",
            table,
            backup,
            keys,
            identity,
            foreign_keys.len()
        );

        db.begin().await?;
        let restored = async {
            if existed {
                // Keys declared on the table itself go away with it
                for fk in foreign_keys.iter().filter(|fk| fk.table != table) {
                    db.drop_foreign_key(fk).await?;
                }
                db.drop_table(table).await?;
            }
            db.copy_table(&backup, table).await?;
            if !keys.is_empty() {
                db.restore_primary_key(table, &keys, identity.as_deref())
                    .await?;
            }
            for fk in &foreign_keys {
                db.add_foreign_key(fk).await?;
            }
            let table_rows = db.row_count(table).await?;
            let backup_rows = db.row_count(&backup).await?;
            if table_rows != backup_rows {
                return Err(MigrationError::BackupIncomplete {
                    table: table.to_string(),
                    backup: backup.clone(),
                    table_rows,
                    backup_rows,
                });
            }
            db.commit().await?;
            Ok::<_, MigrationError>(table_rows)
        }
        .await;

        let rows = match restored {
            Ok(rows) => rows,
            Err(e) => {
                let err = self.settle_failed_rollback(db, table, &backup, existed, e).await;
                error!("{}", err);
                sink.record(StepEvent::new(
                    "rollback",
                    format!("{} <- {}", table, backup),
                    StepOutcome::failed(err.to_string()),
                ));
                return Err(err);
            }
        };

        info!("Restored {} ({} rows) from {}", table, rows, backup);
        sink.record(StepEvent::new(
            "rollback",
            format!("{} <- {}", table, backup),
            StepOutcome::applied(format!("{} rows restored", rows)),
        ));

        Ok(RollbackResult {
            table: table.to_string(),
            backup,
            rows,
            primary_key: keys,
            identity,
            foreign_keys: foreign_keys.into_iter().map(|fk| fk.name).collect(),
        })
    }

    async fn resolve_backup<D: Database>(
        &self,
        db: &mut D,
        table: &str,
        backup: Option<&str>,
    ) -> Result<String, MigrationError> {
        match backup {
            Some(name) => {
                check_identifier(name)?;
                match parse_backup_name(name) {
                    Some((owner, _)) if owner == table => {}
                    _ => return Err(MigrationError::InvalidIdentifier(name.to_string())),
                }
                if !self.inspect_table(db, name).await? {
                    return Err(MigrationError::BackupMissing(name.to_string()));
                }
                Ok(name.to_string())
            }
            None => self
                .list_backups(db, table)
                .await?
                .pop()
                .ok_or_else(|| MigrationError::BackupMissing(table.to_string())),
        }
    }

    /// Undo what can be undone and decide how bad a failed rollback is.
    async fn settle_failed_rollback<D: Database>(
        &self,
        db: &mut D,
        table: &str,
        backup: &str,
        existed: bool,
        cause: MigrationError,
    ) -> MigrationError {
        if let Err(rb) = db.rollback().await {
            error!("ROLLBACK after failed restore of {} failed: {}", table, rb);
        }

        match db.table_exists(table).await {
            Ok(true) => cause,
            Ok(false) if !existed => cause,
            Ok(false) => MigrationError::PostDropIrrecoverable {
                table: table.to_string(),
                backup: backup.to_string(),
                reason: cause.to_string(),
            },
            Err(probe) => MigrationError::PostDropIrrecoverable {
                table: table.to_string(),
                backup: backup.to_string(),
                reason: format!("{}; table state unknown: {}", cause, probe),
            },
        }
    }
}
