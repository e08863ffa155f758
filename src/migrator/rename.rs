//! Table rename batches
//!
//! Referential-integrity checks are switched off for the whole batch, so
//! tables referencing each other can be renamed in any order, and are
//! switched back on however the batch ends: normally, with an error, or
//! with a panic.

use crate::db::{Database, DbError};
use crate::error::MigrationError;
use crate::migrator::columns::fold_outcomes;
use crate::migrator::step::RenameMapping;
use crate::migrator::Migrator;
use crate::report::{ReportSink, StepEvent, StepOutcome};
use futures_util::FutureExt;
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use tracing::{error, info, warn};

/// What happened to one mapping entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameResult {
    pub mapping: RenameMapping,
    pub outcome: StepOutcome,
}

impl RenameResult {
    pub fn renamed(&self) -> bool {
        matches!(self.outcome, StepOutcome::Applied { .. })
    }
}

/// Per-entry results folded into a step outcome
pub(crate) fn batch_outcome(results: &[RenameResult]) -> StepOutcome {
    let outcomes: Vec<StepOutcome> = results.iter().map(|r| r.outcome.clone()).collect();
    fold_outcomes(&outcomes, "tables")
}

impl Migrator {
    /// Rename every mapped table whose new name is not taken yet.
    ///
    /// Each entry is its own transaction. A failing entry is rolled back and
    /// reported; the remaining entries still run. The batch stops early only
    /// when such a rollback itself fails, since the session is then in an
    /// unknown state. Any transaction a panic leaves open is rolled back
    /// before constraint checking is switched back on, and failing to switch
    /// it back on is [`MigrationError::ConstraintRestore`].
    pub async fn apply_rename_batch<D: Database>(
        &self,
        db: &mut D,
        sink: &mut dyn ReportSink,
        step: &str,
        mapping: &[RenameMapping],
    ) -> Result<Vec<RenameResult>, MigrationError> {
        db.set_constraint_checks(false)
            .await
            .map_err(MigrationError::from)?;
        info!("Constraint checks suspended for {} renames", mapping.len());

        let batch = AssertUnwindSafe(self.rename_entries(db, sink, step, mapping))
            .catch_unwind()
            .await;

        if batch.is_err() {
            // A SET inside a transaction that is later rolled back is undone too
            if let Err(e) = db.rollback().await {
                error!("Rollback after panic in rename batch failed: {}", e);
            }
        }

        let restored = db.set_constraint_checks(true).await;

        let batch = match batch {
            Ok(batch) => batch,
            Err(payload) => {
                if let Err(e) = restored {
                    error!("Constraint checks left disabled after panic: {}", e);
                }
                panic::resume_unwind(payload);
            }
        };

        if let Err(e) = restored {
            error!("Re-enabling constraint checks failed: {}", e);
            return Err(MigrationError::ConstraintRestore(e.to_string()));
        }
        info!("Constraint checks restored");

        batch
    }

    async fn rename_entries<D: Database>(
        &self,
        db: &mut D,
        sink: &mut dyn ReportSink,
        step: &str,
        mapping: &[RenameMapping],
    ) -> Result<Vec<RenameResult>, MigrationError> {
        let mut results = Vec::with_capacity(mapping.len());

        for entry in mapping {
            let action = format!("{} -> {}", entry.from, entry.to);
            let outcome = match self.rename_entry(db, entry).await {
                Ok(outcome) => outcome,
                Err(RenameFailure::RolledBack(e)) => {
                    error!("Rename {} failed: {}", action, e);
                    StepOutcome::failed(e.to_string())
                }
                Err(RenameFailure::Stuck { cause, rollback }) => {
                    error!("Rename {} failed ({}) and could not be rolled back: {}", action, cause, rollback);
                    sink.record(StepEvent::new(
                        step,
                        action,
                        StepOutcome::failed(format!("{}; rollback failed: {}", cause, rollback)),
                    ));
                    return Err(rollback.into());
                }
            };
            sink.record(StepEvent::new(step, action, outcome.clone()));
            results.push(RenameResult {
                mapping: entry.clone(),
                outcome,
            });
        }

        Ok(results)
    }

    async fn rename_entry<D: Database>(
        &self,
        db: &mut D,
        entry: &RenameMapping,
    ) -> Result<StepOutcome, RenameFailure> {
        if self.inspect_table(db, &entry.to).await? {
            info!("{} already exists, skipping", entry.to);
            return Ok(StepOutcome::already_applied("already migrated"));
        }

        if !self.inspect_table(db, &entry.from).await? {
            warn!("{} does not exist, skipping", entry.from);
            return Ok(StepOutcome::skipped(format!(
                "source table `{}` does not exist",
                entry.from
            )));
        }

        db.begin().await.map_err(MigrationError::from)?;
        if let Err(e) = db.rename_table(&entry.from, &entry.to).await {
            if let Err(rollback) = db.rollback().await {
                return Err(RenameFailure::Stuck {
                    cause: e.into(),
                    rollback,
                });
            }
            return Err(RenameFailure::RolledBack(e.into()));
        }
        db.commit().await.map_err(MigrationError::from)?;

        info!("Renamed {} to {}", entry.from, entry.to);
        Ok(StepOutcome::applied("renamed"))
    }
}

/// Why one rename entry did not go through
enum RenameFailure {
    /// Nothing changed
    RolledBack(MigrationError),
    /// The transaction could not be rolled back
    Stuck {
        cause: MigrationError,
        rollback: DbError,
    },
}

impl From<MigrationError> for RenameFailure {
    fn from(e: MigrationError) -> Self {
        RenameFailure::RolledBack(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::{FailPoint, MemoryDatabase};
    use crate::report::RunReport;
    use pretty_assertions::assert_eq;

    fn mapping() -> Vec<RenameMapping> {
        vec![
            RenameMapping::new("tblstudents", "students"),
            RenameMapping::new("tblcourses", "courses"),
            RenameMapping::new("tbladvisers", "advisers"),
        ]
    }

    fn legacy() -> MemoryDatabase {
        let mut db = MemoryDatabase::new();
        db.create_table("tblstudents", &["id", "name"], Some("id"));
        db.create_table("tblcourses", &["id", "title"], Some("id"));
        db.insert("tblstudents", &[None, Some("Ana")]);
        db
    }

    #[tokio::test]
    async fn test_batch_renames_and_reports_missing() {
        let mut db = legacy();
        let mut report = RunReport::new();

        let results = Migrator::new()
            .apply_rename_batch(&mut db, &mut report, "rename", &mapping())
            .await
            .unwrap();

        assert_eq!(db.table_names(), vec!["courses", "students"]);
        assert_eq!(db.value("students", 1, "name").as_deref(), Some("Ana"));
        assert!(results[0].renamed());
        assert!(results[1].renamed());
        assert!(matches!(
            results[2].outcome,
            StepOutcome::SkippedPreconditionMissing { .. }
        ));
        assert!(matches!(batch_outcome(&results), StepOutcome::Applied { .. }));

        // Checks are off around the renames and back on afterwards
        assert_eq!(db.log.first().map(String::as_str), Some("CHECKS OFF"));
        assert_eq!(db.log.last().map(String::as_str), Some("CHECKS ON"));
        assert!(db.constraint_checks_enabled());
    }

    #[tokio::test]
    async fn test_second_run_is_already_migrated() {
        let mut db = legacy();
        let migrator = Migrator::new();
        let mut report = RunReport::new();

        migrator
            .apply_rename_batch(&mut db, &mut report, "rename", &mapping())
            .await
            .unwrap();
        let results = migrator
            .apply_rename_batch(&mut db, &mut report, "rename", &mapping())
            .await
            .unwrap();

        assert!(!results.iter().any(RenameResult::renamed));
        assert_eq!(results[0].outcome, StepOutcome::already_applied("already migrated"));
        assert_eq!(db.table_names(), vec!["courses", "students"]);
    }

    #[tokio::test]
    async fn test_existing_target_is_left_alone() {
        let mut db = legacy();
        db.create_table("students", &["id", "name"], Some("id"));
        let mut report = RunReport::new();

        let results = Migrator::new()
            .apply_rename_batch(&mut db, &mut report, "rename", &mapping())
            .await
            .unwrap();

        assert_eq!(results[0].outcome, StepOutcome::already_applied("already migrated"));
        assert!(db.table("tblstudents").is_some());
        assert!(db.table("students").unwrap().rows.is_empty());
    }

    #[tokio::test]
    async fn test_failed_entry_rolls_back_and_batch_continues() {
        let mut db = legacy();
        db.fail_on(FailPoint::RenameTable("tblstudents".to_string()));
        let mut report = RunReport::new();

        let results = Migrator::new()
            .apply_rename_batch(&mut db, &mut report, "rename", &mapping())
            .await
            .unwrap();

        assert!(results[0].outcome.is_failure());
        assert!(results[1].renamed());
        assert!(db.table("tblstudents").is_some());
        assert!(db.table("students").is_none());
        assert!(batch_outcome(&results).is_failure());
        assert!(db.constraint_checks_enabled());
    }

    #[tokio::test]
    async fn test_checks_restored_after_panic() {
        let mut db = legacy();
        db.fail_on(FailPoint::PanicOnRename("tblcourses".to_string()));
        let mut report = RunReport::new();
        let migrator = Migrator::new();

        let outcome = AssertUnwindSafe(migrator.apply_rename_batch(
            &mut db,
            &mut report,
            "rename",
            &mapping(),
        ))
        .catch_unwind()
        .await;

        assert!(outcome.is_err());
        assert!(db.constraint_checks_enabled());

        // The transaction the panic left open is closed before checks come back
        let tail: Vec<&str> = db.log.iter().rev().take(3).rev().map(String::as_str).collect();
        assert_eq!(tail, vec!["BEGIN", "ROLLBACK", "CHECKS ON"]);
        assert!(!db.in_transaction());
        assert!(db.table("students").is_some());
        assert!(db.table("tblcourses").is_some());
        assert!(db.begin().await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_rollback_stops_the_batch() {
        let mut db = legacy();
        db.fail_on(FailPoint::RenameTable("tblstudents".to_string()));
        db.fail_on(FailPoint::Rollback);
        let mut report = RunReport::new();

        let err = Migrator::new()
            .apply_rename_batch(&mut db, &mut report, "rename", &mapping())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            MigrationError::Statement {
                statement: "ROLLBACK".to_string(),
                reason: "injected failure".to_string(),
            }
        );
        assert!(!db.log.iter().any(|l| l.starts_with("RENAME tblcourses")));
        assert!(db.table("tblcourses").is_some());
        assert!(db.constraint_checks_enabled());

        let events = &report.step("rename").unwrap().events;
        assert_eq!(events.len(), 1);
        assert!(events[0].outcome.message().contains("rollback failed"));
    }

    #[tokio::test]
    async fn test_restore_failure_is_an_error() {
        let mut db = legacy();
        db.fail_on(FailPoint::EnableConstraintChecks);
        let mut report = RunReport::new();

        let err = Migrator::new()
            .apply_rename_batch(&mut db, &mut report, "rename", &mapping())
            .await
            .unwrap_err();

        assert!(matches!(err, MigrationError::ConstraintRestore(_)));
    }
}
