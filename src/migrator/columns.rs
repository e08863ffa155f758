//! Catalog probes and additive column changes

use crate::db::{ColumnSpec, Database};
use crate::error::MigrationError;
use crate::migrator::Migrator;
use crate::report::{ReportSink, StepEvent, StepOutcome};
use tracing::{debug, error, info, warn};

impl Migrator {
    /// Does `table` exist in the live catalog
    pub async fn inspect_table<D: Database>(
        &self,
        db: &mut D,
        table: &str,
    ) -> Result<bool, MigrationError> {
        let exists = db.table_exists(table).await?;
        debug!("probe table {}: {}", table, exists);
        Ok(exists)
    }

    /// Does `table.column` exist in the live catalog
    pub async fn inspect_column<D: Database>(
        &self,
        db: &mut D,
        table: &str,
        column: &str,
    ) -> Result<bool, MigrationError> {
        let exists = db.column_exists(table, column).await?;
        debug!("probe column {}.{}: {}", table, column, exists);
        Ok(exists)
    }

    /// Add one column unless it is already there.
    ///
    /// The column is added exactly as described by `column` (nullable with
    /// no default, normally) and existing rows are never touched.
    pub async fn apply_column_addition<D: Database>(
        &self,
        db: &mut D,
        sink: &mut dyn ReportSink,
        step: &str,
        table: &str,
        column: &ColumnSpec,
    ) -> Result<StepOutcome, MigrationError> {
        let action = format!("add column {}.{}", table, column.name);

        if !self.inspect_table(db, table).await? {
            warn!("Cannot add {}.{}: table does not exist", table, column.name);
            let outcome = StepOutcome::skipped(format!("table `{}` does not exist", table));
            sink.record(StepEvent::new(step, action, outcome.clone()));
            return Ok(outcome);
        }

        if self.inspect_column(db, table, &column.name).await? {
            info!("Column {}.{} already present", table, column.name);
            let outcome = StepOutcome::already_applied("column already present");
            sink.record(StepEvent::new(step, action, outcome.clone()));
            return Ok(outcome);
        }

        match db.add_column(table, column).await {
            Ok(()) => {
                info!("Added column {}.{} {}", table, column.name, column.data_type);
                let outcome = StepOutcome::applied(format!("added {}", column.data_type));
                sink.record(StepEvent::new(step, action, outcome.clone()));
                Ok(outcome)
            }
            Err(e) => {
                error!("Adding {}.{} failed: {}", table, column.name, e);
                sink.record(StepEvent::new(step, action, StepOutcome::failed(e.to_string())));
                Err(e.into())
            }
        }
    }

    /// Add every column of a step in order.
    ///
    /// When anything is missing the additions share one transaction, so a
    /// failure on a later column takes the earlier ones back out as well.
    pub(crate) async fn add_columns<D: Database>(
        &self,
        db: &mut D,
        sink: &mut dyn ReportSink,
        step: &str,
        table: &str,
        columns: &[ColumnSpec],
    ) -> Result<StepOutcome, MigrationError> {
        let subject = format!("columns on `{}`", table);
        let mut pending = false;
        if self.inspect_table(db, table).await? {
            for column in columns {
                if !self.inspect_column(db, table, &column.name).await? {
                    pending = true;
                    break;
                }
            }
        }

        if !pending {
            let mut outcomes = Vec::with_capacity(columns.len());
            for column in columns {
                outcomes.push(
                    self.apply_column_addition(db, sink, step, table, column)
                        .await?,
                );
            }
            return Ok(fold_outcomes(&outcomes, &subject));
        }

        db.begin().await?;
        let added = async {
            let mut outcomes = Vec::with_capacity(columns.len());
            for column in columns {
                outcomes.push(
                    self.apply_column_addition(db, sink, step, table, column)
                        .await?,
                );
            }
            Ok::<_, MigrationError>(outcomes)
        }
        .await;

        match added {
            Ok(outcomes) => {
                db.commit().await?;
                Ok(fold_outcomes(&outcomes, &subject))
            }
            Err(e) => {
                if let Err(rb) = db.rollback().await {
                    error!("Rollback of column additions on {} failed: {}", table, rb);
                    return Err(rb.into());
                }
                warn!("Column additions on {} rolled back", table);
                sink.record(StepEvent::new(
                    step,
                    format!("add columns to {}", table),
                    StepOutcome::failed(format!("{}; all additions rolled back", e)),
                ));
                Err(e)
            }
        }
    }
}

/// Collapse sub-action outcomes into one step outcome.
///
/// Anything applied makes the step applied. Otherwise a step with at least
/// one part already done counts as already applied, and the rest is skipped.
pub(crate) fn fold_outcomes(outcomes: &[StepOutcome], subject: &str) -> StepOutcome {
    if let Some(failed) = outcomes.iter().find(|o| o.is_failure()) {
        return failed.clone();
    }

    let applied = outcomes
        .iter()
        .filter(|o| matches!(o, StepOutcome::Applied { .. }))
        .count();
    let already = outcomes
        .iter()
        .filter(|o| matches!(o, StepOutcome::AlreadyApplied { .. }))
        .count();

    if applied > 0 {
        StepOutcome::applied(format!("{} of {} {} applied", applied, outcomes.len(), subject))
    } else if already > 0 || outcomes.is_empty() {
        StepOutcome::already_applied(format!("{} already in place", subject))
    } else {
        StepOutcome::skipped(format!("{}: precondition missing", subject))
    }
}
