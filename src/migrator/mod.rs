//! Schema migrator
//!
//! Applies an ordered list of idempotent [`MigrationStep`]s to the live
//! database. Whether a step is needed is always decided by probing the
//! catalog, never by a record of earlier runs, so a plan can be re-run at
//! any time and after any failure.

mod backfill;
mod backup;
mod columns;
mod rename;
mod state;
mod step;

pub use backfill::{BackfillResult, SplitRule};
pub use backup::{parse_backup_name, RollbackResult};
pub use rename::RenameResult;
pub use state::{StepState, StepTracker};
pub use step::{BackfillSpec, MigrationStep, RenameMapping, StepKind};

use crate::db::Database;
use crate::error::MigrationError;
use crate::report::{ReportSink, RunSummary, StepEvent, StepOutcome};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Source of "now" for backup names
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Clone)]
pub struct Migrator {
    clock: Clock,
}

impl Migrator {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_clock(clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        Self {
            clock: Arc::new(clock),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Run `plan`, or only the step named `only`, in order.
    ///
    /// The run stops after the first failed step since later steps build on
    /// earlier ones. Step failures are reported through `sink` and counted in
    /// the summary; an `Err` is returned only for an unknown step name or
    /// when constraint checking could not be switched back on.
    pub async fn run_plan<D: Database>(
        &self,
        db: &mut D,
        sink: &mut dyn ReportSink,
        plan: &[MigrationStep],
        only: Option<&str>,
    ) -> Result<RunSummary, MigrationError> {
        let selected: Vec<&MigrationStep> = match only {
            Some(name) => {
                let step = plan
                    .iter()
                    .find(|s| s.name == name)
                    .ok_or_else(|| MigrationError::UnknownStep(name.to_string()))?;
                vec![step]
            }
            None => plan.iter().collect(),
        };

        let mut summary = RunSummary::default();
        let mut fatal = None;

        for step in selected {
            let mut tracker = StepTracker::new();
            advance(&mut tracker, StepState::Probing);
            sink.step_started(&step.name, &step.description);
            info!("Step {}: {}", step.name, step.description);

            let outcome = match self.run_step(db, sink, step, &mut summary).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Step {} failed: {}", step.name, e);
                    let outcome = StepOutcome::failed(e.to_string());
                    sink.record(StepEvent::new(&step.name, "step", outcome.clone()));
                    if matches!(e, MigrationError::ConstraintRestore(_)) {
                        fatal = Some(e);
                    }
                    outcome
                }
            };

            for next in path_for(&outcome) {
                advance(&mut tracker, *next);
            }
            let state = tracker.state();
            debug_assert!(state.is_terminal());
            debug!("Step {} went {:?}", step.name, tracker.history());
            summary.count_state(state);
            sink.step_finished(&step.name, state);

            if state == StepState::FailedRolledBack {
                warn!("Aborting run after failed step {}", step.name);
                summary.aborted_at = Some(step.name.clone());
                break;
            }
        }

        sink.summary(&summary);

        match fatal {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    async fn run_step<D: Database>(
        &self,
        db: &mut D,
        sink: &mut dyn ReportSink,
        step: &MigrationStep,
        summary: &mut RunSummary,
    ) -> Result<StepOutcome, MigrationError> {
        match &step.kind {
            StepKind::AddColumns { table, columns } => {
                self.add_columns(db, sink, &step.name, table, columns).await
            }
            StepKind::RenameTables { mapping } => {
                let results = self
                    .apply_rename_batch(db, sink, &step.name, mapping)
                    .await?;
                for result in &results {
                    if result.renamed() {
                        summary.tables_renamed += 1;
                    } else if !result.outcome.is_failure() {
                        summary.tables_skipped += 1;
                    }
                }
                Ok(rename::batch_outcome(&results))
            }
            StepKind::Backfill(spec) => {
                let result = self
                    .backfill_from_pattern(db, sink, &step.name, spec)
                    .await?;
                summary.records_migrated += result.counts.migrated;
                summary.records_skipped += result.counts.skipped;
                summary.records_errored += result.counts.errored;
                Ok(result.outcome)
            }
            StepKind::RemoveColumns { table, columns } => {
                self.remove_columns_with_backup(db, sink, &step.name, table, columns)
                    .await
            }
        }
    }
}

impl Default for Migrator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Migrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migrator").finish_non_exhaustive()
    }
}

/// States a step passes through after probing, given how it ended
fn path_for(outcome: &StepOutcome) -> &'static [StepState] {
    match outcome {
        StepOutcome::Applied { .. } => &[StepState::Applying, StepState::Applied],
        StepOutcome::AlreadyApplied { .. } => &[StepState::AlreadyApplied],
        StepOutcome::SkippedPreconditionMissing { .. } => &[StepState::Skipped],
        StepOutcome::Failed { .. } => &[StepState::Applying, StepState::FailedRolledBack],
    }
}

fn advance(tracker: &mut StepTracker, next: StepState) {
    if let Err(e) = tracker.advance(next) {
        error!("{}", e);
    }
}
