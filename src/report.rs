//! Migration reporting
//!
//! The migrator tells a [`ReportSink`] what happened to every step and
//! sub-action. The console sink streams human-readable lines as the run
//! progresses; [`RunReport`] collects everything into a serializable value
//! for the admin API and `--json` output.

use crate::migrator::StepState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;
use uuid::Uuid;

/// What happened to one sub-action of a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Applied { detail: String },
    AlreadyApplied { detail: String },
    SkippedPreconditionMissing { reason: String },
    Failed { reason: String },
}

impl StepOutcome {
    pub fn applied(detail: impl Into<String>) -> Self {
        StepOutcome::Applied {
            detail: detail.into(),
        }
    }

    pub fn already_applied(detail: impl Into<String>) -> Self {
        StepOutcome::AlreadyApplied {
            detail: detail.into(),
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        StepOutcome::SkippedPreconditionMissing {
            reason: reason.into(),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        StepOutcome::Failed {
            reason: reason.into(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            StepOutcome::Applied { .. } => "applied",
            StepOutcome::AlreadyApplied { .. } => "already applied",
            StepOutcome::SkippedPreconditionMissing { .. } => "skipped",
            StepOutcome::Failed { .. } => "FAILED",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            StepOutcome::Applied { detail } | StepOutcome::AlreadyApplied { detail } => detail,
            StepOutcome::SkippedPreconditionMissing { reason } | StepOutcome::Failed { reason } => reason,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, StepOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepEvent {
    pub step: String,
    pub action: String,
    pub outcome: StepOutcome,
}

impl StepEvent {
    pub fn new(step: &str, action: impl Into<String>, outcome: StepOutcome) -> Self {
        Self {
            step: step.to_string(),
            action: action.into(),
            outcome,
        }
    }
}

/// Row the backfill could not update
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowError {
    pub id: i64,
    pub reason: String,
}

/// Tally of a best-effort backfill
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillCounts {
    pub migrated: u64,
    pub skipped: u64,
    pub errored: u64,
    /// Rows whose value parsed to nothing usable
    pub skipped_ids: Vec<i64>,
    pub errors: Vec<RowError>,
}

/// Totals for a whole run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub tables_renamed: u64,
    pub tables_skipped: u64,
    pub records_migrated: u64,
    pub records_skipped: u64,
    pub records_errored: u64,
    pub steps_applied: u64,
    pub steps_already_applied: u64,
    pub steps_skipped: u64,
    pub steps_failed: u64,
    /// Step after whose failure the remaining steps were not run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted_at: Option<String>,
}

impl RunSummary {
    pub fn succeeded(&self) -> bool {
        self.steps_failed == 0 && self.aborted_at.is_none()
    }

    pub(crate) fn count_state(&mut self, state: StepState) {
        match state {
            StepState::Applied => self.steps_applied += 1,
            StepState::AlreadyApplied => self.steps_already_applied += 1,
            StepState::Skipped => self.steps_skipped += 1,
            StepState::FailedRolledBack => self.steps_failed += 1,
            _ => {}
        }
    }
}

/// Receives progress from the migrator
pub trait ReportSink: Send {
    fn step_started(&mut self, step: &str, description: &str);

    fn record(&mut self, event: StepEvent);

    fn backfill_counts(&mut self, step: &str, counts: &BackfillCounts);

    fn step_finished(&mut self, step: &str, state: StepState);

    fn summary(&mut self, summary: &RunSummary);
}

/// Everything reported about one step
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepReport {
    pub name: String,
    pub state: StepState,
    pub events: Vec<StepEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backfill: Option<BackfillCounts>,
}

/// Collecting sink
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub steps: Vec<StepReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<RunSummary>,
}

impl RunReport {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            steps: Vec::new(),
            summary: None,
        }
    }

    #[cfg(test)]
    pub fn step(&self, name: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// All events across steps, in order
    #[cfg(test)]
    pub fn events(&self) -> impl Iterator<Item = &StepEvent> {
        self.steps.iter().flat_map(|s| s.events.iter())
    }

    fn entry(&mut self, name: &str) -> &mut StepReport {
        let i = match self.steps.iter().position(|s| s.name == name) {
            Some(i) => i,
            None => {
                self.steps.push(StepReport {
                    name: name.to_string(),
                    state: StepState::NotStarted,
                    events: Vec::new(),
                    backfill: None,
                });
                self.steps.len() - 1
            }
        };
        &mut self.steps[i]
    }
}

impl Default for RunReport {
    fn default() -> Self {
        Self::new()
    }
}

impl ReportSink for RunReport {
    fn step_started(&mut self, step: &str, _description: &str) {
        self.entry(step).state = StepState::Probing;
    }

    fn record(&mut self, event: StepEvent) {
        let name = event.step.clone();
        self.entry(&name).events.push(event);
    }

    fn backfill_counts(&mut self, step: &str, counts: &BackfillCounts) {
        self.entry(step).backfill = Some(counts.clone());
    }

    fn step_finished(&mut self, step: &str, state: StepState) {
        self.entry(step).state = state;
    }

    fn summary(&mut self, summary: &RunSummary) {
        self.summary = Some(summary.clone());
    }
}

/// Streams one line per event to a writer (stdout for the CLI)
pub struct ConsoleSink<W: Write + Send> {
    out: W,
}

impl<W: Write + Send> ConsoleSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> ReportSink for ConsoleSink<W> {
    fn step_started(&mut self, step: &str, description: &str) {
        let _ = writeln!(self.out, "==> {} - {}", step, description);
    }

    fn record(&mut self, event: StepEvent) {
        let _ = writeln!(
            self.out,
            "    [{}] {}: {}",
            event.outcome.label(),
            event.action,
            event.outcome.message()
        );
    }

    fn backfill_counts(&mut self, _step: &str, counts: &BackfillCounts) {
        let _ = writeln!(
            self.out,
            "    rows migrated: {}, skipped: {}, errored: {}",
            counts.migrated, counts.skipped, counts.errored
        );
        for id in &counts.skipped_ids {
            let _ = writeln!(self.out, "      skipped row {}", id);
        }
        for err in &counts.errors {
            let _ = writeln!(self.out, "      row {} failed: {}", err.id, err.reason);
        }
    }

    fn step_finished(&mut self, step: &str, state: StepState) {
        let _ = writeln!(self.out, "<== {} {}", step, state);
    }

    fn summary(&mut self, s: &RunSummary) {
        let _ = writeln!(self.out);
        let _ = writeln!(self.out, "Summary");
        let _ = writeln!(
            self.out,
            "  tables renamed: {}, tables skipped: {}",
            s.tables_renamed, s.tables_skipped
        );
        let _ = writeln!(
            self.out,
            "  records migrated: {}, skipped: {}, errored: {}",
            s.records_migrated, s.records_skipped, s.records_errored
        );
        let _ = writeln!(
            self.out,
            "  steps applied: {}, already applied: {}, skipped: {}, failed: {}",
            s.steps_applied, s.steps_already_applied, s.steps_skipped, s.steps_failed
        );
        if let Some(ref step) = s.aborted_at {
            let _ = writeln!(self.out, "  run aborted after `{}`", step);
        }
        let _ = self.out.flush();
    }
}
