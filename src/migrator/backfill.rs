//! Best-effort row backfill
//!
//! Rows are updated one at a time outside any transaction: a failing row is
//! counted and the rest carry on.

use crate::db::Database;
use crate::error::MigrationError;
use crate::migrator::step::BackfillSpec;
use crate::migrator::Migrator;
use crate::report::{BackfillCounts, ReportSink, RowError, StepEvent, StepOutcome};
use serde::Serialize;
use tracing::{info, warn};

/// Split free text on the first delimiter.
///
/// `"Sariaya, Quezon"` gives `("Sariaya", "Quezon")`; `"Lucena"` gives
/// `("Lucena", "")`. Both parts are trimmed. Text that leaves both parts
/// empty yields `None`. There is no check against a list of real places,
/// so odd inputs are carried over as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitRule {
    pub delimiter: char,
}

impl SplitRule {
    pub const FIRST_COMMA: SplitRule = SplitRule { delimiter: ',' };

    pub fn apply(&self, raw: &str) -> Option<(String, String)> {
        let (first, rest) = match raw.split_once(self.delimiter) {
            Some((a, b)) => (a.trim(), b.trim()),
            None => (raw.trim(), ""),
        };
        if first.is_empty() && rest.is_empty() {
            return None;
        }
        Some((first.to_string(), rest.to_string()))
    }
}

/// Outcome of a backfill together with its tallies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillResult {
    pub outcome: StepOutcome,
    pub counts: BackfillCounts,
}

impl Migrator {
    /// Derive the target columns of every pending row from the source column.
    pub async fn backfill_from_pattern<D: Database>(
        &self,
        db: &mut D,
        sink: &mut dyn ReportSink,
        step: &str,
        spec: &BackfillSpec,
    ) -> Result<BackfillResult, MigrationError> {
        let action = format!(
            "{}.{} -> ({}, {})",
            spec.table, spec.source, spec.first, spec.rest
        );
        if !self.inspect_table(db, &spec.table).await? {
            warn!("Backfill skipped: table {} does not exist", spec.table);
            let outcome = StepOutcome::skipped(format!("table `{}` does not exist", spec.table));
            return Ok(settle(sink, step, &action, outcome));
        }

        for target in spec.targets() {
            if !self.inspect_column(db, &spec.table, &target).await? {
                warn!("Backfill skipped: target column {}.{} missing", spec.table, target);
                return Ok(settle(
                    sink,
                    step,
                    &action,
                    StepOutcome::skipped(format!("target column `{}.{}` does not exist", spec.table, target)),
                ));
            }
        }

        if !self.inspect_column(db, &spec.table, &spec.source).await? {
            info!("Backfill source {}.{} already retired", spec.table, spec.source);
            return Ok(settle(
                sink,
                step,
                &action,
                StepOutcome::already_applied(format!(
                    "source column `{}` already retired; targets in place",
                    spec.source
                )),
            ));
        }

        let targets = spec.targets();
        let candidates = match db
            .backfill_candidates(&spec.table, &spec.key, &spec.source, &targets)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                sink.record(StepEvent::new(step, action.clone(), StepOutcome::failed(e.to_string())));
                return Err(e.into());
            }
        };

        if candidates.is_empty() {
            let outcome = StepOutcome::already_applied("no rows left to backfill");
            return Ok(settle(sink, step, &action, outcome));
        }

        info!("Backfilling {} rows of {}", candidates.len(), spec.table);
        let mut counts = BackfillCounts::default();

        for row in candidates {
            let Some((first, rest)) = spec.rule.apply(&row.value) else {
                counts.skipped += 1;
                counts.skipped_ids.push(row.id);
                continue;
            };

            let values = [(spec.first.clone(), first), (spec.rest.clone(), rest)];
            match db.update_row(&spec.table, &spec.key, row.id, &values).await {
                Ok(0) => {
                    counts.errored += 1;
                    counts.errors.push(RowError {
                        id: row.id,
                        reason: "row no longer exists".to_string(),
                    });
                }
                Ok(_) => counts.migrated += 1,
                Err(e) => {
                    warn!("Backfill of {} row {} failed: {}", spec.table, row.id, e);
                    counts.errored += 1;
                    counts.errors.push(RowError {
                        id: row.id,
                        reason: e.reason,
                    });
                }
            }
        }

        info!(
            "Backfill of {}: {} migrated, {} skipped, {} errored",
            spec.table, counts.migrated, counts.skipped, counts.errored
        );

        let tally = format!(
            "{} migrated, {} skipped, {} errored",
            counts.migrated, counts.skipped, counts.errored
        );
        // Only unparseable stragglers were left over from an earlier run
        let outcome = if counts.migrated == 0 && counts.errored == 0 {
            StepOutcome::already_applied(tally)
        } else {
            StepOutcome::applied(tally)
        };
        sink.record(StepEvent::new(step, action, outcome.clone()));
        sink.backfill_counts(step, &counts);

        Ok(BackfillResult { outcome, counts })
    }
}

fn settle(sink: &mut dyn ReportSink, step: &str, action: &str, outcome: StepOutcome) -> BackfillResult {
    sink.record(StepEvent::new(step, action, outcome.clone()));
    BackfillResult {
        outcome,
        counts: BackfillCounts::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::{FailPoint, MemoryDatabase};
    use crate::report::RunReport;
    use pretty_assertions::assert_eq;

    fn spec() -> BackfillSpec {
        BackfillSpec {
            table: "students".to_string(),
            key: "id".to_string(),
            source: "place_of_birth".to_string(),
            first: "birth_city".to_string(),
            rest: "birth_province".to_string(),
            rule: SplitRule::FIRST_COMMA,
        }
    }

    fn students() -> MemoryDatabase {
        let mut db = MemoryDatabase::new();
        db.create_table(
            "students",
            &["id", "name", "place_of_birth", "birth_city", "birth_province"],
            Some("id"),
        );
        db.insert("students", &[None, Some("Ana"), Some("Sariaya, Quezon")]);
        db.insert("students", &[None, Some("Ben"), Some("Lucena")]);
        db.insert("students", &[None, Some("Cora"), Some("")]);
        db.insert("students", &[None, Some("Dan"), None]);
        db.insert("students", &[None, Some("Eli"), Some(" , ")]);
        db
    }

    #[test]
    fn test_split_rule() {
        let rule = SplitRule::FIRST_COMMA;
        assert_eq!(
            rule.apply("Sariaya, Quezon"),
            Some(("Sariaya".to_string(), "Quezon".to_string()))
        );
        assert_eq!(rule.apply("Lucena"), Some(("Lucena".to_string(), String::new())));
        assert_eq!(
            rule.apply("Sta. Cruz, Laguna, Philippines"),
            Some(("Sta. Cruz".to_string(), "Laguna, Philippines".to_string()))
        );
        assert_eq!(rule.apply("  ,  "), None);
        assert_eq!(rule.apply(""), None);
    }

    #[tokio::test]
    async fn test_backfill_counts_and_values() {
        let mut db = students();
        let mut report = RunReport::new();

        let result = Migrator::new()
            .backfill_from_pattern(&mut db, &mut report, "backfill", &spec())
            .await
            .unwrap();

        // Empty and null sources are not candidates at all
        assert_eq!(result.counts.migrated, 2);
        assert_eq!(result.counts.skipped, 1);
        assert_eq!(result.counts.skipped_ids, vec![5]);
        assert_eq!(result.counts.errored, 0);

        assert_eq!(db.value("students", 1, "birth_city").as_deref(), Some("Sariaya"));
        assert_eq!(db.value("students", 1, "birth_province").as_deref(), Some("Quezon"));
        assert_eq!(db.value("students", 2, "birth_city").as_deref(), Some("Lucena"));
        assert_eq!(db.value("students", 2, "birth_province").as_deref(), Some(""));
        assert_eq!(db.value("students", 3, "birth_city"), None);
        assert_eq!(db.value("students", 4, "birth_city"), None);
    }

    #[tokio::test]
    async fn test_row_failure_does_not_abort() {
        let mut db = students();
        db.fail_on(FailPoint::UpdateRow(1));
        let mut report = RunReport::new();

        let result = Migrator::new()
            .backfill_from_pattern(&mut db, &mut report, "backfill", &spec())
            .await
            .unwrap();

        assert_eq!(result.counts.migrated, 1);
        assert_eq!(result.counts.errored, 1);
        assert_eq!(result.counts.errors[0].id, 1);
        assert_eq!(db.value("students", 2, "birth_city").as_deref(), Some("Lucena"));
        assert!(matches!(result.outcome, StepOutcome::Applied { .. }));
        assert!(report.step("backfill").unwrap().backfill.is_some());
    }

    #[tokio::test]
    async fn test_second_run_is_already_applied() {
        let mut db = students();
        db.insert("students", &[None, Some("Fe"), Some("Tiaong,Quezon")]);
        let migrator = Migrator::new();
        let mut report = RunReport::new();

        migrator
            .backfill_from_pattern(&mut db, &mut report, "backfill", &spec())
            .await
            .unwrap();
        assert_eq!(db.value("students", 6, "birth_province").as_deref(), Some("Quezon"));

        // The unparseable row stays a candidate; everything else is done
        let rerun = migrator
            .backfill_from_pattern(&mut db, &mut report, "backfill", &spec())
            .await
            .unwrap();
        assert_eq!(rerun.counts.migrated, 0);
        assert_eq!(rerun.counts.skipped, 1);
        assert!(matches!(rerun.outcome, StepOutcome::AlreadyApplied { .. }));
    }

    #[tokio::test]
    async fn test_missing_targets_is_skipped() {
        let mut db = MemoryDatabase::new();
        db.create_table("students", &["id", "place_of_birth"], Some("id"));
        let mut report = RunReport::new();

        let result = Migrator::new()
            .backfill_from_pattern(&mut db, &mut report, "backfill", &spec())
            .await
            .unwrap();
        assert!(matches!(result.outcome, StepOutcome::SkippedPreconditionMissing { .. }));
    }

    #[tokio::test]
    async fn test_retired_source_counts_as_applied() {
        let mut db = MemoryDatabase::new();
        db.create_table("students", &["id", "birth_city", "birth_province"], Some("id"));
        let mut report = RunReport::new();

        let result = Migrator::new()
            .backfill_from_pattern(&mut db, &mut report, "backfill", &spec())
            .await
            .unwrap();
        assert!(matches!(result.outcome, StepOutcome::AlreadyApplied { .. }));
    }
}
