//! The registrar's migration plan
//!
//! Every table the plan touches is named once in [`tables`]; nothing else in
//! the crate spells a registrar table name out.

use crate::db::ColumnSpec;
use crate::migrator::{BackfillSpec, MigrationStep, RenameMapping, SplitRule, StepKind};

/// Current registrar table names
pub mod tables {
    pub const STUDENTS: &str = "students";
    pub const COURSES: &str = "courses";
    pub const ADVISERS: &str = "advisers";
    pub const CHECKLIST_ITEMS: &str = "checklist_items";
    pub const ENROLLMENTS: &str = "enrollments";
    pub const RECEIPTS: &str = "receipts";

    /// Names used before the rename, paired with their replacements
    pub const LEGACY: [(&str, &str); 6] = [
        ("tblstudents", STUDENTS),
        ("tblcourses", COURSES),
        ("tbladvisers", ADVISERS),
        ("tblchecklist", CHECKLIST_ITEMS),
        ("tblenrollments", ENROLLMENTS),
        ("tblreceipts", RECEIPTS),
    ];
}

pub const RENAME_LEGACY_TABLES: &str = "rename_legacy_tables";
pub const ADD_STUDENT_BIRTHPLACE_COLUMNS: &str = "add_student_birthplace_columns";
pub const BACKFILL_STUDENT_BIRTHPLACE: &str = "backfill_student_birthplace";
pub const LINK_RECEIPTS_TO_ENROLLMENTS: &str = "link_receipts_to_enrollments";
pub const RETIRE_STUDENT_LEGACY_COLUMNS: &str = "retire_student_legacy_columns";

/// The ordered plan. Later steps assume the earlier ones went through.
pub fn registrar_plan() -> Vec<MigrationStep> {
    vec![
        MigrationStep::new(
            RENAME_LEGACY_TABLES,
            "Rename tbl-prefixed tables to their current names",
            StepKind::RenameTables {
                mapping: tables::LEGACY
                    .iter()
                    .map(|(from, to)| RenameMapping::new(*from, *to))
                    .collect(),
            },
        ),
        MigrationStep::new(
            ADD_STUDENT_BIRTHPLACE_COLUMNS,
            "Add birth city and province to students",
            StepKind::AddColumns {
                table: tables::STUDENTS.to_string(),
                columns: vec![
                    ColumnSpec::nullable("birth_city", "VARCHAR(100)").after("place_of_birth"),
                    ColumnSpec::nullable("birth_province", "VARCHAR(100)").after("birth_city"),
                ],
            },
        ),
        MigrationStep::new(
            BACKFILL_STUDENT_BIRTHPLACE,
            "Split place_of_birth into birth city and province",
            StepKind::Backfill(BackfillSpec {
                table: tables::STUDENTS.to_string(),
                key: "id".to_string(),
                source: "place_of_birth".to_string(),
                first: "birth_city".to_string(),
                rest: "birth_province".to_string(),
                rule: SplitRule::FIRST_COMMA,
            }),
        ),
        MigrationStep::new(
            LINK_RECEIPTS_TO_ENROLLMENTS,
            "Add the enrollment reference to receipts",
            StepKind::AddColumns {
                table: tables::RECEIPTS.to_string(),
                columns: vec![ColumnSpec::nullable("enrollment_id", "INTEGER")],
            },
        ),
        MigrationStep::new(
            RETIRE_STUDENT_LEGACY_COLUMNS,
            "Drop place_of_birth and age from students, keeping a backup",
            StepKind::RemoveColumns {
                table: tables::STUDENTS.to_string(),
                columns: vec!["place_of_birth".to_string(), "age".to_string()],
            },
        ),
    ]
}
