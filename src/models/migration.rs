//! Migration-related models and DTOs

use crate::db::queries::is_valid_identifier;
use crate::migrator::{MigrationStep, RollbackResult};
use crate::report::RunReport;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Request to run the plan or one step of it
#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    #[validate(length(min = 1, max = 63, message = "Step name must be between 1 and 63 characters"))]
    pub step: Option<String>,
}

/// Request to restore a table from a backup
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RollbackRequest {
    #[validate(custom(function = "validate_identifier"))]
    pub table: String,

    /// Defaults to the most recent backup
    #[validate(custom(function = "validate_identifier"))]
    pub backup: Option<String>,
}

/// One registered step
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepInfo {
    #[serde(flatten)]
    pub step: MigrationStep,
    pub destructive: bool,
}

impl From<&MigrationStep> for StepInfo {
    fn from(step: &MigrationStep) -> Self {
        Self {
            step: step.clone(),
            destructive: step.is_destructive(),
        }
    }
}

/// Response containing the registered plan
#[derive(Debug, Serialize)]
pub struct StepListResponse {
    pub steps: Vec<StepInfo>,
}

/// Response for a run
#[derive(Debug, Serialize)]
pub struct RunResponse {
    /// False when a step failed and the run was cut short
    pub succeeded: bool,
    pub report: RunReport,
}

/// Response containing the backups of a table
#[derive(Debug, Serialize)]
pub struct BackupListResponse {
    pub table: String,
    pub backups: Vec<String>,
}

/// Response for a rollback
#[derive(Debug, Serialize)]
pub struct RollbackResponse {
    pub rollback: RollbackResult,
}

/// Validate a plain PostgreSQL identifier
fn validate_identifier(name: &str) -> Result<(), validator::ValidationError> {
    if !is_valid_identifier(name) {
        let mut err = validator::ValidationError::new("invalid_identifier");
        err.message = Some(
            "Must start with a letter or underscore and contain only letters, digits, underscores."
                .into(),
        );
        return Err(err);
    }
    Ok(())
}
