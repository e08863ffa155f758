//! Migration route handlers
//!
//! Every handler takes the caller's [`AuthContext`]. Anything that changes
//! the schema holds the run lock for its whole duration, so two operators
//! never migrate at the same time.

use crate::auth::{AuthContext, Role};
use crate::db::PgDatabase;
use crate::error::{validation_error, ApiResult};
use crate::models::{
    BackupListResponse, MessageResponse, RollbackRequest, RollbackResponse, RunRequest,
    RunResponse, StepInfo, StepListResponse, SuccessResponse,
};
use crate::report::RunReport;
use crate::state::SharedState;
use axum::{
    extract::{Path, State},
    Json,
};
use tracing::{info, warn};
use validator::Validate;

/// List the registered steps in order
pub async fn list_steps(
    State(state): State<SharedState>,
    auth: AuthContext,
) -> ApiResult<Json<SuccessResponse<StepListResponse>>> {
    auth.require(Role::Bookkeeper)?;

    let steps: Vec<StepInfo> = state.plan.iter().map(StepInfo::from).collect();

    Ok(Json(SuccessResponse::with_data(
        format!("{} steps registered", steps.len()),
        StepListResponse { steps },
    )))
}

/// Run the whole plan, or a single step of it
pub async fn run_migrations(
    State(state): State<SharedState>,
    auth: AuthContext,
    Json(payload): Json<RunRequest>,
) -> ApiResult<Json<SuccessResponse<RunResponse>>> {
    auth.require(Role::Admin)?;
    payload.validate().map_err(|e| validation_error(e.to_string()))?;

    let _guard = state.run_lock.lock().await;
    info!(
        "Run of {} requested by {}",
        payload.step.as_deref().unwrap_or("all steps"),
        auth.user_id
    );

    let mut db = PgDatabase::connect(&state.db_pool, state.schema()).await?;
    let mut report = RunReport::new();

    let summary = state
        .migrator
        .run_plan(&mut db, &mut report, &state.plan, payload.step.as_deref())
        .await?;

    let message = match summary.aborted_at {
        Some(ref step) => {
            warn!("Run {} aborted after {}", report.id, step);
            format!("Run aborted after step `{}`", step)
        }
        None => "Run completed".to_string(),
    };

    Ok(Json(SuccessResponse::with_data(message, RunResponse {
        succeeded: summary.succeeded(),
        report,
    })))
}

/// List the backups of a table, oldest first
pub async fn list_backups(
    State(state): State<SharedState>,
    auth: AuthContext,
    Path(table): Path<String>,
) -> ApiResult<Json<SuccessResponse<BackupListResponse>>> {
    auth.require(Role::Bookkeeper)?;

    let mut db = PgDatabase::connect(&state.db_pool, state.schema()).await?;
    let backups = state.migrator.list_backups(&mut db, &table).await?;

    Ok(Json(SuccessResponse::with_data(
        format!("{} backups of `{}`", backups.len(), table),
        BackupListResponse { table, backups },
    )))
}

/// Restore a table from one of its backups
pub async fn rollback(
    State(state): State<SharedState>,
    auth: AuthContext,
    Json(payload): Json<RollbackRequest>,
) -> ApiResult<Json<SuccessResponse<RollbackResponse>>> {
    auth.require(Role::Admin)?;
    payload.validate().map_err(|e| validation_error(e.to_string()))?;

    let _guard = state.run_lock.lock().await;
    info!("Rollback of {} requested by {}", payload.table, auth.user_id);

    let mut db = PgDatabase::connect(&state.db_pool, state.schema()).await?;
    let mut report = RunReport::new();

    let result = state
        .migrator
        .rollback(&mut db, &mut report, &payload.table, payload.backup.as_deref())
        .await?;

    Ok(Json(SuccessResponse::with_data(
        format!("`{}` restored from `{}`", result.table, result.backup),
        RollbackResponse { rollback: result },
    )))
}

/// Drop a backup table for good
pub async fn purge_backup(
    State(state): State<SharedState>,
    auth: AuthContext,
    Path(name): Path<String>,
) -> ApiResult<Json<MessageResponse>> {
    auth.require(Role::Admin)?;

    let _guard = state.run_lock.lock().await;
    info!("Purge of {} requested by {}", name, auth.user_id);

    let mut db = PgDatabase::connect(&state.db_pool, state.schema()).await?;
    let mut report = RunReport::new();
    state.migrator.purge_backup(&mut db, &mut report, &name).await?;

    Ok(Json(MessageResponse::new(format!("Backup `{}` purged", name))))
}
