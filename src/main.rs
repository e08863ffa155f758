//! registrar-migrate - schema migrator for the short-course registrar
//!
//! Brings a registrar database from the legacy `tbl*` layout to the current
//! one through an ordered set of idempotent steps. Destructive steps take a
//! backup first, and any table can be rolled back from its backups.
//!
//! The binary is used either one-shot from an operator's shell (`run`,
//! `rollback`, ...) or as a small admin HTTP API (`serve`).

mod auth;
mod config;
mod db;
mod error;
mod migrator;
mod models;
mod plan;
mod report;
mod routes;
mod state;

use crate::auth::Role;
use crate::config::Settings;
use crate::db::{create_pool, PgDatabase};
use crate::error::MigrationError;
use crate::migrator::Migrator;
use crate::plan::registrar_plan;
use crate::report::{ConsoleSink, RunReport};
use crate::routes::create_router;
use crate::state::AppState;
use clap::{Parser, Subcommand};
use std::io;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "registrar-migrate", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the registered steps in order
    Plan,
    /// Run every step, or a single named one
    Run {
        #[arg(long)]
        step: Option<String>,
        /// Print the full report as JSON instead of streaming progress
        #[arg(long)]
        json: bool,
    },
    /// Restore a table from a backup (the most recent one by default)
    Rollback {
        #[arg(long)]
        table: String,
        #[arg(long)]
        backup: Option<String>,
    },
    /// List the backups of a table
    Backups {
        #[arg(long)]
        table: String,
    },
    /// Drop a backup table
    PurgeBackup { name: String },
    /// Start the admin HTTP API
    Serve,
    /// Mint a bearer token for the admin API
    Token {
        #[arg(long)]
        role: Role,
        #[arg(long)]
        user: Option<Uuid>,
    },
}

/// Exit status when a table was dropped and not restored
const EXIT_IRRECOVERABLE: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("error: {:#}", e);
            match e.downcast_ref::<MigrationError>() {
                Some(m) if m.is_irrecoverable() => ExitCode::from(EXIT_IRRECOVERABLE),
                _ => ExitCode::FAILURE,
            }
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let settings = Settings::load()?;
    let migrator = Migrator::new();
    let plan = registrar_plan();

    match cli.command {
        Command::Plan => {
            for (i, step) in plan.iter().enumerate() {
                let marker = if step.is_destructive() { " [destructive]" } else { "" };
                println!("{}. {}{} - {}", i + 1, step.name, marker, step.description);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Run { step, json } => {
            let mut db = connect(&settings).await?;

            let summary = if json {
                let mut report = RunReport::new();
                let summary = migrator
                    .run_plan(&mut db, &mut report, &plan, step.as_deref())
                    .await;
                println!("{}", serde_json::to_string_pretty(&report)?);
                summary?
            } else {
                let mut sink = ConsoleSink::new(io::stdout());
                migrator
                    .run_plan(&mut db, &mut sink, &plan, step.as_deref())
                    .await?
            };

            Ok(if summary.succeeded() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Rollback { table, backup } => {
            let mut db = connect(&settings).await?;
            let mut sink = ConsoleSink::new(io::stdout());
            let result = migrator
                .rollback(&mut db, &mut sink, &table, backup.as_deref())
                .await?;
            println!(
                "Restored {} ({} rows) from {}",
                result.table, result.rows, result.backup
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Backups { table } => {
            let mut db = connect(&settings).await?;
            let backups = migrator.list_backups(&mut db, &table).await?;
            if backups.is_empty() {
                println!("No backups of {}", table);
            }
            for name in backups {
                println!("{}", name);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::PurgeBackup { name } => {
            let mut db = connect(&settings).await?;
            let mut sink = ConsoleSink::new(io::stdout());
            migrator.purge_backup(&mut db, &mut sink, &name).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Token { role, user } => {
            let user = user.unwrap_or_else(Uuid::new_v4);
            let token = auth::create_token(user, role, &settings.auth.jwt_secret)?;
            println!("{}", token);
            Ok(ExitCode::SUCCESS)
        }
        Command::Serve => {
            serve(settings).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn connect(settings: &Settings) -> anyhow::Result<PgDatabase> {
    let pool = create_pool(&settings.database).await?;
    Ok(PgDatabase::connect(&pool, &settings.database.schema).await?)
}

async fn serve(settings: Settings) -> anyhow::Result<()> {
    info!("Starting registrar-migrate admin API...");

    let pool = create_pool(&settings.database).await?;
    info!("Database pool created successfully");

    let addr = SocketAddr::from((settings.server.host, settings.server.port));
    let state = Arc::new(AppState::new(pool, settings.clone()));
    let app = create_router(state, &settings);

    info!("Server listening on http://{}", addr);
    info!("API Endpoints:");
    info!("   GET    /health                - Liveness");
    info!("   GET    /api/migrations        - List steps (bookkeeper)");
    info!("   POST   /api/migrations/run    - Run plan or one step (admin)");
    info!("   GET    /api/backups/:table    - List backups (bookkeeper)");
    info!("   POST   /api/rollback          - Restore from backup (admin)");
    info!("   DELETE /api/backups/:name     - Purge a backup (admin)");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Initialize tracing with structured logging
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));

    // Logs go to stderr so stdout stays clean for reports
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(io::stderr)
                .with_target(true)
                .with_level(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .compact(),
        )
        .init();
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown...");
        },
    }
}
