//! Connection pool construction

use crate::config::DatabaseConfig;
use crate::db::DbError;
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use tokio_postgres::NoTls;
use tracing::info;

/// Connections are reset on return to the pool. A run that fails between
/// suspending and restoring constraint checks must not hand a session with
/// `session_replication_role = replica` to the next request.
fn manager_config() -> ManagerConfig {
    ManagerConfig {
        recycling_method: RecyclingMethod::Clean,
    }
}

/// Build a pool from configuration and verify it with a round trip.
pub async fn create_pool(config: &DatabaseConfig) -> Result<Pool, DbError> {
    let mut cfg = Config::new();
    cfg.host = Some(config.host.clone());
    cfg.port = Some(config.port);
    cfg.user = Some(config.user.clone());
    cfg.password = Some(config.password.clone());
    cfg.dbname = Some(config.database.clone());
    cfg.manager = Some(manager_config());
    cfg.pool = Some(PoolConfig::new(config.max_pool_size));

    let pool = if config.require_tls {
        let certs = rustls_native_certs::load_native_certs();
        let mut root_store = rustls::RootCertStore::empty();
        for cert in certs.certs {
            root_store.add(cert).ok();
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let tls = tokio_postgres_rustls::MakeRustlsConnect::new(tls_config);

        cfg.create_pool(Some(Runtime::Tokio1), tls)
            .map_err(|e| DbError::new("<create pool>", format!("Failed to create TLS pool: {}", e)))?
    } else {
        cfg.create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| DbError::new("<create pool>", format!("Failed to create pool: {}", e)))?
    };

    let client = pool
        .get()
        .await
        .map_err(|e| DbError::new("<connect>", e.to_string()))?;
    client
        .query_one("SELECT 1", &[])
        .await
        .map_err(|e| DbError::new("SELECT 1", e.to_string()))?;

    info!(
        "Database connection to {}:{}/{} verified (TLS: {})",
        config.host, config.port, config.database, config.require_tls
    );
    Ok(pool)
}
