//! Application configuration module
//!
//! Handles loading and validating configuration from environment variables.

use serde::Deserialize;
use std::net::Ipv4Addr;
use thiserror::Error;
use tracing::warn;

const DEV_JWT_SECRET: &str = "registrar-migrate-dev-secret-change-in-production";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: Ipv4Addr,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::new(0, 0, 0, 0), // Bind to 0.0.0.0 for Docker
            port: 3000,
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    /// Schema holding the registrar tables
    pub schema: String,
    pub max_pool_size: usize,
    pub require_tls: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: String::new(),
            database: "postgres".to_string(),
            schema: "public".to_string(),
            max_pool_size: 10,
            require_tls: false,
        }
    }
}

/// CORS configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["http://localhost:3001".to_string()],
        }
    }
}

/// Bearer token configuration
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: DEV_JWT_SECRET.to_string(),
        }
    }
}

/// Complete application settings
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub cors: CorsConfig,
    pub auth: AuthConfig,
}

impl Settings {
    /// Load settings from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if it exists (ignore errors if file not found)
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let server = ServerConfig {
            host: var("HOST")
                .and_then(|h| h.parse().ok())
                .unwrap_or_else(|| ServerConfig::default().host),
            port: var("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or_else(|| ServerConfig::default().port),
        };

        let max_pool_size = var("DB_MAX_CONNECTIONS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);
        let schema = var("DB_SCHEMA").unwrap_or_else(|| "public".to_string());
        if !crate::db::queries::is_valid_identifier(&schema) {
            return Err(ConfigError::InvalidValue(format!("DB_SCHEMA `{}` is not a valid identifier", schema)));
        }

        // Try to load DATABASE_URL first, fall back to individual vars
        let database = if let Some(database_url) = var("DATABASE_URL") {
            Self::parse_database_url(&database_url, schema, max_pool_size)?
        } else {
            DatabaseConfig {
                host: var("DB_HOST").unwrap_or_else(|| "localhost".to_string()),
                port: var("DB_PORT")
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(5432),
                user: var("DB_USER").unwrap_or_else(|| "postgres".to_string()),
                password: var("DB_PASSWORD").unwrap_or_default(),
                database: var("DB_NAME").unwrap_or_else(|| "postgres".to_string()),
                schema,
                max_pool_size,
                require_tls: var("DB_SSLMODE").is_some_and(|m| m == "require"),
            }
        };

        let cors = CorsConfig {
            allowed_origins: var("ALLOWED_ORIGINS")
                .map(|s| s.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_else(|| CorsConfig::default().allowed_origins),
        };

        let auth = AuthConfig {
            jwt_secret: var("JWT_SECRET").unwrap_or_else(|| {
                warn!("JWT_SECRET not set, using default (INSECURE - set in production!)");
                DEV_JWT_SECRET.to_string()
            }),
        };

        Ok(Self {
            server,
            database,
            cors,
            auth,
        })
    }

    /// Parse a DATABASE_URL connection string (postgresql://...)
    fn parse_database_url(
        url: &str,
        schema: String,
        max_pool_size: usize,
    ) -> Result<DatabaseConfig, ConfigError> {
        let parsed = url::Url::parse(url).map_err(|_| {
            ConfigError::InvalidValue("Invalid DATABASE_URL format (expected postgresql://...)".to_string())
        })?;

        let host = parsed
            .host_str()
            .ok_or_else(|| ConfigError::InvalidValue("Missing host in DATABASE_URL".to_string()))?
            .to_string();

        let database = parsed.path().trim_start_matches('/').to_string();
        if database.is_empty() {
            return Err(ConfigError::InvalidValue("Missing database name in DATABASE_URL".to_string()));
        }

        let require_tls = parsed
            .query_pairs()
            .any(|(k, v)| k == "sslmode" && v == "require");

        Ok(DatabaseConfig {
            host,
            port: parsed.port().unwrap_or(5432),
            user: parsed.username().to_string(),
            password: parsed.password().map(|p| p.to_string()).unwrap_or_default(),
            database,
            schema,
            max_pool_size,
            require_tls,
        })
    }
}
