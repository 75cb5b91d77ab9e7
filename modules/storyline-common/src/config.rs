use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;

/// Log output format for the binaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Application configuration loaded from environment variables.
/// Contains only secrets and env-specific values; clustering tunables live in
/// the TOML `ClusteringConfig`.
#[derive(Debug, Clone)]
pub struct AppConfig {
    // Database
    pub database_url: String,
    pub database_max_connections: u32,

    // Clustering tunables file
    pub config_path: PathBuf,

    // Logging
    pub log_format: LogFormat,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL is required")?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("DATABASE_MAX_CONNECTIONS must be a number")?,
            config_path: env::var("STORYLINE_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("config/clustering.toml")),
            log_format: match env::var("LOG_FORMAT").as_deref() {
                Ok("json") => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        Ok(config)
    }

    /// Each concurrent pass holds one pooled connection for its partition lock
    /// and needs at least one more for queries and commits.
    pub fn check_pool_capacity(&self, max_concurrent_partitions: usize) -> Result<()> {
        let required = max_concurrent_partitions.saturating_add(1);
        if (self.database_max_connections as usize) < required {
            anyhow::bail!(
                "DATABASE_MAX_CONNECTIONS ({}) must be greater than scheduler.max_concurrent_partitions ({})",
                self.database_max_connections,
                max_concurrent_partitions
            );
        }
        Ok(())
    }

    /// Log the loaded configuration without leaking credentials.
    pub fn log_redacted(&self) {
        info!(
            database = redact_url(&self.database_url).as_str(),
            max_connections = self.database_max_connections,
            config_path = %self.config_path.display(),
            "Configuration loaded"
        );
    }
}

/// Strip the userinfo part of a connection URL.
fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &url[..scheme_end], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_connections: u32) -> AppConfig {
        AppConfig {
            database_url: "postgres://db/storyline".into(),
            database_max_connections: max_connections,
            config_path: PathBuf::from("config/clustering.toml"),
            log_format: LogFormat::Pretty,
        }
    }

    #[test]
    fn pool_must_exceed_concurrent_partitions() {
        assert!(config(4).check_pool_capacity(4).is_err());
        assert!(config(3).check_pool_capacity(4).is_err());
        assert!(config(5).check_pool_capacity(4).is_ok());
        assert!(config(10).check_pool_capacity(4).is_ok());
    }

    #[test]
    fn redacts_credentials() {
        assert_eq!(
            redact_url("postgres://user:secret@db:5432/storyline"),
            "postgres://***@db:5432/storyline"
        );
        assert_eq!(redact_url("postgres://db/storyline"), "postgres://db/storyline");
    }
}
