// src/config.rs
// Environment-based configuration - single source of truth for all env vars

use std::path::PathBuf;
use tracing::debug;

const DEFAULT_DB_PATH: &str = "lablink.db";
const DEFAULT_BASE_URL: &str = "http://localhost:8000";

/// Deployment settings loaded from environment variables.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    /// SQLite database location (LABLINK_DB)
    pub database_path: PathBuf,
    /// Base URL absolute start links are joined onto (LABLINK_BASE_URL)
    pub base_url: String,
}

impl EnvConfig {
    /// Load configuration from the environment (reads .env if present).
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let config = Self::from_vars(read_var("LABLINK_DB"), read_var("LABLINK_BASE_URL"));
        debug!(
            db = %config.database_path.display(),
            base_url = %config.base_url,
            "configuration loaded"
        );
        config
    }

    fn from_vars(db: Option<String>, base_url: Option<String>) -> Self {
        Self {
            database_path: PathBuf::from(db.unwrap_or_else(|| DEFAULT_DB_PATH.to_string())),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }
}

/// Read a single environment variable, filtering empty values
fn read_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EnvConfig::from_vars(None, None);
        assert_eq!(config.database_path, PathBuf::from("lablink.db"));
        assert_eq!(config.base_url, "http://localhost:8000");
    }

    #[test]
    fn test_explicit_vars() {
        let config = EnvConfig::from_vars(
            Some("/var/lib/lablink/lab.db".to_string()),
            Some("https://lab.example.org".to_string()),
        );
        assert_eq!(config.database_path, PathBuf::from("/var/lib/lablink/lab.db"));
        assert_eq!(config.base_url, "https://lab.example.org");
    }
}
