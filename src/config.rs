//! Process-level configuration loaded from the environment.
//!
//! Tunables that belong to a single subsystem (safety limits, trailing
//! parameters, schedules) live next to that subsystem; this module only
//! covers endpoints and credentials sourced from `.env` / the environment.

use std::env;

/// Endpoints and connection settings for external collaborators.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// SQLite ledger URL
    pub database_url: String,

    /// Base URL of the IB proxy (broker gateway)
    pub ib_proxy_url: String,

    /// Base URL of the market data service (quotes + daily bars)
    pub data_api_url: String,

    /// Optional webhook for operational notifications
    pub webhook_url: Option<String>,
}

impl AppConfig {
    /// Read configuration from the environment, falling back to local defaults.
    pub fn from_env() -> Self {
        Self {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./trailguard.db?mode=rwc".to_string()),
            ib_proxy_url: env::var("IB_PROXY_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:6680".to_string()),
            data_api_url: env::var("DATA_API_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:6681".to_string()),
            webhook_url: env::var("WEBHOOK_URL").ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_env() {
        // Guard against accidental env leakage from the host
        std::env::remove_var("DATABASE_URL");
        std::env::remove_var("IB_PROXY_URL");

        let config = AppConfig::from_env();
        assert!(config.database_url.starts_with("sqlite:"));
        assert!(config.ib_proxy_url.starts_with("http"));
    }
}
