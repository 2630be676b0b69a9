#![warn(missing_docs)]

//! # potat-config
//!
//! Configuration loading for the PotatEval sandbox service.
//!
//! The service reads a single JSON document at startup and treats it as
//! immutable for the life of the process:
//!
//! ```json
//! {
//!   "port": 3000,
//!   "auth": "hunter2",
//!   "maxFetchConcurrency": 5
//! }
//! ```

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Errors from config parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse JSON.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level service configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    /// TCP port the HTTP server listens on.
    pub port: u16,

    /// Shared bearer secret checked on every `POST /eval`.
    pub auth: String,

    /// Concurrent outbound requests allowed from a running snippet.
    #[serde(default = "default_fetch_concurrency")]
    pub max_fetch_concurrency: usize,
}

fn default_fetch_concurrency() -> usize {
    5
}

impl ServiceConfig {
    /// Parse a config from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: ServiceConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.is_empty() {
            return Err(ConfigError::Invalid("auth secret must not be empty".into()));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid("port must be non-zero".into()));
        }
        if self.max_fetch_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "maxFetchConcurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_parses_full_document() {
        let json = r#"{ "port": 3000, "auth": "hunter2", "maxFetchConcurrency": 8 }"#;
        let config = ServiceConfig::from_json(json).unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.auth, "hunter2");
        assert_eq!(config.max_fetch_concurrency, 8);
    }

    #[test]
    fn fetch_concurrency_defaults_to_five() {
        let json = r#"{ "port": 3000, "auth": "hunter2" }"#;
        let config = ServiceConfig::from_json(json).unwrap();
        assert_eq!(config.max_fetch_concurrency, 5);
    }

    #[test]
    fn rejects_empty_auth() {
        let json = r#"{ "port": 3000, "auth": "" }"#;
        let err = ServiceConfig::from_json(json).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(err.to_string().contains("auth"));
    }

    #[test]
    fn rejects_zero_port() {
        let json = r#"{ "port": 0, "auth": "hunter2" }"#;
        let err = ServiceConfig::from_json(json).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_zero_fetch_concurrency() {
        let json = r#"{ "port": 3000, "auth": "hunter2", "maxFetchConcurrency": 0 }"#;
        let err = ServiceConfig::from_json(json).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_malformed_json() {
        let err = ServiceConfig::from_json("{ port: }").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = ServiceConfig::from_file(Path::new("/nonexistent/config.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
