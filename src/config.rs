//! Engine configuration
//!
//! Loaded from a JSON file; every field is optional and falls back to its
//! default. Environment variables override the file, command-line flags
//! override both.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default server port
pub const DEFAULT_PORT: u16 = 7171;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Address the server listens on
    pub host: String,
    pub port: u16,
    /// How often the vacuum checks whether it has work
    pub vacuum_interval_ms: u64,
    /// Records read from the store per batch
    pub scan_batch_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            vacuum_interval_ms: 1000,
            scan_batch_size: 128,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("invalid config {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `KVSQL_HOST`, `KVSQL_PORT`, `KVSQL_VACUUM_INTERVAL_MS` and
    /// `KVSQL_SCAN_BATCH_SIZE` when set
    pub fn with_env(mut self) -> Result<Self> {
        if let Ok(host) = std::env::var("KVSQL_HOST") {
            self.host = host;
        }
        if let Some(port) = env_number("KVSQL_PORT")? {
            self.port = port;
        }
        if let Some(interval) = env_number("KVSQL_VACUUM_INTERVAL_MS")? {
            self.vacuum_interval_ms = interval;
        }
        if let Some(batch) = env_number("KVSQL_SCAN_BATCH_SIZE")? {
            self.scan_batch_size = batch;
        }
        self.validate()?;
        Ok(self)
    }

    /// Set host
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set port
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.scan_batch_size == 0 {
            return Err(Error::Config("scan_batch_size must be positive".to_string()));
        }
        if self.vacuum_interval_ms == 0 {
            return Err(Error::Config("vacuum_interval_ms must be positive".to_string()));
        }
        Ok(())
    }

    pub fn vacuum_interval(&self) -> Duration {
        Duration::from_millis(self.vacuum_interval_ms)
    }

    /// Get bind address
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{} is not a valid number: {}", name, raw))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.bind_address(), "127.0.0.1:7171");
        assert_eq!(config.vacuum_interval(), Duration::from_secs(1));
        assert_eq!(config.scan_batch_size, 128);
    }

    #[test]
    fn test_builder() {
        let config = EngineConfig::new().host("0.0.0.0").port(9000);
        assert_eq!(config.bind_address(), "0.0.0.0:9000");
    }

    #[test]
    fn test_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"port": 8080, "scan_batch_size": 16}}"#).unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.scan_batch_size, 16);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.vacuum_interval_ms, 1000);
    }

    #[test]
    fn test_invalid_files() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "port = 8080").unwrap();
        assert!(matches!(EngineConfig::from_file(file.path()), Err(Error::Config(_))));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"scan_batch_size": 0}}"#).unwrap();
        assert!(matches!(EngineConfig::from_file(file.path()), Err(Error::Config(_))));

        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            EngineConfig::from_file(dir.path().join("missing.json")),
            Err(Error::Config(_))
        ));
    }
}
