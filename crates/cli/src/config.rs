//! Binary configuration: an optional TOML file, overridden by flags and
//! environment variables.
//!
//! ```toml
//! [database]
//! url = "sqlite://orchestrator.db"
//! max_connections = 10
//!
//! [engine]
//! max_concurrent_steps = 32
//! default_step_timeout_ms = 60000
//! ```

use std::path::Path;

use anyhow::Context;
use engine::EngineConfig;
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://orchestrator.db".to_string(),
            max_connections: 10,
        }
    }
}

impl AppConfig {
    /// Defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Apply a `--database-url` / `DATABASE_URL` override.
    pub fn with_database_url(mut self, url: Option<String>) -> Self {
        if let Some(url) = url {
            self.database.url = url;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn missing_path_gives_defaults() {
        let config = AppConfig::load(None).unwrap();
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.engine, EngineConfig::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[database]\nurl = \"sqlite::memory:\"\n\n[engine]\nmax_concurrent_steps = 4\nmax_handoff_depth = 1"
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.database.url, "sqlite::memory:");
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.engine.max_concurrent_steps, Some(4));
        assert_eq!(config.engine.max_handoff_depth, 1);
        assert_eq!(config.engine.default_step_timeout_ms, 120_000);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[engine\nmax_concurrent_steps = ").unwrap();
        assert!(AppConfig::load(Some(file.path())).is_err());
    }

    #[test]
    fn flag_overrides_file_url() {
        let config = AppConfig::default().with_database_url(Some("sqlite://other.db".into()));
        assert_eq!(config.database.url, "sqlite://other.db");
    }
}
