//! Core runtime configuration.
//!
//! # Responsibility
//! - Parse the JSON configuration consumed by embedders and the CLI.
//! - Validate values with the same rules `init_logging` enforces.
//!
//! # Invariants
//! - Every field has a default; an empty object `{}` is a valid config.
//! - A config that passed `validate` never makes `init_logging` fail on
//!   level or directory shape.

use crate::logging::{default_log_level, normalize_level, normalize_log_dir};
use crate::updater::DEFAULT_STATE_KEY;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

/// Logging section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Absolute directory for rolling log files; `None` keeps logging off.
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level().to_string(),
            log_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub logging: LoggingConfig,
    /// SQLite file holding durable update state; in-memory when absent.
    pub state_db_path: Option<PathBuf>,
    /// Settings key of the update state record.
    pub state_key: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            state_db_path: None,
            state_key: DEFAULT_STATE_KEY.to_string(),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, source: std::io::Error },
    Parse(serde_json::Error),
    Invalid(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config `{}`: {source}", path.display())
            }
            Self::Parse(err) => write!(f, "malformed config: {err}"),
            Self::Invalid(message) => write!(f, "invalid config: {message}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse(err) => Some(err),
            Self::Invalid(_) => None,
        }
    }
}

impl CoreConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        normalize_level(&self.logging.level).map_err(ConfigError::Invalid)?;
        if let Some(dir) = &self.logging.log_dir {
            let dir = dir
                .to_str()
                .ok_or_else(|| ConfigError::Invalid("log_dir must be valid UTF-8".to_string()))?;
            normalize_log_dir(dir).map_err(ConfigError::Invalid)?;
        }
        if self.state_key.trim().is_empty() {
            return Err(ConfigError::Invalid("state_key cannot be empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{ConfigError, CoreConfig};
    use crate::logging::default_log_level;
    use crate::updater::DEFAULT_STATE_KEY;
    use std::path::PathBuf;

    #[test]
    fn empty_object_uses_defaults() {
        let config = CoreConfig::from_json_str("{}").expect("empty config");
        assert_eq!(config, CoreConfig::default());
        assert_eq!(config.logging.level, default_log_level());
        assert_eq!(config.state_key, DEFAULT_STATE_KEY);
        assert!(config.state_db_path.is_none());
    }

    #[test]
    fn parses_nested_sections() {
        let config = CoreConfig::from_json_str(
            r#"{"logging":{"level":"warn"},"state_db_path":"/tmp/state.db","state_key":"app/updates"}"#,
        )
        .expect("full config");
        assert_eq!(config.logging.level, "warn");
        assert_eq!(config.state_db_path, Some(PathBuf::from("/tmp/state.db")));
        assert_eq!(config.state_key, "app/updates");
    }

    #[test]
    fn rejects_bad_values() {
        let err = CoreConfig::from_json_str(r#"{"logging":{"level":"loud"}}"#)
            .expect_err("unknown level");
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = CoreConfig::from_json_str(r#"{"logging":{"log_dir":"relative/logs"}}"#)
            .expect_err("relative log dir");
        assert!(err.to_string().contains("absolute"));

        let err = CoreConfig::from_json_str(r#"{"state_key":"  "}"#).expect_err("blank key");
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = CoreConfig::from_json_str("{not json").expect_err("malformed");
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let err = CoreConfig::load(dir.path().join("missing.json")).expect_err("missing file");
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
