use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::trust::TrustConfig;

/// Where script-originated log output goes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum LogMode {
    /// Chat and developer log.
    #[default]
    All = 0,
    ChatOnly = 1,
    DeveloperLogOnly = 2,
}

impl LogMode {
    pub fn to_chat(&self) -> bool {
        !matches!(self, LogMode::DeveloperLogOnly)
    }

    pub fn to_developer_log(&self) -> bool {
        !matches!(self, LogMode::ChatOnly)
    }
}

/// The parts of host configuration the diagnostics pipeline reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Show chat diagnostics for participants other than the local one.
    pub log_others: bool,
    pub script_log: LogMode,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub log_others: bool,
    pub script_log: LogMode,
    pub trust: TrustConfig,
}

impl HostConfig {
    /// Reads the configuration from `path`, or returns the defaults when no path is given.
    pub fn from_json_file(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading host config from {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("parsing host config {}", path.display()))
    }

    pub fn logging(&self) -> LoggingConfig {
        LoggingConfig {
            log_others: self.log_others,
            script_log: self.script_log,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_path_yields_defaults() {
        let config = HostConfig::from_json_file(None).expect("defaults");
        assert_eq!(config, HostConfig::default());
        assert_eq!(config.script_log, LogMode::All);
    }

    #[test]
    fn log_mode_uses_numeric_encoding() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("host.json");
        fs::write(
            &path,
            r#"{"log_others": true, "script_log": 2, "trust": {"defaults": {"tick_instructions": 10}}}"#,
        )?;
        let config = HostConfig::from_json_file(Some(&path))?;
        assert!(config.log_others);
        assert_eq!(config.script_log, LogMode::DeveloperLogOnly);
        assert!(!config.script_log.to_chat());
        assert!(config.script_log.to_developer_log());
        assert_eq!(config.trust.defaults.tick_instructions, 10);
        Ok(())
    }

    #[test]
    fn malformed_config_reports_path() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("broken.json");
        fs::write(&path, "{ not json")?;
        let err = HostConfig::from_json_file(Some(&path)).expect_err("parse should fail");
        assert!(format!("{err:#}").contains("broken.json"));
        Ok(())
    }
}
