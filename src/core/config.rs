//! Workspace configuration loaded from `keel.toml`.
//!
//! Every field has a default, so a missing file or a partial file is valid.
//! Values are checked once by [`KeelConfig::validate`] before any subsystem
//! sees them.

use crate::core::error::KeelError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const CONFIG_FILE_NAME: &str = "keel.toml";

pub const README_CHARS_MIN: usize = 500;
pub const README_CHARS_MAX: usize = 5000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct KeelConfig {
    pub memory: MemoryConfig,
    pub context: ContextConfig,
    pub maintenance: MaintenanceConfig,
    pub protection: ProtectionConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Cap on retained actions per project.
    pub max_entries: usize,
    /// Recent-actions window embedded in the context document.
    pub context_window: usize,
    /// Window served to raw API consumers.
    pub api_window: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_entries: 300,
            context_window: 5,
            api_window: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub readme_chars: usize,
    pub notes_max_chars: usize,
    pub recent_commits: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            readme_chars: 1400,
            notes_max_chars: 300,
            recent_commits: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub max_run_records: usize,
    pub max_log_bytes: u64,
    pub max_commits: usize,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            max_run_records: 50,
            max_log_bytes: 200 * 1024,
            max_commits: 50,
        }
    }
}

/// Extra guard patterns layered on top of the built-in rule set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProtectionConfig {
    pub read_allow: Vec<String>,
    pub write_allow: Vec<String>,
    pub delete_allow: Vec<String>,
    pub protected: Vec<String>,
}

impl KeelConfig {
    pub fn validate(&self) -> Result<(), KeelError> {
        if self.memory.max_entries == 0 {
            return Err(KeelError::ValidationError(
                "memory.max_entries must be at least 1".to_string(),
            ));
        }
        if self.memory.context_window == 0 || self.memory.api_window == 0 {
            return Err(KeelError::ValidationError(
                "memory windows must be at least 1".to_string(),
            ));
        }
        if self.memory.context_window > self.memory.max_entries {
            return Err(KeelError::ValidationError(format!(
                "memory.context_window ({}) exceeds memory.max_entries ({})",
                self.memory.context_window, self.memory.max_entries
            )));
        }
        if !(README_CHARS_MIN..=README_CHARS_MAX).contains(&self.context.readme_chars) {
            return Err(KeelError::ValidationError(format!(
                "context.readme_chars must be within {}..={}",
                README_CHARS_MIN, README_CHARS_MAX
            )));
        }
        if self.maintenance.max_run_records == 0
            || self.maintenance.max_log_bytes == 0
            || self.maintenance.max_commits == 0
        {
            return Err(KeelError::ValidationError(
                "maintenance caps must be non-zero".to_string(),
            ));
        }
        for pattern in self
            .protection
            .read_allow
            .iter()
            .chain(&self.protection.write_allow)
            .chain(&self.protection.delete_allow)
            .chain(&self.protection.protected)
        {
            if pattern.trim().is_empty() || pattern.split('/').any(|seg| seg == "..") {
                return Err(KeelError::ValidationError(format!(
                    "invalid protection pattern '{}'",
                    pattern
                )));
            }
        }
        Ok(())
    }
}

/// Load `keel.toml` from the workspace root; absent file means defaults.
pub fn load_config(root: &Path) -> Result<KeelConfig, KeelError> {
    let path = root.join(CONFIG_FILE_NAME);
    if !path.exists() {
        return Ok(KeelConfig::default());
    }
    let content = fs::read_to_string(&path).map_err(KeelError::IoError)?;
    let config: KeelConfig = toml::from_str(&content)
        .map_err(|e| KeelError::ValidationError(format!("{}: {}", path.display(), e)))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = KeelConfig::default();
        config.validate().unwrap();
        assert_eq!(config.memory.max_entries, 300);
        assert_eq!(config.memory.context_window, 5);
        assert_eq!(config.memory.api_window, 100);
        assert_eq!(config.context.readme_chars, 1400);
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config: KeelConfig = toml::from_str("[memory]\nmax_entries = 10\n").unwrap();
        assert_eq!(config.memory.max_entries, 10);
        assert_eq!(config.memory.context_window, 5);
        assert_eq!(config.maintenance.max_run_records, 50);
    }

    #[test]
    fn rejects_window_larger_than_cap() {
        let mut config = KeelConfig::default();
        config.memory.max_entries = 3;
        assert!(matches!(
            config.validate(),
            Err(KeelError::ValidationError(_))
        ));
    }

    #[test]
    fn rejects_traversal_in_patterns() {
        let mut config = KeelConfig::default();
        config.protection.write_allow.push("../outside/**".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = load_config(tmp.path()).unwrap();
        assert_eq!(config, KeelConfig::default());
    }

    #[test]
    fn malformed_file_is_a_validation_error() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join(CONFIG_FILE_NAME), "[memory\nmax_entries = ").unwrap();
        assert!(matches!(
            load_config(tmp.path()),
            Err(KeelError::ValidationError(_))
        ));
    }
}
