/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Configuration structure definitions
//!
//! Defines the schema for SteerDNS configuration files (YAML format).

use serde::Deserialize;
use serde_yml::Value;
use thiserror::Error;

/// Configuration validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Plugin tag cannot be empty")]
    EmptyPluginTag,

    #[error("Invalid log level: {0}")]
    InvalidLogLevel(String),

    #[error("Plugin type cannot be empty")]
    EmptyPluginType,

    #[error("Duplicate plugin tag: {0}")]
    DuplicatePluginTag(String),
}

/// Main server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging configuration (level, file output)
    #[serde(default)]
    pub log: LogConfig,

    /// List of plugins to load and their configurations
    pub plugins: Vec<PluginConfig>,
}

impl Config {
    /// Validate configuration
    ///
    /// Validates the configuration structure (log level, plugin tags/types).
    /// Plugin-specific validation (listen addresses, sequence commands) is
    /// delegated to each PluginFactory during plugin initialization.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.log.level.to_lowercase().as_str() {
            "off" | "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => return Err(ConfigError::InvalidLogLevel(self.log.level.clone())),
        }

        let mut seen = std::collections::HashSet::new();
        for plugin in &self.plugins {
            if plugin.tag.is_empty() {
                return Err(ConfigError::EmptyPluginTag);
            }
            if plugin.plugin_type.is_empty() {
                return Err(ConfigError::EmptyPluginType);
            }
            if !seen.insert(plugin.tag.as_str()) {
                return Err(ConfigError::DuplicatePluginTag(plugin.tag.clone()));
            }
        }

        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Log level: off, trace, debug, info, warn, error
    #[serde(default = "default_level")]
    pub level: String,

    /// Optional file path for log output (in addition to console)
    pub file: Option<String>,
}

impl Default for LogConfig {
    fn default() -> LogConfig {
        LogConfig {
            level: default_level(),
            file: None,
        }
    }
}

/// Default log level
fn default_level() -> String {
    "info".to_string()
}

/// Plugin configuration entry
#[derive(Debug, Clone, Deserialize)]
pub struct PluginConfig {
    /// Unique identifier for this plugin instance
    pub tag: String,

    /// Plugin type (e.g., "udp_server", "hosts")
    #[serde(rename = "type")]
    pub plugin_type: String,

    /// Plugin-specific arguments (parsed by plugin factory)
    pub args: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Config {
        serde_yml::from_str(yaml).unwrap()
    }

    #[test]
    fn minimal_config_parses_and_validates() {
        let config = parse(
            r#"
plugins:
  - tag: main
    type: sequence
    args:
      - hosts_cn
"#,
        );
        assert_eq!(config.log.level, "info");
        assert_eq!(config.plugins.len(), 1);
        config.validate().unwrap();
    }

    #[test]
    fn bad_log_level_is_rejected() {
        let config = parse(
            r#"
log:
  level: loud
plugins: []
"#,
        );
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel(_))
        ));
    }

    #[test]
    fn duplicate_tags_are_rejected() {
        let config = parse(
            r#"
plugins:
  - tag: a
    type: sequence
  - tag: a
    type: hosts
"#,
        );
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicatePluginTag(_))
        ));
    }
}
