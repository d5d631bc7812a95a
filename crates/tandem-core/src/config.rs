//! Configuration parsing for the pipeline engine.
//!
//! Key=value format loaded from `<project_root>/.tandem/config`, merged
//! over defaults. Unknown keys warn but do not fail.

use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::types::AgentKind;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    /// Review iterations allowed per phase before pausing.
    pub max_reviews: u32,
    /// Diff supplied to the implementation review, bounded in KiB.
    pub max_diff_kb: u32,
    /// Timeout per claude invocation in seconds.
    pub claude_timeout_sec: u32,
    /// Timeout per codex invocation in seconds.
    pub codex_timeout_sec: u32,
    /// Conversation log cap per session (oldest entries dropped on save).
    pub max_log_entries: usize,
    /// Store capacity (oldest sessions evicted first).
    pub max_sessions: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_reviews: 10,
            max_diff_kb: 50,
            claude_timeout_sec: 600,
            codex_timeout_sec: 600,
            max_log_entries: 200,
            max_sessions: 50,
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content (key=value format).
    fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };
            let key = key.trim();
            let value = Self::unquote(value.trim());
            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "max_reviews" => self.max_reviews = Self::parse_int(key, value)?,
            "max_diff_kb" => self.max_diff_kb = Self::parse_int(key, value)?,
            "claude_timeout_sec" => self.claude_timeout_sec = Self::parse_int(key, value)?,
            "codex_timeout_sec" => self.codex_timeout_sec = Self::parse_int(key, value)?,
            "max_log_entries" => {
                self.max_log_entries = Self::parse_int::<usize>(key, value)?;
            }
            "max_sessions" => {
                self.max_sessions = Self::parse_int::<usize>(key, value)?;
            }
            _ => {
                tracing::warn!(key, "unknown config key");
            }
        }
        Ok(())
    }

    fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Diff bound in bytes.
    pub fn max_diff_bytes(&self) -> usize {
        self.max_diff_kb as usize * 1024
    }

    /// Per-call timeout for the given agent kind.
    pub fn timeout_for(&self, kind: AgentKind) -> Duration {
        let secs = match kind {
            AgentKind::Claude => self.claude_timeout_sec,
            AgentKind::Codex => self.codex_timeout_sec,
        };
        Duration::from_secs(u64::from(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let config = Config::default();
        assert_eq!(config.max_reviews, 10);
        assert_eq!(config.max_diff_kb, 50);
        assert_eq!(config.claude_timeout_sec, 600);
        assert_eq!(config.max_log_entries, 200);
        assert_eq!(config.max_sessions, 50);
    }

    #[test]
    fn parse_simple_config() {
        let mut config = Config::default();
        let content = r#"
# overrides
max_reviews=3
max_diff_kb="25"
codex_timeout_sec=120
"#;
        config.parse_content(content).unwrap();
        assert_eq!(config.max_reviews, 3);
        assert_eq!(config.max_diff_kb, 25);
        assert_eq!(config.codex_timeout_sec, 120);
        // Untouched keys keep defaults.
        assert_eq!(config.claude_timeout_sec, 600);
    }

    #[test]
    fn invalid_int_rejected() {
        let mut config = Config::default();
        let result = config.parse_content("max_reviews=lots");
        assert!(matches!(result, Err(ConfigError::InvalidInt { .. })));
    }

    #[test]
    fn invalid_line_rejected() {
        let mut config = Config::default();
        assert!(config.parse_content("no equals sign").is_err());
    }

    #[test]
    fn unquote_removes_quotes() {
        assert_eq!(Config::unquote("\"hello\""), "hello");
        assert_eq!(Config::unquote("'world'"), "world");
        assert_eq!(Config::unquote("noquotes"), "noquotes");
    }

    #[test]
    fn timeout_resolves_per_kind() {
        let mut config = Config::default();
        config.claude_timeout_sec = 5;
        config.codex_timeout_sec = 7;
        assert_eq!(config.timeout_for(AgentKind::Claude), Duration::from_secs(5));
        assert_eq!(config.timeout_for(AgentKind::Codex), Duration::from_secs(7));
    }

    #[test]
    fn max_diff_bytes_scales_kb() {
        let config = Config::default();
        assert_eq!(config.max_diff_bytes(), 50 * 1024);
    }
}
