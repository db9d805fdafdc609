//! core::config::schema
//!
//! Configuration schema types.
//!
//! The same schema is used for the global file and the repository file;
//! any field left unset falls through to the next scope.
//!
//! # Validation
//!
//! Config values are validated after parsing (positive limits, known
//! phase names, warn threshold not above the timeout).

use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::core::types::Phase;

/// One configuration file.
///
/// # Example
///
/// ```toml
/// [ui]
/// username = "Alice <alice@example.com>"
/// timeout = 600
/// timeout_warn = 10
/// allow_empty_commit = false
///
/// [commit]
/// description_size_limit = 65536
/// extras_size_limit = 4096
/// file_count_limit = 10000
///
/// [phases]
/// new_commit = "draft"
///
/// [devel]
/// strict_lock_order = true
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub ui: Option<UiConfig>,
    pub commit: Option<CommitConfig>,
    pub phases: Option<PhasesConfig>,
    pub devel: Option<DevelConfig>,
}

impl ConfigFile {
    /// Validate the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if any value is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(ui) = &self.ui {
            ui.validate()?;
        }
        if let Some(commit) = &self.commit {
            commit.validate()?;
        }
        if let Some(phases) = &self.phases {
            phases.validate()?;
        }
        Ok(())
    }
}

/// `[ui]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct UiConfig {
    /// Default commit author
    pub username: Option<String>,

    /// Seconds to wait for a lock before giving up
    pub timeout: Option<u64>,

    /// Seconds after which a lock wait is reported
    pub timeout_warn: Option<u64>,

    /// Allow commits with no file changes
    pub allow_empty_commit: Option<bool>,
}

impl UiConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(username) = &self.username {
            if username.trim().is_empty() || username.contains('\n') {
                return Err(ConfigError::InvalidValue(
                    "ui.username must be a single non-empty line".to_string(),
                ));
            }
        }
        if let (Some(timeout), Some(warn)) = (self.timeout, self.timeout_warn) {
            if warn > timeout {
                return Err(ConfigError::InvalidValue(format!(
                    "ui.timeout_warn ({}) exceeds ui.timeout ({})",
                    warn, timeout
                )));
            }
        }
        Ok(())
    }
}

/// `[commit]` section: policy limits checked before a commit transaction opens.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CommitConfig {
    /// Maximum description length in bytes
    pub description_size_limit: Option<u64>,

    /// Maximum total size of extra keys and values in bytes
    pub extras_size_limit: Option<u64>,

    /// Maximum number of changed files
    pub file_count_limit: Option<u64>,

    /// Accept control characters in commit messages
    pub allow_non_printable: Option<bool>,
}

impl CommitConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("description_size_limit", self.description_size_limit),
            ("extras_size_limit", self.extras_size_limit),
            ("file_count_limit", self.file_count_limit),
        ] {
            if value == Some(0) {
                return Err(ConfigError::InvalidValue(format!(
                    "commit.{} must be positive",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// `[phases]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PhasesConfig {
    /// Phase assigned to new commits ("public", "draft" or "secret")
    pub new_commit: Option<String>,
}

impl PhasesConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(phase) = &self.new_commit {
            phase.parse::<Phase>().map_err(|_| {
                ConfigError::InvalidValue(format!(
                    "invalid phases.new_commit '{}', must be one of: public, draft, secret",
                    phase
                ))
            })?;
        }
        Ok(())
    }
}

/// `[devel]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DevelConfig {
    /// Turn the lock-order warning into an error
    pub strict_lock_order: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_file() {
        let toml = r#"
            [ui]
            username = "Test <t@example.com>"
            timeout = 5
            timeout_warn = 1

            [commit]
            file_count_limit = 3

            [phases]
            new_commit = "secret"

            [devel]
            strict_lock_order = true
        "#;
        let parsed: ConfigFile = toml::from_str(toml).expect("parse");
        parsed.validate().expect("valid");
        assert_eq!(parsed.ui.as_ref().and_then(|u| u.timeout), Some(5));
        assert_eq!(
            parsed.commit.as_ref().and_then(|c| c.file_count_limit),
            Some(3)
        );
    }

    #[test]
    fn rejects_unknown_fields() {
        let result: Result<ConfigFile, _> = toml::from_str("[ui]\ncolour = true\n");
        assert!(result.is_err());
    }

    #[test]
    fn rejects_zero_limit() {
        let parsed: ConfigFile =
            toml::from_str("[commit]\nextras_size_limit = 0\n").expect("parse");
        assert!(matches!(
            parsed.validate(),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn rejects_unknown_phase() {
        let parsed: ConfigFile = toml::from_str("[phases]\nnew_commit = \"hidden\"\n").expect("parse");
        assert!(parsed.validate().is_err());
    }

    #[test]
    fn rejects_warn_above_timeout() {
        let parsed: ConfigFile =
            toml::from_str("[ui]\ntimeout = 1\ntimeout_warn = 2\n").expect("parse");
        assert!(parsed.validate().is_err());
    }
}
