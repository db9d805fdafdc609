//! core::config
//!
//! Configuration schema and loading.
//!
//! # Overview
//!
//! vcstore has two configuration scopes:
//! - **Global**: User-level settings
//! - **Repo**: `.vcs/config.toml` inside the repository
//!
//! # Precedence
//!
//! Configuration values are resolved in this order (later overrides earlier):
//! 1. Default values
//! 2. Global config file
//! 3. Repo config file
//!
//! # Global Config Locations
//!
//! Searched in order:
//! 1. `$VCSTORE_CONFIG` if set
//! 2. `$XDG_CONFIG_HOME/vcstore/config.toml`
//! 3. `~/.vcstore/config.toml`
//!
//! # Example
//!
//! ```no_run
//! use vcstore::core::config::Config;
//! use std::path::Path;
//!
//! let config = Config::load(Some(Path::new("/path/to/repo/.vcs"))).unwrap();
//! println!("lock timeout: {:?}", config.timeout());
//! println!("new commits are {}", config.new_commit_phase());
//! ```

pub mod schema;

pub use schema::{CommitConfig, ConfigFile, DevelConfig, PhasesConfig, UiConfig};

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::core::types::Phase;

/// Errors from configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

/// Default lock timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Default lock-wait warning threshold in seconds.
pub const DEFAULT_TIMEOUT_WARN_SECS: u64 = 10;

/// Merged configuration from all sources.
///
/// Accessors apply precedence automatically: the repo file overrides the
/// global file, which overrides built-in defaults.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Global configuration
    pub global: ConfigFile,
    /// Repository configuration (if present)
    pub repo: Option<ConfigFile>,
    global_path: Option<PathBuf>,
    repo_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from default locations.
    ///
    /// If `local_dir` (the repository's `.vcs` directory) is provided, its
    /// `config.toml` is layered on top of the global file.
    ///
    /// # Errors
    ///
    /// Returns an error if config files exist but cannot be parsed or hold
    /// invalid values. Missing files are not an error.
    pub fn load(local_dir: Option<&Path>) -> Result<Self, ConfigError> {
        let (global, global_path) = Self::load_global()?;
        let mut config = Self::with_global(global);
        config.global_path = global_path;
        if let Some(dir) = local_dir {
            config.load_repo(dir)?;
        }
        Ok(config)
    }

    /// Build a config from an explicit global layer, skipping the file search.
    pub fn with_global(global: ConfigFile) -> Self {
        Self {
            global,
            ..Self::default()
        }
    }

    /// Parse a TOML string as the repository layer.
    pub fn from_repo_toml(contents: &str) -> Result<Self, ConfigError> {
        let file = Self::parse(contents, Path::new("<inline>"))?;
        Ok(Self {
            repo: Some(file),
            ..Self::default()
        })
    }

    /// Layer `<local_dir>/config.toml` on top of this config, if it exists.
    pub fn load_repo(&mut self, local_dir: &Path) -> Result<(), ConfigError> {
        let path = local_dir.join("config.toml");
        if path.exists() {
            self.repo = Some(Self::read_file(&path)?);
            self.repo_path = Some(path);
        }
        Ok(())
    }

    fn load_global() -> Result<(ConfigFile, Option<PathBuf>), ConfigError> {
        // 1. Check $VCSTORE_CONFIG
        if let Ok(path) = std::env::var("VCSTORE_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                let config = Self::read_file(&path)?;
                return Ok((config, Some(path)));
            }
        }

        // 2. Check $XDG_CONFIG_HOME/vcstore/config.toml
        if let Ok(xdg_home) = std::env::var("XDG_CONFIG_HOME") {
            let path = PathBuf::from(xdg_home).join("vcstore/config.toml");
            if path.exists() {
                let config = Self::read_file(&path)?;
                return Ok((config, Some(path)));
            }
        }

        // 3. Check ~/.vcstore/config.toml
        if let Some(home) = dirs::home_dir() {
            let path = home.join(".vcstore/config.toml");
            if path.exists() {
                let config = Self::read_file(&path)?;
                return Ok((config, Some(path)));
            }
        }

        Ok((ConfigFile::default(), None))
    }

    fn read_file(path: &Path) -> Result<ConfigFile, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse(&contents, path)
    }

    fn parse(contents: &str, path: &Path) -> Result<ConfigFile, ConfigError> {
        let file: ConfigFile = toml::from_str(contents).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        file.validate()?;
        Ok(file)
    }

    /// Path of the global file that was loaded, if any.
    pub fn global_path(&self) -> Option<&Path> {
        self.global_path.as_deref()
    }

    /// Path of the repository file that was loaded, if any.
    pub fn repo_path(&self) -> Option<&Path> {
        self.repo_path.as_deref()
    }

    /// Resolve a value, repo layer first.
    fn pick<T>(&self, get: impl Fn(&ConfigFile) -> Option<T>) -> Option<T> {
        self.repo.as_ref().and_then(&get).or_else(|| get(&self.global))
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn username(&self) -> Option<String> {
        self.pick(|f| f.ui.as_ref()?.username.clone())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(
            self.pick(|f| f.ui.as_ref()?.timeout)
                .unwrap_or(DEFAULT_TIMEOUT_SECS),
        )
    }

    pub fn timeout_warn(&self) -> Duration {
        Duration::from_secs(
            self.pick(|f| f.ui.as_ref()?.timeout_warn)
                .unwrap_or(DEFAULT_TIMEOUT_WARN_SECS),
        )
    }

    pub fn allow_empty_commit(&self) -> bool {
        self.pick(|f| f.ui.as_ref()?.allow_empty_commit)
            .unwrap_or(false)
    }

    pub fn description_size_limit(&self) -> Option<u64> {
        self.pick(|f| f.commit.as_ref()?.description_size_limit)
    }

    pub fn extras_size_limit(&self) -> Option<u64> {
        self.pick(|f| f.commit.as_ref()?.extras_size_limit)
    }

    pub fn file_count_limit(&self) -> Option<u64> {
        self.pick(|f| f.commit.as_ref()?.file_count_limit)
    }

    pub fn allow_non_printable(&self) -> bool {
        self.pick(|f| f.commit.as_ref()?.allow_non_printable)
            .unwrap_or(false)
    }

    /// Phase for newly created commits (default: draft).
    pub fn new_commit_phase(&self) -> Phase {
        self.pick(|f| f.phases.as_ref()?.new_commit.as_ref()?.parse().ok())
            .unwrap_or(Phase::Draft)
    }

    pub fn strict_lock_order(&self) -> bool {
        self.pick(|f| f.devel.as_ref()?.strict_lock_order)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.timeout(), Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        assert_eq!(
            config.timeout_warn(),
            Duration::from_secs(DEFAULT_TIMEOUT_WARN_SECS)
        );
        assert_eq!(config.new_commit_phase(), Phase::Draft);
        assert!(!config.allow_empty_commit());
        assert!(!config.strict_lock_order());
        assert_eq!(config.file_count_limit(), None);
    }

    #[test]
    fn repo_overrides_global() {
        let global: ConfigFile =
            toml::from_str("[ui]\ntimeout = 30\nusername = \"global\"\n").expect("parse");
        let mut config = Config::with_global(global);
        config.repo = Some(toml::from_str("[ui]\ntimeout = 2\n").expect("parse"));

        assert_eq!(config.timeout(), Duration::from_secs(2));
        // Unset in repo, falls through to global
        assert_eq!(config.username().as_deref(), Some("global"));
    }

    #[test]
    fn load_repo_file() {
        let temp = TempDir::new().expect("temp dir");
        fs::write(
            temp.path().join("config.toml"),
            "[phases]\nnew_commit = \"secret\"\n",
        )
        .expect("write");

        let mut config = Config::default();
        config.load_repo(temp.path()).expect("load");
        assert_eq!(config.new_commit_phase(), Phase::Secret);
        assert_eq!(config.repo_path(), Some(temp.path().join("config.toml").as_path()));
    }

    #[test]
    fn load_repo_missing_file_is_fine() {
        let temp = TempDir::new().expect("temp dir");
        let mut config = Config::default();
        config.load_repo(temp.path()).expect("load");
        assert!(config.repo.is_none());
    }

    #[test]
    fn load_repo_invalid_file_errors() {
        let temp = TempDir::new().expect("temp dir");
        fs::write(temp.path().join("config.toml"), "[ui\n").expect("write");
        let mut config = Config::default();
        let err = config.load_repo(temp.path()).expect_err("should fail");
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn from_repo_toml_validates() {
        assert!(Config::from_repo_toml("[commit]\nfile_count_limit = 0\n").is_err());
        let config = Config::from_repo_toml("[devel]\nstrict_lock_order = true\n").expect("parse");
        assert!(config.strict_lock_order());
    }
}
