//! Configuration for the `bugtrail` binary.
//!
//! Read from `$XDG_CONFIG_HOME/bugtrail/config.toml`. Every key is optional;
//! command-line flags override whatever the file says.
//!
//! ```toml
//! database = ".bugtrail/results.db"
//! hash_type = "path-sensitive"
//! hash_workers = 8
//! lock_policy = "reject"
//! log_level = "debug"
//! ```

use std::path::{Path, PathBuf};

use bugtrail_core::LockPolicy;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: String,
    /// Kept as text so an unknown variant is reported when it is used.
    pub hash_type: String,
    /// `None` means one worker per available CPU.
    pub hash_workers: Option<usize>,
    pub lock_policy: LockPolicy,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: ".bugtrail/results.db".to_owned(),
            hash_type: "context-free".to_owned(),
            hash_workers: None,
            lock_policy: LockPolicy::Block,
            log_level: "info".to_owned(),
        }
    }
}

/// Returns the path to the bugtrail config file.
///
/// Prefers `$XDG_CONFIG_HOME/bugtrail/config.toml`; falls back to
/// `~/.config/bugtrail/config.toml` when the env var is absent.
pub fn config_path() -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".config"))
        })
        .unwrap_or_else(|| PathBuf::from(".config"));
    base.join("bugtrail").join("config.toml")
}

/// Loads the config from the default location.
pub fn load() -> Config {
    load_from(&config_path())
}

/// Loads the config at `path`.
///
/// Returns defaults if the file does not exist or cannot be parsed. Never
/// fails: logging is not set up yet, so a parse error goes to stderr.
pub fn load_from(path: &Path) -> Config {
    let raw = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(_) => return Config::default(),
    };
    match parse(&raw) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("bugtrail: config parse error in {:?}: {}", path, e);
            Config::default()
        }
    }
}

fn parse(raw: &str) -> Result<Config, toml::de::Error> {
    toml::from_str(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config = parse("hash_type = \"path-sensitive\"\nlock_policy = \"reject\"").unwrap();
        assert_eq!(config.hash_type, "path-sensitive");
        assert_eq!(config.lock_policy, LockPolicy::Reject);
        assert_eq!(config.database, ".bugtrail/results.db");
        assert_eq!(config.hash_workers, None);
    }

    #[test]
    fn test_unknown_lock_policy_is_rejected() {
        assert!(parse("lock_policy = \"sometimes\"").is_err());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = load_from(Path::new("/nonexistent/bugtrail/config.toml"));
        assert_eq!(config, Config::default());
    }
}
