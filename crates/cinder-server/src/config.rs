//! Configuration file parsing.
//!
//! The format is the classic `key value` per line, `#` comments. Unknown
//! keys are logged and skipped so configs written for richer servers
//! still load.

use std::path::{Path, PathBuf};
use std::time::Duration;

use cinder_persistence::FsyncPolicy;
use thiserror::Error;
use tracing::warn;

/// A bad config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("config line {line}: bad value for '{key}': {value}")]
    BadValue {
        line: usize,
        key: String,
        value: String,
    },
}

/// Everything the server reads from its config file.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub databases: usize,
    pub requirepass: Option<String>,
    pub appendonly: bool,
    pub appendfilename: String,
    pub appendfsync: FsyncPolicy,
    pub maxclients: usize,
    pub dir: PathBuf,
    pub cluster_enable: bool,
    pub cluster_as_seed: bool,
    pub cluster_seed: String,
    pub peer_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 6399,
            databases: 16,
            requirepass: None,
            appendonly: false,
            appendfilename: "appendonly.aof".into(),
            appendfsync: FsyncPolicy::EverySec,
            maxclients: 1000,
            dir: PathBuf::from("."),
            cluster_enable: false,
            cluster_as_seed: false,
            cluster_seed: String::new(),
            peer_timeout: Duration::from_millis(2000),
        }
    }
}

impl ServerConfig {
    /// Loads a config file, applying defaults for unset keys.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parses config text.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for (line_no, raw) in contents.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once(char::is_whitespace) else {
                warn!("config line {}: key '{line}' has no value, skipped", line_no + 1);
                continue;
            };
            let key = key.to_ascii_lowercase();
            let value = value.trim();

            let bad = |key: &str, value: &str| ConfigError::BadValue {
                line: line_no + 1,
                key: key.to_owned(),
                value: value.to_owned(),
            };

            match key.as_str() {
                "bind" => config.bind = value.to_owned(),
                "port" => config.port = value.parse().map_err(|_| bad(&key, value))?,
                "databases" => {
                    config.databases = value.parse().map_err(|_| bad(&key, value))?;
                    if config.databases == 0 {
                        return Err(bad(&key, value));
                    }
                }
                "requirepass" => {
                    config.requirepass = (!value.is_empty()).then(|| value.to_owned())
                }
                "appendonly" => config.appendonly = parse_bool(value).ok_or_else(|| bad(&key, value))?,
                "appendfilename" => {
                    config.appendfilename = value.trim_matches('"').to_owned()
                }
                "appendfsync" => {
                    config.appendfsync = match value.to_ascii_lowercase().as_str() {
                        "always" => FsyncPolicy::Always,
                        "everysec" => FsyncPolicy::EverySec,
                        "no" => FsyncPolicy::No,
                        _ => return Err(bad(&key, value)),
                    }
                }
                "maxclients" => config.maxclients = value.parse().map_err(|_| bad(&key, value))?,
                "dir" => config.dir = PathBuf::from(value),
                "cluster-enable" => {
                    config.cluster_enable = parse_bool(value).ok_or_else(|| bad(&key, value))?
                }
                "cluster-as-seed" => {
                    config.cluster_as_seed = parse_bool(value).ok_or_else(|| bad(&key, value))?
                }
                "cluster-seed" => config.cluster_seed = value.to_owned(),
                "peer-timeout-ms" => {
                    let ms: u64 = value.parse().map_err(|_| bad(&key, value))?;
                    config.peer_timeout = Duration::from_millis(ms);
                }
                other => warn!("config: unknown key '{other}' skipped"),
            }
        }
        Ok(config)
    }

    /// The address clients (and peers) dial.
    pub fn announce_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// Where the AOF lives.
    pub fn aof_path(&self) -> PathBuf {
        self.dir.join(&self.appendfilename)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "yes" | "true" | "1" => Some(true),
        "no" | "false" | "0" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_empty() {
        let config = ServerConfig::parse("").unwrap();
        assert_eq!(config.port, 6399);
        assert_eq!(config.databases, 16);
        assert!(!config.appendonly);
        assert!(config.requirepass.is_none());
    }

    #[test]
    fn parses_a_typical_file() {
        let text = r#"
# cinder config
bind 127.0.0.1
port 7000
databases 4
requirepass hunter2
appendonly yes
appendfilename "cinder.aof"
appendfsync always
maxclients 64
dir /var/lib/cinder
cluster-enable yes
cluster-as-seed no
cluster-seed 10.0.0.1:7000
peer-timeout-ms 500
"#;
        let config = ServerConfig::parse(text).unwrap();
        assert_eq!(config.bind, "127.0.0.1");
        assert_eq!(config.port, 7000);
        assert_eq!(config.databases, 4);
        assert_eq!(config.requirepass.as_deref(), Some("hunter2"));
        assert!(config.appendonly);
        assert_eq!(config.appendfilename, "cinder.aof");
        assert_eq!(config.appendfsync, FsyncPolicy::Always);
        assert_eq!(config.maxclients, 64);
        assert_eq!(config.dir, PathBuf::from("/var/lib/cinder"));
        assert!(config.cluster_enable);
        assert!(!config.cluster_as_seed);
        assert_eq!(config.cluster_seed, "10.0.0.1:7000");
        assert_eq!(config.peer_timeout, Duration::from_millis(500));
        assert_eq!(config.aof_path(), PathBuf::from("/var/lib/cinder/cinder.aof"));
    }

    #[test]
    fn empty_requirepass_disables_auth() {
        // "requirepass" with only whitespace after it has no value token
        let config = ServerConfig::parse("requirepass  \n").unwrap();
        assert!(config.requirepass.is_none());
    }

    #[test]
    fn bad_values_error_with_position() {
        let err = ServerConfig::parse("port notaport\n").unwrap_err();
        assert!(matches!(err, ConfigError::BadValue { line: 1, .. }));

        assert!(ServerConfig::parse("databases 0\n").is_err());
        assert!(ServerConfig::parse("appendfsync sometimes\n").is_err());
    }

    #[test]
    fn unknown_keys_are_skipped() {
        let config = ServerConfig::parse("save 900 1\nport 7000\n").unwrap();
        assert_eq!(config.port, 7000);
    }
}
