//! Typed configuration records for the daemon.
//!
//! Configuration is data, not code: the file is a JSON document mapping
//! onto the records below, validated at load. Fetcher variants that hold
//! closures (`HttpDynamic`, `Callback`) cannot appear in a file and are
//! registered through the API instead.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::source::{Fetcher, SourceDescriptor};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    /// Pool byte cap.
    pub max_entropy_bytes: usize,
    /// Snapshot file path.
    pub persist_file: PathBuf,
    /// Seconds between background snapshots.
    pub persist_interval_s: u64,
    /// Per-chunk byte cap.
    pub pool_chunk_max_bytes: usize,
    /// Loopback control port.
    pub tcp_port: u16,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

/// One configured source.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Minimum seconds between fetches.
    pub interval_s: u64,
    /// Seconds before the first fetch.
    #[serde(default)]
    pub init_delay_s: u64,
    pub fetcher: FetcherConfig,
    #[serde(default)]
    pub prefetch_url: Option<String>,
    #[serde(default)]
    pub size_hint: Option<usize>,
    #[serde(default)]
    pub min_size: Option<usize>,
    #[serde(default = "default_true")]
    pub compress: bool,
    #[serde(default = "default_scale")]
    pub scale: f64,
}

/// Serializable fetcher variants. Tagged so the file reads
/// `{"type": "http", "url": "..."}` and stays self-describing.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FetcherConfig {
    Http { url: String },
    File { path: PathBuf },
    Command { argv: Vec<String> },
}

impl DaemonConfig {
    /// Read and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_entropy_bytes == 0 {
            return Err(invalid("max_entropy_bytes must be positive"));
        }
        if self.pool_chunk_max_bytes == 0 {
            return Err(invalid("pool_chunk_max_bytes must be positive"));
        }
        if self.pool_chunk_max_bytes > self.max_entropy_bytes {
            return Err(invalid(
                "pool_chunk_max_bytes must not exceed max_entropy_bytes",
            ));
        }
        if self.persist_interval_s == 0 {
            return Err(invalid("persist_interval_s must be positive"));
        }

        let mut names = HashSet::new();
        for source in &self.sources {
            if source.name.is_empty() {
                return Err(invalid("source name must not be empty"));
            }
            if source.interval_s == 0 {
                return Err(invalid(format!(
                    "source {}: interval_s must be positive",
                    source.name
                )));
            }
            if !(0.0..=1.0).contains(&source.scale) {
                return Err(invalid(format!(
                    "source {}: scale must be in [0, 1]",
                    source.name
                )));
            }
            if let FetcherConfig::Command { argv } = &source.fetcher {
                if argv.is_empty() {
                    return Err(invalid(format!(
                        "source {}: command argv must not be empty",
                        source.name
                    )));
                }
            }
            if source.enabled && !names.insert(source.name.as_str()) {
                return Err(invalid(format!(
                    "duplicate enabled source name {}",
                    source.name
                )));
            }
        }
        Ok(())
    }
}

impl SourceConfig {
    /// Turn the record into the immutable runtime descriptor.
    pub fn into_descriptor(self) -> SourceDescriptor {
        let fetcher = match self.fetcher {
            FetcherConfig::Http { url } => Fetcher::Http { url },
            FetcherConfig::File { path } => Fetcher::File { path },
            FetcherConfig::Command { argv } => Fetcher::Command { argv },
        };
        SourceDescriptor {
            name: self.name,
            enabled: self.enabled,
            interval: Duration::from_secs(self.interval_s),
            init_delay: Duration::from_secs(self.init_delay_s),
            fetcher,
            prefetch_url: self.prefetch_url,
            size_hint: self.size_hint,
            min_size: self.min_size,
            compress: self.compress,
            scale: self.scale,
        }
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

fn default_true() -> bool {
    true
}

fn default_scale() -> f64 {
    1.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_json() -> String {
        r#"{
            "max_entropy_bytes": 10485760,
            "persist_file": "/tmp/pool.egd",
            "persist_interval_s": 600,
            "pool_chunk_max_bytes": 65536,
            "tcp_port": 7770,
            "sources": [
                {
                    "name": "urandom",
                    "interval_s": 60,
                    "fetcher": {"type": "file", "path": "/dev/urandom"},
                    "size_hint": 4096,
                    "scale": 0.5
                },
                {
                    "name": "ps",
                    "interval_s": 300,
                    "init_delay_s": 10,
                    "fetcher": {"type": "command", "argv": ["ps", "-ef"]},
                    "min_size": 128,
                    "compress": true
                }
            ]
        }"#
        .to_string()
    }

    #[test]
    fn parses_and_validates_full_config() {
        let config: DaemonConfig = serde_json::from_str(&base_json()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.sources.len(), 2);
        assert!(config.sources[0].enabled, "enabled defaults to true");
        assert_eq!(config.sources[0].scale, 0.5);
        assert_eq!(config.sources[1].init_delay_s, 10);
    }

    #[test]
    fn into_descriptor_carries_everything_over() {
        let config: DaemonConfig = serde_json::from_str(&base_json()).unwrap();
        let desc = config.sources[1].clone().into_descriptor();
        assert_eq!(desc.name, "ps");
        assert_eq!(desc.interval, Duration::from_secs(300));
        assert_eq!(desc.init_delay, Duration::from_secs(10));
        assert_eq!(desc.min_size, Some(128));
        assert!(matches!(desc.fetcher, Fetcher::Command { ref argv } if argv[0] == "ps"));
    }

    #[test]
    fn rejects_out_of_range_scale() {
        let json = base_json().replace("\"scale\": 0.5", "\"scale\": 1.5");
        let config: DaemonConfig = serde_json::from_str(&json).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_duplicate_enabled_names() {
        let json = base_json().replace("\"name\": \"ps\"", "\"name\": \"urandom\"");
        let config: DaemonConfig = serde_json::from_str(&json).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn duplicate_name_allowed_when_disabled() {
        let json = base_json().replace(
            "\"name\": \"ps\",",
            "\"name\": \"urandom\", \"enabled\": false,",
        );
        let config: DaemonConfig = serde_json::from_str(&json).unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn rejects_unknown_fields() {
        let json = base_json().replace("\"tcp_port\": 7770", "\"tcp_port\": 7770, \"bogus\": 1");
        assert!(serde_json::from_str::<DaemonConfig>(&json).is_err());
    }

    #[test]
    fn rejects_chunk_cap_above_pool_cap() {
        let json = base_json().replace(
            "\"pool_chunk_max_bytes\": 65536",
            "\"pool_chunk_max_bytes\": 99999999",
        );
        let config: DaemonConfig = serde_json::from_str(&json).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn load_reports_missing_file() {
        let err = DaemonConfig::load(Path::new("/nonexistent/egd.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
