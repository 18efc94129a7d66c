use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:5000`).
    #[serde(default = "default_http_listen")]
    pub http_listen: String,
    pub storage: StorageConfig,
    pub proxy: ProxyConfig,
}

fn default_http_listen() -> String {
    "0.0.0.0:5000".to_string()
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root directory for the local content-addressable store.
    pub rootdirectory: String,
}

// ---------------------------------------------------------------------------
// Proxy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Base URL of the upstream registry (e.g. `https://registry-1.docker.io`).
    pub remoteurl: String,
    /// Upstream username; anonymous when absent.
    #[serde(default)]
    pub username: Option<String>,
    /// Upstream password.
    #[serde(default)]
    pub password: Option<String>,
    /// Cache TTL in seconds for blobs and manifests.  `0` disables TTL
    /// scheduling entirely.
    #[serde(default = "default_ttl_secs")]
    pub ttl: u64,
}

fn default_ttl_secs() -> u64 {
    7 * 24 * 60 * 60
}

impl ProxyConfig {
    /// The configured TTL, or `None` when scheduling is disabled.
    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl > 0).then(|| Duration::from_secs(self.ttl))
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load and parse the YAML configuration file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let yaml = r#"
storage:
  rootdirectory: /var/lib/ocicache/registry
proxy:
  remoteurl: https://registry-1.docker.io
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.http_listen, "0.0.0.0:5000");
        assert_eq!(config.proxy.remoteurl, "https://registry-1.docker.io");
        assert!(config.proxy.username.is_none());
        assert_eq!(config.proxy.ttl, 604800);
        assert_eq!(config.proxy.ttl(), Some(Duration::from_secs(604800)));
    }

    #[test]
    fn parses_full_config() {
        let yaml = r#"
http_listen: "127.0.0.1:5001"
storage:
  rootdirectory: /tmp/registry
proxy:
  remoteurl: https://upstream.example.com
  username: mirror
  password: hunter2
  ttl: 3600
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.http_listen, "127.0.0.1:5001");
        assert_eq!(config.proxy.username.as_deref(), Some("mirror"));
        assert_eq!(config.proxy.ttl(), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn ttl_zero_disables_scheduling() {
        let yaml = r#"
storage:
  rootdirectory: /tmp/registry
proxy:
  remoteurl: https://upstream.example.com
  ttl: 0
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.proxy.ttl(), None);
    }

    #[test]
    fn missing_remoteurl_is_an_error() {
        let yaml = r#"
storage:
  rootdirectory: /tmp/registry
proxy: {}
"#;
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }
}
