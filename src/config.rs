//! Configuration management for the nonce keeper
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub keeper: KeeperConfig,
    pub network: NetworkConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeeperConfig {
    pub resubmit_interval_secs: u64,
    pub rpc_timeout_ms: u64,
    pub block_wait_timeout_ms: u64,
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
    pub health_check_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub chain_id: u64,
    pub rpc_urls: Vec<String>,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

fn default_event_channel_capacity() -> usize {
    10_000
}

impl KeeperConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn block_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.block_wait_timeout_ms)
    }

    pub fn resubmit_interval(&self) -> Duration {
        Duration::from_secs(self.resubmit_interval_secs)
    }
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            resubmit_interval_secs: 30,
            rpc_timeout_ms: 10_000,
            block_wait_timeout_ms: 60_000,
            event_channel_capacity: default_event_channel_capacity(),
            health_check_interval_secs: 60,
        }
    }
}

impl Settings {
    /// Load settings from the file named by `NONCE_KEEPER_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("NONCE_KEEPER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::from_path(&config_path)
    }

    /// Load settings from a specific file
    pub fn from_path(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::from_toml(&config_str)
    }

    /// Parse settings from TOML text, substituting `${VAR}` references first
    pub fn from_toml(config_str: &str) -> Result<Self> {
        let config_str = substitute_env_vars(config_str)?;

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.network.rpc_urls.iter().all(|url| url.trim().is_empty()) {
            anyhow::bail!("Network {} has no RPC URLs configured", self.network.chain_id);
        }
        if self.network.poll_interval_ms == 0 {
            anyhow::bail!("network.poll_interval_ms must be greater than zero");
        }
        if self.keeper.resubmit_interval_secs == 0 {
            anyhow::bail!("keeper.resubmit_interval_secs must be greater than zero");
        }
        if self.keeper.event_channel_capacity == 0 {
            anyhow::bail!("keeper.event_channel_capacity must be greater than zero");
        }
        if self.keeper.rpc_timeout_ms == 0 {
            tracing::warn!("keeper.rpc_timeout_ms is zero - every RPC call will time out");
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")?;

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[keeper]
resubmit_interval_secs = 15
rpc_timeout_ms = 5000
block_wait_timeout_ms = 30000
health_check_interval_secs = 60

[network]
chain_id = 1
rpc_urls = ["https://rpc.example.com/${KEEPER_TEST_RPC_KEY}"]
poll_interval_ms = 2000

[api]
host = "127.0.0.1"
port = 8080

[metrics]
enabled = false
port = 9090
"#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input).unwrap();
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_load_from_file() {
        env::set_var("KEEPER_TEST_RPC_KEY", "secret");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let settings = Settings::from_path(file.path()).unwrap();
        assert_eq!(settings.network.rpc_urls, vec!["https://rpc.example.com/secret"]);
        assert_eq!(settings.keeper.resubmit_interval(), Duration::from_secs(15));
        assert_eq!(settings.keeper.event_channel_capacity, 10_000);
        assert!(!settings.metrics.enabled);
    }

    #[test]
    fn test_rejects_missing_rpc_urls() {
        let config = SAMPLE.replace(
            r#"rpc_urls = ["https://rpc.example.com/${KEEPER_TEST_RPC_KEY}"]"#,
            "rpc_urls = []",
        );
        assert!(Settings::from_toml(&config).is_err());
    }
}
