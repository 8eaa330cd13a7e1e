use std::env;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_server_bind(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_keep_alive_window_ms")]
    pub keep_alive_window_ms: u64,
    #[serde(default = "default_max_active_lifetime_ms")]
    pub max_active_lifetime_ms: u64,
    #[serde(default = "default_max_result_retention_ms")]
    pub max_result_retention_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            keep_alive_window_ms: default_keep_alive_window_ms(),
            max_active_lifetime_ms: default_max_active_lifetime_ms(),
            max_result_retention_ms: default_max_result_retention_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl BrokerConfig {
    pub fn keep_alive_window(&self) -> Duration {
        Duration::from_millis(self.keep_alive_window_ms)
    }

    pub fn max_active_lifetime(&self) -> Duration {
        Duration::from_millis(self.max_active_lifetime_ms)
    }

    pub fn max_result_retention(&self) -> Duration {
        Duration::from_millis(self.max_result_retention_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_tools_enabled")]
    pub enabled: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            enabled: default_tools_enabled(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    #[serde(default = "default_poller_base_url")]
    pub base_url: String,
    #[serde(default = "default_keep_alive_interval_ms")]
    pub keep_alive_interval_ms: u64,
    #[serde(default = "default_fetch_interval_ms")]
    pub fetch_interval_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            base_url: default_poller_base_url(),
            keep_alive_interval_ms: default_keep_alive_interval_ms(),
            fetch_interval_ms: default_fetch_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub debug: bool,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let mut cfg = if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed reading config file {}", path.display()))?;
            toml::from_str::<Config>(&text)
                .with_context(|| format!("failed parsing TOML config {}", path.display()))?
        } else {
            Self::default()
        };
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    pub fn apply_cli_overrides(&mut self, bind: Option<&str>, debug: bool) {
        if let Some(bind) = bind {
            self.server.bind = bind.to_owned();
        }
        if debug {
            self.logging.debug = true;
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("COMMAND_BRIDGE_BIND") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.server.bind = trimmed.to_owned();
            }
        }
        if let Ok(v) = env::var("COMMAND_BRIDGE_KEEP_ALIVE_WINDOW_MS") {
            if let Ok(n) = v.parse::<u64>() {
                self.broker.keep_alive_window_ms = n.max(100);
            }
        }
        if let Ok(v) = env::var("COMMAND_BRIDGE_MAX_ACTIVE_LIFETIME_MS") {
            if let Ok(n) = v.parse::<u64>() {
                self.broker.max_active_lifetime_ms = n.max(100);
            }
        }
        if let Ok(v) = env::var("COMMAND_BRIDGE_MAX_RESULT_RETENTION_MS") {
            if let Ok(n) = v.parse::<u64>() {
                self.broker.max_result_retention_ms = n.max(100);
            }
        }
        if let Ok(v) = env::var("COMMAND_BRIDGE_SWEEP_INTERVAL_MS") {
            if let Ok(n) = v.parse::<u64>() {
                self.broker.sweep_interval_ms = n.max(50);
            }
        }
        if let Ok(v) = env::var("COMMAND_BRIDGE_TOOLS_ENABLED") {
            self.tools.enabled = parse_bool(&v);
        }
        if let Ok(v) = env::var("COMMAND_BRIDGE_POLLER_BASE_URL") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.poller.base_url = trimmed.to_owned();
            }
        }
        if let Ok(v) = env::var("COMMAND_BRIDGE_KEEP_ALIVE_INTERVAL_MS") {
            if let Ok(n) = v.parse::<u64>() {
                self.poller.keep_alive_interval_ms = n.max(50);
            }
        }
        if let Ok(v) = env::var("COMMAND_BRIDGE_FETCH_INTERVAL_MS") {
            if let Ok(n) = v.parse::<u64>() {
                self.poller.fetch_interval_ms = n.max(50);
            }
        }
        if let Ok(v) = env::var("COMMAND_BRIDGE_DEBUG") {
            self.logging.debug = parse_bool(&v);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.bind.trim().is_empty() {
            anyhow::bail!("server.bind must not be empty");
        }
        if self.broker.keep_alive_window_ms == 0 {
            anyhow::bail!("broker.keep_alive_window_ms must be > 0");
        }
        if self.broker.max_active_lifetime_ms == 0 {
            anyhow::bail!("broker.max_active_lifetime_ms must be > 0");
        }
        if self.broker.max_result_retention_ms == 0 {
            anyhow::bail!("broker.max_result_retention_ms must be > 0");
        }
        if self.broker.sweep_interval_ms == 0 {
            anyhow::bail!("broker.sweep_interval_ms must be > 0");
        }
        if self.poller.keep_alive_interval_ms == 0 {
            anyhow::bail!("poller.keep_alive_interval_ms must be > 0");
        }
        if self.poller.fetch_interval_ms == 0 {
            anyhow::bail!("poller.fetch_interval_ms must be > 0");
        }
        if self.poller.request_timeout_ms == 0 {
            anyhow::bail!("poller.request_timeout_ms must be > 0");
        }
        if self.poller.keep_alive_interval_ms >= self.broker.keep_alive_window_ms {
            anyhow::bail!(
                "poller.keep_alive_interval_ms must be lower than broker.keep_alive_window_ms"
            );
        }
        let base_url = Url::parse(&self.poller.base_url)
            .with_context(|| format!("poller.base_url is not a URL: {}", self.poller.base_url))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            anyhow::bail!("poller.base_url must use http or https");
        }
        Ok(())
    }

    /// Log filter implied by the config when no explicit filter is given.
    pub fn log_filter<'a>(&self, requested: &'a str) -> &'a str {
        if self.logging.debug {
            "debug"
        } else {
            requested
        }
    }
}

fn parse_bool(s: &str) -> bool {
    matches!(
        s.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn default_server_bind() -> String {
    "127.0.0.1:8695".to_owned()
}

fn default_keep_alive_window_ms() -> u64 {
    5_000
}

fn default_max_active_lifetime_ms() -> u64 {
    30_000
}

fn default_max_result_retention_ms() -> u64 {
    5 * 60 * 1_000
}

fn default_sweep_interval_ms() -> u64 {
    10_000
}

fn default_tools_enabled() -> bool {
    true
}

fn default_poller_base_url() -> String {
    "http://127.0.0.1:8695".to_owned()
}

fn default_keep_alive_interval_ms() -> u64 {
    4_000
}

fn default_fetch_interval_ms() -> u64 {
    1_000
}

fn default_request_timeout_ms() -> u64 {
    5_000
}
