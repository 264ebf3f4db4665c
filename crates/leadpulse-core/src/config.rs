//! LeadPulse configuration system.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LeadPulseError, Result};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeadPulseConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub score: ScoreConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub renderer: RendererConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl LeadPulseConfig {
    /// Load config from the default path (~/.leadpulse/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| LeadPulseError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| LeadPulseError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the given path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| LeadPulseError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(LeadPulseError::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.worker.batch_size == 0 || self.worker.max_in_flight == 0 {
            return Err(LeadPulseError::Config(
                "worker.batch_size and worker.max_in_flight must be positive".into(),
            ));
        }
        if self.worker.lease_ttl_secs <= self.worker.dispatch_timeout_secs {
            return Err(LeadPulseError::Config(format!(
                "worker.lease_ttl_secs ({}) must exceed worker.dispatch_timeout_secs ({})",
                self.worker.lease_ttl_secs, self.worker.dispatch_timeout_secs
            )));
        }
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the LeadPulse home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".leadpulse")
    }
}

/// Expand `~` and environment variables in a configured path.
pub fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

fn bool_true() -> bool { true }

/// Execution store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

fn default_store_path() -> String { "~/.leadpulse/leadpulse.db".into() }

impl Default for StoreConfig {
    fn default() -> Self {
        Self { path: default_store_path() }
    }
}

impl StoreConfig {
    pub fn resolved_path(&self) -> PathBuf {
        expand_path(&self.path)
    }
}

/// Background worker (coordinator loop) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Identifies this process in leases; defaults to a random id.
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,
    #[serde(default = "default_dispatch_timeout")]
    pub dispatch_timeout_secs: u64,
    /// Cadence of TIME_TICK sweeps over known lead anchors.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub event_batch_size: usize,
}

fn default_poll_interval() -> u64 { 5 }
fn default_batch_size() -> usize { 100 }
fn default_max_in_flight() -> usize { 16 }
fn default_lease_ttl() -> u64 { 300 }
fn default_dispatch_timeout() -> u64 { 30 }
fn default_tick_interval() -> u64 { 60 }

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            poll_interval_secs: default_poll_interval(),
            batch_size: default_batch_size(),
            max_in_flight: default_max_in_flight(),
            lease_ttl_secs: default_lease_ttl(),
            dispatch_timeout_secs: default_dispatch_timeout(),
            tick_interval_secs: default_tick_interval(),
            event_batch_size: default_batch_size(),
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }
}

/// Dispatch retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total dispatch attempts before an execution becomes FAILED_TERMINAL.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Backoff after the 1st, 2nd, ... failure. The last entry repeats.
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: Vec<u64>,
}

fn default_max_attempts() -> u32 { 3 }
fn default_backoff_secs() -> Vec<u64> { vec![3600, 14400] }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_secs: default_backoff_secs(),
        }
    }
}

/// Temperature score recalculation hook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreConfig {
    /// HTTP endpoint that recomputes a lead's score. Disabled when unset.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_score_retry_delay")]
    pub retry_delay_secs: u64,
}

fn default_score_retry_delay() -> u64 { 5 }

impl Default for ScoreConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            max_attempts: default_max_attempts(),
            retry_delay_secs: default_score_retry_delay(),
        }
    }
}

/// Outbound channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelsConfig {
    /// Channel used by steps that do not name one.
    #[serde(default = "default_channel")]
    pub default: String,
    /// Log every dispatch instead of sending.
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub webhook: Option<WebhookChannelConfig>,
    #[serde(default)]
    pub email: Option<EmailChannelConfig>,
    #[serde(default)]
    pub whatsapp: Option<WhatsAppChannelConfig>,
}

fn default_channel() -> String { "email".into() }

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            default: default_channel(),
            dry_run: false,
            webhook: None,
            email: None,
            whatsapp: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookChannelConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailChannelConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub from_address: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

fn default_smtp_port() -> u16 { 587 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhatsAppChannelConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    pub access_token: String,
    pub phone_number_id: String,
    #[serde(default = "default_graph_version")]
    pub api_version: String,
}

fn default_graph_version() -> String { "v21.0".into() }

/// Template renderer used by the email and WhatsApp channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendererConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_renderer_timeout")]
    pub timeout_secs: u64,
}

fn default_renderer_timeout() -> u64 { 10 }

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: default_renderer_timeout(),
        }
    }
}

/// Operator alerts for terminal dispatch failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

fn default_history_limit() -> usize { 100 }

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            webhook_url: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub json: bool,
}
