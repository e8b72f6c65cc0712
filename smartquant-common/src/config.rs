//! Configuration management for the SmartQuant advisor.
//!
//! The service reads a single configuration file at `~/.smartquant/config.json`.
//!
//! # Configuration Priority
//!
//! 1. Environment variables (see below)
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `SMARTQUANT_LOG_LEVEL` → observability.log_level
//! - `SMARTQUANT_DATA_DIR` → advisor.data_dir
//! - `SMARTQUANT_PORT` → advisor.port
//! - `SMARTQUANT_API_KEY` → secrets.llm.api_key
//! - `TUSHARE_TOKEN` → secrets.tushare_tokens (comma separated)
//! - `WXPUSHER_TOKEN` → secrets.wxpusher.app_token

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Error;

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".smartquant"),
        |dirs| dirs.home_dir().join(".smartquant"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

// ============================================================================
// Root Configuration
// ============================================================================

/// Root configuration for the advisor service.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Advisor service configuration (storage, HTTP, scan job)
    #[serde(default)]
    pub advisor: AdvisorConfig,

    /// Decision scheduler configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Credentials for external collaborators
    #[serde(default)]
    pub secrets: SecretsConfig,

    /// Notification fan-out configuration
    #[serde(default)]
    pub notification: NotificationConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration with environment variable overrides, then validate.
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("SMARTQUANT_LOG_LEVEL") {
            self.observability.log_level = level;
        }

        if let Ok(dir) = std::env::var("SMARTQUANT_DATA_DIR") {
            self.advisor.data_dir = dir;
        }

        if let Ok(port) = std::env::var("SMARTQUANT_PORT") {
            if let Ok(p) = port.parse() {
                self.advisor.port = p;
            }
        }

        if let Ok(key) = std::env::var("SMARTQUANT_API_KEY") {
            self.secrets.llm.api_key = Some(key);
        }

        if let Ok(tokens) = std::env::var("TUSHARE_TOKEN") {
            self.secrets.tushare_tokens = split_list(&tokens);
        }

        if let Ok(token) = std::env::var("WXPUSHER_TOKEN") {
            self.secrets.wxpusher.app_token = Some(token);
        }
    }

    /// Validate values that cannot be expressed through serde defaults.
    pub fn validate(&self) -> crate::Result<()> {
        if self.scheduler.period_minutes == 0 {
            return Err(Error::Config(
                "scheduler.period_minutes must be at least 1".into(),
            ));
        }
        if self.scheduler.period_minutes > MAX_PERIOD_MINUTES {
            return Err(Error::Config(format!(
                "scheduler.period_minutes must be at most {}, got {}",
                MAX_PERIOD_MINUTES, self.scheduler.period_minutes
            )));
        }

        if self.advisor.data_dir.trim().is_empty() {
            return Err(Error::Config("advisor.data_dir must not be empty".into()));
        }

        Ok(())
    }

    /// Resolved data directory (tilde expanded).
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.advisor.data_dir).as_ref())
    }

    /// Resolved directory for the persistent signal log.
    pub fn signal_log_dir(&self) -> PathBuf {
        let dir = PathBuf::from(shellexpand::tilde(&self.notification.log_dir).as_ref());
        if dir.is_absolute() {
            dir
        } else {
            self.data_dir().join(dir)
        }
    }
}

/// Split a comma separated list, dropping empty entries.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

// ============================================================================
// Observability
// ============================================================================

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level", alias = "level")]
    pub log_level: String,

    /// Log format (json, pretty)
    #[serde(default = "default_log_format", alias = "format")]
    pub log_format: String,

    /// Additional module targets to pin at `warn`.
    #[serde(default)]
    pub excluded_targets: Vec<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            excluded_targets: Vec::new(),
        }
    }
}

// ============================================================================
// Advisor Service
// ============================================================================

/// Local screening strategy used by the post-close scan job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScanStrategy {
    /// Volume/price resonance, hold overnight (一夜持股法)
    #[default]
    Overnight,
    /// Stocks closing at the daily limit (打板)
    LimitUp,
}

/// Advisor service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvisorConfig {
    /// Data directory holding portfolio.json and history/
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// HTTP API host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP API port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Serve the HTTP API
    #[serde(default = "default_true")]
    pub http_enabled: bool,

    /// Strategy for the post-close scan job
    #[serde(default)]
    pub scan_strategy: ScanStrategy,

    /// Number of scan results included in the notification
    #[serde(default = "default_scan_top_n")]
    pub scan_top_n: usize,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            host: default_host(),
            port: default_port(),
            http_enabled: true,
            scan_strategy: ScanStrategy::default(),
            scan_top_n: default_scan_top_n(),
        }
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Risk profile passed to the decision step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// High risk, high reward
    #[serde(alias = "High-Risk/High-Reward")]
    Aggressive,
    /// Low risk, low yield
    #[serde(alias = "Low-Risk/Low-Yield")]
    Conservative,
    /// Follows market rotation with balanced risk
    #[default]
    #[serde(alias = "Dynamic-Market-Adjusted")]
    Balanced,
}

impl Strategy {
    /// Maximum share of total assets a single position may take, in percent.
    pub fn max_position_pct(&self) -> u32 {
        match self {
            Self::Aggressive => 40,
            Self::Conservative => 15,
            Self::Balanced => 30,
        }
    }

    /// Stable label for logs and prompts.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Aggressive => "aggressive",
            Self::Conservative => "conservative",
            Self::Balanced => "balanced",
        }
    }
}

/// Decision scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Risk profile for the decision step
    #[serde(default)]
    pub strategy: Strategy,

    /// Tick interval in minutes, `1..=MAX_PERIOD_MINUTES`
    #[serde(default = "default_period_minutes")]
    pub period_minutes: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            period_minutes: default_period_minutes(),
        }
    }
}

// ============================================================================
// Secrets
// ============================================================================

/// Credentials for external collaborators.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SecretsConfig {
    /// Tushare Pro tokens, tried in order
    #[serde(default)]
    pub tushare_tokens: Vec<String>,

    /// LLM endpoint used by the decision client
    #[serde(default)]
    pub llm: LlmSecretsConfig,

    /// WxPusher push credentials
    #[serde(default)]
    pub wxpusher: WxPusherSecretsConfig,
}

/// OpenAI-compatible LLM endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSecretsConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for LlmSecretsConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            api_key: None,
        }
    }
}

/// WxPusher credentials.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WxPusherSecretsConfig {
    #[serde(default)]
    pub app_token: Option<String>,
    #[serde(default)]
    pub uids: Vec<String>,
}

// ============================================================================
// Notification
// ============================================================================

/// Notification fan-out configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Show local desktop notifications
    #[serde(default = "default_true")]
    pub desktop: bool,

    /// Append signals to the daily signal log
    #[serde(default = "default_true")]
    pub signal_log: bool,

    /// Push via WxPusher
    #[serde(default = "default_true")]
    pub push: bool,

    /// Signal log directory, relative to the data directory unless absolute
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            desktop: true,
            signal_log: true,
            push: true,
            log_dir: default_log_dir(),
        }
    }
}

// ============================================================================
// Defaults
// ============================================================================

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "pretty".into()
}
fn default_data_dir() -> String {
    "~/.smartquant/data".into()
}
fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    4480
}
fn default_true() -> bool {
    true
}
fn default_scan_top_n() -> usize {
    20
}
/// Upper bound for `scheduler.period_minutes`: one tick per day.
pub const MAX_PERIOD_MINUTES: u64 = 24 * 60;

fn default_period_minutes() -> u64 {
    10
}
fn default_llm_base_url() -> String {
    "https://api.deepseek.com".into()
}
fn default_llm_model() -> String {
    "deepseek-chat".into()
}
fn default_log_dir() -> String {
    "logs".into()
}
