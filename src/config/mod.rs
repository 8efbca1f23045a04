//! # Configuration Management Module
//!
//! All runtime settings live in one TOML file (default `config.toml`). The file is read
//! once per run into an immutable [`Config`] shared as `Arc<Config>`; edits take effect on
//! the next run. The only values written back by the program are the ones in
//! [`StateConfig`] (last CSV path, modem selection).
//!
//! ## Configuration Structure
//!
//! - [`SmsConfig`] - country prefix and flash default
//! - [`GatewayConfig`] - external tool locations and call timeouts
//! - [`ModemsConfig`] - device discovery and rescan behaviour
//! - [`ActivationConfig`] - AT activation sequence
//! - [`KeepaliveConfig`] - periodic keepalive command
//! - [`DispatchConfig`] - pacing between sends
//! - [`StorageConfig`] - history location and retention
//! - [`ApiConfig`] - read-only history API bind address
//! - [`LoggingConfig`] - log level and files
//! - [`StateConfig`] - values persisted between runs
//!
//! ## Configuration File Format
//!
//! ```toml
//! [sms]
//! country_prefix = "55"
//! flash = false
//!
//! [gateway]
//! connection = "at"
//!
//! [modems]
//! device_globs = ["/dev/ttyUSB*"]
//! rescan_interval_seconds = 30
//!
//! [activation]
//! at_commands = ["AT", "AT+CMGF=1"]
//! at_baud_rate = 115200
//! auto_activate_on_start = false
//!
//! [keepalive]
//! enabled = false
//! command = "AT"
//! interval_seconds = 60
//!
//! [dispatch]
//! send_delay_seconds = 1.0
//!
//! [dispatch.jitter]
//! enabled = true
//! min_seconds = 10
//! max_seconds = 30
//! ```

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

use crate::errors::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsConfig {
    /// Country calling code prefixed to numbers that lack it. Empty disables prefixing.
    #[serde(default = "default_country_prefix")]
    pub country_prefix: String,
    /// Default flash flag for new dispatch runs.
    #[serde(default)]
    pub flash: bool,
}

fn default_country_prefix() -> String {
    "55".to_string()
}

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            country_prefix: default_country_prefix(),
            flash: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Gammu connection kind written into each device section (e.g. "at", "at115200").
    #[serde(default = "default_connection")]
    pub connection: String,
    #[serde(default = "default_gammu_binary")]
    pub gammu_binary: String,
    #[serde(default = "default_fuser_binary")]
    pub fuser_binary: String,
    /// Directory for the generated per-device gammu rc files.
    #[serde(default = "default_work_dir")]
    pub work_dir: String,
    #[serde(default = "default_identify_timeout")]
    pub identify_timeout_seconds: u64,
    #[serde(default = "default_send_timeout")]
    pub send_timeout_seconds: u64,
    /// Bound for raw AT commands and port release.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_seconds: u64,
}

fn default_connection() -> String {
    "at".to_string()
}
fn default_gammu_binary() -> String {
    "gammu".to_string()
}
fn default_fuser_binary() -> String {
    "fuser".to_string()
}
fn default_work_dir() -> String {
    "./data/gammu".to_string()
}
fn default_identify_timeout() -> u64 {
    3
}
fn default_send_timeout() -> u64 {
    60
}
fn default_command_timeout() -> u64 {
    5
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            connection: default_connection(),
            gammu_binary: default_gammu_binary(),
            fuser_binary: default_fuser_binary(),
            work_dir: default_work_dir(),
            identify_timeout_seconds: default_identify_timeout(),
            send_timeout_seconds: default_send_timeout(),
            command_timeout_seconds: default_command_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModemsConfig {
    /// Candidate device globs. Only a trailing `*` is supported (`/dev/ttyUSB*`).
    #[serde(default = "default_device_globs")]
    pub device_globs: Vec<String>,
    /// Run an identity check on every candidate during scans.
    #[serde(default = "default_true")]
    pub validate: bool,
    #[serde(default = "default_rescan_interval")]
    pub rescan_interval_seconds: u64,
    #[serde(default = "default_true")]
    pub rescan_before_dispatch: bool,
    /// Kill processes holding a busy port and retry the identity check once.
    #[serde(default)]
    pub release_busy_ports: bool,
}

fn default_device_globs() -> Vec<String> {
    vec!["/dev/ttyUSB*".to_string()]
}
fn default_rescan_interval() -> u64 {
    30
}
fn default_true() -> bool {
    true
}

impl Default for ModemsConfig {
    fn default() -> Self {
        Self {
            device_globs: default_device_globs(),
            validate: true,
            rescan_interval_seconds: default_rescan_interval(),
            rescan_before_dispatch: true,
            release_busy_ports: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationConfig {
    /// Raw commands sent in order, one response awaited per command.
    #[serde(default = "default_at_commands")]
    pub at_commands: Vec<String>,
    #[serde(default = "default_baud_rate")]
    pub at_baud_rate: u32,
    #[serde(default)]
    pub auto_activate_on_start: bool,
}

fn default_at_commands() -> Vec<String> {
    vec!["AT".to_string(), "AT+CMGF=1".to_string()]
}
fn default_baud_rate() -> u32 {
    115200
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            at_commands: default_at_commands(),
            at_baud_rate: default_baud_rate(),
            auto_activate_on_start: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepaliveConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_keepalive_command")]
    pub command: String,
    #[serde(default = "default_keepalive_interval")]
    pub interval_seconds: u64,
}

fn default_keepalive_command() -> String {
    "AT".to_string()
}
fn default_keepalive_interval() -> u64 {
    60
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: default_keepalive_command(),
            interval_seconds: default_keepalive_interval(),
        }
    }
}

/// Random extra delay added on top of `send_delay_seconds`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JitterConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_jitter_min")]
    pub min_seconds: u64,
    #[serde(default = "default_jitter_max")]
    pub max_seconds: u64,
}

fn default_jitter_min() -> u64 {
    10
}
fn default_jitter_max() -> u64 {
    30
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_seconds: default_jitter_min(),
            max_seconds: default_jitter_max(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_send_delay")]
    pub send_delay_seconds: f64,
    #[serde(default)]
    pub jitter: JitterConfig,
}

fn default_send_delay() -> f64 {
    1.0
}

/// Longest accepted pause between two sends.
pub const MAX_SEND_DELAY_SECONDS: f64 = 3600.0;

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            send_delay_seconds: default_send_delay(),
            jitter: JitterConfig::default(),
        }
    }
}

impl DispatchConfig {
    /// Fixed part of the pause between two sends, clamped to
    /// `0..=MAX_SEND_DELAY_SECONDS`.
    pub fn base_delay(&self) -> Duration {
        let seconds = self.send_delay_seconds.clamp(0.0, MAX_SEND_DELAY_SECONDS);
        Duration::try_from_secs_f64(seconds).unwrap_or(Duration::ZERO)
    }

    /// Jitter bounds, or `None` when jitter is disabled.
    pub fn jitter_range(&self) -> Option<(Duration, Duration)> {
        if !self.jitter.enabled {
            return None;
        }
        Some((
            Duration::from_secs(self.jitter.min_seconds),
            Duration::from_secs(self.jitter.max_seconds),
        ))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_history_file")]
    pub history_file: String,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_data_dir() -> String {
    "./data".to_string()
}
fn default_history_file() -> String {
    "history.jsonl".to_string()
}
fn default_retention_days() -> u32 {
    7
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            history_file: default_history_file(),
            retention_days: default_retention_days(),
        }
    }
}

impl StorageConfig {
    pub fn history_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join(&self.history_file)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// No authentication is offered; keep this on localhost or behind a proxy.
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

fn default_api_host() -> String {
    "127.0.0.1".to_string()
}
fn default_api_port() -> u16 {
    8081
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    pub file: Option<String>,
    /// Receives one line per send attempt (log target `sms_events`).
    #[serde(default)]
    pub events_file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: Some("smsfleet.log".to_string()),
            events_file: Some("smsfleet-events.log".to_string()),
        }
    }
}

/// Values the program writes back so the next run can offer them as defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StateConfig {
    #[serde(default)]
    pub last_csv_path: String,
    #[serde(default)]
    pub selected: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub sms: SmsConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub modems: ModemsConfig,
    #[serde(default)]
    pub activation: ActivationConfig,
    #[serde(default)]
    pub keepalive: KeepaliveConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub state: StateConfig,
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        Config::default().save(path).await
    }

    /// Persist the whole configuration (used after updating [`StateConfig`]).
    pub async fn save(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| anyhow!("Failed to serialize config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Reject settings that cannot be applied to physical devices.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &'static str, reason: &str| ConfigError::Invalid {
            key,
            reason: reason.to_string(),
        };

        if !self.sms.country_prefix.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid("sms.country_prefix", "must contain digits only"));
        }
        if self.gateway.connection.trim().is_empty() {
            return Err(invalid("gateway.connection", "must not be empty"));
        }
        if self.gateway.identify_timeout_seconds == 0
            || self.gateway.send_timeout_seconds == 0
            || self.gateway.command_timeout_seconds == 0
        {
            return Err(invalid("gateway.*_timeout_seconds", "timeouts must be > 0"));
        }
        if self.modems.device_globs.is_empty() {
            return Err(invalid("modems.device_globs", "at least one glob is required"));
        }
        if let Some(bad) = self
            .modems
            .device_globs
            .iter()
            .find(|g| g.trim_end_matches('*').contains('*'))
        {
            return Err(ConfigError::Invalid {
                key: "modems.device_globs",
                reason: format!("only a trailing '*' is supported: {bad}"),
            });
        }
        if self.modems.rescan_interval_seconds == 0 {
            return Err(invalid("modems.rescan_interval_seconds", "must be > 0"));
        }
        if self.activation.at_baud_rate == 0 {
            return Err(invalid("activation.at_baud_rate", "must be > 0"));
        }
        if self.activation.auto_activate_on_start && self.activation.at_commands.is_empty() {
            return Err(invalid(
                "activation.at_commands",
                "auto activation needs at least one command",
            ));
        }
        if self.keepalive.enabled {
            if self.keepalive.interval_seconds == 0 {
                return Err(invalid("keepalive.interval_seconds", "must be > 0"));
            }
            if self.keepalive.command.trim().is_empty() {
                return Err(invalid("keepalive.command", "must not be empty"));
            }
        }
        let delay = self.dispatch.send_delay_seconds;
        if !delay.is_finite() || !(0.0..=MAX_SEND_DELAY_SECONDS).contains(&delay) {
            return Err(ConfigError::Invalid {
                key: "dispatch.send_delay_seconds",
                reason: format!("must be between 0 and {MAX_SEND_DELAY_SECONDS}"),
            });
        }
        if self.dispatch.jitter.enabled
            && self.dispatch.jitter.min_seconds > self.dispatch.jitter.max_seconds
        {
            return Err(invalid("dispatch.jitter", "min_seconds must be <= max_seconds"));
        }
        if self.storage.retention_days == 0 {
            return Err(invalid("storage.retention_days", "must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sms.country_prefix, "55");
        assert_eq!(config.modems.rescan_interval_seconds, 30);
        assert_eq!(config.storage.retention_days, 7);
    }

    #[test]
    fn jitter_defaults_to_ten_to_thirty_seconds() {
        let config = DispatchConfig::default();
        assert_eq!(
            config.jitter_range(),
            Some((Duration::from_secs(10), Duration::from_secs(30)))
        );
        let mut off = config.clone();
        off.jitter.enabled = false;
        assert_eq!(off.jitter_range(), None);
    }

    #[test]
    fn base_delay_never_panics_on_out_of_range_values() {
        let mut config = DispatchConfig::default();
        config.send_delay_seconds = 1e20;
        assert_eq!(config.base_delay(), Duration::from_secs(3600));
        config.send_delay_seconds = f64::NAN;
        assert_eq!(config.base_delay(), Duration::ZERO);
        config.send_delay_seconds = -5.0;
        assert_eq!(config.base_delay(), Duration::ZERO);
        config.send_delay_seconds = 1.5;
        assert_eq!(config.base_delay(), Duration::from_millis(1500));
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let config: Config = toml::from_str(
            r#"
            [sms]
            country_prefix = "351"

            [keepalive]
            enabled = true
            "#,
        )
        .unwrap();
        assert_eq!(config.sms.country_prefix, "351");
        assert!(config.keepalive.enabled);
        assert_eq!(config.keepalive.command, "AT");
        assert_eq!(config.gateway.connection, "at");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = Config::default();
        config.sms.country_prefix = "+55".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.dispatch.send_delay_seconds = -1.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.dispatch.send_delay_seconds = 1e20;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("dispatch.send_delay_seconds"));

        let mut config = Config::default();
        config.dispatch.jitter.min_seconds = 40;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.modems.device_globs = vec!["/dev/tty*USB".into()];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("modems.device_globs"));
    }

    #[tokio::test]
    async fn save_and_reload_round_trips_state() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        let path = path.to_str().unwrap();
        let mut config = Config::default();
        config.state.last_csv_path = "/tmp/contacts.csv".into();
        config.state.selected = vec!["/dev/ttyUSB0".into()];
        config.save(path).await.unwrap();

        let loaded = Config::load(path).await.unwrap();
        assert_eq!(loaded.state.last_csv_path, "/tmp/contacts.csv");
        assert_eq!(loaded.state.selected, vec!["/dev/ttyUSB0".to_string()]);
    }
}
