//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use crate::domain::raw::ZoneConfig;
use anyhow::Context;
use chrono::NaiveDate;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use tracing::warn;

/// How the poll delay grows after failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffMode {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Sent as a bearer token when present
    #[serde(default)]
    pub auth_token: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self { base_url: default_base_url(), auth_token: None }
    }
}

fn default_base_url() -> String {
    "http://localhost:9090".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionConfig {
    #[serde(default = "default_tenant")]
    pub tenant: String,
    /// Day to follow; today (UTC) when absent
    #[serde(default)]
    pub date: Option<NaiveDate>,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self { tenant: default_tenant(), date: None }
    }
}

fn default_tenant() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollerConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_backoff")]
    pub backoff: BackoffMode,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Consecutive failures before a degraded signal
    #[serde(default = "default_failure_ceiling")]
    pub failure_ceiling: u32,
    #[serde(default = "default_watchdog_ms")]
    pub watchdog_ms: u64,
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    /// Capacity of the update channel to consumers
    #[serde(default = "default_update_buffer")]
    pub update_buffer: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            backoff: default_backoff(),
            max_backoff_ms: default_max_backoff_ms(),
            failure_ceiling: default_failure_ceiling(),
            watchdog_ms: default_watchdog_ms(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            update_buffer: default_update_buffer(),
        }
    }
}

fn default_interval_ms() -> u64 {
    5000
}

fn default_backoff() -> BackoffMode {
    BackoffMode::Exponential
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

fn default_failure_ceiling() -> u32 {
    3
}

fn default_watchdog_ms() -> u64 {
    10_000
}

fn default_fetch_timeout_ms() -> u64 {
    10_000
}

fn default_update_buffer() -> usize {
    64
}

#[derive(Debug, Clone, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "default_epsilon_deg")]
    pub epsilon_deg: f64,
    #[serde(default = "default_offset_deg")]
    pub offset_deg: f64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            epsilon_deg: default_epsilon_deg(),
            offset_deg: default_offset_deg(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_epsilon_deg() -> f64 {
    crate::services::dedup::DEFAULT_EPSILON_DEG
}

fn default_offset_deg() -> f64 {
    crate::services::dedup::DEFAULT_OFFSET_DEG
}

fn default_max_attempts() -> u32 {
    crate::services::dedup::DEFAULT_MAX_ATTEMPTS
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ZonesConfig {
    /// JSON file with zone definitions, loaded at startup in addition to
    /// whatever the provider sends with the day payload
    #[serde(default)]
    pub file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EgressConfig {
    #[serde(default = "default_egress_enabled")]
    pub enabled: bool,
    /// File path for snapshot egress (JSONL format)
    #[serde(default = "default_egress_file")]
    pub file: String,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self { enabled: default_egress_enabled(), file: default_egress_file() }
    }
}

fn default_egress_enabled() -> bool {
    true
}

fn default_egress_file() -> String {
    "snapshots.jsonl".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Topic for snapshots (QoS 0)
    #[serde(default = "default_snapshots_topic")]
    pub snapshots_topic: String,
    /// Topic for loading/degraded status (QoS 1)
    #[serde(default = "default_status_topic")]
    pub status_topic: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            username: None,
            password: None,
            snapshots_topic: default_snapshots_topic(),
            status_topic: default_status_topic(),
        }
    }
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_snapshots_topic() -> String {
    "presence/snapshots".to_string()
}

fn default_status_topic() -> String {
    "presence/status".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default = "default_prometheus_port")]
    pub prometheus_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval(), prometheus_port: default_prometheus_port() }
    }
}

fn default_metrics_interval() -> u64 {
    10
}

fn default_prometheus_port() -> u16 {
    9464
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub subscription: SubscriptionConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub zones: ZonesConfig,
    #[serde(default)]
    pub egress: EgressConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    provider_base_url: String,
    provider_auth_token: Option<String>,
    tenant: String,
    date: Option<NaiveDate>,
    poll_interval_ms: u64,
    backoff: BackoffMode,
    max_backoff_ms: u64,
    failure_ceiling: u32,
    watchdog_ms: u64,
    fetch_timeout_ms: u64,
    update_buffer: usize,
    dedup_epsilon_deg: f64,
    dedup_offset_deg: f64,
    dedup_max_attempts: u32,
    zones_file: Option<String>,
    egress_enabled: bool,
    egress_file: String,
    mqtt_enabled: bool,
    mqtt_host: String,
    mqtt_port: u16,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    mqtt_snapshots_topic: String,
    mqtt_status_topic: String,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        Self {
            provider_base_url: toml_config.provider.base_url,
            provider_auth_token: toml_config.provider.auth_token,
            tenant: toml_config.subscription.tenant,
            date: toml_config.subscription.date,
            poll_interval_ms: toml_config.poller.interval_ms,
            backoff: toml_config.poller.backoff,
            max_backoff_ms: toml_config.poller.max_backoff_ms,
            failure_ceiling: toml_config.poller.failure_ceiling,
            watchdog_ms: toml_config.poller.watchdog_ms,
            fetch_timeout_ms: toml_config.poller.fetch_timeout_ms,
            update_buffer: toml_config.poller.update_buffer,
            dedup_epsilon_deg: toml_config.dedup.epsilon_deg,
            dedup_offset_deg: toml_config.dedup.offset_deg,
            dedup_max_attempts: toml_config.dedup.max_attempts,
            zones_file: toml_config.zones.file,
            egress_enabled: toml_config.egress.enabled,
            egress_file: toml_config.egress.file,
            mqtt_enabled: toml_config.mqtt.enabled,
            mqtt_host: toml_config.mqtt.host,
            mqtt_port: toml_config.mqtt.port,
            mqtt_username: toml_config.mqtt.username,
            mqtt_password: toml_config.mqtt.password,
            mqtt_snapshots_topic: toml_config.mqtt.snapshots_topic,
            mqtt_status_topic: toml_config.mqtt.status_topic,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            prometheus_port: toml_config.metrics.prometheus_port,
            config_file,
        }
    }

    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self::from_toml(toml_config, path.display().to_string()))
    }

    /// Load from an explicit path, falling back to defaults on any error
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "config_fallback_to_defaults");
                Self::default()
            }
        }
    }

    /// Override the subscription from the command line
    pub fn with_subscription(mut self, date: Option<NaiveDate>, tenant: Option<String>) -> Self {
        if date.is_some() {
            self.date = date;
        }
        if let Some(tenant) = tenant {
            self.tenant = tenant;
        }
        self
    }

    pub fn provider_base_url(&self) -> &str {
        &self.provider_base_url
    }

    pub fn provider_auth_token(&self) -> Option<&str> {
        self.provider_auth_token.as_deref()
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn date(&self) -> Option<NaiveDate> {
        self.date
    }

    pub fn poll_interval_ms(&self) -> u64 {
        self.poll_interval_ms
    }

    pub fn backoff(&self) -> BackoffMode {
        self.backoff
    }

    pub fn max_backoff_ms(&self) -> u64 {
        self.max_backoff_ms
    }

    pub fn failure_ceiling(&self) -> u32 {
        self.failure_ceiling
    }

    pub fn watchdog_ms(&self) -> u64 {
        self.watchdog_ms
    }

    pub fn fetch_timeout_ms(&self) -> u64 {
        self.fetch_timeout_ms
    }

    pub fn update_buffer(&self) -> usize {
        self.update_buffer
    }

    pub fn dedup_epsilon_deg(&self) -> f64 {
        self.dedup_epsilon_deg
    }

    pub fn dedup_offset_deg(&self) -> f64 {
        self.dedup_offset_deg
    }

    pub fn dedup_max_attempts(&self) -> u32 {
        self.dedup_max_attempts
    }

    pub fn zones_file(&self) -> Option<&str> {
        self.zones_file.as_deref()
    }

    pub fn egress_enabled(&self) -> bool {
        self.egress_enabled
    }

    pub fn egress_file(&self) -> &str {
        &self.egress_file
    }

    pub fn mqtt_enabled(&self) -> bool {
        self.mqtt_enabled
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt_host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt_username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt_password.as_deref()
    }

    pub fn mqtt_snapshots_topic(&self) -> &str {
        &self.mqtt_snapshots_topic
    }

    pub fn mqtt_status_topic(&self) -> &str {
        &self.mqtt_status_topic
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }
}

/// Load zone definitions from a JSON file (an array of zone configs)
pub fn load_zones_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Vec<ZoneConfig>> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read zones file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse zones file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.provider_base_url(), "http://localhost:9090");
        assert_eq!(config.tenant(), "default");
        assert_eq!(config.date(), None);
        assert_eq!(config.poll_interval_ms(), 5000);
        assert_eq!(config.backoff(), BackoffMode::Exponential);
        assert_eq!(config.failure_ceiling(), 3);
        assert_eq!(config.watchdog_ms(), 10_000);
        assert_eq!(config.fetch_timeout_ms(), 10_000);
        assert_eq!(config.dedup_max_attempts(), 10);
        assert!(!config.mqtt_enabled());
        assert_eq!(config.config_file(), "default");
    }

    #[test]
    fn test_resolve_config_path_from_arg() {
        let args: Vec<String> = vec![
            "presence-engine".to_string(),
            "--config".to_string(),
            "config/field.toml".to_string(),
        ];
        assert_eq!(Config::resolve_config_path(&args), "config/field.toml");
    }

    #[test]
    fn test_resolve_config_path_from_arg_equals() {
        let args: Vec<String> =
            vec!["presence-engine".to_string(), "--config=config/hq.toml".to_string()];
        assert_eq!(Config::resolve_config_path(&args), "config/hq.toml");
    }

    #[test]
    fn test_partial_toml_keeps_section_defaults() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
[poller]
interval_ms = 2000
backoff = "fixed"
"#,
        )
        .unwrap();
        let config = Config::from_toml(toml_config, "inline".to_string());

        assert_eq!(config.poll_interval_ms(), 2000);
        assert_eq!(config.backoff(), BackoffMode::Fixed);
        assert_eq!(config.max_backoff_ms(), 60_000);
        assert_eq!(config.egress_file(), "snapshots.jsonl");
    }

    #[test]
    fn test_cli_overrides_subscription() {
        let day = NaiveDate::from_ymd_opt(2024, 5, 1);
        let config = Config::default().with_subscription(day, Some("acme".to_string()));
        assert_eq!(config.date(), day);
        assert_eq!(config.tenant(), "acme");

        let kept = config.clone().with_subscription(None, None);
        assert_eq!(kept.date(), day);
        assert_eq!(kept.tenant(), "acme");
    }

    #[test]
    fn test_egress_file_default() {
        let egress = EgressConfig::default();
        assert_eq!(egress.file, "snapshots.jsonl");
        assert!(egress.enabled);
    }
}
