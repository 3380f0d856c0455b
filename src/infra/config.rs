//! Configuration loading from TOML files
//!
//! The binary picks the file via `--config`, `CONFIG_FILE`, or
//! `config/dev.toml`. A missing or invalid file falls back to defaults.

use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SiteConfig {
    /// Unique site identifier
    #[serde(default = "default_site_id")]
    pub id: String,
}

fn default_site_id() -> String {
    "petgate".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Upload root: door frames under `events/`, firmware under `firmware/`
    #[serde(default = "default_image_dir")]
    pub image_dir: String,
    /// Append-only event journal (JSONL)
    #[serde(default = "default_journal_file")]
    pub journal_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { image_dir: default_image_dir(), journal_file: default_journal_file() }
    }
}

fn default_image_dir() -> String {
    "uploads".to_string()
}

fn default_journal_file() -> String {
    "events.jsonl".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionConfig {
    #[serde(default = "default_threshold")]
    pub default_threshold: f64,
    #[serde(default = "default_auto_close_secs")]
    pub default_auto_close_secs: u32,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            default_threshold: default_threshold(),
            default_auto_close_secs: default_auto_close_secs(),
        }
    }
}

fn default_threshold() -> f64 {
    0.7
}

fn default_auto_close_secs() -> u32 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrustConfig {
    /// Accepted clock skew for device challenge responses
    #[serde(default = "default_replay_window_secs")]
    pub replay_window_secs: u64,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self { replay_window_secs: default_replay_window_secs() }
    }
}

fn default_replay_window_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifyConfig {
    #[serde(default = "default_notify_enabled")]
    pub enabled: bool,
    #[serde(default = "default_mqtt_host")]
    pub mqtt_host: String,
    #[serde(default = "default_mqtt_port")]
    pub mqtt_port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Messages go to `<topic_prefix>/<owner>/notifications`
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enabled: default_notify_enabled(),
            mqtt_host: default_mqtt_host(),
            mqtt_port: default_mqtt_port(),
            username: None,
            password: None,
            topic_prefix: default_topic_prefix(),
            queue_size: default_queue_size(),
            send_timeout_ms: default_send_timeout_ms(),
        }
    }
}

fn default_notify_enabled() -> bool {
    true
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_topic_prefix() -> String {
    "petgate".to_string()
}

fn default_queue_size() -> usize {
    1000
}

fn default_send_timeout_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Device-facing HTTP port (0 to disable)
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Bearer token for owner and firmware management routes. Unset
    /// disables those routes.
    #[serde(default)]
    pub admin_token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { port: default_api_port(), admin_token: None }
    }
}

fn default_api_port() -> u16 {
    8080
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
    9090
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub trust: TrustConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    image_dir: String,
    journal_file: String,
    default_threshold: f64,
    default_auto_close_secs: u32,
    replay_window_secs: u64,
    notify_enabled: bool,
    notify_mqtt_host: String,
    notify_mqtt_port: u16,
    notify_username: Option<String>,
    notify_password: Option<String>,
    notify_topic_prefix: String,
    notify_queue_size: usize,
    notify_send_timeout_ms: u64,
    api_port: u16,
    admin_token: Option<String>,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default")
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: &str) -> Self {
        Self {
            site_id: toml_config.site.id,
            image_dir: toml_config.storage.image_dir,
            journal_file: toml_config.storage.journal_file,
            default_threshold: toml_config.admission.default_threshold.clamp(0.0, 1.0),
            default_auto_close_secs: toml_config.admission.default_auto_close_secs,
            replay_window_secs: toml_config.trust.replay_window_secs,
            notify_enabled: toml_config.notify.enabled,
            notify_mqtt_host: toml_config.notify.mqtt_host,
            notify_mqtt_port: toml_config.notify.mqtt_port,
            notify_username: toml_config.notify.username,
            notify_password: toml_config.notify.password,
            notify_topic_prefix: toml_config.notify.topic_prefix,
            notify_queue_size: toml_config.notify.queue_size,
            notify_send_timeout_ms: toml_config.notify.send_timeout_ms,
            api_port: toml_config.api.port,
            admin_token: toml_config.api.admin_token.filter(|t| !t.trim().is_empty()),
            metrics_interval_secs: toml_config.metrics.interval_secs,
            prometheus_port: toml_config.metrics.prometheus_port,
            config_file: config_file.to_string(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self::from_toml(toml_config, &path.display().to_string()))
    }

    /// Load from an explicit path, falling back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn image_dir(&self) -> &str {
        &self.image_dir
    }

    pub fn journal_file(&self) -> &str {
        &self.journal_file
    }

    pub fn default_threshold(&self) -> f64 {
        self.default_threshold
    }

    pub fn default_auto_close_secs(&self) -> u32 {
        self.default_auto_close_secs
    }

    pub fn replay_window_secs(&self) -> u64 {
        self.replay_window_secs
    }

    pub fn notify_enabled(&self) -> bool {
        self.notify_enabled
    }

    pub fn notify_mqtt_host(&self) -> &str {
        &self.notify_mqtt_host
    }

    pub fn notify_mqtt_port(&self) -> u16 {
        self.notify_mqtt_port
    }

    pub fn notify_username(&self) -> Option<&str> {
        self.notify_username.as_deref()
    }

    pub fn notify_password(&self) -> Option<&str> {
        self.notify_password.as_deref()
    }

    pub fn notify_topic_prefix(&self) -> &str {
        &self.notify_topic_prefix
    }

    pub fn notify_queue_size(&self) -> usize {
        self.notify_queue_size
    }

    pub fn notify_send_timeout_ms(&self) -> u64 {
        self.notify_send_timeout_ms
    }

    pub fn api_port(&self) -> u16 {
        self.api_port
    }

    pub fn admin_token(&self) -> Option<&str> {
        self.admin_token.as_deref()
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

    /// Builder method for tests to shorten the replay window
    pub fn with_replay_window_secs(mut self, secs: u64) -> Self {
        self.replay_window_secs = secs;
        self
    }

    /// Builder method for tests to redirect captured frames
    pub fn with_image_dir(mut self, dir: &str) -> Self {
        self.image_dir = dir.to_string();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.site_id(), "petgate");
        assert_eq!(config.image_dir(), "uploads");
        assert_eq!(config.journal_file(), "events.jsonl");
        assert_eq!(config.default_threshold(), 0.7);
        assert_eq!(config.default_auto_close_secs(), 10);
        assert_eq!(config.replay_window_secs(), 30);
        assert_eq!(config.notify_queue_size(), 1000);
        assert_eq!(config.config_file(), "default");
    }

    #[test]
    fn test_threshold_clamped() {
        let mut toml_config = TomlConfig::default();
        toml_config.admission.default_threshold = 1.5;
        let config = Config::from_toml(toml_config, "inline");
        assert_eq!(config.default_threshold(), 1.0);
    }

    #[test]
    fn test_builders_override() {
        let config = Config::default().with_replay_window_secs(5).with_image_dir("/tmp/frames");
        assert_eq!(config.replay_window_secs(), 5);
        assert_eq!(config.image_dir(), "/tmp/frames");
        assert_eq!(config.journal_file(), "events.jsonl");
    }

    #[test]
    fn test_partial_file_uses_section_defaults() {
        let toml_config: TomlConfig = toml::from_str("[trust]\nreplay_window_secs = 10\n").unwrap();
        let config = Config::from_toml(toml_config, "inline");
        assert_eq!(config.replay_window_secs(), 10);
        assert_eq!(config.notify_topic_prefix(), "petgate");
        assert_eq!(config.api_port(), 8080);
        assert!(config.admin_token().is_none());
    }

    #[test]
    fn test_blank_admin_token_disables_owner_routes() {
        let toml_config: TomlConfig = toml::from_str("[api]\nadmin_token = \"  \"\n").unwrap();
        assert!(Config::from_toml(toml_config, "inline").admin_token().is_none());

        let toml_config: TomlConfig = toml::from_str("[api]\nadmin_token = \"s3cret\"\n").unwrap();
        assert_eq!(Config::from_toml(toml_config, "inline").admin_token(), Some("s3cret"));
    }
}
