use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::services::effective_interval;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub endpoints: EndpointsConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub flow: FlowConfig,
    pub paths: PathsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Assessment backend connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL every endpoint path is joined onto
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Retries for idempotent requests (default: 3)
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_max_retries() -> usize {
    3
}

fn default_retry_base_delay() -> u64 {
    200
}

fn default_retry_max_delay() -> u64 {
    5_000 // 5 seconds
}

fn default_user_agent() -> String {
    format!("flowctl/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
            user_agent: default_user_agent(),
        }
    }
}

/// Endpoint path templates; `{flow_id}` is substituted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointsConfig {
    #[serde(default = "default_definition_endpoint")]
    pub definition: String,
    /// No progress endpoint means no remote progress fetch
    #[serde(default = "default_progress_endpoint")]
    pub progress: Option<String>,
}

fn default_definition_endpoint() -> String {
    "/stu/api/flows/{flow_id}".to_string()
}

fn default_progress_endpoint() -> Option<String> {
    Some("/stu/api/flows/{flow_id}/progress".to_string())
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            definition: default_definition_endpoint(),
            progress: default_progress_endpoint(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_heartbeat_enabled")]
    pub enabled: bool,
    /// Seconds between pushes (default: 15, minimum 3)
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,
}

fn default_heartbeat_enabled() -> bool {
    true
}

fn default_heartbeat_interval() -> u64 {
    15
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: default_heartbeat_enabled(),
            interval_secs: default_heartbeat_interval(),
        }
    }
}

impl HeartbeatConfig {
    /// Configured interval, raised to the minimum
    pub fn effective_interval(&self) -> Duration {
        effective_interval(Duration::from_secs(self.interval_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Where the student is sent after the last step
    #[serde(default = "default_completion_route")]
    pub completion_route: String,
    /// Host entry points wired to the same wrapped navigation
    #[serde(default = "default_navigation_aliases")]
    pub navigation_aliases: Vec<String>,
}

fn default_completion_route() -> String {
    "/login".to_string()
}

fn default_navigation_aliases() -> Vec<String> {
    vec!["set_current_page_id".to_string()]
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            completion_route: default_completion_route(),
            navigation_aliases: default_navigation_aliases(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    pub state: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Write to `<state>/logs` instead of stderr
    #[serde(default)]
    pub to_file: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            to_file: false,
        }
    }
}

impl Config {
    /// Path to the project config file
    pub fn project_config_path() -> PathBuf {
        PathBuf::from(".flow/config.toml")
    }

    pub fn load(config_path: Option<&str>) -> Result<Self> {
        // Start with embedded defaults so flowctl works without config files
        let defaults = Config::default();
        let defaults_json =
            serde_json::to_string(&defaults).context("Failed to serialize default config")?;

        let mut builder = config::Config::builder().add_source(config::File::from_str(
            &defaults_json,
            config::FileFormat::Json,
        ));

        let project_config = Self::project_config_path();
        if project_config.exists() {
            builder = builder.add_source(config::File::from(project_config));
        }

        // User config in ~/.config/flowctl/ (optional global overrides)
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("flowctl").join("config.toml");
            if user_config.exists() {
                builder = builder.add_source(config::File::from(user_config));
            }
        }

        // Explicit config file (CLI override)
        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path));
        }

        // Environment variables with FLOWCTL_ prefix
        builder = builder.add_source(
            config::Environment::with_prefix("FLOWCTL")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to load configuration")?;
        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Save config to .flow/config.toml
    pub fn save(&self) -> Result<()> {
        let config_path = Self::project_config_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let toml_str =
            toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        std::fs::write(&config_path, toml_str).context("Failed to write config file")?;

        Ok(())
    }

    /// Get absolute path to state directory
    pub fn state_path(&self) -> PathBuf {
        let path = PathBuf::from(&self.paths.state);
        if path.is_absolute() {
            path
        } else {
            std::env::current_dir().unwrap_or_default().join(path)
        }
    }

    /// Get absolute path to logs directory
    pub fn logs_path(&self) -> PathBuf {
        self.state_path().join("logs")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            endpoints: EndpointsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            flow: FlowConfig::default(),
            paths: PathsConfig {
                state: ".flow".to_string(), // Relative to cwd
            },
            logging: LoggingConfig::default(),
        }
    }
}
