//! trustplane Configuration System
//!
//! A TOML-based configuration system for the policy core. Configuration can
//! be loaded from files, environment variables, or built with defaults.
//!
//! # Configuration Sources (Priority Order)
//!
//! 1. **Environment Variables**: `TRUSTPLANE_*` prefixed variables override all
//! 2. **Config File**: `trustplane.toml` in current directory or `~/.config/trustplane/`
//! 3. **Defaults**: Sensible defaults for every non-required key
//!
//! `identity.db_path`, `identity.ca_dir` and `deception.honeypot_log_path`
//! are required and validated at startup; a missing required key aborts.
//!
//! # Example trustplane.toml
//!
//! ```toml
//! [identity]
//! db_path = "/var/lib/trustplane/identity.db"
//! ca_dir = "/var/lib/trustplane/ca"
//!
//! [trust]
//! initial_score = 70
//! thresholds = [70, 50, 30]
//! hysteresis = 5
//!
//! [profiling]
//! duration_secs = 300
//! min_packets = 5
//!
//! [analyst]
//! flow_poll_interval_secs = 10
//! anomaly_window_secs = 60
//! attestation_interval_secs = 300
//!
//! [deception]
//! honeypot_log_path = "/var/log/honeypot/events.json"
//! threat_ttl_secs = 86400
//!
//! [switch]
//! honeypot_port = 7
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Errors that can occur during configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Configuration file not found
    #[error("Configuration file not found: {0}")]
    FileNotFound(PathBuf),

    /// Failed to read configuration file
    #[error("Failed to read config file {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML in {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// Invalid or missing configuration value
    #[error("Invalid configuration for {key}: {reason}")]
    ValidationError { key: String, reason: String },
}

impl From<ConfigError> for trustplane_core::Error {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::ValidationError { key, reason } => {
                trustplane_core::Error::Config { key, reason }
            }
            other => trustplane_core::Error::Config {
                key: "config".to_string(),
                reason: other.to_string(),
            },
        }
    }
}

/// Main configuration structure for the policy core
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub identity: IdentityConfig,
    pub trust: TrustConfig,
    pub profiling: ProfilingConfig,
    pub analyst: AnalystConfig,
    pub deception: DeceptionConfig,
    pub orchestrator: OrchestratorConfig,
    pub switch: SwitchConfig,
    pub bus: BusConfig,
    pub api: ApiConfig,
    pub logging: LoggingConfig,
}

/// Identity store and certificate authority locations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Path to the single-file identity database (required)
    pub db_path: String,
    /// Directory holding the root CA pair, device PEMs, and revocation list (required)
    pub ca_dir: String,
}

/// Trust scorer parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    /// Initial score for newly onboarded devices
    pub initial_score: i64,
    /// Thresholds published as TrustChanged when crossed, highest first
    pub thresholds: Vec<i64>,
    /// Upward crossings require threshold + hysteresis
    pub hysteresis: i64,
    /// +2 per uneventful hour; off by default
    pub positive_tick: bool,
}

/// Profiling window parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilingConfig {
    /// Length of the behavioral profiling window in seconds
    pub duration_secs: u64,
    /// Below this observation count the baseline is marked sparse
    pub min_packets: u64,
    /// Cadence of the finalization watcher
    pub finalize_check_interval_secs: u64,
    /// EMA smoothing factor for post-finalization baseline adaptation
    pub ema_alpha: f64,
}

/// Flow polling, anomaly detection, and attestation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalystConfig {
    pub flow_poll_interval_secs: u64,
    /// Each anomaly rule fires at most once per device per window
    pub anomaly_window_secs: u64,
    pub attestation_interval_secs: u64,
}

/// Honeypot ingestion parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeceptionConfig {
    /// Newline-delimited JSON honeypot event log (required)
    pub honeypot_log_path: String,
    /// Threats with no events for this long are aged out
    pub threat_ttl_secs: u64,
    /// Cadence at which new log lines are picked up
    pub tail_interval_secs: u64,
}

/// Traffic orchestrator parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Alerts older than this are ignored by the decision function
    pub alert_window_secs: u64,
    /// Recovery requires a quiet window of this length
    pub recovery_window_secs: u64,
    /// Install attempts before failing closed
    pub rule_install_retries: u32,
}

/// Switch adapter parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchConfig {
    /// Fixed output port for redirect decisions; redirect capability is
    /// absent when unset
    pub honeypot_port: Option<u32>,
    /// Queued installs tolerated during a disconnect
    pub max_queue: usize,
    /// Disconnects longer than this surface SwitchUnavailable
    pub max_disconnect_secs: u64,
    /// Timeout applied to every switch call
    pub call_timeout_secs: u64,
}

/// Event bus parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Bounded per-subscriber queue size
    pub event_queue_size: usize,
}

/// Management API parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address the management API listens on
    pub listen_address: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (compact, pretty, json)
    pub format: String,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            initial_score: 70,
            thresholds: vec![70, 50, 30],
            hysteresis: 5,
            positive_tick: false,
        }
    }
}

impl Default for ProfilingConfig {
    fn default() -> Self {
        Self {
            duration_secs: 300,
            min_packets: 5,
            finalize_check_interval_secs: 30,
            ema_alpha: 0.1,
        }
    }
}

impl Default for AnalystConfig {
    fn default() -> Self {
        Self {
            flow_poll_interval_secs: 10,
            anomaly_window_secs: 60,
            attestation_interval_secs: 300,
        }
    }
}

impl Default for DeceptionConfig {
    fn default() -> Self {
        Self {
            honeypot_log_path: String::new(),
            threat_ttl_secs: 86_400,
            tail_interval_secs: 2,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            alert_window_secs: 300,
            recovery_window_secs: 600,
            rule_install_retries: 3,
        }
    }
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            honeypot_port: None,
            max_queue: 1000,
            max_disconnect_secs: 60,
            call_timeout_secs: 5,
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            event_queue_size: 1024,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:8420".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

impl Config {
    /// Load configuration with the following priority:
    /// 1. Environment variables (TRUSTPLANE_*)
    /// 2. Config file (if exists)
    /// 3. Defaults
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(config_path) = Self::find_config_file() {
            config = Self::load_from_file(&config_path)?;
        }

        config = Self::apply_env_overrides(config);
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file, applying env overrides
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::apply_env_overrides(Self::load_from_file(path)?);
        config.validate()?;
        Ok(config)
    }

    /// Parse a config file without validation
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Config =
            toml::from_str(&content).map_err(|source| ConfigError::ParseError {
                path: path.to_path_buf(),
                source,
            })?;

        Ok(config)
    }

    /// Find config file in standard locations
    /// 1. ./trustplane.toml (current directory)
    /// 2. ~/.config/trustplane/trustplane.toml
    fn find_config_file() -> Option<PathBuf> {
        let local_config = PathBuf::from("trustplane.toml");
        if local_config.exists() {
            return Some(local_config);
        }

        if let Some(home_dir) = dirs::home_dir() {
            let user_config = home_dir
                .join(".config")
                .join("trustplane")
                .join("trustplane.toml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        None
    }

    /// Apply environment variable overrides for the common knobs
    fn apply_env_overrides(mut config: Config) -> Self {
        if let Ok(path) = std::env::var("TRUSTPLANE_DB_PATH") {
            config.identity.db_path = path;
        }
        if let Ok(dir) = std::env::var("TRUSTPLANE_CA_DIR") {
            config.identity.ca_dir = dir;
        }
        if let Ok(path) = std::env::var("TRUSTPLANE_HONEYPOT_LOG_PATH") {
            config.deception.honeypot_log_path = path;
        }
        if let Ok(port) = std::env::var("TRUSTPLANE_HONEYPOT_PORT") {
            if let Ok(port) = port.parse() {
                config.switch.honeypot_port = Some(port);
            }
        }
        if let Ok(level) = std::env::var("TRUSTPLANE_LOGGING_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(address) = std::env::var("TRUSTPLANE_API_LISTEN_ADDRESS") {
            config.api.listen_address = address;
        }
        config
    }

    /// Validate configuration values; a failure here aborts startup
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = |key: &str, value: &str| -> Result<(), ConfigError> {
            if value.is_empty() {
                return Err(ConfigError::ValidationError {
                    key: key.to_string(),
                    reason: "required key is missing".to_string(),
                });
            }
            Ok(())
        };

        required("identity.db_path", &self.identity.db_path)?;
        required("identity.ca_dir", &self.identity.ca_dir)?;
        required("deception.honeypot_log_path", &self.deception.honeypot_log_path)?;

        if !(0.0..=1.0).contains(&self.profiling.ema_alpha) || self.profiling.ema_alpha == 0.0 {
            return Err(ConfigError::ValidationError {
                key: "profiling.ema_alpha".to_string(),
                reason: "must be in (0.0, 1.0]".to_string(),
            });
        }

        if !(0..=100).contains(&self.trust.initial_score) {
            return Err(ConfigError::ValidationError {
                key: "trust.initial_score".to_string(),
                reason: "must be in [0, 100]".to_string(),
            });
        }

        if self.trust.thresholds.is_empty()
            || self.trust.thresholds.windows(2).any(|w| w[0] <= w[1])
            || self.trust.thresholds.iter().any(|t| !(0..=100).contains(t))
        {
            return Err(ConfigError::ValidationError {
                key: "trust.thresholds".to_string(),
                reason: "must be a strictly descending list within [0, 100]".to_string(),
            });
        }

        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationError {
                key: "logging.level".to_string(),
                reason: format!("must be one of: {}", valid_levels.join(", ")),
            });
        }

        if self.bus.event_queue_size == 0 {
            return Err(ConfigError::ValidationError {
                key: "bus.event_queue_size".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        Ok(())
    }

    /// Whether redirect decisions can be honored
    pub fn redirect_capable(&self) -> bool {
        self.switch.honeypot_port.is_some()
    }

    /// Save configuration to a file
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self).map_err(|e| {
            ConfigError::ValidationError {
                key: "config".to_string(),
                reason: format!("Failed to serialize config: {}", e),
            }
        })?;

        fs::write(path, toml_string).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(())
    }
}
