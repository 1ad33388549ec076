// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Runtime Configuration Types
//
// Kubernetes-style manifest (apiVersion/kind/metadata/spec) controlling the
// activation runtime: correlation deadlines, hierarchy depth bound, snapshot
// cadence, redelivery dedup window, idle deactivation and logging.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use humantime_serde::re::humantime::parse_duration;

pub const API_VERSION: &str = "canopy.dev/v1";
pub const KIND: &str = "RuntimeConfig";

/// Top-level runtime configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfigManifest {
    /// API version (must be "canopy.dev/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "RuntimeConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    #[serde(default)]
    pub spec: RuntimeConfigSpec,
}

/// Manifest metadata (Kubernetes-style)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfigSpec {
    #[serde(default)]
    pub correlation: CorrelationConfig,

    #[serde(default)]
    pub hierarchy: HierarchyConfig,

    #[serde(default)]
    pub event_log: EventLogConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub activation: ActivationConfig,

    #[serde(default)]
    pub observability: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationConfig {
    /// Deadline used when a request is published without an explicit timeout
    #[serde(default = "default_correlation_timeout", with = "humantime_serde")]
    pub default_timeout: Duration,

    /// Period of the background deadline sweep
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HierarchyConfig {
    /// Longest ancestor chain walked by the cycle check
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventLogConfig {
    /// Take a snapshot every N confirmed log entries (disabled when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_interval: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Number of handled (correlation, event) pairs remembered per activation
    #[serde(default = "default_dedup_window")]
    pub dedup_window: usize,

    /// Send `HandlerFailed` back to the publisher when a handler fails
    #[serde(default = "default_true")]
    pub report_handler_failures: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActivationConfig {
    /// Deactivate agents whose mailbox stays empty this long (never when unset)
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub idle_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format ("json" or "text")
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_true() -> bool {
    true
}

fn default_correlation_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_sweep_interval() -> Duration {
    Duration::from_millis(25)
}

fn default_max_depth() -> usize {
    64
}

fn default_dedup_window() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            default_timeout: default_correlation_timeout(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            dedup_window: default_dedup_window(),
            report_handler_failures: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for RuntimeConfigManifest {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: "canopy-runtime".to_string(),
                labels: None,
            },
            spec: RuntimeConfigSpec::default(),
        }
    }
}

impl RuntimeConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Parse configuration from YAML string
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. CANOPY_CONFIG_PATH environment variable
    /// 2. ./canopy-config.yaml (working directory)
    /// 3. ~/.canopy/config.yaml (user home)
    /// 4. /etc/canopy/config.yaml (system)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("CANOPY_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./canopy-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".canopy").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/canopy/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(explicit_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit path fails if missing or invalid
        if let Some(path) = explicit_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path).map_err(|e| {
                anyhow::anyhow!("Failed to load config at {:?}: {}", path, e)
            })?;
            config.apply_env_overrides();
            config.validate()?;
            return Ok(config);
        }

        let mut config = if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            Self::from_yaml_file(config_path)?
        } else {
            tracing::debug!("No configuration file found in standard locations. Using defaults.");
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("CANOPY_LOG_LEVEL") {
            tracing::info!("Environment override: CANOPY_LOG_LEVEL={}", val);
            self.spec.observability.level = val;
        }

        if let Ok(val) = std::env::var("CANOPY_IDLE_TIMEOUT") {
            match parse_duration(&val) {
                Ok(timeout) => {
                    tracing::info!("Environment override: CANOPY_IDLE_TIMEOUT={}", val);
                    self.spec.activation.idle_timeout = Some(timeout);
                }
                Err(e) => {
                    tracing::warn!(
                        "Invalid value for CANOPY_IDLE_TIMEOUT: '{}' ({}). Ignoring.",
                        val,
                        e
                    );
                }
            }
        }

        if let Ok(val) = std::env::var("CANOPY_CORRELATION_TIMEOUT") {
            match parse_duration(&val) {
                Ok(timeout) => {
                    tracing::info!("Environment override: CANOPY_CORRELATION_TIMEOUT={}", val);
                    self.spec.correlation.default_timeout = timeout;
                }
                Err(e) => {
                    tracing::warn!(
                        "Invalid value for CANOPY_CORRELATION_TIMEOUT: '{}' ({}). Ignoring.",
                        val,
                        e
                    );
                }
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        if self.spec.hierarchy.max_depth == 0 {
            anyhow::bail!("spec.hierarchy.max_depth must be at least 1");
        }

        if self.spec.correlation.sweep_interval.is_zero() {
            anyhow::bail!("spec.correlation.sweep_interval must be non-zero");
        }

        if self.spec.dispatch.dedup_window == 0 {
            anyhow::bail!("spec.dispatch.dedup_window must be at least 1");
        }

        if self.spec.event_log.snapshot_interval == Some(0) {
            anyhow::bail!("spec.event_log.snapshot_interval must be at least 1 when set");
        }

        if !matches!(self.spec.observability.format.as_str(), "json" | "text") {
            anyhow::bail!(
                "Invalid observability.format: '{}'. Must be 'json' or 'text'",
                self.spec.observability.format
            );
        }

        Ok(())
    }
}
