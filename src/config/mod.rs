//! meshguard Configuration
//!
//! Two YAML documents, one per role:
//!
//! - [`EdgeConfig`]: a participating node with a virtual interface
//! - [`SuperConfig`]: the optional coordinator
//!
//! Field names follow the established PascalCase layout so existing
//! deployments keep working:
//!
//! ```yaml
//! NodeID: 1
//! PrivKey: "6GyDagZKhbm5WNqMiRHhkf43RlbMJ34IieTlIuvfJ1M="
//! DynamicRoute:
//!   SendPingInterval: 16
//!   P2P:
//!     UseP2P: true
//! ```
//!
//! Every optional field has a serde default, and `validate()` rejects the
//! values that would only fail later at runtime.

mod edge;
mod super_node;

use crate::identity::IdentityError;
use crate::routing::GraphSettings;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub use edge::{
    DynamicRouteConfig, EdgeConfig, InterfaceConfig, NtpConfig, P2pConfig, PeerEntry,
    SuperNodeConfig,
};
pub use super_node::{SuperConfig, SuperPeerEntry};

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("failed to write config file {path}: {source}")]
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),
}

// ============================================================================
// Logging
// ============================================================================

/// Log verbosity and per-category switches (`LogLevel`).
///
/// Each switch maps onto a tracing target; a disabled category is capped at
/// `info` so its per-packet `debug` lines disappear.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `error`, `normal`, `verbose`/`debug`, `trace` or `silent`.
    #[serde(rename = "LogLevel", default = "LogConfig::default_level")]
    pub level: String,
    #[serde(rename = "LogTransit", default)]
    pub transit: bool,
    #[serde(rename = "LogControl", default)]
    pub control: bool,
    #[serde(rename = "LogNormal", default)]
    pub normal: bool,
    #[serde(rename = "LogInternal", default)]
    pub internal: bool,
    #[serde(rename = "LogNTP", default)]
    pub ntp: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            transit: false,
            control: false,
            normal: false,
            internal: false,
            ntp: false,
        }
    }
}

impl LogConfig {
    fn default_level() -> String {
        "normal".to_string()
    }

    fn base_level(&self) -> &'static str {
        match self.level.to_ascii_lowercase().as_str() {
            "silent" | "off" => "off",
            "error" => "error",
            "warn" => "warn",
            "verbose" | "debug" => "debug",
            "trace" => "trace",
            _ => "info",
        }
    }

    /// `EnvFilter` directive string for this block.
    pub fn filter_directives(&self) -> String {
        let base = self.base_level();
        let mut directives = vec![base.to_string()];
        if base == "off" {
            return base.to_string();
        }
        let categories = [
            ("meshguard::transit", self.transit),
            ("meshguard::control", self.control),
            ("meshguard::normal", self.normal),
            ("meshguard::internal", self.internal || self.ntp),
        ];
        for (target, enabled) in categories {
            let level = if enabled {
                "debug"
            } else if base == "error" || base == "warn" {
                base
            } else {
                "info"
            };
            directives.push(format!("{}={}", target, level));
        }
        directives.join(",")
    }
}

// ============================================================================
// Routing
// ============================================================================

/// Recalculation tuning (`GraphRecalculateSetting`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphRecalculateConfig {
    #[serde(rename = "StaticMode", default)]
    pub static_mode: bool,
    /// Milliseconds.
    #[serde(rename = "JitterTolerance", default = "GraphRecalculateConfig::default_jitter")]
    pub jitter_tolerance: f64,
    #[serde(
        rename = "JitterToleranceMultiplier",
        default = "GraphRecalculateConfig::default_multiplier"
    )]
    pub jitter_tolerance_multiplier: f64,
    /// Seconds between latency expiry sweeps.
    #[serde(
        rename = "TimeoutCheckInterval",
        default = "GraphRecalculateConfig::default_timeout_check"
    )]
    pub timeout_check_interval: f64,
    /// Seconds between recomputes.
    #[serde(
        rename = "RecalculateCoolDown",
        default = "GraphRecalculateConfig::default_cooldown"
    )]
    pub recalculate_cooldown: f64,
    /// Weight given to the previous latency when smoothing a new sample.
    #[serde(
        rename = "DampingResistance",
        default = "GraphRecalculateConfig::default_damping"
    )]
    pub damping_resistance: f64,
}

impl Default for GraphRecalculateConfig {
    fn default() -> Self {
        Self {
            static_mode: false,
            jitter_tolerance: Self::default_jitter(),
            jitter_tolerance_multiplier: Self::default_multiplier(),
            timeout_check_interval: Self::default_timeout_check(),
            recalculate_cooldown: Self::default_cooldown(),
            damping_resistance: Self::default_damping(),
        }
    }
}

impl GraphRecalculateConfig {
    fn default_jitter() -> f64 { 50.0 }
    fn default_multiplier() -> f64 { 1.1 }
    fn default_timeout_check() -> f64 { 5.0 }
    fn default_cooldown() -> f64 { 5.0 }
    fn default_damping() -> f64 { 0.9 }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.jitter_tolerance < 0.0 {
            return Err(invalid("JitterTolerance must not be negative"));
        }
        if self.jitter_tolerance_multiplier < 1.0 {
            return Err(invalid("JitterToleranceMultiplier must be at least 1"));
        }
        if !(0.0..1.0).contains(&self.damping_resistance) {
            return Err(invalid("DampingResistance must be in [0, 1)"));
        }
        positive("TimeoutCheckInterval", self.timeout_check_interval)?;
        non_negative("RecalculateCoolDown", self.recalculate_cooldown)?;
        Ok(())
    }

    /// Graph settings; the super-only fields are filled by the caller.
    pub fn graph_settings(&self) -> GraphSettings {
        GraphSettings {
            static_mode: self.static_mode,
            jitter_tolerance: self.jitter_tolerance,
            jitter_tolerance_multiplier: self.jitter_tolerance_multiplier,
            recalculate_cooldown: seconds(self.recalculate_cooldown),
            timeout_check_interval: seconds(self.timeout_check_interval),
            ..GraphSettings::default()
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

pub(crate) fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

pub(crate) fn positive(name: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(invalid(format!("{} must be positive, got {}", name, value)))
    }
}

pub(crate) fn non_negative(name: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(invalid(format!("{} must not be negative, got {}", name, value)))
    }
}

/// Seconds from the YAML float form. Callers validate first.
pub(crate) fn seconds(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}

/// Load and parse one YAML file.
pub(crate) fn load_yaml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    serde_yaml::from_str(&contents).map_err(|e| ConfigError::ParseYaml {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Replace `path` with `contents` via a sibling temp file and rename.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<(), ConfigError> {
    let write_err = |source| ConfigError::WriteFile {
        path: path.to_path_buf(),
        source,
    };
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "config".to_string());
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));
    std::fs::write(&tmp, contents).map_err(write_err)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(write_err(e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_filter_directives_default() {
        let log = LogConfig::default();
        let f = log.filter_directives();
        assert!(f.starts_with("info,"));
        assert!(f.contains("meshguard::transit=info"));
    }

    #[test]
    fn test_filter_directives_categories() {
        let log: LogConfig =
            serde_yaml::from_str("LogLevel: verbose\nLogTransit: true\nLogNTP: true\n").unwrap();
        let f = log.filter_directives();
        assert!(f.starts_with("debug,"));
        assert!(f.contains("meshguard::transit=debug"));
        assert!(f.contains("meshguard::internal=debug"));
        assert!(f.contains("meshguard::control=info"));
    }

    #[test]
    fn test_filter_directives_error_and_silent() {
        let log: LogConfig = serde_yaml::from_str("LogLevel: error\nLogControl: true\n").unwrap();
        let f = log.filter_directives();
        assert!(f.contains("meshguard::control=debug"));
        assert!(f.contains("meshguard::normal=error"));

        let silent: LogConfig = serde_yaml::from_str("LogLevel: silent\n").unwrap();
        assert_eq!(silent.filter_directives(), "off");
    }

    #[test]
    fn test_graph_recalculate_validate() {
        let mut g = GraphRecalculateConfig::default();
        assert!(g.validate().is_ok());
        g.jitter_tolerance_multiplier = 0.5;
        assert!(matches!(g.validate(), Err(ConfigError::Invalid(_))));
        g.jitter_tolerance_multiplier = 1.0;
        g.timeout_check_interval = 0.0;
        assert!(g.validate().is_err());
    }

    #[test]
    fn test_graph_settings_conversion() {
        let g: GraphRecalculateConfig =
            serde_yaml::from_str("JitterTolerance: 20\nRecalculateCoolDown: 2.5\n").unwrap();
        let s = g.graph_settings();
        assert_eq!(s.jitter_tolerance, 20.0);
        assert_eq!(s.recalculate_cooldown, Duration::from_millis(2500));
        assert_eq!(s.jitter_tolerance_multiplier, 1.1);
    }

    #[test]
    fn test_write_atomic_replaces_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("edge.yaml");
        std::fs::write(&path, "old").unwrap();
        write_atomic(&path, "new").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_load_yaml_errors() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.yaml");
        assert!(matches!(
            load_yaml::<LogConfig>(&missing),
            Err(ConfigError::ReadFile { .. })
        ));
        let bad = dir.path().join("bad.yaml");
        std::fs::write(&bad, "LogTransit: [").unwrap();
        assert!(matches!(
            load_yaml::<LogConfig>(&bad),
            Err(ConfigError::ParseYaml { .. })
        ));
    }
}
