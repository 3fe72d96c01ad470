//! Configuration for lsm-audit
//!
//! Provides:
//! - Config file discovery (CLI flag, env var, standard paths)
//! - TOML parsing with serde
//! - Environment variable overrides
//! - Validation of channel geometry

use crate::pipeline::{ChannelSizes, PipelineConfig};
use crate::schema::EventKind;
use lsm_audit_common::{CONNECT_EVENTS_DEFAULT_BYTES, FILE_OPEN_EVENTS_DEFAULT_BYTES};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Page size the kernel ring buffer sizes must be a multiple of
pub const PAGE_SIZE: u32 = 4096;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Complete configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub audit: AuditSettings,
    pub channels: ChannelSettings,
    pub capture: CaptureSettings,
}

/// Core audit settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,

    /// Trace every record decision (bpf_printk in the kernel programs)
    pub debug_tracing: bool,

    /// Only audit this process id; 0 audits everything
    pub target_pid: u32,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            debug_tracing: false,
            target_pid: 0,
        }
    }
}

/// Ring channel sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSettings {
    /// Connect channel capacity in bytes
    pub connect_bytes: u32,

    /// File-open channel capacity in bytes
    pub file_open_bytes: u32,

    /// How often the consumer polls userspace channels
    pub poll_interval_ms: u64,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            connect_bytes: CONNECT_EVENTS_DEFAULT_BYTES,
            file_open_bytes: FILE_OPEN_EVENTS_DEFAULT_BYTES,
            poll_interval_ms: 10,
        }
    }
}

/// Kernel capture settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Path to the compiled LSM programs (Linux only)
    pub ebpf_path: Option<String>,
}

impl AuditConfig {
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            debug_tracing: self.audit.debug_tracing,
            target_pid: self.audit.target_pid,
        }
    }

    pub fn channel_sizes(&self) -> ChannelSizes {
        ChannelSizes {
            connect_bytes: self.channels.connect_bytes as usize,
            file_open_bytes: self.channels.file_open_bytes as usize,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.channels.poll_interval_ms)
    }
}

/// Configuration loader
#[derive(Debug, Default)]
pub struct ConfigLoader {
    /// Path to config file (if specified via CLI)
    cli_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new config loader
    pub fn new() -> Self {
        Self { cli_path: None }
    }

    /// Set the config path from CLI argument
    pub fn with_cli_path(mut self, path: Option<PathBuf>) -> Self {
        self.cli_path = path;
        self
    }

    /// Load configuration with the following precedence:
    /// 1. CLI --config flag
    /// 2. LSM_AUDIT_CONFIG environment variable
    /// 3. ~/.config/lsm-audit/config.toml
    /// 4. /etc/lsm-audit/config.toml
    /// 5. Default values
    pub fn load(&self) -> ConfigResult<AuditConfig> {
        let mut config = match self.find_config_file() {
            Some(path) => {
                info!("Loading configuration from: {}", path.display());
                self.load_from_file(&path)?
            }
            None => {
                debug!("No config file found, using defaults");
                AuditConfig::default()
            }
        };

        self.apply_overrides(&mut config, |key| std::env::var(key).ok());
        self.validate(&config)?;

        Ok(config)
    }

    /// Find the config file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.cli_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!("CLI config path does not exist: {}", path.display());
        }

        if let Ok(env_path) = std::env::var("LSM_AUDIT_CONFIG") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
            warn!("LSM_AUDIT_CONFIG path does not exist: {}", env_path);
        }

        if let Some(path) = Self::default_config_path() {
            if path.exists() {
                return Some(path);
            }
        }

        let path = PathBuf::from("/etc/lsm-audit/config.toml");
        if path.exists() {
            return Some(path);
        }

        None
    }

    /// Load configuration from a TOML file
    fn load_from_file(&self, path: &Path) -> ConfigResult<AuditConfig> {
        let content = std::fs::read_to_string(path)?;
        let config: AuditConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply `LSM_AUDIT_*` overrides looked up through `var`
    fn apply_overrides(&self, config: &mut AuditConfig, var: impl Fn(&str) -> Option<String>) {
        if let Some(val) = var("LSM_AUDIT_LOG_LEVEL") {
            config.audit.log_level = val;
        }
        if let Some(val) = var("LSM_AUDIT_DEBUG") {
            config.audit.debug_tracing = parse_flag(&val).unwrap_or(config.audit.debug_tracing);
        }
        if let Some(val) = var("LSM_AUDIT_TARGET_PID") {
            match val.parse() {
                Ok(pid) => config.audit.target_pid = pid,
                Err(_) => warn!("Ignoring LSM_AUDIT_TARGET_PID={}: not a pid", val),
            }
        }
        if let Some(val) = var("LSM_AUDIT_EBPF_PATH") {
            config.capture.ebpf_path = Some(val);
        }
    }

    /// Validate configuration
    fn validate(&self, config: &AuditConfig) -> ConfigResult<()> {
        if !VALID_LOG_LEVELS.contains(&config.audit.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                config.audit.log_level, VALID_LOG_LEVELS
            )));
        }

        validate_channel(EventKind::Connect, config.channels.connect_bytes)?;
        validate_channel(EventKind::FileOpen, config.channels.file_open_bytes)?;

        if config.channels.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "poll_interval_ms cannot be 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Get the default config file path for the current user
    pub fn default_config_path() -> Option<PathBuf> {
        config_dir().map(|d| d.join("lsm-audit").join("config.toml"))
    }
}

fn validate_channel(kind: EventKind, bytes: u32) -> ConfigResult<()> {
    if !bytes.is_power_of_two() || bytes % PAGE_SIZE != 0 {
        return Err(ConfigError::ValidationError(format!(
            "{} size {} must be a power of two and a multiple of {}",
            kind.channel_name(),
            bytes,
            PAGE_SIZE
        )));
    }
    if (bytes as usize) < kind.record_size() {
        return Err(ConfigError::ValidationError(format!(
            "{} size {} cannot hold one {} byte record",
            kind.channel_name(),
            bytes,
            kind.record_size()
        )));
    }
    Ok(())
}

fn parse_flag(val: &str) -> Option<bool> {
    match val.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn config_dir() -> Option<PathBuf> {
    std::env::var("XDG_CONFIG_HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".config"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = AuditConfig::default();
        assert_eq!(config.audit.log_level, "info");
        assert!(!config.audit.debug_tracing);
        assert_eq!(config.audit.target_pid, 0);
        assert_eq!(config.channels.connect_bytes, 4 * 1024 * 1024);
        assert_eq!(config.channels.file_open_bytes, 8 * 1024 * 1024);
        assert!(ConfigLoader::new().validate(&config).is_ok());
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml_str = r#"
            [audit]
            target_pid = 1337
        "#;
        let config: AuditConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.audit.target_pid, 1337);
        assert_eq!(config.audit.log_level, "info");
        assert_eq!(config.channels, ChannelSettings::default());
    }

    #[test]
    fn test_load_from_cli_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [audit]
            log_level = "debug"
            debug_tracing = true

            [channels]
            connect_bytes = 65536
            file_open_bytes = 131072
            poll_interval_ms = 50

            [capture]
            ebpf_path = "/usr/lib/lsm-audit/lsm-audit-ebpf"
            "#
        )
        .unwrap();

        let config = ConfigLoader::new()
            .with_cli_path(Some(file.path().to_path_buf()))
            .load()
            .unwrap();
        assert_eq!(config.audit.log_level, "debug");
        assert!(config.pipeline_config().debug_tracing);
        assert_eq!(config.channel_sizes().connect_bytes, 65536);
        assert_eq!(config.poll_interval(), Duration::from_millis(50));
        assert_eq!(
            config.capture.ebpf_path.as_deref(),
            Some("/usr/lib/lsm-audit/lsm-audit-ebpf")
        );
    }

    #[test]
    fn test_malformed_file_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[audit\nlog_level = ").unwrap();
        let result = ConfigLoader::new().load_from_file(file.path());
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("LSM_AUDIT_LOG_LEVEL", "trace"),
            ("LSM_AUDIT_DEBUG", "1"),
            ("LSM_AUDIT_TARGET_PID", "4242"),
            ("LSM_AUDIT_EBPF_PATH", "/tmp/prog.o"),
        ]
        .into_iter()
        .collect();

        let mut config = AuditConfig::default();
        ConfigLoader::new().apply_overrides(&mut config, |k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.audit.log_level, "trace");
        assert!(config.audit.debug_tracing);
        assert_eq!(config.audit.target_pid, 4242);
        assert_eq!(config.capture.ebpf_path.as_deref(), Some("/tmp/prog.o"));
    }

    #[test]
    fn test_bad_override_values_ignored() {
        let mut config = AuditConfig::default();
        ConfigLoader::new().apply_overrides(&mut config, |k| match k {
            "LSM_AUDIT_DEBUG" => Some("maybe".to_string()),
            "LSM_AUDIT_TARGET_PID" => Some("-1".to_string()),
            _ => None,
        });
        assert!(!config.audit.debug_tracing);
        assert_eq!(config.audit.target_pid, 0);
    }

    #[test]
    fn test_validation_invalid_log_level() {
        let config = AuditConfig {
            audit: AuditSettings {
                log_level: "loud".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(ConfigLoader::new().validate(&config).is_err());
    }

    #[test]
    fn test_validation_channel_geometry() {
        let loader = ConfigLoader::new();
        let with_connect = |bytes| AuditConfig {
            channels: ChannelSettings {
                connect_bytes: bytes,
                ..Default::default()
            },
            ..Default::default()
        };

        // 160 * 16384, the size of a record array rather than a ring buffer
        assert!(loader.validate(&with_connect(2_621_440)).is_err());
        // power of two but below a page
        assert!(loader.validate(&with_connect(2048)).is_err());
        assert!(loader.validate(&with_connect(0)).is_err());
        assert!(loader.validate(&with_connect(4096)).is_ok());
    }

    #[test]
    fn test_validation_zero_poll_interval() {
        let config = AuditConfig {
            channels: ChannelSettings {
                poll_interval_ms: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(ConfigLoader::new().validate(&config).is_err());
    }

    #[test]
    fn test_serialize_config() {
        let toml_str = toml::to_string_pretty(&AuditConfig::default()).unwrap();
        assert!(toml_str.contains("[audit]"));
        assert!(toml_str.contains("[channels]"));
        assert!(toml_str.contains("poll_interval_ms"));
    }
}
