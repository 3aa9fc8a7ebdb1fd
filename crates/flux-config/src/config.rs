//! Sync settings, their defaults, and the `config.ron` file that holds them.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Name of the persisted configuration file.
const CONFIG_FILE: &str = "config.ron";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Network topology, replication and jitter settings.
    pub network: NetworkConfig,
    /// Action store settings.
    pub actions: ActionConfig,
    /// Diagnostics.
    pub debug: DebugConfig,
}

/// Network and replication configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Delay added to local simulation time before buffered entity frames
    /// are released, in milliseconds.
    pub jitter_buffer_delay_ms: f64,
    /// Simulation tick rate (Hz).
    pub tick_rate: u32,
    /// Topic assigned to actions dispatched without an explicit one.
    pub default_topic: String,
    /// Minimum encoded action batch size (bytes) before LZ4 is applied.
    pub compression_threshold: usize,
    /// Position deltas at or below this are not retransmitted.
    pub position_epsilon: f64,
    /// Rotation component deltas at or below this are not retransmitted.
    pub rotation_epsilon: f32,
    /// Maximum absolute value per axis for compressed velocity vectors.
    pub velocity_max_range: f32,
}

/// Action store configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ActionConfig {
    /// Capture a backtrace into `$stack` on every dispatch (development only).
    pub capture_stack: bool,
    /// Topics whose incoming actions are relayed even when authored remotely.
    /// Hosts list the topics they host here.
    pub forward_topics: Vec<String>,
}

/// Logging and diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            jitter_buffer_delay_ms: 100.0,
            tick_rate: 60,
            default_topic: "world".to_string(),
            compression_threshold: 256,
            position_epsilon: 0.0001,
            rotation_epsilon: 0.0001,
            velocity_max_range: 64.0,
        }
    }
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            capture_stack: false,
            forward_topics: Vec::new(),
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl NetworkConfig {
    /// Duration of one simulation tick in milliseconds.
    pub fn tick_duration_ms(&self) -> f64 {
        1000.0 / self.tick_rate.max(1) as f64
    }
}

/// Platform config directory for Flux (e.g. `~/.config/flux`).
pub fn default_config_dir() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join("flux"))
        .ok_or(ConfigError::NoConfigDir)
}

fn invalid(field: &'static str, reason: &'static str) -> ConfigError {
    ConfigError::Invalid { field, reason }
}

impl Config {
    /// Rejects settings the sync core cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let network = &self.network;
        if network.tick_rate == 0 {
            return Err(invalid("network.tick_rate", "must be at least 1"));
        }
        let negative = |value: f64| value.is_nan() || value < 0.0;
        if negative(network.jitter_buffer_delay_ms) {
            return Err(invalid("network.jitter_buffer_delay_ms", "must be zero or positive"));
        }
        if negative(network.position_epsilon) || negative(f64::from(network.rotation_epsilon)) {
            return Err(invalid("network.*_epsilon", "must be zero or positive"));
        }
        if !network.velocity_max_range.is_finite() || network.velocity_max_range <= 0.0 {
            return Err(invalid("network.velocity_max_range", "must be finite and positive"));
        }
        if network.default_topic.is_empty() {
            return Err(invalid("network.default_topic", "must not be empty"));
        }
        if self.actions.forward_topics.iter().any(String::is_empty) {
            return Err(invalid("actions.forward_topics", "must not contain empty topics"));
        }
        Ok(())
    }

    /// Reads `config.ron` from `config_dir`, writing the defaults there first
    /// if the file does not exist yet.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let path = config_dir.join(CONFIG_FILE);
        if !path.exists() {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Wrote default sync settings to {}", path.display());
            return Ok(config);
        }
        let config = read_file(&path)?;
        log::info!("Loaded sync settings from {}", path.display());
        Ok(config)
    }

    /// Writes `config.ron` into `config_dir`, creating the directory.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        let path = config_dir.join(CONFIG_FILE);
        let write_err = |source| ConfigError::Write {
            path: path.clone(),
            source,
        };
        std::fs::create_dir_all(config_dir).map_err(write_err)?;

        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(2)
            .struct_names(false)
            .enumerate_arrays(false);
        let text = ron::ser::to_string_pretty(self, pretty)?;
        std::fs::write(&path, text).map_err(write_err)
    }

    /// Re-reads `config.ron`. Returns the new settings only when they differ
    /// from `self`.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let reloaded = read_file(&config_dir.join(CONFIG_FILE))?;
        if &reloaded == self {
            return Ok(None);
        }
        log::info!("Sync settings changed on disk");
        Ok(Some(reloaded))
    }
}

fn read_file(path: &Path) -> Result<Config, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_owned(),
        source,
    })?;
    let config: Config = ron::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_owned(),
        source,
    })?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_serializes() {
        let config = Config::default();
        let ron_str =
            ron::ser::to_string_pretty(&config, ron::ser::PrettyConfig::new().depth_limit(3))
                .unwrap();
        assert!(ron_str.contains("jitter_buffer_delay_ms: 100.0"));
        assert!(ron_str.contains("default_topic: \"world\""));
    }

    #[test]
    fn test_missing_section_uses_default() {
        let ron_str = "(network: (tick_rate: 30))";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config.network.tick_rate, 30);
        assert_eq!(config.network.default_topic, "world");
        assert_eq!(config.actions, ActionConfig::default());
        assert_eq!(config.debug, DebugConfig::default());
    }

    #[test]
    fn test_extra_field_ignored() {
        let result: Result<Config, _> = ron::from_str("(future_setting: true)");
        assert!(result.is_ok());
    }

    #[test]
    fn test_tick_duration() {
        let mut network = NetworkConfig::default();
        assert!((network.tick_duration_ms() - 1000.0 / 60.0).abs() < 1e-9);
        network.tick_rate = 0;
        assert_eq!(network.tick_duration_ms(), 1000.0);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.network.jitter_buffer_delay_ms = 50.0;
        config.actions.forward_topics = vec!["world".to_string()];
        config.debug.log_level = "debug".to_string();

        config.save(dir.path()).unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_or_create_writes_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, Config::default());
        assert!(dir.path().join(CONFIG_FILE).exists());
    }

    #[test]
    fn test_reload_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        let mut modified = config.clone();
        modified.network.tick_rate = 20;
        modified.save(dir.path()).unwrap();

        let result = config.reload(dir.path()).unwrap();
        assert_eq!(result.unwrap().network.tick_rate, 20);
    }

    #[test]
    fn test_reload_no_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();
        assert!(config.reload(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let mut config = Config::default();
        config.network.tick_rate = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "network.tick_rate",
                ..
            })
        ));

        let mut config = Config::default();
        config.network.velocity_max_range = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.network.jitter_buffer_delay_ms = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.actions.forward_topics = vec![String::new()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "(network: (tick_rate: 0))").unwrap();
        assert!(matches!(
            Config::load_or_create(dir.path()),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_parse_error_names_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{{not valid}}").unwrap();
        let err = Config::load_or_create(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains(CONFIG_FILE));
    }
}
