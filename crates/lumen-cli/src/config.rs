use lumen_engine::error::ConfigError;
use lumen_engine::EngineConfig;
use lumen_runner::RegionConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Also write logs under the data directory
    #[serde(default)]
    pub file_logging: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LumenConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub region: RegionConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

const EXAMPLE_CONFIG: &str = r#"# Lumen Configuration

[engine]
# Instruction steps per scheduling pass, and per script before moving on
instruction_frequency = 48
script_timeslice = 8
# Minimum spacing between two saved snapshots of one script
save_interval_ms = 240000
# cache_dir = "/path/to/cache"
# state_dir = "/path/to/states"

[region]
scripts_dir = "demos/scripts"
instances_per_script = 1
touch_interval_ms = 1000
restore_state = true

[logging]
file_logging = false
"#;

impl LumenConfig {
    pub fn config_path() -> PathBuf {
        lumen_engine::config::config_dir().join("config.toml")
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }
}

pub fn create_example_config(path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, EXAMPLE_CONFIG)?;
    eprintln!("Config file created at: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_example_config_parses() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lumen").join("config.toml");
        create_example_config(&path).unwrap();

        let config = LumenConfig::load_from(&path).unwrap();
        assert_eq!(config.engine.instruction_frequency, 48);
        assert_eq!(config.engine.max_deferred_events, 32);
        assert_eq!(config.region.scripts_dir, PathBuf::from("demos/scripts"));
        assert!(!config.logging.file_logging);
    }

    #[test]
    fn test_missing_and_malformed_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        assert!(matches!(
            LumenConfig::load_from(&path),
            Err(ConfigError::NotFound(_))
        ));

        fs::write(&path, "[engine\n").unwrap();
        assert!(matches!(
            LumenConfig::load_from(&path),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[region]\ninstances_per_script = 4\n").unwrap();

        let config = LumenConfig::load_from(&path).unwrap();
        assert_eq!(config.region.instances_per_script, 4);
        assert!(config.region.restore_state);
        assert_eq!(config.engine, EngineConfig::default());
        assert_eq!(config.logging, LoggingConfig::default());
    }
}
