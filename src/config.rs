//! Configuration types and file I/O for the traind edge agent.
//!
//! Two YAML documents live on disk:
//! - the *service config* (static, deployment-time): where the control plane
//!   is and how verbose to log. Missing or malformed is a fatal startup error.
//! - the *runtime config* (dynamic, assigned by the control plane): train
//!   assignment, broker address, topics, hardware type. It is downloaded,
//!   cached locally, and read back when the control plane is unreachable.
//!
//! [`ConfigLoader`] owns all file operations. No network or retry logic
//! lives here; that is [`crate::config_manager`] territory.

use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Raised when a configuration file cannot be loaded, parsed, or saved.
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML in {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Static service configuration, loaded once at startup and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Hostname or IP of the central control plane.
    pub control_plane_host: String,

    /// Control plane HTTP port.
    pub control_plane_port: u16,

    /// Log verbosity (`error|warn|info|debug|trace`).
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
}

impl ServiceConfig {
    /// Base URL of the control plane HTTP API.
    pub fn control_plane_url(&self) -> String {
        format!(
            "http://{}:{}",
            self.control_plane_host, self.control_plane_port
        )
    }
}

/// MQTT broker connection details, assigned by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Hardware backend selector. Resolved once at construction by the factory
/// in [`crate::hardware`]; never inspected at runtime after that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwareType {
    StepperHat,
    DcMotorHat,
    Generic,
    Simulator,
}

impl fmt::Display for HardwareType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HardwareType::StepperHat => "stepper_hat",
            HardwareType::DcMotorHat => "dc_motor_hat",
            HardwareType::Generic => "generic",
            HardwareType::Simulator => "simulator",
        };
        f.write_str(name)
    }
}

/// Assignment fields the control plane returns from
/// `GET /controllers/{uuid}/config`. The response does not echo the uuid;
/// [`RuntimeConfig::from_assignment`] merges it back in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Assignment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub train_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker: Option<BrokerConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_topic: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commands_topic: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_type: Option<HardwareType>,
}

/// Dynamic runtime configuration.
///
/// The uuid is assigned once by the control plane and is immutable
/// thereafter; everything else may be absent while the device waits for an
/// administrator to assign it a train. An incomplete config is a valid,
/// non-error state — callers must gate transport/hardware construction on
/// [`RuntimeConfig::is_complete`] and nothing else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub uuid: Uuid,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub train_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker: Option<BrokerConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_topic: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commands_topic: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_type: Option<HardwareType>,
}

impl RuntimeConfig {
    /// A registered-but-unassigned config: uuid only.
    pub fn waiting(uuid: Uuid) -> Self {
        Self {
            uuid,
            train_id: None,
            broker: None,
            status_topic: None,
            commands_topic: None,
            hardware_type: None,
        }
    }

    /// Merges a downloaded assignment with the durable uuid.
    pub fn from_assignment(uuid: Uuid, assignment: Assignment) -> Self {
        Self {
            uuid,
            train_id: assignment.train_id,
            broker: assignment.broker,
            status_topic: assignment.status_topic,
            commands_topic: assignment.commands_topic,
            hardware_type: assignment.hardware_type,
        }
    }

    /// The single completeness predicate: a config is ready for transport and
    /// hardware initialization iff train assignment, broker, and both topics
    /// are all present. Used identically everywhere that decision is made.
    pub fn is_complete(&self) -> bool {
        self.train_id.is_some()
            && self.broker.is_some()
            && self.status_topic.is_some()
            && self.commands_topic.is_some()
    }
}

mod defaults {
    pub fn log_level() -> String {
        "info".to_string()
    }
}

/// Pure file I/O for the two configuration documents.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    service_path: PathBuf,
    cache_path: PathBuf,
}

impl ConfigLoader {
    pub fn new(service_path: PathBuf, cache_path: PathBuf) -> Self {
        Self {
            service_path,
            cache_path,
        }
    }

    /// Loads the static service config. There is no sensible default, so a
    /// missing or malformed file is an error the caller treats as fatal.
    pub fn load_service_config(&self) -> Result<ServiceConfig, ConfigLoadError> {
        let path = &self.service_path;
        if !path.exists() {
            return Err(ConfigLoadError::NotFound(path.clone()));
        }

        let content = fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
            path: path.clone(),
            source,
        })?;

        serde_yaml::from_str(&content).map_err(|source| ConfigLoadError::Parse {
            path: path.clone(),
            source,
        })
    }

    /// Loads the cached runtime config. Absence of the cache is a normal
    /// state (first boot), and an unparsable cache is treated the same way:
    /// `None`, with a warning for the unparsable case.
    pub fn load_cached_runtime_config(&self) -> Option<RuntimeConfig> {
        let path = &self.cache_path;
        if !path.exists() {
            info!("No cached runtime config at {}", path.display());
            return None;
        }

        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                warn!(
                    "Failed to read cached runtime config {}: {e}",
                    path.display()
                );
                return None;
            }
        };

        match serde_yaml::from_str(&content) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!(
                    "Ignoring unparsable cached runtime config {}: {e}",
                    path.display()
                );
                None
            }
        }
    }

    /// Persists the runtime config, overwriting the previous cache.
    ///
    /// Writes to a temporary file and renames it into place so a crash
    /// mid-write never leaves a corrupt cache behind.
    pub fn save_runtime_config(&self, config: &RuntimeConfig) -> Result<(), ConfigLoadError> {
        let path = &self.cache_path;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| ConfigLoadError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let yaml = serde_yaml::to_string(config).map_err(|source| ConfigLoadError::Parse {
            path: path.clone(),
            source,
        })?;

        let tmp_path = path.with_extension("yaml.tmp");
        fs::write(&tmp_path, yaml).map_err(|source| ConfigLoadError::Io {
            path: tmp_path.clone(),
            source,
        })?;

        fs::rename(&tmp_path, path).map_err(|source| ConfigLoadError::Io {
            path: path.clone(),
            source,
        })?;

        info!("Saved runtime config to {}", path.display());
        Ok(())
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    fn write_temp(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    fn loader_with_service(file: &NamedTempFile) -> ConfigLoader {
        ConfigLoader::new(
            file.path().to_path_buf(),
            PathBuf::from("/nonexistent/cache.yaml"),
        )
    }

    fn complete_config() -> RuntimeConfig {
        RuntimeConfig {
            uuid: Uuid::new_v4(),
            train_id: Some("t1".to_string()),
            broker: Some(BrokerConfig {
                host: "mqtt".to_string(),
                port: 1883,
                username: Some("edge".to_string()),
                password: Some("secret".to_string()),
            }),
            status_topic: Some("trains/t1/status".to_string()),
            commands_topic: Some("trains/t1/commands".to_string()),
            hardware_type: Some(HardwareType::DcMotorHat),
        }
    }

    #[test]
    fn service_config_parses_with_default_log_level() {
        let file = write_temp("control_plane_host: api.local\ncontrol_plane_port: 8000\n");
        let config = loader_with_service(&file).load_service_config().unwrap();

        assert_eq!(config.control_plane_host, "api.local");
        assert_eq!(config.control_plane_port, 8000);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.control_plane_url(), "http://api.local:8000");
    }

    #[test]
    fn service_config_missing_file_is_an_error() {
        let loader = ConfigLoader::new(
            PathBuf::from("/nonexistent/edge-agent.conf"),
            PathBuf::from("/nonexistent/cache.yaml"),
        );

        let err = loader.load_service_config().unwrap_err();
        assert!(matches!(err, ConfigLoadError::NotFound(_)));
    }

    #[test]
    fn service_config_invalid_yaml_is_an_error() {
        let file = write_temp("control_plane_host: [unclosed\n");
        let err = loader_with_service(&file).load_service_config().unwrap_err();
        assert!(matches!(err, ConfigLoadError::Parse { .. }));
    }

    #[test]
    fn completeness_requires_every_field() {
        let full = complete_config();
        assert!(full.is_complete());

        let mut missing = full.clone();
        missing.train_id = None;
        assert!(!missing.is_complete());

        let mut missing = full.clone();
        missing.broker = None;
        assert!(!missing.is_complete());

        let mut missing = full.clone();
        missing.status_topic = None;
        assert!(!missing.is_complete());

        let mut missing = full.clone();
        missing.commands_topic = None;
        assert!(!missing.is_complete());

        // hardware_type is not part of the readiness decision
        let mut no_hw = full.clone();
        no_hw.hardware_type = None;
        assert!(no_hw.is_complete());

        assert!(!RuntimeConfig::waiting(Uuid::new_v4()).is_complete());
    }

    #[test]
    fn runtime_config_round_trips_through_cache() {
        let dir = TempDir::new().unwrap();
        let loader = ConfigLoader::new(
            dir.path().join("edge-agent.conf"),
            dir.path().join("edge-agent.yaml"),
        );

        let config = complete_config();
        loader.save_runtime_config(&config).unwrap();

        let loaded = loader.load_cached_runtime_config().unwrap();
        assert_eq!(loaded.uuid, config.uuid);
        assert_eq!(loaded.train_id, config.train_id);
        assert_eq!(loaded.broker, config.broker);
        assert_eq!(loaded.status_topic, config.status_topic);
        assert_eq!(loaded.commands_topic, config.commands_topic);
        assert_eq!(loaded.hardware_type, config.hardware_type);
    }

    #[test]
    fn save_creates_parent_directories_and_overwrites() {
        let dir = TempDir::new().unwrap();
        let loader = ConfigLoader::new(
            dir.path().join("edge-agent.conf"),
            dir.path().join("nested/cache/edge-agent.yaml"),
        );

        let first = RuntimeConfig::waiting(Uuid::new_v4());
        loader.save_runtime_config(&first).unwrap();

        let second = complete_config();
        loader.save_runtime_config(&second).unwrap();

        let loaded = loader.load_cached_runtime_config().unwrap();
        assert_eq!(loaded.uuid, second.uuid);
        assert!(loaded.is_complete());
    }

    #[test]
    fn missing_cache_is_none_not_an_error() {
        let dir = TempDir::new().unwrap();
        let loader = ConfigLoader::new(
            dir.path().join("edge-agent.conf"),
            dir.path().join("edge-agent.yaml"),
        );

        assert!(loader.load_cached_runtime_config().is_none());
    }

    #[test]
    fn unparsable_cache_is_none_not_an_error() {
        let dir = TempDir::new().unwrap();
        let cache_path = dir.path().join("edge-agent.yaml");
        fs::write(&cache_path, "uuid: [this is not a uuid\n").unwrap();

        let loader = ConfigLoader::new(dir.path().join("edge-agent.conf"), cache_path);
        assert!(loader.load_cached_runtime_config().is_none());
    }

    #[test]
    fn waiting_cache_round_trips_without_optional_fields() {
        let dir = TempDir::new().unwrap();
        let loader = ConfigLoader::new(
            dir.path().join("edge-agent.conf"),
            dir.path().join("edge-agent.yaml"),
        );

        let uuid = Uuid::new_v4();
        loader
            .save_runtime_config(&RuntimeConfig::waiting(uuid))
            .unwrap();

        // None fields are skipped on serialize, so the cache stays minimal
        let raw = fs::read_to_string(loader.cache_path()).unwrap();
        assert!(!raw.contains("train_id"));

        let loaded = loader.load_cached_runtime_config().unwrap();
        assert_eq!(loaded.uuid, uuid);
        assert!(!loaded.is_complete());
    }

    #[test]
    fn hardware_type_parses_snake_case_tags() {
        let config: RuntimeConfig = serde_yaml::from_str(&format!(
            "uuid: {}\nhardware_type: stepper_hat\n",
            Uuid::new_v4()
        ))
        .unwrap();
        assert_eq!(config.hardware_type, Some(HardwareType::StepperHat));

        for (tag, expected) in [
            ("dc_motor_hat", HardwareType::DcMotorHat),
            ("generic", HardwareType::Generic),
            ("simulator", HardwareType::Simulator),
        ] {
            let parsed: HardwareType = serde_yaml::from_str(tag).unwrap();
            assert_eq!(parsed, expected);
            assert_eq!(parsed.to_string(), tag);
        }
    }
}
