//! Configuration lifecycle state machine.
//!
//! On startup the agent walks `INIT → API_CHECK → {REGISTER | REFRESH} →
//! {READY | WAITING}`, falling back to the local cache when the control
//! plane is unreachable and failing only when neither source yields a
//! config. Every config freshly downloaded from the control plane is
//! persisted, complete or not, so the uuid survives reboots and the last
//! known assignment survives outages.
//!
//! The manager is generic over [`ControlPlane`] so the whole machine is
//! unit-testable against an in-memory control plane.

use log::{info, warn};
use thiserror::Error;

use crate::{
    config::{ConfigLoader, RuntimeConfig},
    registration::{ControlPlane, DeviceIdentity, RegistrationError},
};

/// Outcome of configuration initialization. Both variants carry a valid
/// runtime config; only `Ready` has enough of it to drive a train.
#[derive(Debug, Clone)]
pub enum RuntimeState {
    /// Train assignment, broker, and topics all present.
    Ready(RuntimeConfig),

    /// Registered, but waiting for an administrator to assign a train.
    Waiting(RuntimeConfig),
}

impl RuntimeState {
    fn from_config(config: RuntimeConfig) -> Self {
        if config.is_complete() {
            Self::Ready(config)
        } else {
            Self::Waiting(config)
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        match self {
            Self::Ready(config) | Self::Waiting(config) => config,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }
}

/// Raised when no runtime configuration can be obtained at all. The agent
/// cannot do anything useful without one, so this is fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("control plane unreachable and no cached runtime config")]
    Unreachable,

    #[error("device registration failed")]
    Registration(#[from] RegistrationError),
}

/// Drives the startup state machine and the waiting-state refresh.
pub struct ConfigManager<C> {
    control_plane: C,
    loader: ConfigLoader,
    identity: DeviceIdentity,
}

impl<C: ControlPlane> ConfigManager<C> {
    pub fn new(control_plane: C, loader: ConfigLoader, identity: DeviceIdentity) -> Self {
        Self {
            control_plane,
            loader,
            identity,
        }
    }

    /// Resolves the runtime configuration.
    ///
    /// Online: reuse the cached uuid or register for a new one, then
    /// download the current assignment. Offline: fall back to the cache.
    /// Errors only when registration fails or when neither the network nor
    /// the cache can produce a config.
    pub async fn initialize(&self) -> Result<RuntimeState, ConfigurationError> {
        let cached = self.loader.load_cached_runtime_config();

        if !self.control_plane.check_health().await {
            return match cached {
                Some(config) => {
                    warn!(
                        "Control plane unreachable, using cached runtime config for {}",
                        config.uuid
                    );
                    Ok(RuntimeState::from_config(config))
                }
                None => Err(ConfigurationError::Unreachable),
            };
        }

        let uuid = match &cached {
            Some(config) => {
                info!("Using cached device uuid {}", config.uuid);
                config.uuid
            }
            None => self.control_plane.register(&self.identity).await?,
        };

        // The control plane is authoritative while reachable: an empty
        // download means "registered, unassigned" and supersedes whatever
        // the cache held.
        let config = match self.control_plane.download_runtime_config(uuid).await {
            Some(assignment) => RuntimeConfig::from_assignment(uuid, assignment),
            None => RuntimeConfig::waiting(uuid),
        };
        self.persist(&config);

        Ok(RuntimeState::from_config(config))
    }

    /// Re-downloads the assignment for an already-registered device. Used
    /// by the waiting-state poll loop; a failed or empty download keeps the
    /// current config unchanged.
    pub async fn refresh(&self, current: &RuntimeConfig) -> RuntimeState {
        match self.control_plane.download_runtime_config(current.uuid).await {
            Some(assignment) => {
                let config = RuntimeConfig::from_assignment(current.uuid, assignment);
                self.persist(&config);
                RuntimeState::from_config(config)
            }
            None => RuntimeState::from_config(current.clone()),
        }
    }

    /// The cache is an optimization for offline starts; failing to write it
    /// must not take the agent down.
    fn persist(&self, config: &RuntimeConfig) {
        if let Err(e) = self.loader.save_runtime_config(config) {
            warn!("Failed to persist runtime config: {e}");
        }
    }
}
