//! # traind
//!
//! Edge agent daemon for a distributed model-train control platform.
//!
//! Each agent runs on a device physically wired to one train. On startup
//! it registers with the central control plane, downloads (and caches) its
//! runtime configuration, then connects to the assigned MQTT broker to
//! receive commands and publish status.
//!
//! ## Architecture
//!
//! - [`config_manager::ConfigManager`] — resolves the runtime config:
//!   register, download, cache, offline fallback
//! - [`transport`] — MQTT command subscription and status publishing,
//!   QoS 0 both ways
//! - [`hardware`] — pluggable actuation backends behind the
//!   [`hardware::HardwareController`] trait
//! - [`agent::EdgeAgent`] — orchestration: waiting-state polling, command
//!   dispatch, heartbeat, graceful shutdown
//!
//! ## Example
//!
//! ```no_run
//! use std::{path::PathBuf, sync::Arc};
//! use traind::{
//!     agent::{BrokerOverride, EdgeAgent},
//!     config::ConfigLoader,
//!     config_manager::ConfigManager,
//!     registration::{DeviceIdentity, RegistrationClient},
//!     retry::TokioSleeper,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let loader = ConfigLoader::new(
//!         PathBuf::from("/etc/traind/config.yaml"),
//!         PathBuf::from("/var/lib/traind/runtime.yaml"),
//!     );
//!     let service = loader.load_service_config()?;
//!     let client = RegistrationClient::new(&service)?;
//!     let manager = ConfigManager::new(client, loader, DeviceIdentity::detect());
//!     let agent = EdgeAgent::new(manager, Arc::new(TokioSleeper), false, BrokerOverride::default());
//!     agent.run(CancellationToken::new()).await
//! }
//! ```

pub mod agent;
pub mod cli;
pub mod command;
pub mod config;
pub mod config_manager;
pub mod hardware;
pub mod registration;
pub mod retry;
pub mod task_manager;
pub mod transport;
