//! Edge agent orchestration.
//!
//! Ties the pieces together: resolve configuration, wait out an
//! unassigned state, build the hardware backend and MQTT transport, then
//! dispatch commands until shutdown. Every successful or failed dispatch
//! is followed by an immediate status publish, and a 1 Hz heartbeat keeps
//! the status topic fresh in between.

use std::{
    sync::{Arc, Mutex, atomic::AtomicBool, atomic::Ordering},
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::{
    command::{Command, DEFAULT_START_SPEED, StatusReport},
    config_manager::{ConfigManager, RuntimeState},
    hardware::{HardwareController, build_controller},
    registration::ControlPlane,
    retry::Sleeper,
    task_manager::TaskManager,
    transport::{self, CommandHandler, TransportClient},
};

/// How often an unassigned agent re-asks the control plane for a config.
pub const WAITING_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Heartbeat period for the status topic.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Where status samples go. [`TransportClient`] is the production sink;
/// tests substitute a recorder.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn publish(&self, report: &StatusReport);
}

#[async_trait]
impl StatusSink for TransportClient {
    async fn publish(&self, report: &StatusReport) {
        self.publish_status(report).await;
    }
}

/// Maps inbound commands onto hardware calls and keeps the shared status
/// sample current.
pub struct CommandDispatcher {
    hardware: Arc<dyn HardwareController>,
    sink: Arc<dyn StatusSink>,
    status: Mutex<StatusReport>,
}

impl CommandDispatcher {
    pub fn new(
        hardware: Arc<dyn HardwareController>,
        sink: Arc<dyn StatusSink>,
        train_id: &str,
    ) -> Self {
        Self {
            hardware,
            sink,
            status: Mutex::new(StatusReport::new(train_id)),
        }
    }

    fn snapshot(&self) -> StatusReport {
        self.status.lock().expect("status lock poisoned").clone()
    }

    fn update<F: FnOnce(&mut StatusReport)>(&self, apply: F) {
        let mut status = self.status.lock().expect("status lock poisoned");
        apply(&mut status);
        status.touch();
    }

    async fn publish_current(&self) {
        let report = self.snapshot();
        self.sink.publish(&report).await;
    }
}

#[async_trait]
impl CommandHandler for CommandDispatcher {
    async fn handle(&self, command: Command) {
        let outcome = match command {
            Command::Start { speed } => {
                let speed = speed.unwrap_or(DEFAULT_START_SPEED);
                let result = self.hardware.start(speed).await;
                if result.is_ok() {
                    self.update(|status| {
                        status.speed = speed;
                        status.position = "started".to_string();
                        // A deliberate restart ends the emergency.
                        status.emergency = false;
                        status.error = None;
                    });
                }
                result
            }
            Command::Stop => {
                let result = self.hardware.stop().await;
                if result.is_ok() {
                    self.update(|status| {
                        status.speed = 0;
                        status.position = "stopped".to_string();
                        status.error = None;
                    });
                }
                result
            }
            Command::SetSpeed { speed } => {
                let result = self.hardware.set_speed(speed).await;
                if result.is_ok() {
                    self.update(|status| {
                        status.speed = speed;
                        status.error = None;
                    });
                }
                result
            }
            Command::EmergencyStop => {
                let result = self.hardware.stop().await;
                if result.is_ok() {
                    self.update(|status| {
                        status.speed = 0;
                        status.position = "stopped".to_string();
                        status.emergency = true;
                        status.error = None;
                    });
                }
                result
            }
        };

        if let Err(e) = outcome {
            error!("Hardware rejected {command:?}: {e:#}");
            self.update(|status| status.error = Some(format!("{e:#}")));
        }

        // Controllers see the effect of their command without waiting for
        // the next heartbeat.
        self.publish_current().await;
    }

    async fn current_status(&self) -> StatusReport {
        self.snapshot()
    }
}

/// Runs hardware cleanup exactly once, whichever shutdown path gets there
/// first.
pub struct HardwareCleanup {
    hardware: Arc<dyn HardwareController>,
    done: AtomicBool,
}

impl HardwareCleanup {
    pub fn new(hardware: Arc<dyn HardwareController>) -> Self {
        Self {
            hardware,
            done: AtomicBool::new(false),
        }
    }

    pub async fn run(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.hardware.cleanup().await {
            warn!("Hardware cleanup failed: {e:#}");
        }
    }
}

/// Command-line overrides for the assigned broker, for pointing a device
/// at a test broker without touching its assignment.
#[derive(Debug, Clone, Default)]
pub struct BrokerOverride {
    pub host: Option<String>,
    pub port: Option<u16>,
}

impl BrokerOverride {
    fn apply(&self, broker: &mut crate::config::BrokerConfig) {
        if let Some(host) = &self.host {
            info!("Broker host overridden to {host}");
            broker.host = host.clone();
        }
        if let Some(port) = self.port {
            info!("Broker port overridden to {port}");
            broker.port = port;
        }
    }
}

/// The edge agent runtime.
pub struct EdgeAgent<C> {
    manager: ConfigManager<C>,
    sleeper: Arc<dyn Sleeper>,
    force_simulator: bool,
    broker_override: BrokerOverride,
}

impl<C: ControlPlane> EdgeAgent<C> {
    pub fn new(
        manager: ConfigManager<C>,
        sleeper: Arc<dyn Sleeper>,
        force_simulator: bool,
        broker_override: BrokerOverride,
    ) -> Self {
        Self {
            manager,
            sleeper,
            force_simulator,
            broker_override,
        }
    }

    /// Runs the agent until `shutdown` fires. Returns early with an error
    /// only when no configuration can be obtained at all or the hardware
    /// backend cannot be built.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let state = self.manager.initialize().await?;

        let Some(config) = self.wait_until_ready(state, &shutdown).await else {
            info!("Shutdown requested before a train was assigned");
            return Ok(());
        };

        info!(
            "Configured: train {} on device {}",
            config.train_id.as_deref().unwrap_or("?"),
            config.uuid
        );

        let hardware = build_controller(config.hardware_type, self.force_simulator)?;
        let cleanup = HardwareCleanup::new(Arc::clone(&hardware));

        let mut broker = config.broker.clone().context("runtime config missing broker")?;
        self.broker_override.apply(&mut broker);
        let status_topic = config
            .status_topic
            .clone()
            .context("runtime config missing status topic")?;
        let commands_topic = config
            .commands_topic
            .clone()
            .context("runtime config missing commands topic")?;
        let train_id = config.train_id.clone().context("runtime config missing train id")?;

        let (client, worker) = transport::connect(&broker, config.uuid, status_topic, commands_topic);
        let client = Arc::new(client);
        let dispatcher = Arc::new(CommandDispatcher::new(
            Arc::clone(&hardware),
            client.clone() as Arc<dyn StatusSink>,
            &train_id,
        ));

        let mut tasks = TaskManager::new();

        let handler: Arc<dyn CommandHandler> = dispatcher.clone();
        tasks.spawn("transport", move |token| async move {
            worker.run(handler, token).await;
            Ok(())
        });

        let heartbeat_dispatcher = dispatcher.clone();
        tasks.spawn("heartbeat", move |token| async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        heartbeat_dispatcher.update(|_| {});
                        heartbeat_dispatcher.publish_current().await;
                    }
                }
            }
            Ok(())
        });

        shutdown.cancelled().await;
        info!("Shutting down");

        if let Err(e) = tasks.shutdown().await {
            error!("Background tasks did not stop cleanly: {e:#}");
        }
        cleanup.run().await;
        Ok(())
    }

    /// Polls the control plane until the device has a complete assignment,
    /// or `shutdown` fires.
    async fn wait_until_ready(
        &self,
        mut state: RuntimeState,
        shutdown: &CancellationToken,
    ) -> Option<crate::config::RuntimeConfig> {
        loop {
            let config = match state {
                RuntimeState::Ready(config) => return Some(config),
                RuntimeState::Waiting(config) => config,
            };

            info!(
                "Device {} registered but no train assigned; polling again in {}s",
                config.uuid,
                WAITING_POLL_INTERVAL.as_secs()
            );

            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = self.sleeper.sleep(WAITING_POLL_INTERVAL) => {}
            }

            state = self.manager.refresh(&config).await;
        }
    }
}
