//! HTTP client for the central control plane.
//!
//! The control plane is the authoritative source for device identity and
//! runtime configuration. This module consumes three endpoints:
//!
//! - `GET /health` — reachability probe, retried per [`BackoffPolicy`]
//! - `POST /register {name, address}` — uuid assignment, idempotent
//!   server-side (the same physical device always receives the same uuid)
//! - `GET /controllers/{uuid}/config` — runtime config download, where 404
//!   means "registered but unassigned", a normal state
//!
//! Everything here is startup-path only; once the agent enters its main
//! loop no HTTP is involved.

use std::net::UdpSocket;

use async_trait::async_trait;
use log::{info, warn};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    config::{Assignment, ServiceConfig},
    retry::{BackoffPolicy, Sleeper, TokioSleeper},
};

/// Raised when registration fails. An agent with no uuid and no cache
/// cannot proceed, so callers treat this as fatal.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("registration request failed")]
    Request(#[source] reqwest::Error),

    #[error("registration rejected with HTTP {0}")]
    Status(StatusCode),

    #[error("invalid registration response")]
    InvalidBody(#[source] reqwest::Error),

    #[error("registration response missing uuid")]
    MissingUuid,
}

/// Name and network address reported during registration so an operator can
/// identify the physical device in the control-plane inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub name: String,
    pub address: String,
}

impl DeviceIdentity {
    /// Best-effort detection: hostname from the environment or
    /// `/etc/hostname`, local address from a routed (never-sent) UDP probe.
    /// Either falls back to `"unknown"` rather than failing registration.
    pub fn detect() -> Self {
        let name = std::env::var("HOSTNAME")
            .ok()
            .filter(|name| !name.is_empty())
            .or_else(|| {
                std::fs::read_to_string("/etc/hostname")
                    .ok()
                    .map(|raw| raw.trim().to_string())
                    .filter(|name| !name.is_empty())
            })
            .unwrap_or_else(|| "unknown".to_string());

        let address = UdpSocket::bind("0.0.0.0:0")
            .and_then(|socket| {
                socket.connect("8.8.8.8:53")?;
                socket.local_addr()
            })
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        Self { name, address }
    }
}

/// Interface to the control plane, kept as a trait so the configuration
/// state machine can be exercised against an in-memory implementation.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Probes reachability with bounded retry. Never errors; exhaustion of
    /// the retry budget yields `false`.
    async fn check_health(&self) -> bool;

    /// Registers this device and returns its assigned uuid. Single attempt.
    async fn register(&self, identity: &DeviceIdentity) -> Result<Uuid, RegistrationError>;

    /// Downloads the runtime assignment for a registered device.
    ///
    /// `None` covers both "registered but unassigned" (404) and transport
    /// or server failures; the two are distinguished in the logs only.
    async fn download_runtime_config(&self, uuid: Uuid) -> Option<Assignment>;
}

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    uuid: Option<Uuid>,
    #[serde(default)]
    status: Option<String>,
}

/// reqwest-backed [`ControlPlane`] client.
pub struct RegistrationClient<S = TokioSleeper> {
    http: reqwest::Client,
    base_url: String,
    backoff: BackoffPolicy,
    sleeper: S,
}

impl RegistrationClient<TokioSleeper> {
    /// Default per-request timeout for control-plane calls.
    pub const HTTP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

    pub fn new(service: &ServiceConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Self::HTTP_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            base_url: service.control_plane_url(),
            backoff: BackoffPolicy::default(),
            sleeper: TokioSleeper,
        })
    }
}

impl<S: Sleeper> RegistrationClient<S> {
    /// Replaces the sleeper, keeping everything else. Used by tests to run
    /// the retry budget without wall-clock delays.
    pub fn with_sleeper<T: Sleeper>(self, sleeper: T) -> RegistrationClient<T> {
        RegistrationClient {
            http: self.http,
            base_url: self.base_url,
            backoff: self.backoff,
            sleeper,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn probe_health_once(&self) -> Result<StatusCode, reqwest::Error> {
        let url = format!("{}/health", self.base_url);
        Ok(self.http.get(url).send().await?.status())
    }
}

#[async_trait]
impl<S: Sleeper> ControlPlane for RegistrationClient<S> {
    async fn check_health(&self) -> bool {
        for attempt in 1..=self.backoff.max_attempts {
            match self.probe_health_once().await {
                Ok(StatusCode::OK) => {
                    info!("Control plane is reachable");
                    return true;
                }
                Ok(status) => warn!(
                    "Control plane health probe returned {status} \
                     (attempt {attempt}/{})",
                    self.backoff.max_attempts
                ),
                Err(e) => warn!(
                    "Control plane not reachable (attempt {attempt}/{}): {e}",
                    self.backoff.max_attempts
                ),
            }

            if let Some(delay) = self.backoff.delay_after(attempt) {
                self.sleeper.sleep(delay).await;
            }
        }

        false
    }

    async fn register(&self, identity: &DeviceIdentity) -> Result<Uuid, RegistrationError> {
        let url = format!("{}/register", self.base_url);
        let payload = serde_json::json!({
            "name": identity.name,
            "address": identity.address,
        });

        let response = self
            .http
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(RegistrationError::Request)?;

        let status = response.status();
        if !status.is_success() {
            return Err(RegistrationError::Status(status));
        }

        let body: RegisterResponse = response
            .json()
            .await
            .map_err(RegistrationError::InvalidBody)?;

        let uuid = body.uuid.ok_or(RegistrationError::MissingUuid)?;
        info!(
            "Registered device name={} address={} uuid={uuid} status={}",
            identity.name,
            identity.address,
            body.status.as_deref().unwrap_or("unknown")
        );
        Ok(uuid)
    }

    async fn download_runtime_config(&self, uuid: Uuid) -> Option<Assignment> {
        let url = format!("{}/controllers/{uuid}/config", self.base_url);

        let response = match self.http.get(url).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("Failed to download runtime config for {uuid}: {e}");
                return None;
            }
        };

        match response.status() {
            StatusCode::NOT_FOUND => {
                // Registered but no train assigned yet: a normal state.
                info!("No runtime config assigned to {uuid} yet");
                None
            }
            status if !status.is_success() => {
                warn!("Runtime config download for {uuid} returned {status}");
                None
            }
            _ => match response.json::<Assignment>().await {
                Ok(assignment) => {
                    info!("Downloaded runtime config for {uuid}");
                    Some(assignment)
                }
                Err(e) => {
                    warn!("Invalid runtime config payload for {uuid}: {e}");
                    None
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::testing::RecordingSleeper;
    use pretty_assertions::assert_eq;
    use std::{sync::Arc, time::Duration};

    fn service_config(host: &str, port: u16) -> ServiceConfig {
        ServiceConfig {
            control_plane_host: host.to_string(),
            control_plane_port: port,
            log_level: "info".to_string(),
        }
    }

    // Port 9 on localhost is almost certainly closed; connections are
    // refused immediately, so these tests exercise the failure paths
    // without waiting on timeouts.
    fn unreachable_client() -> RegistrationClient {
        RegistrationClient::new(&service_config("127.0.0.1", 9)).unwrap()
    }

    #[test]
    fn base_url_comes_from_service_config() {
        let client = RegistrationClient::new(&service_config("api.local", 8000)).unwrap();
        assert_eq!(client.base_url(), "http://api.local:8000");
    }

    #[test]
    fn register_response_parses_uuid_and_status() {
        let uuid = Uuid::new_v4();
        let body: RegisterResponse =
            serde_json::from_str(&format!(r#"{{"uuid":"{uuid}","status":"registered"}}"#)).unwrap();

        assert_eq!(body.uuid, Some(uuid));
        assert_eq!(body.status.as_deref(), Some("registered"));

        let missing: RegisterResponse = serde_json::from_str(r#"{"status":"error"}"#).unwrap();
        assert_eq!(missing.uuid, None);
    }

    #[test]
    fn device_identity_detect_never_fails() {
        let identity = DeviceIdentity::detect();
        assert!(!identity.name.is_empty());
        assert!(!identity.address.is_empty());
    }

    #[tokio::test]
    async fn check_health_exhausts_linear_backoff_budget() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let client = unreachable_client()
            .with_backoff(BackoffPolicy::new(4, Duration::from_secs(2)))
            .with_sleeper(Arc::clone(&sleeper));

        assert!(!client.check_health().await);

        // Three sleeps between four attempts, linearly increasing.
        let slept = sleeper.slept.lock().unwrap().clone();
        assert_eq!(
            slept,
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(6),
            ]
        );
    }

    #[tokio::test]
    async fn register_surfaces_request_failure() {
        let client = unreachable_client().with_backoff(BackoffPolicy::new(1, Duration::ZERO));

        let identity = DeviceIdentity {
            name: "edge-01".to_string(),
            address: "10.0.0.5".to_string(),
        };
        let err = client.register(&identity).await.unwrap_err();
        assert!(matches!(err, RegistrationError::Request(_)));
    }

    #[tokio::test]
    async fn download_failure_yields_none() {
        let client = unreachable_client().with_backoff(BackoffPolicy::new(1, Duration::ZERO));
        assert!(client.download_runtime_config(Uuid::new_v4()).await.is_none());
    }

    // Arc<S> forwarding so tests can observe a shared sleeper.
    #[async_trait]
    impl<S: Sleeper> Sleeper for Arc<S> {
        async fn sleep(&self, duration: Duration) {
            self.as_ref().sleep(duration).await;
        }
    }
}
