//! Registry Discovery Client
//!
//! HTTP consumer of the registry service: discovery lookups plus the
//! register/unregister pair, and an announcer task that keeps a registration
//! alive by renewing it inside the expiry window.

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use semver::{Version, VersionReq};
use std::time::Duration;
use tracing::{debug, info, warn};

use stitch_common::{RegisterAck, Result, ServiceInstance, StitchError};

const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(2);

/// Client for the registry's HTTP surface.
///
/// Cheap to clone; every call builds a fresh connection, which keeps the
/// client free of connection state toward a registry that may restart at any
/// time.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    base_url: String,
    timeout: Duration,
}

impl RegistryClient {
    /// # Arguments
    /// * `base_url` - Registry root, e.g. "http://127.0.0.1:3000"
    pub fn new(base_url: impl Into<String>) -> Self {
        RegistryClient {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout: DEFAULT_DISCOVERY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Asks the registry for one live instance of `name` satisfying `range`.
    ///
    /// `Ok(None)` mirrors the registry's 404: the service currently has no
    /// matching live instance, which is routine rather than an error.
    pub async fn find(&self, name: &str, range: &VersionReq) -> Result<Option<ServiceInstance>> {
        let url = format!(
            "{}/find/{}/{}",
            self.base_url,
            urlencoding::encode(name),
            urlencoding::encode(&range.to_string())
        );

        let (status, body) = self.send(Method::GET, &url).await?;
        match status {
            s if s.is_success() => Ok(Some(serde_json::from_slice(&body)?)),
            StatusCode::NOT_FOUND => Ok(None),
            s => Err(StitchError::Transport(format!(
                "Registry find failed with status {}",
                s
            ))),
        }
    }

    /// Registers (or renews) this process as an instance of `name`. The
    /// registry derives the host from the connection's peer address.
    ///
    /// # Returns
    /// Whether an existing registration was renewed.
    pub async fn register(&self, name: &str, version: &Version, port: u16) -> Result<bool> {
        let url = format!(
            "{}/register/{}/{}/{}",
            self.base_url,
            urlencoding::encode(name),
            version,
            port
        );

        let (status, body) = self.send(Method::PUT, &url).await?;
        if !status.is_success() {
            return Err(StitchError::Transport(format!(
                "Registry register failed with status {}",
                status
            )));
        }
        let ack: RegisterAck = serde_json::from_slice(&body)?;
        Ok(ack.renewed)
    }

    /// Withdraws this process's registration.
    pub async fn unregister(&self, name: &str, version: &Version, port: u16) -> Result<()> {
        let url = format!(
            "{}/register/{}/{}/{}",
            self.base_url,
            urlencoding::encode(name),
            version,
            port
        );

        let (status, _) = self.send(Method::DELETE, &url).await?;
        if !status.is_success() {
            return Err(StitchError::Transport(format!(
                "Registry unregister failed with status {}",
                status
            )));
        }
        Ok(())
    }

    async fn send(&self, method: Method, url: &str) -> Result<(StatusCode, Bytes)> {
        let request = Request::builder()
            .method(method)
            .uri(url)
            .body(Full::new(Bytes::new()))
            .map_err(|e| StitchError::Transport(format!("Failed to build request: {}", e)))?;

        let client = Client::builder(TokioExecutor::new()).build_http();
        let response = tokio::time::timeout(self.timeout, client.request(request))
            .await
            .map_err(|_| StitchError::Timeout(self.timeout.as_millis() as u64))?
            .map_err(|e| StitchError::Transport(format!("Registry request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| {
                StitchError::Transport(format!("Failed to read registry response: {}", e))
            })?
            .to_bytes();
        Ok((status, body))
    }
}

/// What an [`Announcer`] keeps registered.
#[derive(Debug, Clone)]
pub struct AnnounceConfig {
    pub name: String,
    pub version: Version,
    pub port: u16,
    /// Renewal cadence. Must stay under the registry's expiry timeout or the
    /// instance flaps in and out of discovery.
    pub interval: Duration,
}

impl AnnounceConfig {
    pub fn new(name: impl Into<String>, version: Version, port: u16) -> Self {
        AnnounceConfig {
            name: name.into(),
            version,
            port,
            interval: Duration::from_secs(20),
        }
    }
}

/// Heartbeat task: re-registers one instance on a fixed interval, starting
/// immediately. A failed renewal is logged and retried on the next tick;
/// the registry forgives gaps shorter than its timeout.
#[derive(Debug, Clone)]
pub struct Announcer {
    registry: RegistryClient,
    config: AnnounceConfig,
}

impl Announcer {
    pub fn new(registry: RegistryClient, config: AnnounceConfig) -> Self {
        Announcer { registry, config }
    }

    /// Starts the renewal task.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(self) {
        let mut interval = tokio::time::interval(self.config.interval);
        loop {
            interval.tick().await;
            match self
                .registry
                .register(&self.config.name, &self.config.version, self.config.port)
                .await
            {
                Ok(true) => debug!(service = %self.config.name, "registration renewed"),
                Ok(false) => info!(
                    service = %self.config.name,
                    version = %self.config.version,
                    port = self.config.port,
                    "registered with registry"
                ),
                Err(e) => warn!(service = %self.config.name, error = %e, "announce failed"),
            }
        }
    }

    /// One-shot withdrawal, for shutdown paths.
    pub async fn withdraw(&self) -> Result<()> {
        self.registry
            .unregister(&self.config.name, &self.config.version, self.config.port)
            .await
    }
}
