//! Circuit Breaker
//!
//! Guards outbound HTTP calls per endpoint, where an endpoint is the method
//! plus the full target URL. Sustained failures trip the circuit so callers
//! fail fast instead of waiting on a struggling instance; after a cooldown a
//! probe is let through to detect recovery. The short call timeout turns
//! "slow" into "failed" before it can stall the caller.

use dashmap::DashMap;
use futures::StreamExt;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

use crate::ByteStream;
use stitch_common::{Result, StitchError};

/// Circuit state for one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, calls flow through
    Closed,
    /// Tripped: calls are rejected without any I/O
    Open,
    /// Cooldown elapsed, probing whether the endpoint recovered
    HalfOpen,
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures tolerated before tripping; the circuit opens on
    /// the failure that exceeds this count.
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before admitting a probe.
    pub cooldown: Duration,
    /// Bound on each guarded call.
    pub call_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(10),
            call_timeout: Duration::from_secs(1),
        }
    }
}

/// Per-endpoint breaker record. Created lazily on first use, never removed;
/// bounded by the number of distinct endpoints, not requests.
#[derive(Debug, Clone)]
struct EndpointState {
    failures: u32,
    state: CircuitState,
    next_retry_at: Option<SystemTime>,
}

impl EndpointState {
    fn new() -> Self {
        Self {
            failures: 0,
            state: CircuitState::Closed,
            next_retry_at: None,
        }
    }
}

/// Read-only view of one endpoint's breaker record.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointSnapshot {
    pub state: CircuitState,
    pub failures: u32,
    /// Remaining cooldown, when the circuit is open and not yet due.
    pub retry_in: Option<Duration>,
}

/// What a guarded call produced.
pub enum Payload {
    /// Parsed JSON response body.
    Value(serde_json::Value),
    /// Response body bytes as they arrive from the wire.
    Stream(ByteStream),
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Payload::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Payload::Stream(_) => f.debug_tuple("Stream").finish(),
        }
    }
}

/// How the caller wants the response body delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Value,
    Stream,
}

/// The breaker table.
///
/// All methods take `&self`; endpoint records live in a sharded map, so the
/// increment-then-compare on one endpoint is serialized while unrelated
/// endpoints proceed independently.
pub struct CircuitBreaker {
    states: DashMap<String, EndpointState>,
    config: BreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        CircuitBreaker {
            states: DashMap::new(),
            config,
        }
    }

    /// Performs `method url` under the breaker.
    ///
    /// # Returns
    /// - `Ok(Payload)` - the call succeeded; the endpoint's record is reset
    /// - `Err(CircuitOpen)` - the circuit rejected the call, no I/O happened
    /// - `Err(Timeout | Transport | UpstreamStatus)` - the call was attempted
    ///   and failed; recorded against the endpoint
    ///
    /// Timeout, connection errors, non-2xx statuses, and unparsable response
    /// bodies are all uniformly failures. For `PayloadKind::Stream` the
    /// timeout bounds the connection and response headers; body bytes flow
    /// after success is recorded.
    pub async fn execute(&self, method: Method, url: &str, kind: PayloadKind) -> Result<Payload> {
        let endpoint = endpoint_identity(&method, url);

        if !self.admit(&endpoint) {
            return Err(StitchError::CircuitOpen(endpoint));
        }

        match self.attempt(method, url, kind).await {
            Ok(payload) => {
                self.record_success(&endpoint);
                Ok(payload)
            }
            Err(e) => {
                self.record_failure(&endpoint);
                Err(e)
            }
        }
    }

    /// Snapshot of one endpoint's record, if it has ever been called.
    pub fn snapshot(&self, method: &Method, url: &str) -> Option<EndpointSnapshot> {
        let endpoint = endpoint_identity(method, url);
        self.states.get(&endpoint).map(|state| EndpointSnapshot {
            state: state.state,
            failures: state.failures,
            retry_in: state
                .next_retry_at
                .and_then(|at| at.duration_since(SystemTime::now()).ok()),
        })
    }

    /// Whether a call to `endpoint` may proceed right now. An OPEN circuit
    /// whose cooldown has elapsed flips to HALF_OPEN and admits the call as
    /// the recovery probe.
    fn admit(&self, endpoint: &str) -> bool {
        let mut state = self
            .states
            .entry(endpoint.to_string())
            .or_insert_with(EndpointState::new);

        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let due = state
                    .next_retry_at
                    .map(|at| SystemTime::now() >= at)
                    .unwrap_or(true);
                if due {
                    state.state = CircuitState::HalfOpen;
                    info!(endpoint, "circuit half-open, probing");
                }
                due
            }
        }
    }

    /// A success fully resets the endpoint: CLOSED, zero failures.
    fn record_success(&self, endpoint: &str) {
        let mut state = self
            .states
            .entry(endpoint.to_string())
            .or_insert_with(EndpointState::new);

        if state.state != CircuitState::Closed {
            info!(endpoint, "circuit closed after successful probe");
        }
        *state = EndpointState::new();
    }

    /// A failure increments the consecutive count; past the threshold the
    /// circuit opens (or re-opens) with a fresh cooldown.
    fn record_failure(&self, endpoint: &str) {
        let mut state = self
            .states
            .entry(endpoint.to_string())
            .or_insert_with(EndpointState::new);

        state.failures += 1;
        if state.failures > self.config.failure_threshold {
            state.state = CircuitState::Open;
            state.next_retry_at = Some(SystemTime::now() + self.config.cooldown);
            warn!(endpoint, failures = state.failures, "circuit open");
        }
    }

    async fn attempt(&self, method: Method, url: &str, kind: PayloadKind) -> Result<Payload> {
        let request = Request::builder()
            .method(method)
            .uri(url)
            .body(Full::new(Bytes::new()))
            .map_err(|e| StitchError::Transport(format!("Failed to build request: {}", e)))?;

        let client = Client::builder(TokioExecutor::new()).build_http();
        let timeout = self.config.call_timeout;

        let response = tokio::time::timeout(timeout, client.request(request))
            .await
            .map_err(|_| StitchError::Timeout(timeout.as_millis() as u64))?
            .map_err(|e| StitchError::Transport(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(StitchError::UpstreamStatus(status.as_u16()));
        }

        match kind {
            PayloadKind::Value => {
                let body = tokio::time::timeout(timeout, response.into_body().collect())
                    .await
                    .map_err(|_| StitchError::Timeout(timeout.as_millis() as u64))?
                    .map_err(|e| StitchError::Transport(format!("Failed to read body: {}", e)))?
                    .to_bytes();
                // A 200 whose body does not parse is still a failed call; it
                // counts against the endpoint and the cache may cover it.
                let value = serde_json::from_slice(&body)
                    .map_err(|e| StitchError::Transport(format!("Invalid JSON body: {}", e)))?;
                Ok(Payload::Value(value))
            }
            PayloadKind::Stream => {
                let stream = response.into_body().into_data_stream().map(|chunk| {
                    chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
                });
                Ok(Payload::Stream(Box::pin(stream)))
            }
        }
    }
}

/// Endpoint identity: the method plus the full target URL.
fn endpoint_identity(method: &Method, url: &str) -> String {
    format!("{}:{}", method, url)
}
