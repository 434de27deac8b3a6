//! HTTP Surface for the Registry
//!
//! This module exposes the registry table over HTTP using axum. Services
//! announce themselves with PUT, withdraw with DELETE, and callers discover
//! instances with GET. The instance host is taken from the connection's peer
//! address, so a service never has to know its own routable IP.

use axum::{
    extract::{ConnectInfo, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, put},
    Json,
};
use semver::{Version, VersionReq};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::registry::Registry;
use stitch_common::{ErrorBody, RegisterAck, RegistryInfo, Result, StitchError};

/// HTTP server wrapping a [`Registry`].
///
/// Routes:
/// - `PUT /register/{name}/{version}/{port}` - register or renew an instance
/// - `DELETE /register/{name}/{version}/{port}` - unregister an instance
/// - `GET /find/{name}/{range}` - discover one live instance (range is a
///   percent-encoded semver requirement such as `^1.2.0`)
/// - `GET /info` - uptime and live instance counts
/// - `GET /__health` - health check
pub struct RegistryServer {
    registry: Arc<Registry>,
    started_at: Instant,
}

#[derive(Clone)]
struct AppState {
    registry: Arc<Registry>,
    started_at: Instant,
}

impl RegistryServer {
    /// Creates a new server over an existing registry table.
    pub fn new(registry: Arc<Registry>) -> Self {
        RegistryServer {
            registry,
            started_at: Instant::now(),
        }
    }

    /// Builds the axum router. Exposed so tests can serve it on an ephemeral
    /// listener.
    pub fn router(&self) -> axum::Router {
        let state = AppState {
            registry: self.registry.clone(),
            started_at: self.started_at,
        };

        axum::Router::new()
            .route(
                "/register/{name}/{version}/{port}",
                put(handle_register).delete(handle_unregister),
            )
            .route("/find/{name}/{range}", get(handle_find))
            .route("/info", get(handle_info))
            .route("/__health", get(health_check))
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Runs the server until the process exits.
    ///
    /// # Arguments
    /// * `addr` - Socket address to bind to (e.g. "0.0.0.0:3000")
    ///
    /// # Behavior
    /// - Binds to the specified address and logs the listening address
    /// - Serves with peer-address info attached, so handlers can record the
    ///   registrant's host
    pub async fn run(self, addr: SocketAddr) -> Result<()> {
        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| StitchError::Transport(format!("Failed to bind to {}: {}", addr, e)))?;

        info!(
            "Registry listening on {}",
            listener
                .local_addr()
                .map_err(|e| StitchError::Transport(format!("Failed to get local addr: {}", e)))?
        );

        axum::serve(listener, app)
            .await
            .map_err(|e| StitchError::Transport(format!("Server error: {}", e)))?;

        Ok(())
    }
}

/// The registrant's host as stored in the table. V4-mapped V6 peers collapse
/// to plain V4; real V6 addresses are bracketed so `http://host:port` URLs
/// compose.
fn canonical_host(peer: SocketAddr) -> String {
    match peer.ip().to_canonical() {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{}]", v6),
    }
}

type HandlerError = (StatusCode, Json<ErrorBody>);

fn bad_request(message: String) -> HandlerError {
    (StatusCode::BAD_REQUEST, Json(ErrorBody::new(message)))
}

async fn handle_register(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path((name, version, port)): Path<(String, String, u16)>,
) -> std::result::Result<Json<RegisterAck>, HandlerError> {
    let version: Version = version
        .parse()
        .map_err(|e| bad_request(format!("Invalid version '{}': {}", version, e)))?;

    let host = canonical_host(peer);
    let (key, renewed) = state.registry.register(&name, version, &host, port);

    Ok(Json(RegisterAck {
        key: key.to_string(),
        renewed,
    }))
}

async fn handle_unregister(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path((name, version, port)): Path<(String, String, u16)>,
) -> std::result::Result<Json<RegisterAck>, HandlerError> {
    let version: Version = version
        .parse()
        .map_err(|e| bad_request(format!("Invalid version '{}': {}", version, e)))?;

    let host = canonical_host(peer);
    let key = state.registry.unregister(&name, version, &host, port);

    Ok(Json(RegisterAck {
        key: key.to_string(),
        renewed: false,
    }))
}

async fn handle_find(
    State(state): State<AppState>,
    Path((name, range)): Path<(String, String)>,
) -> axum::response::Response {
    let range: VersionReq = match range.parse() {
        Ok(r) => r,
        Err(e) => {
            return bad_request(format!("Invalid version range '{}': {}", range, e)).into_response()
        }
    };

    match state.registry.lookup(&name, &range) {
        Some(instance) => Json(instance).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorBody::new(format!(
                "No live instance of '{}' matching '{}'",
                name, range
            ))),
        )
            .into_response(),
    }
}

async fn handle_info(State(state): State<AppState>) -> Json<RegistryInfo> {
    let (total_instances, services) = state.registry.summary();

    Json(RegistryInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_ms: state.started_at.elapsed().as_millis() as u64,
        total_instances,
        services,
    })
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
