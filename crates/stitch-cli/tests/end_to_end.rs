//! End-to-End Mesh Tests
//!
//! Drives the whole substrate together: a registry over HTTP, two mock
//! service instances announcing to it, and a resilient client discovering
//! and calling them. Covers the register/lookup/unregister lifecycle, load
//! distribution across equally-eligible instances, and degradation when
//! every instance is gone.

use axum::routing::get;
use axum::Json;
use semver::{Version, VersionReq};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use stitch_client::{Payload, RegistryClient, ReplyOrigin, ServiceClient};
use stitch_registry::{Registry, RegistryConfig, RegistryServer};

fn v(s: &str) -> Version {
    s.parse().unwrap()
}

fn range(s: &str) -> VersionReq {
    s.parse().unwrap()
}

// ============================================================================
// Registry Lifecycle (typed API)
// ============================================================================

/// The canonical lifecycle scenario: two instances of one service, a burst of
/// lookups that must reach both, then unregistration narrowing the pool.
#[test]
fn test_register_lookup_unregister_lifecycle() {
    let registry = Registry::new(RegistryConfig::default());
    registry.register("speakers-service", v("1.0.0"), "host1", 9001);
    registry.register("speakers-service", v("1.0.0"), "host2", 9002);

    let mut seen = HashMap::new();
    for _ in 0..100 {
        let instance = registry
            .lookup("speakers-service", &range("^1.0.0"))
            .expect("two instances are live");
        *seen.entry(instance.host).or_insert(0u32) += 1;
    }
    assert!(seen.contains_key("host1"), "A never selected: {:?}", seen);
    assert!(seen.contains_key("host2"), "B never selected: {:?}", seen);

    registry.unregister("speakers-service", v("1.0.0"), "host1", 9001);
    for _ in 0..20 {
        let instance = registry
            .lookup("speakers-service", &range("^1.0.0"))
            .expect("B is still live");
        assert_eq!(instance.host, "host2");
        assert_eq!(instance.port, 9002);
    }
}

/// Selection among equally-eligible instances is uniform. Statistical with
/// loose bounds: 400 draws over two instances, each expected near 200, and a
/// band of 120-280 keeps the false-failure odds negligible.
#[test]
fn test_selection_is_roughly_uniform() {
    let registry = Registry::new(RegistryConfig::default());
    registry.register("svc", v("1.0.0"), "host1", 9001);
    registry.register("svc", v("1.0.0"), "host2", 9002);

    let mut counts = HashMap::new();
    for _ in 0..400 {
        let instance = registry.lookup("svc", &range("*")).unwrap();
        *counts.entry(instance.host).or_insert(0u32) += 1;
    }

    for (host, count) in &counts {
        assert!(
            (120..=280).contains(count),
            "selection skewed: {} chosen {} of 400",
            host,
            count
        );
    }
}

// ============================================================================
// Full HTTP Mesh
// ============================================================================

struct Mesh {
    registry_addr: SocketAddr,
    _registry_handle: tokio::task::JoinHandle<()>,
}

impl Mesh {
    async fn spawn() -> Self {
        let registry = Arc::new(Registry::new(RegistryConfig::default()));
        let app = RegistryServer::new(registry)
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind registry listener");
        let registry_addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Mesh {
            registry_addr,
            _registry_handle: handle,
        }
    }

    fn registry_client(&self) -> RegistryClient {
        RegistryClient::new(format!("http://{}", self.registry_addr))
    }

    /// Spawns a mock instance whose `/whoami` reports `label`, registered as
    /// `speakers` at the given version.
    async fn spawn_instance(
        &self,
        label: &'static str,
        version: &str,
    ) -> (u16, tokio::task::JoinHandle<()>) {
        let app = axum::Router::new().route(
            "/whoami",
            get(move || async move { Json(json!({ "instance": label })) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind instance listener");
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        self.registry_client()
            .register("speakers", &v(version), port)
            .await
            .expect("instance registration failed");
        (port, handle)
    }
}

fn reply_value(payload: Payload) -> Value {
    match payload {
        Payload::Value(value) => value,
        Payload::Stream(_) => panic!("expected a value payload"),
    }
}

#[tokio::test]
async fn test_mesh_calls_reach_both_instances() {
    let mesh = Mesh::spawn().await;
    mesh.spawn_instance("a", "1.0.0").await;
    mesh.spawn_instance("b", "1.0.0").await;

    let client = ServiceClient::new(mesh.registry_client(), "speakers", range("^1.0.0"));

    let mut seen = HashMap::new();
    for _ in 0..40 {
        let reply = client.get("/whoami").await.unwrap();
        assert_eq!(reply.origin, ReplyOrigin::Live);
        let who = reply_value(reply.payload)["instance"]
            .as_str()
            .unwrap()
            .to_string();
        *seen.entry(who).or_insert(0u32) += 1;
    }
    assert!(seen.contains_key("a"), "instance a never called: {:?}", seen);
    assert!(seen.contains_key("b"), "instance b never called: {:?}", seen);
}

#[tokio::test]
async fn test_mesh_unregister_narrows_routing() {
    let mesh = Mesh::spawn().await;
    let (port_a, _handle_a) = mesh.spawn_instance("a", "1.0.0").await;
    mesh.spawn_instance("b", "1.0.0").await;

    let registry_client = mesh.registry_client();
    registry_client
        .unregister("speakers", &v("1.0.0"), port_a)
        .await
        .unwrap();

    let client = ServiceClient::new(registry_client, "speakers", range("^1.0.0"));
    for _ in 0..10 {
        let reply = client.get("/whoami").await.unwrap();
        assert_eq!(reply_value(reply.payload)["instance"], "b");
    }
}

#[tokio::test]
async fn test_mesh_version_range_routes_to_satisfying_instance() {
    let mesh = Mesh::spawn().await;
    mesh.spawn_instance("old", "1.2.5").await;
    mesh.spawn_instance("new", "2.0.0").await;

    // ^1.2.0 admits 1.2.5 and rejects 2.0.0.
    let client = ServiceClient::new(mesh.registry_client(), "speakers", range("^1.2.0"));
    for _ in 0..10 {
        let reply = client.get("/whoami").await.unwrap();
        assert_eq!(reply_value(reply.payload)["instance"], "old");
    }
}

#[tokio::test]
async fn test_mesh_degrades_to_cache_when_all_instances_die() {
    let mesh = Mesh::spawn().await;
    let (port, handle) = mesh.spawn_instance("a", "1.0.0").await;

    let client = ServiceClient::new(mesh.registry_client(), "speakers", range("^1.0.0"));
    let live = client.get("/whoami").await.unwrap();
    assert_eq!(live.origin, ReplyOrigin::Live);

    // Kill the only instance and withdraw it; discovery now comes up empty,
    // and the cached answer carries the call.
    handle.abort();
    mesh.registry_client()
        .unregister("speakers", &v("1.0.0"), port)
        .await
        .unwrap();

    let degraded = client.get("/whoami").await.unwrap();
    assert!(degraded.is_cached());
    assert_eq!(reply_value(degraded.payload)["instance"], "a");
}
