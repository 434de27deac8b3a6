//! Resilient Service Client
//!
//! Turns "find an instance and call it" into a call that degrades gracefully
//! instead of failing outright. Each client is scoped to one upstream service
//! and version range; the call path is discover, execute through the breaker,
//! cache on success, and fall back to the cache when the live path is blocked
//! or failing. Only when the fallback also misses does the caller see an
//! error, and that error is always [`StitchError::Unavailable`].

use hyper::Method;
use semver::VersionReq;
use tracing::{debug, info, warn};

use crate::breaker::{BreakerConfig, CircuitBreaker, Payload, PayloadKind};
use crate::cache::{fingerprint, BlobCache, BlobCacheConfig, ValueCache, ValueCacheConfig};
use crate::discovery::RegistryClient;
use stitch_common::{Result, StitchError};

/// Tunables for a [`ServiceClient`]: one knob set per layer.
#[derive(Debug, Clone, Default)]
pub struct ServiceClientConfig {
    pub breaker: BreakerConfig,
    pub value_cache: ValueCacheConfig,
    pub blob_cache: BlobCacheConfig,
}

/// Where a reply came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOrigin {
    /// A live instance answered.
    Live,
    /// The cache answered because the live path was blocked, failing, or had
    /// no instance. `age_secs` is how long ago the entry was stored; blob
    /// entries do not track it.
    Cached { age_secs: Option<u64> },
}

/// A successful reply, fresh or degraded. Staleness is an explicit property
/// of the result, never a silent substitution.
#[derive(Debug)]
pub struct ServiceReply {
    pub origin: ReplyOrigin,
    pub payload: Payload,
}

impl ServiceReply {
    pub fn is_cached(&self) -> bool {
        matches!(self.origin, ReplyOrigin::Cached { .. })
    }
}

/// Cache-backed client for one upstream service.
///
/// Owns its breaker table and caches; construct one per upstream service and
/// share it behind an `Arc`. All methods take `&self`.
///
/// # Example
/// ```no_run
/// # use stitch_client::{RegistryClient, ServiceClient};
/// # #[tokio::main]
/// # async fn main() -> stitch_common::Result<()> {
/// let registry = RegistryClient::new("http://127.0.0.1:3000");
/// let client = ServiceClient::new(registry, "speakers", "^1.0.0".parse().unwrap());
///
/// let reply = client.get("/list").await?;
/// if reply.is_cached() {
///     eprintln!("degraded: serving cached speakers list");
/// }
/// # Ok(())
/// # }
/// ```
pub struct ServiceClient {
    service: String,
    range: VersionReq,
    registry: RegistryClient,
    breaker: CircuitBreaker,
    value_cache: ValueCache,
    blob_cache: BlobCache,
}

impl ServiceClient {
    /// Client with default breaker and cache tunables.
    ///
    /// # Arguments
    /// * `registry` - discovery client for the registry service
    /// * `service` - upstream service name, e.g. "speakers"
    /// * `range` - versions this caller accepts, e.g. `^1.0.0`
    pub fn new(registry: RegistryClient, service: impl Into<String>, range: VersionReq) -> Self {
        Self::with_config(registry, service, range, ServiceClientConfig::default())
    }

    pub fn with_config(
        registry: RegistryClient,
        service: impl Into<String>,
        range: VersionReq,
        config: ServiceClientConfig,
    ) -> Self {
        ServiceClient {
            service: service.into(),
            range,
            registry,
            breaker: CircuitBreaker::new(config.breaker),
            value_cache: ValueCache::new(config.value_cache),
            blob_cache: BlobCache::new(config.blob_cache),
        }
    }

    /// The breaker table, for snapshots in tests and logging.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// `GET path` expecting a JSON body.
    pub async fn get(&self, path: &str) -> Result<ServiceReply> {
        self.call(Method::GET, path, PayloadKind::Value).await
    }

    /// `GET path` expecting a byte stream.
    pub async fn get_stream(&self, path: &str) -> Result<ServiceReply> {
        self.call(Method::GET, path, PayloadKind::Stream).await
    }

    /// Calls `method path` on some live instance of this client's service.
    ///
    /// # Behavior
    /// 1. Discover an instance via the registry. A discovery miss (or an
    ///    unreachable registry) skips straight to the fallback path: the
    ///    fingerprint covers only method and path, so a cached answer is
    ///    usable even with no instance in sight.
    /// 2. Execute through the circuit breaker against the chosen instance.
    /// 3. On success, record the response in the value cache (or tee streamed
    ///    bytes into the blob cache) and return it marked [`ReplyOrigin::Live`].
    /// 4. On denial or failure, serve the cached entry for this fingerprint if
    ///    one of the requested shape exists, marked [`ReplyOrigin::Cached`]:
    ///    value calls read only the value cache, stream calls only the blob
    ///    cache.
    ///
    /// # Errors
    /// [`StitchError::Unavailable`] when the live path is impossible and the
    /// cache has nothing for this fingerprint. Nothing else surfaces.
    pub async fn call(
        &self,
        method: Method,
        path: &str,
        kind: PayloadKind,
    ) -> Result<ServiceReply> {
        let fp = fingerprint(&method, path);

        let instance = match self.registry.find(&self.service, &self.range).await {
            Ok(found) => found,
            Err(e) => {
                warn!(
                    service = %self.service,
                    error = %e,
                    "registry unreachable, treating as discovery miss"
                );
                None
            }
        };

        let Some(instance) = instance else {
            debug!(service = %self.service, range = %self.range, "no live instance found");
            return self
                .fallback(
                    &fp,
                    path,
                    kind,
                    StitchError::NoInstance {
                        service: self.service.clone(),
                        range: self.range.to_string(),
                    },
                )
                .await;
        };

        let url = format!("{}{}", instance.base_url(), path);
        match self.breaker.execute(method, &url, kind).await {
            Ok(Payload::Value(value)) => {
                self.value_cache.store(&fp, value.clone());
                Ok(ServiceReply {
                    origin: ReplyOrigin::Live,
                    payload: Payload::Value(value),
                })
            }
            Ok(Payload::Stream(stream)) => Ok(ServiceReply {
                origin: ReplyOrigin::Live,
                payload: Payload::Stream(self.blob_cache.store_streaming(&fp, stream)),
            }),
            Err(e) if e.is_fallback_eligible() => self.fallback(&fp, path, kind, e).await,
            Err(e) => Err(e),
        }
    }

    /// The degraded path: the cache matching the requested payload shape, or
    /// give up. A value call never receives a blob hit and vice versa; the
    /// two stores share the fingerprint but not the shape. `cause` is what
    /// made the live path impossible; it is logged but never surfaced once a
    /// cache hit covers for it.
    async fn fallback(
        &self,
        fp: &str,
        path: &str,
        kind: PayloadKind,
        cause: StitchError,
    ) -> Result<ServiceReply> {
        match kind {
            PayloadKind::Value => {
                if let Some((value, age_secs)) = self.value_cache.lookup(fp) {
                    info!(
                        service = %self.service,
                        path,
                        age_secs,
                        cause = %cause,
                        "serving cached value"
                    );
                    return Ok(ServiceReply {
                        origin: ReplyOrigin::Cached {
                            age_secs: Some(age_secs),
                        },
                        payload: Payload::Value(value),
                    });
                }
            }
            PayloadKind::Stream => {
                if let Some(stream) = self.blob_cache.open(fp).await {
                    info!(service = %self.service, path, cause = %cause, "serving cached blob");
                    return Ok(ServiceReply {
                        origin: ReplyOrigin::Cached { age_secs: None },
                        payload: Payload::Stream(stream),
                    });
                }
            }
        }

        warn!(service = %self.service, path, cause = %cause, "unavailable, no cached fallback");
        Err(StitchError::Unavailable {
            service: self.service.clone(),
            path: path.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // Nothing listens here; connections are refused immediately.
    const DEAD_REGISTRY: &str = "http://127.0.0.1:1";

    fn client() -> ServiceClient {
        ServiceClient::new(
            RegistryClient::new(DEAD_REGISTRY),
            "speakers",
            "^1.0.0".parse().unwrap(),
        )
    }

    #[tokio::test]
    async fn test_unreachable_registry_with_empty_cache_is_unavailable() {
        let err = client().get("/list").await.unwrap_err();
        match err {
            StitchError::Unavailable { service, path } => {
                assert_eq!(service, "speakers");
                assert_eq!(path, "/list");
            }
            other => panic!("expected Unavailable, got {}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_registry_falls_back_to_value_cache() {
        let client = client();
        let fp = fingerprint(&Method::GET, "/list");
        client.value_cache.store(&fp, json!(["ada", "grace"]));

        let reply = client.get("/list").await.unwrap();
        assert!(reply.is_cached());
        match reply.payload {
            Payload::Value(v) => assert_eq!(v, json!(["ada", "grace"])),
            Payload::Stream(_) => panic!("expected a value payload"),
        }
        match reply.origin {
            ReplyOrigin::Cached { age_secs } => assert!(age_secs.unwrap() < 2),
            ReplyOrigin::Live => panic!("expected a cached origin"),
        }
    }

    #[tokio::test]
    async fn test_value_call_ignores_blob_entries() {
        let dir = tempfile::tempdir().unwrap();
        let fp = fingerprint(&Method::GET, "/media");
        std::fs::write(dir.path().join(&fp), b"persisted bytes").unwrap();

        let client = ServiceClient::with_config(
            RegistryClient::new(DEAD_REGISTRY),
            "speakers",
            "^1.0.0".parse().unwrap(),
            ServiceClientConfig {
                blob_cache: BlobCacheConfig::new(dir.path()),
                ..Default::default()
            },
        );

        // A blob under this fingerprint must not answer a value call.
        let err = client.get("/media").await.unwrap_err();
        assert!(matches!(err, StitchError::Unavailable { .. }));

        // The same entry does answer a stream call.
        let reply = client.get_stream("/media").await.unwrap();
        assert!(reply.is_cached());
    }

    #[tokio::test]
    async fn test_stream_call_ignores_value_entries() {
        let client = client();
        client
            .value_cache
            .store(&fingerprint(&Method::GET, "/list"), json!(["ada"]));

        let err = client.get_stream("/list").await.unwrap_err();
        assert!(matches!(err, StitchError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn test_cache_key_ignores_which_path_missed() {
        let client = client();
        client
            .value_cache
            .store(&fingerprint(&Method::GET, "/list"), json!(1));

        // A different path shares no fingerprint, so it still misses.
        assert!(client.get("/other").await.is_err());
    }

    #[test]
    fn test_config_default_wires_all_layers() {
        let config = ServiceClientConfig::default();
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.value_cache.max_entries, 256);
        assert_eq!(config.blob_cache.max_bytes, 256 * 1024 * 1024);
    }
}
