//! Stitch Resilient Client
//!
//! This crate is the caller-side half of the stitch mesh. It answers one
//! question reliably: "can I reach a healthy instance of service X, and if
//! not, what is the best available substitute?"
//!
//! Three layers collaborate:
//!
//! - **Discovery** ([`RegistryClient`], [`Announcer`]): find instances via the
//!   registry service and keep this process's own registration alive.
//! - **Circuit breaker** ([`CircuitBreaker`]): per-endpoint failure isolation
//!   with a short call timeout, so a struggling instance fails fast instead of
//!   stalling its callers.
//! - **Degraded-mode caches** ([`ValueCache`], [`BlobCache`]): the last
//!   successful response per `(method, path)` fingerprint, served when the
//!   live path is blocked or failing.
//!
//! [`ServiceClient`] composes all three; its replies carry an explicit
//! [`ReplyOrigin`] so callers can always tell a fresh answer from a stale one.

use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;

pub mod breaker;
pub mod cache;
pub mod client;
pub mod discovery;

/// Byte stream as delivered to and from the caller: response bodies on the
/// live path, file reads on the blob-cache fallback path.
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

pub use breaker::{
    BreakerConfig, CircuitBreaker, CircuitState, EndpointSnapshot, Payload, PayloadKind,
};
pub use cache::{fingerprint, BlobCache, BlobCacheConfig, ValueCache, ValueCacheConfig};
pub use client::{ReplyOrigin, ServiceClient, ServiceClientConfig, ServiceReply};
pub use discovery::{AnnounceConfig, Announcer, RegistryClient};
