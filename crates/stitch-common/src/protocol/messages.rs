//! Registry Wire Payloads
//!
//! Response bodies exchanged with the registry's HTTP surface. Discovery
//! responses reuse [`ServiceInstance`](super::ServiceInstance) directly.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Acknowledgement for a register or unregister call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegisterAck {
    /// Display form of the instance key the call affected.
    pub key: String,
    /// True when the call renewed an existing registration rather than
    /// creating one. Always false for unregister.
    pub renewed: bool,
}

/// JSON error body for non-2xx registry responses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        ErrorBody {
            error: error.into(),
        }
    }
}

/// Snapshot served by the registry's `/info` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistryInfo {
    /// Registry package version.
    pub version: String,
    /// Milliseconds since the registry process started.
    pub uptime_ms: u64,
    /// Live instances across all services, after a sweep.
    pub total_instances: usize,
    /// Live instance count per service name.
    pub services: BTreeMap<String, usize>,
}
