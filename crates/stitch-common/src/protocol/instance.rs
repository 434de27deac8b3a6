//! Service Instance Records
//!
//! This module defines the registry's unit of bookkeeping: one running,
//! network-addressable copy of a named service at a specific version.

use semver::Version;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a registered instance.
///
/// Two registrations with the same `(name, version, host, port)` describe the
/// same instance: the second one renews the heartbeat instead of creating a
/// duplicate record. Distinct versions or addresses are distinct instances.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceKey {
    pub name: String,
    pub version: Version,
    pub host: String,
    pub port: u16,
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}/{}:{}",
            self.name, self.version, self.host, self.port
        )
    }
}

/// A live (or recently live) service instance as stored in the registry and
/// returned from discovery lookups.
///
/// # Fields
///
/// - `name`: service kind, e.g. `"speakers"`
/// - `version`: semantic version this instance implements
/// - `host` / `port`: where the instance accepts requests
/// - `last_heartbeat`: unix time (seconds) of the most recent registration or
///   renewal; liveness is always recomputed from this, never stored
///
/// # Example
///
/// ```
/// use stitch_common::ServiceInstance;
/// use semver::Version;
///
/// let inst = ServiceInstance {
///     name: "speakers".into(),
///     version: Version::new(1, 0, 0),
///     host: "127.0.0.1".into(),
///     port: 9001,
///     last_heartbeat: 1_700_000_000,
/// };
///
/// assert!(inst.is_live(1_700_000_010, 30));
/// assert!(!inst.is_live(1_700_000_030, 30));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceInstance {
    pub name: String,
    pub version: Version,
    pub host: String,
    pub port: u16,
    pub last_heartbeat: u64,
}

impl ServiceInstance {
    /// Returns the identity key for this instance.
    pub fn key(&self) -> InstanceKey {
        InstanceKey {
            name: self.name.clone(),
            version: self.version.clone(),
            host: self.host.clone(),
            port: self.port,
        }
    }

    /// Base URL requests to this instance are built against.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// An instance is live iff its heartbeat is younger than the timeout.
    ///
    /// Saturating: a heartbeat recorded ahead of `now` (clock skew) counts
    /// as live rather than underflowing.
    pub fn is_live(&self, now: u64, timeout_secs: u64) -> bool {
        now.saturating_sub(self.last_heartbeat) < timeout_secs
    }
}
