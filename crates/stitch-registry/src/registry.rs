//! In-Memory Service Registry
//!
//! The registry is a table of instance records keyed by identity. Liveness is
//! never stored: every `register` and `lookup` starts with an expiry sweep, so
//! a caller is never handed an instance whose heartbeat has lapsed. The cost
//! is that a live but slow-to-renew instance can be dropped early; callers
//! treat an empty lookup as routine and retry later.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::seq::SliceRandom;
use semver::{Version, VersionReq};
use std::collections::BTreeMap;
use stitch_common::time::unix_now;
use stitch_common::{InstanceKey, ServiceInstance};
use tracing::{debug, info};

/// Tunables for [`Registry`].
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Seconds a registration stays live without renewal.
    pub timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig { timeout_secs: 30 }
    }
}

/// The instance table.
///
/// All methods take `&self`; the table is sharded per key, so operations on
/// unrelated instances do not serialize against each other. Operations on the
/// same identity key are linearized by the shard lock. Share behind an `Arc`.
///
/// The registry never fails: `register` and `unregister` always succeed, and
/// a `lookup` with no match returns `None` rather than an error.
pub struct Registry {
    services: DashMap<InstanceKey, ServiceInstance>,
    timeout_secs: u64,
}

impl Registry {
    pub fn new(config: RegistryConfig) -> Self {
        Registry {
            services: DashMap::new(),
            timeout_secs: config.timeout_secs,
        }
    }

    /// Registers an instance, or renews its heartbeat if the identity key is
    /// already present. Sweeps expired records first.
    ///
    /// # Returns
    ///
    /// The identity key and whether an existing registration was renewed.
    pub fn register(
        &self,
        name: &str,
        version: Version,
        host: &str,
        port: u16,
    ) -> (InstanceKey, bool) {
        let now = unix_now();
        self.sweep(now);

        let key = InstanceKey {
            name: name.to_string(),
            version,
            host: host.to_string(),
            port,
        };

        let renewed = match self.services.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().last_heartbeat = now;
                true
            }
            Entry::Vacant(entry) => {
                entry.insert(ServiceInstance {
                    name: key.name.clone(),
                    version: key.version.clone(),
                    host: key.host.clone(),
                    port: key.port,
                    last_heartbeat: now,
                });
                false
            }
        };

        if renewed {
            debug!(key = %key, "registration renewed");
        } else {
            info!(key = %key, "instance registered");
        }
        (key, renewed)
    }

    /// Removes the record for this identity key. A missing record is a no-op,
    /// not an error: the instance may already have been swept.
    pub fn unregister(&self, name: &str, version: Version, host: &str, port: u16) -> InstanceKey {
        let key = InstanceKey {
            name: name.to_string(),
            version,
            host: host.to_string(),
            port,
        };
        if self.services.remove(&key).is_some() {
            info!(key = %key, "instance unregistered");
        }
        key
    }

    /// Finds a live instance of `name` whose version satisfies `range`.
    ///
    /// Sweeps expired records first, then selects uniformly at random among
    /// the matches. Random selection is the entire load-balancing policy:
    /// no weighting, no health scoring beyond liveness.
    pub fn lookup(&self, name: &str, range: &VersionReq) -> Option<ServiceInstance> {
        self.sweep(unix_now());

        let candidates: Vec<ServiceInstance> = self
            .services
            .iter()
            .filter(|entry| entry.name == name && range.matches(&entry.version))
            .map(|entry| entry.value().clone())
            .collect();

        candidates.choose(&mut rand::thread_rng()).cloned()
    }

    /// Live instance total and per-service counts, after a sweep.
    pub fn summary(&self) -> (usize, BTreeMap<String, usize>) {
        self.sweep(unix_now());

        let mut services = BTreeMap::new();
        for entry in self.services.iter() {
            *services.entry(entry.name.clone()).or_insert(0) += 1;
        }
        (self.services.len(), services)
    }

    /// Drops every record whose heartbeat is at least `timeout_secs` old.
    fn sweep(&self, now: u64) {
        self.services.retain(|key, instance| {
            let live = instance.is_live(now, self.timeout_secs);
            if !live {
                debug!(key = %key, "expired registration removed");
            }
            live
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn v(s: &str) -> Version {
        s.parse().unwrap()
    }

    fn range(s: &str) -> VersionReq {
        s.parse().unwrap()
    }

    fn backdate(registry: &Registry, key: &InstanceKey, secs: u64) {
        registry
            .services
            .get_mut(key)
            .expect("instance should be present")
            .last_heartbeat -= secs;
    }

    #[test]
    fn test_register_then_lookup() {
        let registry = Registry::new(RegistryConfig::default());
        registry.register("speakers", v("1.0.0"), "10.0.0.1", 9001);

        let found = registry.lookup("speakers", &range("^1.0.0")).unwrap();
        assert_eq!(found.name, "speakers");
        assert_eq!(found.host, "10.0.0.1");
        assert_eq!(found.port, 9001);
    }

    #[test]
    fn test_lookup_unknown_service_is_none() {
        let registry = Registry::new(RegistryConfig::default());
        assert!(registry.lookup("nope", &range("*")).is_none());
    }

    #[test]
    fn test_renewal_does_not_duplicate() {
        let registry = Registry::new(RegistryConfig::default());
        let (key1, renewed1) = registry.register("svc", v("1.0.0"), "h", 80);
        let (key2, renewed2) = registry.register("svc", v("1.0.0"), "h", 80);

        assert_eq!(key1, key2);
        assert!(!renewed1);
        assert!(renewed2);
        assert_eq!(registry.services.len(), 1);
    }

    #[test]
    fn test_renewal_refreshes_heartbeat() {
        let registry = Registry::new(RegistryConfig::default());
        let (key, _) = registry.register("svc", v("1.0.0"), "h", 80);
        backdate(&registry, &key, 29);

        registry.register("svc", v("1.0.0"), "h", 80);
        let stored = registry.services.get(&key).unwrap();
        assert!(unix_now() - stored.last_heartbeat < 2);
    }

    #[test]
    fn test_expired_instance_is_swept_on_lookup() {
        let registry = Registry::new(RegistryConfig::default());
        let (key, _) = registry.register("svc", v("1.0.0"), "h", 80);
        backdate(&registry, &key, 31);

        assert!(registry.lookup("svc", &range("*")).is_none());
        assert!(registry.services.is_empty());
    }

    #[test]
    fn test_expired_instance_is_swept_on_register() {
        let registry = Registry::new(RegistryConfig::default());
        let (stale, _) = registry.register("old", v("1.0.0"), "h", 80);
        backdate(&registry, &stale, 31);

        registry.register("new", v("1.0.0"), "h", 81);
        assert!(registry.services.get(&stale).is_none());
        assert_eq!(registry.services.len(), 1);
    }

    #[test]
    fn test_instance_at_timeout_boundary_is_dead() {
        let registry = Registry::new(RegistryConfig { timeout_secs: 30 });
        let (key, _) = registry.register("svc", v("1.0.0"), "h", 80);
        backdate(&registry, &key, 30);

        assert!(registry.lookup("svc", &range("*")).is_none());
    }

    #[test]
    fn test_version_range_filtering() {
        let registry = Registry::new(RegistryConfig::default());
        registry.register("svc", v("1.2.5"), "a", 1);
        registry.register("svc", v("1.3.0"), "b", 2);
        registry.register("svc", v("2.0.0"), "c", 3);

        let caret = range("^1.2.0");
        for _ in 0..50 {
            let found = registry.lookup("svc", &caret).unwrap();
            assert!(
                found.version == v("1.2.5") || found.version == v("1.3.0"),
                "2.0.0 must never satisfy ^1.2.0, got {}",
                found.version
            );
        }
    }

    #[test]
    fn test_name_must_match_exactly() {
        let registry = Registry::new(RegistryConfig::default());
        registry.register("speakers", v("1.0.0"), "h", 80);

        assert!(registry.lookup("speaker", &range("*")).is_none());
        assert!(registry.lookup("speakers-service", &range("*")).is_none());
    }

    #[test]
    fn test_selection_is_roughly_uniform() {
        let registry = Registry::new(RegistryConfig::default());
        registry.register("svc", v("1.0.0"), "a", 1);
        registry.register("svc", v("1.0.0"), "b", 2);

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..300 {
            let found = registry.lookup("svc", &range("^1.0.0")).unwrap();
            *counts.entry(found.host).or_insert(0) += 1;
        }

        // Fair coin over 300 draws; anything under 60 would be wildly skewed.
        assert!(counts["a"] >= 60, "host a picked only {} times", counts["a"]);
        assert!(counts["b"] >= 60, "host b picked only {} times", counts["b"]);
    }

    #[test]
    fn test_unregister_removes_immediately() {
        let registry = Registry::new(RegistryConfig::default());
        registry.register("svc", v("1.0.0"), "a", 1);
        registry.register("svc", v("1.0.0"), "b", 2);

        registry.unregister("svc", v("1.0.0"), "a", 1);

        for _ in 0..50 {
            let found = registry.lookup("svc", &range("*")).unwrap();
            assert_eq!(found.host, "b");
        }
    }

    #[test]
    fn test_unregister_absent_is_noop() {
        let registry = Registry::new(RegistryConfig::default());
        registry.unregister("ghost", v("1.0.0"), "h", 80);
        assert!(registry.services.is_empty());
    }

    #[test]
    fn test_distinct_ports_are_distinct_instances() {
        let registry = Registry::new(RegistryConfig::default());
        registry.register("svc", v("1.0.0"), "h", 80);
        registry.register("svc", v("1.0.0"), "h", 81);
        assert_eq!(registry.services.len(), 2);
    }

    #[test]
    fn test_summary_counts_per_service() {
        let registry = Registry::new(RegistryConfig::default());
        registry.register("a", v("1.0.0"), "h", 1);
        registry.register("a", v("1.0.0"), "h", 2);
        registry.register("b", v("2.0.0"), "h", 3);

        let (total, services) = registry.summary();
        assert_eq!(total, 3);
        assert_eq!(services["a"], 2);
        assert_eq!(services["b"], 1);
    }
}
