//! Stitch Common Types
//!
//! This crate provides the shared protocol types and error handling for the
//! stitch service mesh. All other stitch crates depend on it.
//!
//! # Overview
//!
//! Stitch is a minimal service-mesh substrate: services announce themselves to
//! a registry, callers discover live instances by name and semantic-version
//! range, and a resilience layer (circuit breaker + degraded-mode cache)
//! protects callers from slow or failing downstreams. This crate contains the
//! pieces every component agrees on:
//!
//! - **Instance records**: [`ServiceInstance`] and its identity [`InstanceKey`]
//! - **Wire payloads**: registration acks, error bodies, registry info
//! - **Errors**: [`StitchError`] and the crate-wide [`Result`] alias
//!
//! # Example
//!
//! ```
//! use stitch_common::ServiceInstance;
//! use semver::Version;
//!
//! let inst = ServiceInstance {
//!     name: "speakers".into(),
//!     version: Version::new(1, 2, 0),
//!     host: "10.0.0.7".into(),
//!     port: 9001,
//!     last_heartbeat: 1_700_000_000,
//! };
//!
//! assert_eq!(inst.base_url(), "http://10.0.0.7:9001");
//! assert_eq!(inst.key().to_string(), "speakers@1.2.0/10.0.0.7:9001");
//! ```

pub mod protocol;
pub mod time;

pub use protocol::*;
