//! Master/slave election for fleets of identical, stateless process instances.
//!
//! Each registered *job* is a logical unit of work that should run on exactly
//! one instance of a component (or, under the `multi` policy, on every
//! instance). Consumers register a [`MasterSlaveListener`] for a job and get
//! edge-triggered `go_master`/`go_slave` callbacks on every role change; they
//! never poll.
//!
//! Mastership itself is arbitrated by a pluggable backend implementing
//! [`MastershipElector`]:
//!
//! - [`consul::ConsulElector`] holds a session-backed KV lock against a
//!   Consul-style coordination service, reached through the
//!   [`consul::KvTransport`] seam.
//! - [`mongo::MongoElector`] holds a wall-clock lease document in a document
//!   store, reached through the [`mongo::MasterSlaveStore`] seam, renewed with
//!   an atomic compare-and-replace.
//!
//! Before a role is ever granted, two cross-cutting gates apply: datacenter
//! affinity and deployed-version affinity. Failing either forces SLAVE
//! regardless of lease state.
//!
//! # Example
//!
//! ```rust,no_run
//! use mastership::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example(transport: Arc<dyn mastership::consul::KvTransport>) -> Result<(), RegistryError> {
//! let identity = InstanceIdentity::new("reporting-service", "host-1.example.com")
//!     .with_version("1.2.0")
//!     .with_datacenter("us-east");
//!
//! let config = MasterSlaveConfig::new()
//!     .with_job("reporting", JobConfig::new().with_lease_time(30));
//!
//! let registry = MasterSlaveRegistry::new(
//!     ClusterContext::new(identity, config).with_kv_transport(transport),
//! );
//!
//! let listener = Arc::new(CallbackListener::new(
//!     || println!("now master"),
//!     || println!("now slave"),
//! ));
//! registry.register("reporting", listener).await?;
//! # Ok(())
//! # }
//! ```
//!
//! Unregistering flips a per-job cancellation token; the job's runner finishes
//! its current cycle, releases the backend lease and exits, so shutdown
//! latency is bounded by one lease duration.

pub mod core;

pub mod consul;
pub mod mongo;

pub mod registry;
pub mod runner;

/// In-memory fakes for the backend seams, shared by this crate's unit and
/// integration tests. Consumers may use them to test their own listeners
/// without a live coordination service.
#[doc(hidden)]
pub mod testing;

/// Re-exports to simplify importing this crate's types.
pub mod prelude {
    pub use crate::core::config::{JobConfig, MasterSlaveConfig, Multiplicity};
    pub use crate::core::elector::{BoxedElector, ElectorError, MastershipElector};
    pub use crate::core::identity::InstanceIdentity;
    pub use crate::core::listener::{CallbackListener, MasterSlaveListener};
    pub use crate::core::CancellationToken;
    pub use crate::registry::{ClusterContext, MasterSlaveRegistry, RegistryError};
    pub use crate::runner::Role;
}

pub use crate::core::elector::MastershipElector;
pub use crate::core::listener::MasterSlaveListener;
pub use crate::registry::MasterSlaveRegistry;
