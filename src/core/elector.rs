use async_trait::async_trait;
use thiserror::Error;

/// Shorthand for a boxed elector trait object as held by a job's runner.
pub type BoxedElector = Box<dyn MastershipElector>;

/// Backend strategy answering "does this instance currently hold the lease
/// for a job".
///
/// An elector instance is owned by exactly one job runner. [`init`] must be
/// called (by the registry, with a bounded retry budget) before any other
/// method; exhausting that budget is fatal for the process, which must
/// terminate rather than run without a safe election backend.
///
/// Decision methods return `Err` only for unexpected failures; the runner
/// retries the whole decision cycle once and then falls back to SLAVE, so no
/// backend error ever reaches a consumer.
///
/// [`init`]: MastershipElector::init
#[async_trait]
pub trait MastershipElector: Send + Sync {
    /// Establish backend-side resources (session, lease document) for the
    /// given lease key and job.
    async fn init(&mut self, lease_key: &str, job_name: &str) -> Result<(), ElectorError>;

    /// Cheap liveness probe of the backend. A `false` result is non-fatal and
    /// resolves the current cycle to SLAVE.
    async fn is_ready(&self) -> bool;

    /// Whether `current_version` may hold mastership. `true` when no
    /// active-version marker exists or when the marker matches.
    async fn is_active_version(&self, current_version: &str) -> Result<bool, ElectorError>;

    /// Whether `current_datacenter` may hold mastership.
    async fn is_active_datacenter(&self, current_datacenter: &str)
        -> Result<bool, ElectorError>;

    /// Attempt to acquire or re-affirm the lease for this job.
    async fn is_master(&self) -> Result<bool, ElectorError>;

    /// Best-effort early lease release when this instance is about to step
    /// down, distinct from [`close`] which is final teardown. Optional hook;
    /// the default does nothing.
    ///
    /// [`close`]: MastershipElector::close
    async fn cleanup_master(&self) {}

    /// Best-effort release of the lease and any backend session. Failures are
    /// logged, never returned.
    async fn close(&self);

    /// The deployed-version identifier this instance reports to the version
    /// gate, usually taken from its environment.
    fn active_version(&self) -> Option<String>;
}

/// Errors surfaced by elector backends.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ElectorError {
    /// The backend answered with a non-success status where success was
    /// required.
    #[error("failed to {op}: backend returned status {status}")]
    RequestFailed { op: &'static str, status: u16 },

    /// The backend answered with a payload this crate could not interpret.
    #[error("malformed backend response while trying to {op}")]
    MalformedResponse {
        op: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// Transport or driver failure underneath the elector.
    #[error("backend error: {0}")]
    Backend(#[from] anyhow::Error),
}
