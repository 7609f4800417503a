use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Floor for per-job lease times. Anything shorter is unsafe relative to
/// expected network and heartbeat jitter and is rejected at registration.
pub const MIN_LEASE_TIME_SECS: u64 = 10;

/// Default per-job lease time when a job has no explicit configuration.
pub const DEFAULT_LEASE_TIME_SECS: u64 = 30;

/// Pause between backend init attempts.
pub(crate) const INIT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Mastership multiplicity policy for a job.
///
/// `Single` elects one exclusive master per job through lease contention.
/// `Multi` grants mastership to every qualifying instance without consulting
/// the lease at all, for jobs where each instance may act independently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Multiplicity {
    #[default]
    Single,
    Multi,
}

impl Multiplicity {
    /// Parse a configuration value. Anything other than `"multi"` resolves to
    /// [`Multiplicity::Single`].
    pub fn parse(value: &str) -> Self {
        match value {
            "multi" => Multiplicity::Multi,
            _ => Multiplicity::Single,
        }
    }
}

/// Per-job election settings.
///
/// Immutable once the job's runner has started; re-registering a job under the
/// same name is a no-op and does not pick up changed settings.
///
/// # Examples
///
/// ```rust
/// use mastership::prelude::{JobConfig, Multiplicity};
///
/// let config = JobConfig::new()
///     .with_lease_time(60)
///     .with_multiplicity(Multiplicity::Multi)
///     .with_single_across_datacenters(false);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Lease duration in seconds. Doubles as the decision-cycle interval so a
    /// held lease is renewed at least once per cycle.
    pub lease_time: u64,

    /// Whether this job elects a single exclusive master or many.
    pub multiplicity: Multiplicity,

    /// When `true`, only instances in the active datacenter may become master.
    pub single_across_datacenters: bool,

    /// When `true`, only instances running the active deployed version may
    /// become master. Used for staged-rollout safety while two versions
    /// coexist.
    pub single_across_versions: bool,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            lease_time: DEFAULT_LEASE_TIME_SECS,
            multiplicity: Multiplicity::Single,
            single_across_datacenters: true,
            single_across_versions: true,
        }
    }
}

impl JobConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the lease duration in seconds. Values below
    /// [`MIN_LEASE_TIME_SECS`] are rejected at registration time.
    pub fn with_lease_time(mut self, seconds: u64) -> Self {
        self.lease_time = seconds;
        self
    }

    pub fn with_multiplicity(mut self, multiplicity: Multiplicity) -> Self {
        self.multiplicity = multiplicity;
        self
    }

    pub fn with_single_across_datacenters(mut self, single: bool) -> Self {
        self.single_across_datacenters = single;
        self
    }

    pub fn with_single_across_versions(mut self, single: bool) -> Self {
        self.single_across_versions = single;
        self
    }

    /// Lease duration as a [`Duration`].
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_time)
    }

    pub(crate) fn validate(&self, job_name: &str) -> Result<(), ConfigError> {
        if self.lease_time < MIN_LEASE_TIME_SECS {
            return Err(ConfigError::LeaseTimeTooShort {
                job: job_name.to_string(),
                got: self.lease_time,
            });
        }
        Ok(())
    }
}

/// Process-wide election configuration: backend selection and per-job
/// settings.
///
/// Deserializable with serde so a host application can embed it in its own
/// configuration file; every field has a default matching the documented key
/// surface, so an empty table is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterSlaveConfig {
    /// Backend discriminator. `"consul"` and `"mongo"` are built in; other
    /// tags resolve against constructors injected through
    /// [`MasterSlaveRegistry::register_backend`](crate::registry::MasterSlaveRegistry::register_backend).
    pub backend: String,

    /// Bounded number of backend init attempts per job before registration
    /// fails fatally.
    pub init_attempts: u32,

    /// Per-job overrides. Jobs not listed here run with
    /// [`JobConfig::default`].
    pub jobs: HashMap<String, JobConfig>,
}

impl Default for MasterSlaveConfig {
    fn default() -> Self {
        Self {
            backend: "consul".to_string(),
            init_attempts: 3,
            jobs: HashMap::new(),
        }
    }
}

impl MasterSlaveConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = backend.into();
        self
    }

    pub fn with_init_attempts(mut self, attempts: u32) -> Self {
        self.init_attempts = attempts;
        self
    }

    pub fn with_job(mut self, job_name: impl Into<String>, config: JobConfig) -> Self {
        self.jobs.insert(job_name.into(), config);
        self
    }

    /// Effective configuration for a job, falling back to defaults for jobs
    /// with no explicit entry.
    pub fn job(&self, job_name: &str) -> JobConfig {
        self.jobs.get(job_name).cloned().unwrap_or_default()
    }
}

/// Errors in the static configuration or process environment.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConfigError {
    /// Lease times below the floor are unsafe relative to expected network
    /// and heartbeat jitter.
    #[error("lease time for job '{job}' must be at least {}s, got {got}s", MIN_LEASE_TIME_SECS)]
    LeaseTimeTooShort { job: String, got: u64 },

    /// A mandatory environment variable for instance identification is
    /// missing.
    #[error("environment variable {0} is required to identify this instance")]
    MissingEnv(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_config_defaults() {
        let config = JobConfig::default();
        assert_eq!(config.lease_time, DEFAULT_LEASE_TIME_SECS);
        assert_eq!(config.multiplicity, Multiplicity::Single);
        assert!(config.single_across_datacenters);
        assert!(config.single_across_versions);
    }

    #[test]
    fn job_config_builder_chains() {
        let config = JobConfig::new()
            .with_lease_time(45)
            .with_multiplicity(Multiplicity::Multi)
            .with_single_across_datacenters(false)
            .with_single_across_versions(false);

        assert_eq!(config.lease_time, 45);
        assert_eq!(config.multiplicity, Multiplicity::Multi);
        assert!(!config.single_across_datacenters);
        assert!(!config.single_across_versions);
        assert_eq!(config.lease_duration(), Duration::from_secs(45));
    }

    #[test]
    fn lease_time_floor_is_enforced() {
        let config = JobConfig::new().with_lease_time(9);
        assert!(matches!(
            config.validate("reporting"),
            Err(ConfigError::LeaseTimeTooShort { got: 9, .. })
        ));

        let config = JobConfig::new().with_lease_time(MIN_LEASE_TIME_SECS);
        assert!(config.validate("reporting").is_ok());
    }

    #[test]
    fn multiplicity_parse_defaults_to_single() {
        assert_eq!(Multiplicity::parse("multi"), Multiplicity::Multi);
        assert_eq!(Multiplicity::parse("single"), Multiplicity::Single);
        assert_eq!(Multiplicity::parse("anything-else"), Multiplicity::Single);
    }

    #[test]
    fn unknown_job_falls_back_to_defaults() {
        let config = MasterSlaveConfig::new()
            .with_job("reporting", JobConfig::new().with_lease_time(120));

        assert_eq!(config.job("reporting").lease_time, 120);
        assert_eq!(config.job("other").lease_time, DEFAULT_LEASE_TIME_SECS);
    }

    #[test]
    fn config_deserializes_from_partial_table() {
        let raw = r#"
            {
                "backend": "mongo",
                "jobs": {
                    "reporting": { "lease_time": 20, "multiplicity": "multi" }
                }
            }
        "#;
        let config: MasterSlaveConfig = serde_json::from_str(raw).unwrap();

        assert_eq!(config.backend, "mongo");
        assert_eq!(config.init_attempts, 3);
        let job = config.job("reporting");
        assert_eq!(job.lease_time, 20);
        assert_eq!(job.multiplicity, Multiplicity::Multi);
        // Fields absent from the table keep their defaults.
        assert!(job.single_across_versions);
    }

    #[test]
    fn config_round_trips_through_serde() {
        let config = MasterSlaveConfig::new()
            .with_backend("mongo")
            .with_init_attempts(5)
            .with_job("cleanup", JobConfig::new().with_lease_time(15));

        let encoded = serde_json::to_string(&config).unwrap();
        let decoded: MasterSlaveConfig = serde_json::from_str(&encoded).unwrap();

        assert_eq!(decoded.backend, "mongo");
        assert_eq!(decoded.init_attempts, 5);
        assert_eq!(decoded.job("cleanup"), config.job("cleanup"));
    }
}
