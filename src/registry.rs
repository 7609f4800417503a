//! Process-wide job registry: one election runner per registered job.

use crate::consul::{ConsulElector, KvTransport};
use crate::core::config::{ConfigError, JobConfig, MasterSlaveConfig, INIT_RETRY_BACKOFF};
use crate::core::elector::{BoxedElector, ElectorError, MastershipElector};
use crate::core::identity::InstanceIdentity;
use crate::core::listener::MasterSlaveListener;
use crate::core::CancellationToken;
use crate::mongo::{MasterSlaveStore, MongoElector};
use crate::runner::{ElectionRunner, RunnerOptions};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Discriminator tag of the built-in Consul-style backend.
pub const CONSUL_BACKEND: &str = "consul";
/// Discriminator tag of the built-in document-store backend.
pub const MONGO_BACKEND: &str = "mongo";

/// Constructor for a custom elector backend, registered under a discriminator
/// tag as the escape hatch next to the built-in backends.
pub type ElectorConstructor =
    Box<dyn Fn(&ClusterContext, &str, &JobConfig) -> BoxedElector + Send + Sync>;

/// Explicit context owning the process-wide client handles and configuration.
///
/// Passed to the registry instead of living in hidden global state; the
/// injected handles are shared by every job runner and heartbeat task, and
/// are only ever used through their own request operations.
pub struct ClusterContext {
    identity: InstanceIdentity,
    config: MasterSlaveConfig,
    kv_transport: Option<Arc<dyn KvTransport>>,
    document_store: Option<Arc<dyn MasterSlaveStore>>,
}

impl ClusterContext {
    pub fn new(identity: InstanceIdentity, config: MasterSlaveConfig) -> Self {
        Self {
            identity,
            config,
            kv_transport: None,
            document_store: None,
        }
    }

    /// Attach the transport backing the Consul-style backend.
    pub fn with_kv_transport(mut self, transport: Arc<dyn KvTransport>) -> Self {
        self.kv_transport = Some(transport);
        self
    }

    /// Attach the driver backing the document-store backend.
    pub fn with_document_store(mut self, store: Arc<dyn MasterSlaveStore>) -> Self {
        self.document_store = Some(store);
        self
    }

    pub fn identity(&self) -> &InstanceIdentity {
        &self.identity
    }

    pub fn config(&self) -> &MasterSlaveConfig {
        &self.config
    }

    pub fn kv_transport(&self) -> Option<&Arc<dyn KvTransport>> {
        self.kv_transport.as_ref()
    }

    pub fn document_store(&self) -> Option<&Arc<dyn MasterSlaveStore>> {
        self.document_store.as_ref()
    }
}

/// Errors surfaced when registering a job.
///
/// All of these are fatal conditions for the process: an instance that cannot
/// bring up a safe election backend must terminate rather than run silently
/// slave-only or risk double mastership.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RegistryError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The configured backend tag is neither built in nor injected.
    #[error("no '{0}' backend is built in or registered under that tag")]
    UnknownBackend(String),

    /// The configured backend needs a client handle the context does not
    /// carry.
    #[error("the '{backend}' backend requires a {handle} handle on the cluster context")]
    MissingHandle {
        backend: &'static str,
        handle: &'static str,
    },

    /// The backend could not be initialized within the bounded retry budget.
    #[error("backend init for job '{job}' failed after {attempts} attempts")]
    InitFailed {
        job: String,
        attempts: u32,
        #[source]
        source: ElectorError,
    },
}

struct JobEntry {
    /// `None` once the job has been unregistered; the runner may still be
    /// draining its final cycle.
    listener: Option<Arc<dyn MasterSlaveListener>>,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

/// Process-wide table of registered jobs.
///
/// `register` is idempotent per job name, `unregister` asks the job's runner
/// to stand down after its current cycle, and both are safe to call
/// concurrently from any task.
pub struct MasterSlaveRegistry {
    context: Arc<ClusterContext>,
    jobs: DashMap<String, JobEntry>,
    constructors: DashMap<String, ElectorConstructor>,
    runner_options: RunnerOptions,
}

impl MasterSlaveRegistry {
    pub fn new(context: ClusterContext) -> Self {
        Self {
            context: Arc::new(context),
            jobs: DashMap::new(),
            constructors: DashMap::new(),
            runner_options: RunnerOptions::default(),
        }
    }

    pub fn with_runner_options(mut self, options: RunnerOptions) -> Self {
        self.runner_options = options;
        self
    }

    /// Inject a constructor for a custom backend under `tag`. Built-in tags
    /// take precedence over injected ones.
    pub fn register_backend(&self, tag: impl Into<String>, constructor: ElectorConstructor) {
        self.constructors.insert(tag.into(), constructor);
    }

    /// Start election for `job_name`, notifying `listener` on role changes.
    ///
    /// Registering an already-registered job is a no-op. An `Err` means this
    /// instance cannot safely take part in elections for the job and should
    /// terminate.
    pub async fn register(
        &self,
        job_name: &str,
        listener: Arc<dyn MasterSlaveListener>,
    ) -> Result<(), RegistryError> {
        if let Some(entry) = self.jobs.get(job_name) {
            if entry.listener.is_some() {
                debug!(job = job_name, "job already registered, ignoring");
                return Ok(());
            }
        }

        let config = self.context.config.job(job_name);
        config.validate(job_name)?;

        let mut elector = self.build_elector(job_name, &config)?;
        self.init_elector(elector.as_mut(), job_name).await?;

        let shutdown = CancellationToken::new();
        let runner = ElectionRunner::new(
            job_name,
            config,
            &self.context.identity,
            elector,
            Arc::clone(&listener),
            shutdown.clone(),
            self.runner_options.clone(),
        );
        let handle = spawn_runner(job_name.to_string(), runner);

        match self.jobs.entry(job_name.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().listener.is_some() {
                    // Lost a race against a concurrent register for the same
                    // job: stand the fresh runner down; it closes its elector
                    // on the way out.
                    shutdown.cancel();
                    return Ok(());
                }
                occupied.insert(JobEntry {
                    listener: Some(listener),
                    shutdown,
                    handle,
                });
            }
            Entry::Vacant(vacant) => {
                vacant.insert(JobEntry {
                    listener: Some(listener),
                    shutdown,
                    handle,
                });
            }
        }
        info!(job = job_name, "registered master/slave listener");
        Ok(())
    }

    /// Ask the job's runner to stand down. The runner observes the request at
    /// its next wake, releases the backend lease and exits, so shutdown
    /// latency is bounded by one lease duration.
    ///
    /// Returns whether a listener had been registered for `job_name`.
    pub fn unregister(&self, job_name: &str) -> bool {
        match self.jobs.get_mut(job_name) {
            Some(mut entry) => {
                let had_listener = entry.listener.take().is_some();
                entry.shutdown.cancel();
                if had_listener {
                    info!(job = job_name, "unregistered master/slave listener");
                }
                had_listener
            }
            None => false,
        }
    }

    /// Whether the background task for `job_name` is still executing.
    pub fn is_alive(&self, job_name: &str) -> bool {
        self.jobs
            .get(job_name)
            .map(|entry| !entry.handle.is_finished())
            .unwrap_or(false)
    }

    fn build_elector(
        &self,
        job_name: &str,
        config: &JobConfig,
    ) -> Result<BoxedElector, RegistryError> {
        match self.context.config.backend.as_str() {
            CONSUL_BACKEND => {
                let transport = self
                    .context
                    .kv_transport
                    .clone()
                    .ok_or(RegistryError::MissingHandle {
                        backend: CONSUL_BACKEND,
                        handle: "KV transport",
                    })?;
                Ok(Box::new(ConsulElector::new(
                    transport,
                    self.context.identity.clone(),
                    config,
                )))
            }
            MONGO_BACKEND => {
                let store = self
                    .context
                    .document_store
                    .clone()
                    .ok_or(RegistryError::MissingHandle {
                        backend: MONGO_BACKEND,
                        handle: "document store",
                    })?;
                Ok(Box::new(MongoElector::new(
                    store,
                    self.context.identity.clone(),
                    config,
                )))
            }
            custom => match self.constructors.get(custom) {
                Some(constructor) => {
                    Ok((constructor.value())(&self.context, job_name, config))
                }
                None => Err(RegistryError::UnknownBackend(custom.to_string())),
            },
        }
    }

    async fn init_elector(
        &self,
        elector: &mut dyn MastershipElector,
        job_name: &str,
    ) -> Result<(), RegistryError> {
        let attempts = self.context.config.init_attempts.max(1);
        let lease_key = format!("{}-{}", self.context.identity.component(), job_name);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match elector.init(&lease_key, job_name).await {
                Ok(()) => return Ok(()),
                Err(error) if attempt < attempts => {
                    warn!(job = job_name, attempt, %error, "problem initializing elector");
                    tokio::time::sleep(INIT_RETRY_BACKOFF).await;
                }
                Err(error) => {
                    error!(
                        job = job_name,
                        attempt,
                        %error,
                        "giving up initializing elector; this instance cannot take part in elections"
                    );
                    return Err(RegistryError::InitFailed {
                        job: job_name.to_string(),
                        attempts,
                        source: error,
                    });
                }
            }
        }
    }
}

/// One task per job; a panic inside a runner is logged with the job identity
/// and never touches sibling jobs.
fn spawn_runner(job_name: String, runner: ElectionRunner) -> JoinHandle<()> {
    tokio::spawn(async move {
        let inner = tokio::spawn(runner.run());
        if let Err(error) = inner.await {
            if error.is_panic() {
                error!(job = %job_name, "election runner panicked; sibling jobs are unaffected");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Multiplicity;
    use crate::runner::Role;
    use crate::testing::{RecordingListener, ScriptStep, ScriptedElector, ScriptedState};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;

    const SCRIPTED_BACKEND: &str = "scripted";

    fn identity() -> InstanceIdentity {
        InstanceIdentity::new("reporting-service", "host-1").with_version("1.0")
    }

    fn scripted_registry(state: Arc<ScriptedState>, config: MasterSlaveConfig) -> MasterSlaveRegistry {
        let registry = MasterSlaveRegistry::new(ClusterContext::new(identity(), config));
        registry.register_backend(
            SCRIPTED_BACKEND,
            Box::new(move |_context, _job_name, _config| {
                Box::new(ScriptedElector::from_state(Arc::clone(&state)))
            }),
        );
        registry
    }

    fn scripted_config() -> MasterSlaveConfig {
        MasterSlaveConfig::new()
            .with_backend(SCRIPTED_BACKEND)
            .with_job("reporting", JobConfig::new().with_lease_time(10))
    }

    async fn wait_until_dead(registry: &MasterSlaveRegistry, job_name: &str) {
        timeout(Duration::from_secs(600), async {
            while registry.is_alive(job_name) {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("job task never stopped");
    }

    #[tokio::test(start_paused = true)]
    async fn registering_twice_starts_exactly_one_runner() {
        let state = ScriptedState::with_script([ScriptStep::Master]);
        let registry = scripted_registry(Arc::clone(&state), scripted_config());
        let constructions = Arc::new(AtomicU32::new(0));

        // Count constructions through a second wrapper backend.
        {
            let state = Arc::clone(&state);
            let constructions = Arc::clone(&constructions);
            registry.register_backend(
                SCRIPTED_BACKEND,
                Box::new(move |_context, _job_name, _config| {
                    constructions.fetch_add(1, Ordering::SeqCst);
                    Box::new(ScriptedElector::from_state(Arc::clone(&state)))
                }),
            );
        }

        let (listener, mut events) = RecordingListener::channel();
        registry.register("reporting", listener.clone()).await.unwrap();
        registry.register("reporting", listener).await.unwrap();

        assert_eq!(constructions.load(Ordering::SeqCst), 1);
        assert_eq!(state.init_calls(), 1);
        assert!(registry.is_alive("reporting"));

        assert_eq!(
            timeout(Duration::from_secs(600), events.recv()).await.unwrap(),
            Some(Role::Master)
        );
        registry.unregister("reporting");
    }

    #[tokio::test(start_paused = true)]
    async fn an_unknown_backend_tag_is_rejected() {
        let registry = MasterSlaveRegistry::new(ClusterContext::new(
            identity(),
            MasterSlaveConfig::new().with_backend("etcd"),
        ));
        let (listener, _events) = RecordingListener::channel();

        let error = registry.register("reporting", listener).await.unwrap_err();
        assert!(matches!(error, RegistryError::UnknownBackend(tag) if tag == "etcd"));
    }

    #[tokio::test(start_paused = true)]
    async fn builtin_backends_require_their_context_handle() {
        let registry = MasterSlaveRegistry::new(ClusterContext::new(
            identity(),
            MasterSlaveConfig::new(),
        ));
        let (listener, _events) = RecordingListener::channel();

        let error = registry.register("reporting", listener).await.unwrap_err();
        assert!(matches!(
            error,
            RegistryError::MissingHandle {
                backend: CONSUL_BACKEND,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn a_lease_time_below_the_floor_is_fatal() {
        let state = ScriptedState::with_script([ScriptStep::Master]);
        let config = MasterSlaveConfig::new()
            .with_backend(SCRIPTED_BACKEND)
            .with_job("reporting", JobConfig::new().with_lease_time(5));
        let registry = scripted_registry(state, config);
        let (listener, _events) = RecordingListener::channel();

        let error = registry.register("reporting", listener).await.unwrap_err();
        assert!(matches!(
            error,
            RegistryError::Config(ConfigError::LeaseTimeTooShort { got: 5, .. })
        ));
        assert!(!registry.is_alive("reporting"));
    }

    #[tokio::test(start_paused = true)]
    async fn init_is_retried_within_the_configured_budget() {
        let state = ScriptedState::with_script([ScriptStep::Master]);
        state.fail_next_inits(2);
        let registry = scripted_registry(Arc::clone(&state), scripted_config());
        let (listener, _events) = RecordingListener::channel();

        registry.register("reporting", listener).await.unwrap();
        assert_eq!(state.init_calls(), 3);
        registry.unregister("reporting");
    }

    #[tokio::test(start_paused = true)]
    async fn exhausting_the_init_budget_is_fatal() {
        let state = ScriptedState::with_script([ScriptStep::Master]);
        state.fail_next_inits(10);
        let config = scripted_config().with_init_attempts(2);
        let registry = scripted_registry(Arc::clone(&state), config);
        let (listener, _events) = RecordingListener::channel();

        let error = registry.register("reporting", listener).await.unwrap_err();
        assert!(matches!(
            error,
            RegistryError::InitFailed { attempts: 2, .. }
        ));
        assert_eq!(state.init_calls(), 2);
        assert!(!registry.is_alive("reporting"));
    }

    #[tokio::test(start_paused = true)]
    async fn unregister_stops_the_runner_within_one_lease() {
        let state = ScriptedState::with_script([ScriptStep::Master]);
        let registry = scripted_registry(Arc::clone(&state), scripted_config());
        let (listener, mut events) = RecordingListener::channel();

        registry.register("reporting", listener).await.unwrap();
        assert_eq!(
            timeout(Duration::from_secs(600), events.recv()).await.unwrap(),
            Some(Role::Master)
        );

        assert!(registry.unregister("reporting"));
        wait_until_dead(&registry, "reporting").await;

        assert_eq!(state.close_calls(), 1);
        // No further notifications after the runner stopped.
        assert!(timeout(Duration::from_secs(120), events.recv()).await.is_err());
        // A second unregister reports that no listener was registered.
        assert!(!registry.unregister("reporting"));
        assert!(!registry.unregister("never-registered"));
    }

    #[tokio::test(start_paused = true)]
    async fn jobs_are_independent() {
        let state = ScriptedState::with_script([]);
        state.set_repeat(ScriptStep::Master);
        let config = scripted_config()
            .with_job("cleanup", JobConfig::new().with_lease_time(10).with_multiplicity(Multiplicity::Multi));
        let registry = scripted_registry(Arc::clone(&state), config);

        let (reporting_listener, mut reporting_events) = RecordingListener::channel();
        let (cleanup_listener, mut cleanup_events) = RecordingListener::channel();
        registry.register("reporting", reporting_listener).await.unwrap();
        registry.register("cleanup", cleanup_listener).await.unwrap();

        assert_eq!(
            timeout(Duration::from_secs(600), reporting_events.recv()).await.unwrap(),
            Some(Role::Master)
        );
        assert_eq!(
            timeout(Duration::from_secs(600), cleanup_events.recv()).await.unwrap(),
            Some(Role::Master)
        );

        // Stopping one job leaves the other running.
        registry.unregister("reporting");
        wait_until_dead(&registry, "reporting").await;
        assert!(registry.is_alive("cleanup"));
        registry.unregister("cleanup");
    }
}
