//! Consul-style elector: mastership is a KV lock tied to a TTL session.
//!
//! The elector creates one session per job at init and keeps it alive with a
//! background heartbeat renewing at a third of the lease TTL. Mastership is
//! then a conditional `acquire` write on the job's lock key: the service
//! grants the lock only when it is unheld or held by an invalidated session.
//! Once held, subsequent cycles re-affirm ownership with a plain read instead
//! of contending for the lock again.
//!
//! The wire transport is out of scope and injected through [`KvTransport`];
//! any HTTP-style client with a method/path/body/query request shape can back
//! it.

use crate::core::config::JobConfig;
use crate::core::elector::{ElectorError, MastershipElector};
use crate::core::identity::InstanceIdentity;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

/// KV key carrying the active-datacenter marker.
pub const ACTIVE_DATACENTER_KEY: &str = "primaryDatacenter";

/// HTTP method of a coordination-service request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Put,
}

/// One request against the KV/session coordination service.
#[derive(Debug, Clone)]
pub struct KvRequest {
    pub method: HttpMethod,
    pub path: String,
    pub body: Option<String>,
    pub query: Vec<(String, String)>,
}

impl KvRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            path: path.into(),
            body: None,
            query: Vec::new(),
        }
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Put,
            path: path.into(),
            body: None,
            query: Vec::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }
}

/// Response contract of the coordination service: a status code and the raw
/// body. Protocol-level failures are carried in the status; `Err` from the
/// transport is reserved for transport-level failures.
#[derive(Debug, Clone)]
pub struct KvResponse {
    pub status: u16,
    pub body: String,
}

impl KvResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Wire transport used to reach the KV/session service. Implementations must
/// be safe for concurrent use by every job runner and heartbeat task in the
/// process.
#[async_trait]
pub trait KvTransport: Send + Sync {
    async fn execute(&self, request: KvRequest) -> Result<KvResponse, anyhow::Error>;
}

/// Source of the active-version marker: which KV key to compare against and
/// which version value this instance reports.
///
/// Injected as a value rather than overridden in a subclass; deployments that
/// publish their activation marker elsewhere only differ in this pair.
#[derive(Debug, Clone)]
pub struct VersionMarker {
    key: String,
    value: Option<String>,
}

impl VersionMarker {
    pub fn new(key: impl Into<String>, value: Option<String>) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }

    /// Default marker: the `{component}-version` key compared against the
    /// deployed artifact version from the instance identity.
    pub fn for_component(identity: &InstanceIdentity) -> Self {
        Self {
            key: format!("{}-version", identity.component()),
            value: identity.version().map(str::to_string),
        }
    }

    /// Marker layout used by OpenStack heat deployments: the
    /// `/activated/{STACK_NAME}` key compared against `STACK_VERSION`.
    pub fn openstack() -> Self {
        Self {
            key: format!(
                "/activated/{}",
                env::var("STACK_NAME").unwrap_or_default()
            ),
            value: env::var("STACK_VERSION").ok(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }
}

#[derive(Deserialize)]
struct CreatedSession {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Deserialize, Default)]
struct KvEntry {
    #[serde(rename = "Value", default)]
    value: Option<String>,
    #[serde(rename = "Session", default)]
    session: Option<String>,
}

fn parse_lock_response(body: &str) -> bool {
    body.trim().parse().unwrap_or(false)
}

fn is_invalid_session(body: &str) -> bool {
    body.contains("invalid session") || body.contains("Invalid session")
}

/// Session + KV lock implementation of [`MastershipElector`].
pub struct ConsulElector {
    transport: Arc<dyn KvTransport>,
    identity: InstanceIdentity,
    version_marker: VersionMarker,
    ttl: Duration,
    job_name: String,
    mastership_key: String,
    session: Arc<RwLock<String>>,
    heartbeat: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl ConsulElector {
    pub fn new(
        transport: Arc<dyn KvTransport>,
        identity: InstanceIdentity,
        config: &JobConfig,
    ) -> Self {
        let version_marker = VersionMarker::for_component(&identity);
        Self {
            transport,
            identity,
            version_marker,
            ttl: config.lease_duration(),
            job_name: String::new(),
            mastership_key: String::new(),
            session: Arc::new(RwLock::new(String::new())),
            heartbeat: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Replace the default version-marker source.
    pub fn with_version_marker(mut self, version_marker: VersionMarker) -> Self {
        self.version_marker = version_marker;
        self
    }

    async fn execute(
        &self,
        request: KvRequest,
        op: &'static str,
    ) -> Result<KvResponse, ElectorError> {
        let response = self.transport.execute(request).await?;
        if !response.is_success() {
            error!(
                op,
                status = response.status,
                body = %response.body,
                "coordination service request failed"
            );
            return Err(ElectorError::RequestFailed {
                op,
                status: response.status,
            });
        }
        Ok(response)
    }

    /// Best-effort variant of [`execute`](Self::execute) for teardown paths:
    /// logs failures and never errors.
    async fn try_execute(&self, request: KvRequest, op: &'static str) -> Option<KvResponse> {
        match self.transport.execute(request).await {
            Ok(response) => {
                if !response.is_success() {
                    warn!(
                        op,
                        status = response.status,
                        body = %response.body,
                        "coordination service request failed"
                    );
                }
                Some(response)
            }
            Err(error) => {
                warn!(op, %error, "coordination service unreachable");
                None
            }
        }
    }

    async fn create_session(&self) -> Result<(), ElectorError> {
        let body = serde_json::json!({
            "Name": self.identity.instance_id(),
            "TTL": format!("{}s", self.ttl.as_secs()),
        });
        let request = KvRequest::put("/v1/session/create").with_body(body.to_string());
        let response = self.execute(request, "create session").await?;

        let created: CreatedSession = serde_json::from_str(&response.body).map_err(|source| {
            ElectorError::MalformedResponse {
                op: "create session",
                source: source.into(),
            }
        })?;
        info!(job = %self.job_name, session = %created.id, "created coordination session");
        *self.session.write().await = created.id;
        Ok(())
    }

    async fn destroy_session(&self) {
        let session = self.session.read().await.clone();
        if session.is_empty() {
            return;
        }
        let request = KvRequest::put(format!("/v1/session/destroy/{session}"));
        self.try_execute(request, "destroy session").await;
    }

    async fn release_lock(&self) {
        let session = self.session.read().await.clone();
        if session.is_empty() {
            return;
        }
        let request =
            KvRequest::put(format!("/v1/kv/{}", self.mastership_key)).with_query("release", session);
        self.try_execute(request, "release lock").await;
    }

    fn acquire_request(&self, session: &str) -> KvRequest {
        KvRequest::put(format!("/v1/kv/{}", self.mastership_key)).with_query("acquire", session)
    }

    /// The heartbeat renews the session at a third of the TTL for the
    /// elector's lifetime; a failed renewal is logged and retried on the next
    /// interval rather than escalated.
    fn spawn_heartbeat(&mut self) {
        if self.heartbeat.is_some() {
            return;
        }
        let transport = Arc::clone(&self.transport);
        let session = Arc::clone(&self.session);
        let token = self.shutdown.clone();
        let job_name = self.job_name.clone();
        let period = self.ttl / 3;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let id = session.read().await.clone();
                        let request = KvRequest::put(format!("/v1/session/renew/{id}"));
                        match transport.execute(request).await {
                            Ok(response) if response.is_success() => {
                                trace!(job = %job_name, "session renewed");
                            }
                            Ok(response) => {
                                error!(
                                    job = %job_name,
                                    status = response.status,
                                    body = %response.body,
                                    "failed to renew session"
                                );
                            }
                            Err(error) => {
                                warn!(job = %job_name, %error, "problem in session heartbeat");
                            }
                        }
                    }
                    _ = token.cancelled() => break,
                }
            }
        });
        self.heartbeat = Some(handle);
    }

    /// Marker keys that are missing or unreadable impose no restriction.
    async fn is_active_key_value(
        &self,
        key: &str,
        current_value: &str,
    ) -> Result<bool, ElectorError> {
        let request = KvRequest::get(format!("/v1/kv/{key}"));
        let response = self.transport.execute(request).await?;
        if !response.is_success() {
            debug!(key, status = response.status, "no readable marker key, treating as unrestricted");
            return Ok(true);
        }

        let entries: Vec<KvEntry> = serde_json::from_str(&response.body).map_err(|source| {
            ElectorError::MalformedResponse {
                op: "read marker key",
                source: source.into(),
            }
        })?;
        let Some(encoded) = entries.first().and_then(|entry| entry.value.as_deref()) else {
            return Ok(true);
        };
        if encoded.is_empty() {
            return Ok(true);
        }

        let decoded = BASE64.decode(encoded).map_err(|source| {
            ElectorError::MalformedResponse {
                op: "read marker key",
                source: source.into(),
            }
        })?;
        let marker = String::from_utf8_lossy(&decoded);
        let is_active = marker == current_value;
        debug!(key, marker = %marker, current = current_value, is_active, "marker comparison");
        Ok(is_active)
    }
}

#[async_trait]
impl MastershipElector for ConsulElector {
    #[instrument(skip_all, err, fields(job = job_name))]
    async fn init(&mut self, _lease_key: &str, job_name: &str) -> Result<(), ElectorError> {
        self.job_name = job_name.to_string();
        self.mastership_key = format!(
            "master-slave/{}/{}",
            self.identity.component(),
            job_name
        );
        self.create_session().await?;
        self.spawn_heartbeat();
        Ok(())
    }

    async fn is_ready(&self) -> bool {
        let request = KvRequest::get("/v1/agent/self");
        matches!(self.transport.execute(request).await, Ok(response) if response.is_success())
    }

    async fn is_active_version(&self, current_version: &str) -> Result<bool, ElectorError> {
        self.is_active_key_value(self.version_marker.key(), current_version)
            .await
    }

    async fn is_active_datacenter(
        &self,
        current_datacenter: &str,
    ) -> Result<bool, ElectorError> {
        self.is_active_key_value(ACTIVE_DATACENTER_KEY, current_datacenter)
            .await
    }

    #[instrument(skip_all, err, fields(job = %self.job_name))]
    async fn is_master(&self) -> Result<bool, ElectorError> {
        // Re-affirmation path: once the lock key records a session owner,
        // mastership is simply whether that owner is us. Keeps a holder from
        // contending for its own lock every cycle.
        let read = self
            .transport
            .execute(KvRequest::get(format!("/v1/kv/{}", self.mastership_key)))
            .await?;
        if read.is_success() {
            if let Ok(entries) = serde_json::from_str::<Vec<KvEntry>>(&read.body) {
                if let Some(owner) = entries
                    .first()
                    .and_then(|entry| entry.session.as_deref())
                    .filter(|owner| !owner.is_empty())
                {
                    let mine = self.session.read().await;
                    return Ok(owner == *mine);
                }
            }
        }

        let session = self.session.read().await.clone();
        let response = self.transport.execute(self.acquire_request(&session)).await?;
        let acquired = if response.is_success() {
            parse_lock_response(&response.body)
        } else {
            error!(
                key = %self.mastership_key,
                status = response.status,
                body = %response.body,
                "failed to acquire lock"
            );
            if is_invalid_session(&response.body) {
                // The session was invalidated underneath us. Recreate it and
                // retry the acquire exactly once.
                self.destroy_session().await;
                self.create_session().await?;
                let session = self.session.read().await.clone();
                match self
                    .try_execute(self.acquire_request(&session), "acquire lock")
                    .await
                {
                    Some(retry) if retry.is_success() => parse_lock_response(&retry.body),
                    _ => false,
                }
            } else {
                false
            }
        };
        debug!(key = %self.mastership_key, acquired, "lock acquisition attempt");
        Ok(acquired)
    }

    async fn cleanup_master(&self) {
        self.release_lock().await;
    }

    async fn close(&self) {
        self.release_lock().await;
        self.destroy_session().await;
        self.shutdown.cancel();
    }

    fn active_version(&self) -> Option<String> {
        self.version_marker.value().map(str::to_string)
    }
}

impl Drop for ConsulElector {
    fn drop(&mut self) {
        // The heartbeat task must not outlive the elector.
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeConsul;

    fn identity() -> InstanceIdentity {
        InstanceIdentity::new("reporting-service", "host-1").with_version("1.0")
    }

    fn config() -> JobConfig {
        JobConfig::new().with_lease_time(30)
    }

    async fn init_elector(consul: &Arc<FakeConsul>, identity: InstanceIdentity) -> ConsulElector {
        let mut elector = ConsulElector::new(
            Arc::clone(consul) as Arc<dyn KvTransport>,
            identity,
            &config(),
        );
        elector
            .init("reporting-service-reporting", "reporting")
            .await
            .unwrap();
        elector
    }

    #[tokio::test(start_paused = true)]
    async fn init_creates_a_session_and_heartbeat_renews_it() {
        let consul = Arc::new(FakeConsul::new());
        let _elector = init_elector(&consul, identity()).await;

        assert_eq!(consul.session_count(), 1);

        // Lease 30s, so the heartbeat period is 10s.
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(consul.renew_count() >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn first_instance_wins_the_lock_and_the_second_stays_slave() {
        let consul = Arc::new(FakeConsul::new());
        let first = init_elector(&consul, identity()).await;
        let second =
            init_elector(&consul, InstanceIdentity::new("reporting-service", "host-2")).await;

        assert!(first.is_master().await.unwrap());
        assert!(!second.is_master().await.unwrap());
        // The holder keeps winning on subsequent cycles.
        assert!(first.is_master().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn a_held_lock_is_reaffirmed_without_contending() {
        let consul = Arc::new(FakeConsul::new());
        let elector = init_elector(&consul, identity()).await;

        assert!(elector.is_master().await.unwrap());
        let acquires_after_first_win = consul.acquire_count();
        assert!(elector.is_master().await.unwrap());
        assert!(elector.is_master().await.unwrap());
        assert_eq!(consul.acquire_count(), acquires_after_first_win);
    }

    #[tokio::test(start_paused = true)]
    async fn an_invalidated_session_is_recreated_and_the_acquire_retried() {
        let consul = Arc::new(FakeConsul::new());
        let elector = init_elector(&consul, identity()).await;

        assert!(elector.is_master().await.unwrap());
        let old_session = consul.lock_owner("master-slave/reporting-service/reporting").unwrap();

        // Invalidate the session and drop the lock it held, as the service
        // would after a TTL expiry.
        consul.invalidate_session(&old_session);

        assert!(elector.is_master().await.unwrap());
        let new_session = consul.lock_owner("master-slave/reporting-service/reporting").unwrap();
        assert_ne!(old_session, new_session);
        // Only the recreated session is still valid.
        assert_eq!(consul.session_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn version_marker_gates_on_the_decoded_kv_value() {
        let consul = Arc::new(FakeConsul::new());
        let elector = init_elector(&consul, identity()).await;

        // No marker key at all: unrestricted.
        assert!(elector.is_active_version("1.0").await.unwrap());

        consul.set_kv("reporting-service-version", "2.0");
        assert!(!elector.is_active_version("1.0").await.unwrap());
        assert!(elector.is_active_version("2.0").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn datacenter_marker_gates_on_the_primary_datacenter_key() {
        let consul = Arc::new(FakeConsul::new());
        let elector = init_elector(&consul, identity()).await;

        assert!(elector.is_active_datacenter("us-east").await.unwrap());

        consul.set_kv(ACTIVE_DATACENTER_KEY, "us-west");
        assert!(!elector.is_active_datacenter("us-east").await.unwrap());
        assert!(elector.is_active_datacenter("us-west").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn close_releases_the_lock_and_destroys_the_session() {
        let consul = Arc::new(FakeConsul::new());
        let elector = init_elector(&consul, identity()).await;

        assert!(elector.is_master().await.unwrap());
        elector.close().await;

        assert_eq!(consul.lock_owner("master-slave/reporting-service/reporting"), None);
        assert_eq!(consul.session_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_master_releases_the_lock_but_keeps_the_session() {
        let consul = Arc::new(FakeConsul::new());
        let elector = init_elector(&consul, identity()).await;

        assert!(elector.is_master().await.unwrap());
        elector.cleanup_master().await;

        assert_eq!(consul.lock_owner("master-slave/reporting-service/reporting"), None);
        assert_eq!(consul.session_count(), 1);
        // The elector can win the lock again on a later cycle.
        assert!(elector.is_master().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn is_ready_reflects_the_agent_probe() {
        let consul = Arc::new(FakeConsul::new());
        let elector = init_elector(&consul, identity()).await;

        assert!(elector.is_ready().await);
        consul.set_agent_up(false);
        assert!(!elector.is_ready().await);
    }

    #[tokio::test(start_paused = true)]
    async fn custom_version_marker_overrides_the_component_default() {
        let consul = Arc::new(FakeConsul::new());
        let mut elector = ConsulElector::new(
            Arc::clone(&consul) as Arc<dyn KvTransport>,
            identity(),
            &config(),
        )
        .with_version_marker(VersionMarker::new("activated/stack-7", Some("7.1".to_string())));
        elector.init("reporting-service-reporting", "reporting").await.unwrap();

        assert_eq!(elector.active_version(), Some("7.1".to_string()));
        consul.set_kv("activated/stack-7", "7.1");
        assert!(elector.is_active_version("7.1").await.unwrap());
        assert!(!elector.is_active_version("7.0").await.unwrap());
    }

    #[test]
    fn lock_response_parsing_is_strict_about_true() {
        assert!(parse_lock_response("true"));
        assert!(parse_lock_response(" true\n"));
        assert!(!parse_lock_response("false"));
        assert!(!parse_lock_response("yes"));
        assert!(!parse_lock_response(""));
    }
}
