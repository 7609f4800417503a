//! In-memory fakes for the backend seams.
//!
//! These back this crate's own unit and integration tests and are usable by
//! consumers testing listeners without a live coordination service. They model
//! the documented behavior of the real services: the fake KV service grants a
//! lock only to a valid session and releases it when the session dies; the
//! fake document store applies the lease filter atomically under one lock.

use crate::consul::{HttpMethod, KvRequest, KvResponse, KvTransport};
use crate::core::elector::{ElectorError, MastershipElector};
use crate::core::listener::MasterSlaveListener;
use crate::mongo::{LeaseDocument, LeaseFilter, MasterSlaveStore};
use crate::runner::Role;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Listener that forwards every notification into a channel.
pub struct RecordingListener {
    events: UnboundedSender<Role>,
}

impl RecordingListener {
    pub fn channel() -> (Arc<Self>, UnboundedReceiver<Role>) {
        let (events, receiver) = mpsc::unbounded_channel();
        (Arc::new(Self { events }), receiver)
    }
}

#[async_trait]
impl MasterSlaveListener for RecordingListener {
    async fn go_master(&self) {
        let _ = self.events.send(Role::Master);
    }

    async fn go_slave(&self) {
        let _ = self.events.send(Role::Slave);
    }
}

/// One scripted `is_master` outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptStep {
    Master,
    Slave,
    Error,
}

/// Shared state behind a [`ScriptedElector`], kept separate so tests hold a
/// handle after the elector moves into a runner.
pub struct ScriptedState {
    script: Mutex<VecDeque<ScriptStep>>,
    repeat: Mutex<ScriptStep>,
    ready: AtomicBool,
    active_version: AtomicBool,
    active_datacenter: AtomicBool,
    init_failures_left: AtomicU32,
    init_calls: AtomicU32,
    close_calls: AtomicU32,
    cleanup_calls: AtomicU32,
    is_master_calls: AtomicU32,
    is_active_version_calls: AtomicU32,
    is_active_datacenter_calls: AtomicU32,
}

impl ScriptedState {
    pub fn with_script(script: impl IntoIterator<Item = ScriptStep>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            repeat: Mutex::new(ScriptStep::Slave),
            ready: AtomicBool::new(true),
            active_version: AtomicBool::new(true),
            active_datacenter: AtomicBool::new(true),
            init_failures_left: AtomicU32::new(0),
            init_calls: AtomicU32::new(0),
            close_calls: AtomicU32::new(0),
            cleanup_calls: AtomicU32::new(0),
            is_master_calls: AtomicU32::new(0),
            is_active_version_calls: AtomicU32::new(0),
            is_active_datacenter_calls: AtomicU32::new(0),
        })
    }

    /// Answer to repeat once the script runs dry. Also updated to the last
    /// non-error step served.
    pub fn set_repeat(&self, step: ScriptStep) {
        *self.repeat.lock().unwrap() = step;
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn set_active_version(&self, active: bool) {
        self.active_version.store(active, Ordering::SeqCst);
    }

    pub fn set_active_datacenter(&self, active: bool) {
        self.active_datacenter.store(active, Ordering::SeqCst);
    }

    /// Make the next `count` init calls fail.
    pub fn fail_next_inits(&self, count: u32) {
        self.init_failures_left.store(count, Ordering::SeqCst);
    }

    pub fn init_calls(&self) -> u32 {
        self.init_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> u32 {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn cleanup_calls(&self) -> u32 {
        self.cleanup_calls.load(Ordering::SeqCst)
    }

    pub fn is_master_calls(&self) -> u32 {
        self.is_master_calls.load(Ordering::SeqCst)
    }

    pub fn is_active_version_calls(&self) -> u32 {
        self.is_active_version_calls.load(Ordering::SeqCst)
    }

    pub fn is_active_datacenter_calls(&self) -> u32 {
        self.is_active_datacenter_calls.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> ScriptStep {
        let mut script = self.script.lock().unwrap();
        match script.pop_front() {
            Some(step) => {
                if step != ScriptStep::Error {
                    *self.repeat.lock().unwrap() = step;
                }
                step
            }
            None => *self.repeat.lock().unwrap(),
        }
    }
}

/// Elector whose `is_master` answers follow a prepared script, repeating the
/// last non-error answer once the script runs dry.
pub struct ScriptedElector {
    state: Arc<ScriptedState>,
}

impl ScriptedElector {
    pub fn with_script(script: impl IntoIterator<Item = ScriptStep>) -> Self {
        Self {
            state: ScriptedState::with_script(script),
        }
    }

    pub fn from_state(state: Arc<ScriptedState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> Arc<ScriptedState> {
        Arc::clone(&self.state)
    }
}

#[async_trait]
impl MastershipElector for ScriptedElector {
    async fn init(&mut self, _lease_key: &str, _job_name: &str) -> Result<(), ElectorError> {
        self.state.init_calls.fetch_add(1, Ordering::SeqCst);
        let failures = self.state.init_failures_left.load(Ordering::SeqCst);
        if failures > 0 {
            self.state
                .init_failures_left
                .store(failures - 1, Ordering::SeqCst);
            return Err(ElectorError::Backend(anyhow::anyhow!(
                "scripted init failure"
            )));
        }
        Ok(())
    }

    async fn is_ready(&self) -> bool {
        self.state.ready.load(Ordering::SeqCst)
    }

    async fn is_active_version(&self, _current_version: &str) -> Result<bool, ElectorError> {
        self.state
            .is_active_version_calls
            .fetch_add(1, Ordering::SeqCst);
        Ok(self.state.active_version.load(Ordering::SeqCst))
    }

    async fn is_active_datacenter(
        &self,
        _current_datacenter: &str,
    ) -> Result<bool, ElectorError> {
        self.state
            .is_active_datacenter_calls
            .fetch_add(1, Ordering::SeqCst);
        Ok(self.state.active_datacenter.load(Ordering::SeqCst))
    }

    async fn is_master(&self) -> Result<bool, ElectorError> {
        self.state.is_master_calls.fetch_add(1, Ordering::SeqCst);
        match self.state.next_step() {
            ScriptStep::Master => Ok(true),
            ScriptStep::Slave => Ok(false),
            ScriptStep::Error => Err(ElectorError::Backend(anyhow::anyhow!(
                "scripted backend failure"
            ))),
        }
    }

    async fn cleanup_master(&self) {
        self.state.cleanup_calls.fetch_add(1, Ordering::SeqCst);
    }

    async fn close(&self) {
        self.state.close_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn active_version(&self) -> Option<String> {
        Some("1.0".to_string())
    }
}

#[derive(Default)]
struct KvPair {
    value: Option<String>,
    session: Option<String>,
}

#[derive(Default)]
struct ConsulInner {
    sessions: HashSet<String>,
    kv: HashMap<String, KvPair>,
    created_sessions: u32,
}

/// In-memory KV/session coordination service behind [`KvTransport`].
///
/// Sessions are granted sequential ids; a lock acquire succeeds only for a
/// valid session against an unheld key, and invalidating or destroying a
/// session releases every lock it held.
pub struct FakeConsul {
    inner: Mutex<ConsulInner>,
    agent_up: AtomicBool,
    renew_count: AtomicU32,
    acquire_count: AtomicU32,
}

impl FakeConsul {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ConsulInner::default()),
            agent_up: AtomicBool::new(true),
            renew_count: AtomicU32::new(0),
            acquire_count: AtomicU32::new(0),
        }
    }

    /// Number of currently valid sessions.
    pub fn session_count(&self) -> usize {
        self.inner.lock().unwrap().sessions.len()
    }

    /// Number of successful session renewals.
    pub fn renew_count(&self) -> u32 {
        self.renew_count.load(Ordering::SeqCst)
    }

    /// Number of lock-acquire attempts.
    pub fn acquire_count(&self) -> u32 {
        self.acquire_count.load(Ordering::SeqCst)
    }

    /// Session currently holding the lock on `key`.
    pub fn lock_owner(&self, key: &str) -> Option<String> {
        self.inner.lock().unwrap().kv.get(key)?.session.clone()
    }

    /// Set a plain KV value, as an operator publishing a marker would.
    pub fn set_kv(&self, key: impl Into<String>, value: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        inner.kv.entry(key.into()).or_default().value = Some(value.into());
    }

    pub fn set_agent_up(&self, up: bool) {
        self.agent_up.store(up, Ordering::SeqCst);
    }

    /// Invalidate a session as the service would on TTL expiry, releasing
    /// every lock it held.
    pub fn invalidate_session(&self, id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.sessions.remove(id);
        for pair in inner.kv.values_mut() {
            if pair.session.as_deref() == Some(id) {
                pair.session = None;
            }
        }
    }
}

impl Default for FakeConsul {
    fn default() -> Self {
        Self::new()
    }
}

fn ok(body: impl Into<String>) -> KvResponse {
    KvResponse {
        status: 200,
        body: body.into(),
    }
}

fn query_param(request: &KvRequest, name: &str) -> Option<String> {
    request
        .query
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.clone())
}

#[async_trait]
impl KvTransport for FakeConsul {
    async fn execute(&self, request: KvRequest) -> Result<KvResponse, anyhow::Error> {
        let path = request.path.clone();
        match (request.method, path.as_str()) {
            (HttpMethod::Put, "/v1/session/create") => {
                let mut inner = self.inner.lock().unwrap();
                inner.created_sessions += 1;
                let id = format!("session-{}", inner.created_sessions);
                inner.sessions.insert(id.clone());
                Ok(ok(serde_json::json!({ "ID": id }).to_string()))
            }
            (HttpMethod::Put, path) if path.starts_with("/v1/session/renew/") => {
                let id = path.trim_start_matches("/v1/session/renew/");
                let inner = self.inner.lock().unwrap();
                if inner.sessions.contains(id) {
                    self.renew_count.fetch_add(1, Ordering::SeqCst);
                    Ok(ok("[]"))
                } else {
                    Ok(KvResponse {
                        status: 404,
                        body: format!("session \"{id}\" not found"),
                    })
                }
            }
            (HttpMethod::Put, path) if path.starts_with("/v1/session/destroy/") => {
                let id = path.trim_start_matches("/v1/session/destroy/");
                let mut inner = self.inner.lock().unwrap();
                inner.sessions.remove(id);
                for pair in inner.kv.values_mut() {
                    if pair.session.as_deref() == Some(id) {
                        pair.session = None;
                    }
                }
                Ok(ok("true"))
            }
            (HttpMethod::Get, "/v1/agent/self") => {
                if self.agent_up.load(Ordering::SeqCst) {
                    Ok(ok("{}"))
                } else {
                    Ok(KvResponse {
                        status: 500,
                        body: "agent down".to_string(),
                    })
                }
            }
            (HttpMethod::Get, path) if path.starts_with("/v1/kv/") => {
                let key = path.trim_start_matches("/v1/kv/");
                let inner = self.inner.lock().unwrap();
                match inner.kv.get(key) {
                    Some(pair) => {
                        let entries = serde_json::json!([{
                            "Value": pair.value.as_ref().map(|value| BASE64.encode(value)),
                            "Session": pair.session,
                        }]);
                        Ok(ok(entries.to_string()))
                    }
                    None => Ok(KvResponse {
                        status: 404,
                        body: String::new(),
                    }),
                }
            }
            (HttpMethod::Put, path) if path.starts_with("/v1/kv/") => {
                let key = path.trim_start_matches("/v1/kv/").to_string();
                if let Some(session_id) = query_param(&request, "acquire") {
                    self.acquire_count.fetch_add(1, Ordering::SeqCst);
                    let mut inner = self.inner.lock().unwrap();
                    if !inner.sessions.contains(&session_id) {
                        return Ok(KvResponse {
                            status: 500,
                            body: format!("invalid session \"{session_id}\""),
                        });
                    }
                    let pair = inner.kv.entry(key).or_default();
                    let held_by_other = pair
                        .session
                        .as_deref()
                        .is_some_and(|holder| holder != session_id);
                    if held_by_other {
                        Ok(ok("false"))
                    } else {
                        pair.session = Some(session_id);
                        Ok(ok("true"))
                    }
                } else if let Some(session_id) = query_param(&request, "release") {
                    let mut inner = self.inner.lock().unwrap();
                    let pair = inner.kv.entry(key).or_default();
                    if pair.session.as_deref() == Some(session_id.as_str()) {
                        pair.session = None;
                        Ok(ok("true"))
                    } else {
                        Ok(ok("false"))
                    }
                } else {
                    let mut inner = self.inner.lock().unwrap();
                    inner.kv.entry(key).or_default().value = request.body.clone();
                    Ok(ok("true"))
                }
            }
            _ => Ok(KvResponse {
                status: 404,
                body: "unknown route".to_string(),
            }),
        }
    }
}

/// In-memory document store behind [`MasterSlaveStore`].
///
/// `replace_lease` evaluates the filter and swaps the document under one
/// lock, giving the same single-document atomicity a real document store
/// guarantees.
pub struct MemoryStore {
    leases: Mutex<HashMap<String, LeaseDocument>>,
    datacenters: Mutex<HashSet<String>>,
    up: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
            datacenters: Mutex::new(HashSet::new()),
            up: AtomicBool::new(true),
        }
    }

    pub fn lease(&self, id: &str) -> Option<LeaseDocument> {
        self.leases.lock().unwrap().get(id).cloned()
    }

    /// Store a document directly, bypassing the lease filter.
    pub fn put_lease(&self, document: LeaseDocument) {
        self.leases
            .lock()
            .unwrap()
            .insert(document.id.clone(), document);
    }

    pub fn add_datacenter(&self, datacenter: impl Into<String>) {
        self.datacenters.lock().unwrap().insert(datacenter.into());
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MasterSlaveStore for MemoryStore {
    async fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    async fn find_lease(&self, id: &str) -> Result<Option<LeaseDocument>, anyhow::Error> {
        Ok(self.leases.lock().unwrap().get(id).cloned())
    }

    async fn insert_lease(&self, document: &LeaseDocument) -> Result<(), anyhow::Error> {
        let mut leases = self.leases.lock().unwrap();
        if leases.contains_key(&document.id) {
            anyhow::bail!("duplicate lease document '{}'", document.id);
        }
        leases.insert(document.id.clone(), document.clone());
        Ok(())
    }

    async fn replace_lease(
        &self,
        filter: &LeaseFilter,
        replacement: &LeaseDocument,
    ) -> Result<bool, anyhow::Error> {
        let mut leases = self.leases.lock().unwrap();
        match leases.get(&filter.id) {
            Some(current) if filter.matches(current) => {
                leases.insert(filter.id.clone(), replacement.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_leases_for_instance(&self, instance_id: &str) -> Result<(), anyhow::Error> {
        self.leases
            .lock()
            .unwrap()
            .retain(|_, document| document.master_instance_id != instance_id);
        Ok(())
    }

    async fn datacenter_marker_exists(&self, datacenter: &str) -> Result<bool, anyhow::Error> {
        Ok(self.datacenters.lock().unwrap().contains(datacenter))
    }
}
