//! Document-store elector: mastership is an optimistic lease document.
//!
//! Each job owns one document keyed by `component-job`. Holding mastership
//! means having stamped that document with your own instance id recently
//! enough: a lease is current while `lease_renewed` is newer than one lease
//! duration ago. Acquiring and renewing are the same operation, an atomic
//! compare-and-replace whose filter lets the current holder renew before
//! expiry and lets anyone steal an expired lease. The store's single-document
//! atomicity guarantees at most one concurrent winner per lease window.
//!
//! The driver is out of scope and injected through [`MasterSlaveStore`].

use crate::core::config::JobConfig;
use crate::core::elector::{ElectorError, MastershipElector};
use crate::core::identity::InstanceIdentity;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{instrument, trace, warn};

/// Field names of the lease document, for driver implementations mapping
/// [`LeaseDocument`] onto a real collection.
pub const FIELD_ID: &str = "_id";
pub const FIELD_MASTER_INSTANCE_ID: &str = "masterInstanceId";
pub const FIELD_LEASE_RENEWED: &str = "leaseRenewed";
pub const FIELD_ACTIVE_VERSION: &str = "activeVersion";
pub const FIELD_COMPONENT: &str = "component";
pub const FIELD_JOB: &str = "job";
/// Field of the datacenter-marker collection naming an active datacenter.
pub const FIELD_ACTIVE_DATACENTER: &str = "activeDatacenter";

/// One job's lease record as stored in the master-slave collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseDocument {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "masterInstanceId")]
    pub master_instance_id: String,
    /// Epoch milliseconds of the last renewal. Zero means never renewed, so
    /// the lease is immediately up for grabs.
    #[serde(rename = "leaseRenewed")]
    pub lease_renewed: i64,
    /// Optional staged-rollout marker naming the only version allowed to hold
    /// mastership for this job.
    #[serde(rename = "activeVersion", default, skip_serializing_if = "Option::is_none")]
    pub active_version: Option<String>,
    pub component: String,
    pub job: String,
}

/// Filter of the atomic lease replace.
///
/// Matches the document for `id` when either the lease is still held by
/// `owner` and unexpired (`lease_renewed > expired_before`, the renew path) or
/// the lease has expired (`lease_renewed <= expired_before`, the steal path).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseFilter {
    pub id: String,
    pub owner: String,
    pub expired_before: i64,
}

impl LeaseFilter {
    /// Evaluate the filter against a candidate document. Driver
    /// implementations translating the filter into a native query can use
    /// this as the reference semantics.
    pub fn matches(&self, document: &LeaseDocument) -> bool {
        document.id == self.id
            && ((document.master_instance_id == self.owner
                && document.lease_renewed > self.expired_before)
                || document.lease_renewed <= self.expired_before)
    }
}

/// Document-store driver seam: the master-slave collection plus the
/// datacenter-marker collection.
///
/// Implementations must be safe for concurrent use by every job runner in the
/// process.
#[async_trait]
pub trait MasterSlaveStore: Send + Sync {
    /// Cheap liveness probe of the store connection.
    async fn is_up(&self) -> bool;

    async fn find_lease(&self, id: &str) -> Result<Option<LeaseDocument>, anyhow::Error>;

    async fn insert_lease(&self, document: &LeaseDocument) -> Result<(), anyhow::Error>;

    /// Atomically replace the single document matching `filter` with
    /// `replacement`, returning `true` iff a document matched and was
    /// replaced. Must be a true compare-and-replace: the filter evaluation
    /// and the write have to be atomic with respect to concurrent callers.
    async fn replace_lease(
        &self,
        filter: &LeaseFilter,
        replacement: &LeaseDocument,
    ) -> Result<bool, anyhow::Error>;

    /// Best-effort removal of the lease records owned by an instance.
    async fn delete_leases_for_instance(&self, instance_id: &str) -> Result<(), anyhow::Error>;

    /// Whether a datacenter-marker document exists for `datacenter`.
    async fn datacenter_marker_exists(&self, datacenter: &str) -> Result<bool, anyhow::Error>;
}

/// Optimistic-lease implementation of [`MastershipElector`].
pub struct MongoElector {
    store: Arc<dyn MasterSlaveStore>,
    identity: InstanceIdentity,
    lease_time: u64,
    single_across_versions: bool,
    lease_key: String,
    job_name: String,
    /// Last fetched lease document; carried between cycles so a replace
    /// preserves marker fields this elector does not own.
    document: Mutex<Option<LeaseDocument>>,
}

impl MongoElector {
    pub fn new(
        store: Arc<dyn MasterSlaveStore>,
        identity: InstanceIdentity,
        config: &JobConfig,
    ) -> Self {
        Self {
            store,
            identity,
            lease_time: config.lease_time,
            single_across_versions: config.single_across_versions,
            lease_key: String::new(),
            job_name: String::new(),
            document: Mutex::new(None),
        }
    }

    fn blank_document(&self) -> LeaseDocument {
        LeaseDocument {
            id: self.lease_key.clone(),
            master_instance_id: self.identity.instance_id().to_string(),
            lease_renewed: 0,
            active_version: None,
            component: self.identity.component().to_string(),
            job: self.job_name.clone(),
        }
    }

    async fn fetch_or_create(&self) -> Result<LeaseDocument, ElectorError> {
        if let Some(existing) = self.store.find_lease(&self.lease_key).await? {
            return Ok(existing);
        }
        let document = self.blank_document();
        self.store.insert_lease(&document).await?;
        Ok(document)
    }
}

#[async_trait]
impl MastershipElector for MongoElector {
    #[instrument(skip_all, err, fields(job = job_name, lease_key = lease_key))]
    async fn init(&mut self, lease_key: &str, job_name: &str) -> Result<(), ElectorError> {
        self.lease_key = lease_key.to_string();
        self.job_name = job_name.to_string();
        if self.store.is_up().await {
            let document = self.fetch_or_create().await?;
            *self.document.lock().await = Some(document);
        }
        Ok(())
    }

    async fn is_ready(&self) -> bool {
        self.store.is_up().await
    }

    async fn is_active_version(&self, current_version: &str) -> Result<bool, ElectorError> {
        let document = self.fetch_or_create().await?;
        trace!(document = ?document, "lease document in store");
        let marker = document.active_version.clone();
        *self.document.lock().await = Some(document);

        match marker.as_deref() {
            Some(marker) if !marker.is_empty() && self.single_across_versions => {
                Ok(!current_version.is_empty() && current_version == marker)
            }
            _ => Ok(true),
        }
    }

    async fn is_active_datacenter(
        &self,
        current_datacenter: &str,
    ) -> Result<bool, ElectorError> {
        Ok(self
            .store
            .datacenter_marker_exists(current_datacenter)
            .await?)
    }

    #[instrument(skip_all, err, fields(job = %self.job_name))]
    async fn is_master(&self) -> Result<bool, ElectorError> {
        let now = Utc::now().timestamp_millis();
        let expired_before = now - (self.lease_time as i64) * 1000;

        let mut cache = self.document.lock().await;
        let mut replacement = match cache.as_ref() {
            Some(document) => document.clone(),
            None => self.fetch_or_create().await?,
        };
        replacement.master_instance_id = self.identity.instance_id().to_string();
        replacement.lease_renewed = now;

        let filter = LeaseFilter {
            id: self.lease_key.clone(),
            owner: self.identity.instance_id().to_string(),
            expired_before,
        };
        trace!(
            id = %self.lease_key,
            now,
            lease_time = self.lease_time,
            expired_before,
            "attempting lease replace"
        );
        let replaced = self.store.replace_lease(&filter, &replacement).await?;
        if replaced {
            *cache = Some(replacement);
        }
        Ok(replaced)
    }

    async fn close(&self) {
        if let Err(error) = self
            .store
            .delete_leases_for_instance(self.identity.instance_id())
            .await
        {
            warn!(job = %self.job_name, %error, "failed to clean up lease records on close");
        }
        *self.document.lock().await = None;
    }

    fn active_version(&self) -> Option<String> {
        self.identity.version().map(str::to_string)
    }
}
