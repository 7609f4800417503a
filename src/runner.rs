//! Per-job election state machine.
//!
//! One [`ElectionRunner`] runs per registered job, on its own task. Each cycle
//! it applies the datacenter and version gates, consults the elector under the
//! job's multiplicity policy, and notifies the listener only on an actual role
//! change. Decisions for one job never overlap; the cycle interval equals the
//! lease duration so a held lease is renewed at least once per cycle.

use crate::core::config::{JobConfig, Multiplicity};
use crate::core::elector::{BoxedElector, ElectorError};
use crate::core::identity::InstanceIdentity;
use crate::core::listener::MasterSlaveListener;
use crate::core::CancellationToken;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Role last notified to a job's listener.
///
/// `Unset` is the state before the first decision, so the first determined
/// role always fires its callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Unset,
    Master,
    Slave,
}

/// Options for the election runner.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct RunnerOptions {
    /// Pause before the first decision, giving the backend connection time to
    /// finish its own asynchronous warm-up (default: 2 seconds).
    pub startup_grace: Duration,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            startup_grace: Duration::from_secs(2),
        }
    }
}

/// Decide-and-notify loop for one job.
///
/// Runs until its cancellation token fires; cancellation short-circuits the
/// between-cycle sleep but never interrupts a cycle in flight, and the elector
/// is closed exactly once on the way out.
pub struct ElectionRunner {
    job_name: String,
    config: JobConfig,
    instance_id: String,
    datacenter: Option<String>,
    elector: BoxedElector,
    listener: Arc<dyn MasterSlaveListener>,
    shutdown: CancellationToken,
    options: RunnerOptions,
    last_notified: Role,
}

impl ElectionRunner {
    pub fn new(
        job_name: impl Into<String>,
        config: JobConfig,
        identity: &InstanceIdentity,
        elector: BoxedElector,
        listener: Arc<dyn MasterSlaveListener>,
        shutdown: CancellationToken,
        options: RunnerOptions,
    ) -> Self {
        Self {
            job_name: job_name.into(),
            config,
            instance_id: identity.instance_id().to_string(),
            datacenter: identity.datacenter().map(str::to_string),
            elector,
            listener,
            shutdown,
            options,
            last_notified: Role::Unset,
        }
    }

    pub async fn run(mut self) {
        tokio::select! {
            _ = tokio::time::sleep(self.options.startup_grace) => {}
            _ = self.shutdown.cancelled() => {}
        }

        let current_version = self.elector.active_version().unwrap_or_default();
        let cycle = self.config.lease_duration();

        while !self.shutdown.is_cancelled() {
            if let Err(error) = self.decide(&current_version).await {
                warn!(
                    job = %self.job_name,
                    %error,
                    "problem running election cycle, retrying once"
                );
                if let Err(error) = self.decide(&current_version).await {
                    error!(
                        job = %self.job_name,
                        %error,
                        "election cycle failed twice, falling back to slave"
                    );
                    self.notify(Role::Slave).await;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(cycle) => {}
                _ = self.shutdown.cancelled() => {}
            }
        }

        self.elector.close().await;
        debug!(job = %self.job_name, "election runner stopped");
    }

    async fn decide(&mut self, current_version: &str) -> Result<(), ElectorError> {
        let role = self.evaluate(current_version).await?;
        self.notify(role).await;
        Ok(())
    }

    async fn evaluate(&self, current_version: &str) -> Result<Role, ElectorError> {
        if !self.datacenter_gate().await? {
            debug!(job = %self.job_name, "not in the active datacenter");
            return Ok(Role::Slave);
        }
        if !self.elector.is_ready().await {
            debug!(job = %self.job_name, "backend not ready, staying slave for this cycle");
            return Ok(Role::Slave);
        }
        if !self.version_gate(current_version).await? {
            debug!(job = %self.job_name, current_version, "not the active version");
            return Ok(Role::Slave);
        }

        match self.config.multiplicity {
            // Every qualifying instance acts as master; the lease is never
            // contended.
            Multiplicity::Multi => Ok(Role::Master),
            Multiplicity::Single => Ok(if self.elector.is_master().await? {
                Role::Master
            } else {
                Role::Slave
            }),
        }
    }

    async fn datacenter_gate(&self) -> Result<bool, ElectorError> {
        if !self.config.single_across_datacenters {
            return Ok(true);
        }
        match self.datacenter.as_deref().filter(|dc| !dc.is_empty()) {
            Some(datacenter) => self.elector.is_active_datacenter(datacenter).await,
            // No datacenter tag on this instance: single-datacenter deployment.
            None => Ok(true),
        }
    }

    async fn version_gate(&self, current_version: &str) -> Result<bool, ElectorError> {
        if !self.config.single_across_versions {
            return Ok(true);
        }
        self.elector.is_active_version(current_version).await
    }

    async fn notify(&mut self, role: Role) {
        if role == self.last_notified {
            return;
        }
        match role {
            Role::Master => {
                info!(job = %self.job_name, instance = %self.instance_id, "instance is now master");
                self.listener.go_master().await;
            }
            Role::Slave => {
                info!(job = %self.job_name, instance = %self.instance_id, "instance is now slave");
                self.listener.go_slave().await;
            }
            Role::Unset => return,
        }
        self.last_notified = role;
    }
}
