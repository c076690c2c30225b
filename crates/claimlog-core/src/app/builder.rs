//! CoordinatorBuilder - wiring and fail-fast validation.
//!
//! # Usage
//! ```ignore
//! let coordinator = CoordinatorBuilder::new(substrate)
//!     .config(CoordinationConfig::load(None)?)
//!     .build()?;
//!
//! match coordinator.claim(&worker, None).await? {
//!     ClaimOutcome::Claimed(lease) => { /* ... */ }
//!     ClaimOutcome::NoEligibleTask => { /* idle */ }
//! }
//! ```
//!
//! `build()` validates the configuration, so a bad lease/heartbeat ratio is
//! reported at startup instead of as lost leases in production.

use std::sync::Arc;
use std::time::Duration;

use super::Services;
use super::claim::{ClaimOutcome, ClaimProtocol, Lease};
use super::complete::{Completion, CompletionOutcome};
use super::heartbeat::{HeartbeatHandle, HeartbeatManager, Renewed};
use super::reaper_loop::{ReaperLoop, ReclaimReport, Reclaimer};
use super::router::NamespaceScope;
use super::status::BacklogStatus;
use super::worker_loop::{TaskRunner, WorkerLoop};
use crate::backlog::Jitter;
use crate::config::CoordinationConfig;
use crate::domain::{BranchName, Namespace, TaskId, WorkerId};
use crate::error::{ClaimError, CompleteError, ConfigError, HeartbeatError, SubstrateError};
use crate::ports::{Clock, Sleeper, Substrate, SystemClock, TokioSleeper};

pub struct CoordinatorBuilder {
    substrate: Arc<dyn Substrate>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    config: CoordinationConfig,
    jitter: Jitter,
}

impl CoordinatorBuilder {
    pub fn new(substrate: Arc<dyn Substrate>) -> Self {
        Self {
            substrate,
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(TokioSleeper),
            config: CoordinationConfig::default(),
            jitter: Jitter::Entropy,
        }
    }

    pub fn config(mut self, config: CoordinationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn build(self) -> Result<Coordinator, ConfigError> {
        self.config.validate()?;

        let mut retry = self.config.retry_policy();
        retry.jitter = self.jitter;

        Ok(Coordinator {
            services: Services {
                substrate: self.substrate,
                clock: self.clock,
                sleeper: self.sleeper,
                layout: self.config.layout(),
                retry,
            },
            config: self.config,
        })
    }
}

/// The operation surface, bound to one configuration.
#[derive(Clone)]
pub struct Coordinator {
    services: Services,
    config: CoordinationConfig,
}

impl Coordinator {
    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    pub fn branch(&self) -> &BranchName {
        &self.config.branch
    }

    /// Scope for an optional caller filter inside the configured allow-list.
    pub fn scope(&self, namespace: Option<Namespace>) -> NamespaceScope {
        NamespaceScope::resolve(namespace, &self.config.namespaces)
    }

    pub async fn claim(
        &self,
        worker: &WorkerId,
        namespace: Option<Namespace>,
    ) -> Result<ClaimOutcome, ClaimError> {
        ClaimProtocol::new(self.services.clone())
            .with_capabilities(self.config.capabilities.clone())
            .claim(worker, &self.scope(namespace), self.branch())
            .await
    }

    pub async fn heartbeat(
        &self,
        namespace: &Namespace,
        task_id: &TaskId,
        worker: &WorkerId,
    ) -> Result<Renewed, HeartbeatError> {
        HeartbeatManager::new(self.services.clone())
            .beat(self.branch(), namespace, task_id, worker)
            .await
    }

    pub fn start_heartbeat(&self, lease: Lease) -> HeartbeatHandle {
        HeartbeatManager::new(self.services.clone()).start(lease, self.config.heartbeat_interval())
    }

    pub async fn complete(
        &self,
        namespace: &Namespace,
        task_id: &TaskId,
        worker: &WorkerId,
        external_ref: Option<String>,
    ) -> Result<CompletionOutcome, CompleteError> {
        Completion::new(self.services.clone())
            .complete(self.branch(), namespace, task_id, worker, external_ref)
            .await
    }

    /// One sweep with the configured lease timeout.
    pub async fn reclaim(&self) -> Result<ReclaimReport, SubstrateError> {
        self.reclaim_with(self.config.lease_timeout(), self.branch())
            .await
    }

    pub async fn reclaim_with(
        &self,
        timeout: Duration,
        branch: &BranchName,
    ) -> Result<ReclaimReport, SubstrateError> {
        Reclaimer::new(self.services.clone())
            .sweep(branch, timeout)
            .await
    }

    pub async fn status(&self) -> Result<BacklogStatus, SubstrateError> {
        let backlog = self.services.load(self.branch()).await?;
        Ok(BacklogStatus::from_backlog(
            &backlog,
            self.services.clock.now(),
            self.config.lease_timeout(),
        ))
    }

    pub fn worker_loop(
        &self,
        worker: WorkerId,
        namespace: Option<Namespace>,
        runner: Arc<dyn TaskRunner>,
    ) -> WorkerLoop {
        WorkerLoop::new(self.services.clone(), worker, runner)
            .scope(self.scope(namespace))
            .capabilities(self.config.capabilities.clone())
            .branch(self.config.branch.clone())
            .heartbeat_interval(self.config.heartbeat_interval())
            .poll_interval(self.config.poll_interval())
    }

    pub fn spawn_reaper(&self) -> ReaperLoop {
        ReaperLoop::spawn(
            Reclaimer::new(self.services.clone()),
            self.config.branch.clone(),
            self.config.lease_timeout(),
            self.config.reclaim_interval(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Task;
    use crate::impls::InMemorySubstrate;
    use crate::test_support::{id, ns, worker};

    fn substrate() -> Arc<InMemorySubstrate> {
        Arc::new(InMemorySubstrate::new())
    }

    #[test]
    fn build_success() {
        assert!(CoordinatorBuilder::new(substrate()).build().is_ok());
    }

    #[test]
    fn build_rejects_short_lease() {
        let config = CoordinationConfig {
            lease_timeout_secs: 10,
            heartbeat_interval_secs: 10,
            ..CoordinationConfig::default()
        };
        let result = CoordinatorBuilder::new(substrate()).config(config).build();
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[tokio::test]
    async fn allow_list_limits_claims() {
        let substrate = substrate();
        let branch = BranchName::default();
        substrate.put_task(&branch, &Task::new(ns("api"), id("T-1"), 9)).await.unwrap();
        substrate.put_task(&branch, &Task::new(ns("web"), id("T-2"), 1)).await.unwrap();

        let config = CoordinationConfig {
            namespaces: vec![ns("web")],
            ..CoordinationConfig::default()
        };
        let coordinator = CoordinatorBuilder::new(substrate)
            .config(config)
            .build()
            .unwrap();

        let ClaimOutcome::Claimed(lease) = coordinator.claim(&worker("w1"), None).await.unwrap()
        else {
            panic!("expected a claim");
        };
        assert_eq!(lease.task_id, id("T-2"));

        // outside the allow-list: nothing, even though api has work
        assert_eq!(
            coordinator.claim(&worker("w2"), Some(ns("api"))).await.unwrap(),
            ClaimOutcome::NoEligibleTask
        );
    }
}
