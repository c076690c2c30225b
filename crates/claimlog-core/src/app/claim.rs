//! Claim protocol: acquire exclusive ownership of one eligible task.
//!
//! # Flow (per attempt)
//! 1. sync the branch head
//! 2. enumerate eligible tasks in the allowed namespaces that the worker's
//!    capabilities match
//! 3. rank (priority desc, namespace, id) and take the best
//! 4. apply `ready -> claimed` through the task's transition guard
//! 5. publish `ready -> claimed` against the revision that was read
//! 6. rejected: drop the mutation, back off, go to 1
//!
//! The substrate orders publishes on a branch, so of N workers racing for the
//! same head exactly one publish lands and the others see `Rejected`.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use super::Services;
use super::router::{self, NamespaceScope};
use crate::backlog::Backlog;
use crate::domain::{BranchName, Lifecycle, Namespace, TaskId, TaskState, WorkerId};
use crate::error::ClaimError;
use crate::ports::{PublishOutcome, Revision};

/// Proof that a claim was *published*, nothing more.
///
/// Ownership is advisory: the lease can be reclaimed at any time after
/// `published_at` without the holder being told. Use [`Lease::verify`] against
/// a fresh view before relying on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lease {
    pub namespace: Namespace,
    pub task_id: TaskId,
    pub owner: WorkerId,
    pub branch: BranchName,

    /// Revision that contains the claim.
    pub published_at: Revision,
    pub claimed_at: DateTime<Utc>,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseStatus {
    /// The view still shows this exact claim.
    Held,

    /// Reclaimed, completed, re-claimed by someone else or gone.
    Lost {
        state: Option<TaskState>,
        holder: Option<WorkerId>,
    },
}

impl Lease {
    pub fn verify(&self, backlog: &Backlog) -> LeaseStatus {
        let Some(task) = backlog.get(&self.namespace, &self.task_id) else {
            return LeaseStatus::Lost {
                state: None,
                holder: None,
            };
        };
        match &task.lifecycle {
            Lifecycle::Claimed(claim)
                if claim.is_owned_by(&self.owner) && claim.attempt == self.attempt =>
            {
                LeaseStatus::Held
            }
            _ => LeaseStatus::Lost {
                state: Some(task.state()),
                holder: task.holder().cloned(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed(Lease),

    /// Nothing eligible in scope right now. Not an error.
    NoEligibleTask,
}

#[derive(Clone)]
pub struct ClaimProtocol {
    services: Services,

    /// Offered by the claiming worker. Empty = only unrestricted tasks.
    capabilities: BTreeSet<String>,
}

impl ClaimProtocol {
    pub fn new(services: Services) -> Self {
        Self {
            services,
            capabilities: BTreeSet::new(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: BTreeSet<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub async fn claim(
        &self,
        worker: &WorkerId,
        scope: &NamespaceScope,
        branch: &BranchName,
    ) -> Result<ClaimOutcome, ClaimError> {
        let retry = self.services.retry;

        for attempt in 0..retry.max_attempts {
            let backlog = self.services.load(branch).await?;
            let namespaces = router::discover(&backlog, scope);

            let Some(task) = backlog
                .eligible(&namespaces, &self.capabilities)
                .into_iter()
                .next()
            else {
                debug!(worker = %worker, revision = %backlog.revision(), "no eligible task");
                return Ok(ClaimOutcome::NoEligibleTask);
            };

            // 状態遷移のチェックはここ（ready 以外なら TransitionError）
            let now = self.services.clock.now();
            let claimed = task.claim(worker, now)?;
            let message = format!("[CLAIM] {worker} claimed {}/{}", task.namespace, task.id);

            match self
                .services
                .publish_task::<ClaimError>(branch, backlog.revision(), &claimed, message)
                .await?
            {
                PublishOutcome::Published(revision) => {
                    info!(
                        worker = %worker,
                        namespace = %claimed.namespace,
                        task = %claimed.id,
                        attempt,
                        revision = %revision,
                        "task claimed"
                    );
                    return Ok(ClaimOutcome::Claimed(Lease {
                        namespace: claimed.namespace.clone(),
                        task_id: claimed.id.clone(),
                        owner: worker.clone(),
                        branch: branch.clone(),
                        published_at: revision,
                        claimed_at: now,
                        attempt: claimed.claim_count,
                    }));
                }
                PublishOutcome::Rejected => {
                    debug!(
                        worker = %worker,
                        namespace = %task.namespace,
                        task = %task.id,
                        attempt,
                        "claim lost the race"
                    );
                    if retry.allows_retry(attempt) {
                        self.services.back_off(attempt).await;
                    }
                }
            }
        }

        Err(ClaimError::ExhaustedRetries {
            attempts: retry.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Fixture, id, ns, worker};
    use crate::domain::Task;

    #[tokio::test]
    async fn claims_highest_priority_task() {
        let fx = Fixture::new();
        fx.put(Task::new(ns("api"), id("LOW"), 1)).await;
        fx.put(Task::new(ns("api"), id("HIGH"), 9)).await;

        let outcome = fx
            .claims()
            .claim(&worker("w1"), &NamespaceScope::All, &fx.branch)
            .await
            .unwrap();

        let ClaimOutcome::Claimed(lease) = outcome else {
            panic!("expected a claim, got {outcome:?}");
        };
        assert_eq!(lease.task_id, id("HIGH"));
        assert_eq!(lease.attempt, 1);

        let task = fx.task(&ns("api"), &id("HIGH")).await;
        assert_eq!(task.holder(), Some(&worker("w1")));
        assert_eq!(lease.verify(&fx.backlog().await), LeaseStatus::Held);
    }

    #[tokio::test]
    async fn empty_scope_is_no_work() {
        let fx = Fixture::new();
        fx.put(Task::new(ns("api"), id("T-1"), 1)).await;

        let outcome = fx
            .claims()
            .claim(&worker("w1"), &NamespaceScope::Pinned(ns("web")), &fx.branch)
            .await
            .unwrap();
        assert_eq!(outcome, ClaimOutcome::NoEligibleTask);
    }

    #[tokio::test]
    async fn capabilities_decide_who_may_claim() {
        let fx = Fixture::new();
        fx.put(Task::new(ns("api"), id("ML"), 9).with_required_capabilities(["gpu"]))
            .await;

        let plain = fx
            .claims()
            .claim(&worker("w1"), &NamespaceScope::All, &fx.branch)
            .await
            .unwrap();
        assert_eq!(plain, ClaimOutcome::NoEligibleTask);

        let outcome = fx
            .claims()
            .with_capabilities(BTreeSet::from(["gpu".to_string()]))
            .claim(&worker("w2"), &NamespaceScope::All, &fx.branch)
            .await
            .unwrap();
        let ClaimOutcome::Claimed(lease) = outcome else {
            panic!("expected a claim, got {outcome:?}");
        };
        assert_eq!(lease.task_id, id("ML"));
        assert_eq!(lease.owner, worker("w2"));
    }

    #[tokio::test]
    async fn lost_races_back_off_then_exhaust() {
        let fx = Fixture::new();
        fx.put(Task::new(ns("api"), id("T-1"), 1)).await;
        fx.substrate.reject_next_publishes(10);

        let err = fx
            .claims()
            .claim(&worker("w1"), &NamespaceScope::All, &fx.branch)
            .await
            .unwrap_err();

        assert!(matches!(err, ClaimError::ExhaustedRetries { attempts: 5 }));
        // one sleep between each pair of attempts
        let delays = fx.sleeper.delays();
        assert_eq!(delays.len(), 4);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(fx.task(&ns("api"), &id("T-1")).await.state(), TaskState::Ready);
    }

    #[tokio::test]
    async fn retry_after_rejection_can_succeed() {
        let fx = Fixture::new();
        fx.put(Task::new(ns("api"), id("T-1"), 1)).await;
        fx.substrate.reject_next_publishes(2);

        let outcome = fx
            .claims()
            .claim(&worker("w1"), &NamespaceScope::All, &fx.branch)
            .await
            .unwrap();
        assert!(matches!(outcome, ClaimOutcome::Claimed(_)));
        assert_eq!(fx.sleeper.delays().len(), 2);
    }

    #[tokio::test]
    async fn lease_is_lost_once_the_task_is_claimed_again() {
        let fx = Fixture::new();
        fx.put(Task::new(ns("api"), id("T-1"), 1)).await;

        let ClaimOutcome::Claimed(first) = fx
            .claims()
            .claim(&worker("w1"), &NamespaceScope::All, &fx.branch)
            .await
            .unwrap()
        else {
            panic!("expected a claim");
        };

        let expired = fx.task(&ns("api"), &id("T-1")).await.expire().unwrap();
        fx.put(expired).await;
        let ClaimOutcome::Claimed(second) = fx
            .claims()
            .claim(&worker("w1"), &NamespaceScope::All, &fx.branch)
            .await
            .unwrap()
        else {
            panic!("expected a claim");
        };

        let backlog = fx.backlog().await;
        assert_eq!(second.attempt, 2);
        assert_eq!(second.verify(&backlog), LeaseStatus::Held);
        assert!(matches!(first.verify(&backlog), LeaseStatus::Lost { .. }));
    }
}
