//! Heartbeat / lease manager.
//!
//! A heartbeat rewrites `last_heartbeat` on a claim the caller owns. It never
//! creates a claim: once the reclaimer has put the task back to `ready`, the
//! old owner gets `OwnershipMismatch` and nothing is resurrected.
//!
//! `HeartbeatHandle` runs beats on a cadence in the background and reports the
//! first permanent failure through a watch channel.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::Services;
use super::claim::Lease;
use crate::domain::{BranchName, Lifecycle, Namespace, TaskId, WorkerId};
use crate::error::HeartbeatError;
use crate::ports::{PublishOutcome, Revision};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Renewed {
    pub at: DateTime<Utc>,
    pub revision: Revision,
}

#[derive(Clone)]
pub struct HeartbeatManager {
    services: Services,
}

impl HeartbeatManager {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    pub async fn beat(
        &self,
        branch: &BranchName,
        namespace: &Namespace,
        task_id: &TaskId,
        worker: &WorkerId,
    ) -> Result<Renewed, HeartbeatError> {
        let retry = self.services.retry;

        for attempt in 0..retry.max_attempts {
            let backlog = self.services.load(branch).await?;
            let Some(task) = backlog.get(namespace, task_id) else {
                return Err(HeartbeatError::NotFound {
                    namespace: namespace.clone(),
                    task: task_id.clone(),
                });
            };

            match &task.lifecycle {
                Lifecycle::Claimed(claim) if claim.is_owned_by(worker) => {}
                Lifecycle::Completed(_) => {
                    return Err(HeartbeatError::NotClaimed {
                        namespace: namespace.clone(),
                        task: task_id.clone(),
                        state: task.state(),
                    });
                }
                _ => {
                    return Err(HeartbeatError::OwnershipMismatch {
                        namespace: namespace.clone(),
                        task: task_id.clone(),
                        worker: worker.clone(),
                        holder: task.holder().cloned(),
                    });
                }
            }

            let now = self.services.clock.now();
            let renewed = task.renew(now)?;
            let message = format!("[HEARTBEAT] {worker} renewed {namespace}/{task_id}");

            match self
                .services
                .publish_task::<HeartbeatError>(branch, backlog.revision(), &renewed, message)
                .await?
            {
                PublishOutcome::Published(revision) => {
                    debug!(worker = %worker, namespace = %namespace, task = %task_id, revision = %revision, "lease renewed");
                    return Ok(Renewed { at: now, revision });
                }
                PublishOutcome::Rejected => {
                    // 所有者かどうかは次の sync で再確認する
                    debug!(worker = %worker, namespace = %namespace, task = %task_id, attempt, "heartbeat rejected");
                    if retry.allows_retry(attempt) {
                        self.services.back_off(attempt).await;
                    }
                }
            }
        }

        Err(HeartbeatError::PublishFailed {
            namespace: namespace.clone(),
            task: task_id.clone(),
            attempts: retry.max_attempts,
        })
    }

    pub async fn beat_lease(&self, lease: &Lease) -> Result<Renewed, HeartbeatError> {
        self.beat(&lease.branch, &lease.namespace, &lease.task_id, &lease.owner)
            .await
    }

    /// Renew `lease` every `interval` until stopped or the lease is lost.
    ///
    /// Transient failures (substrate errors, a consumed retry budget) are
    /// logged and the next tick tries again; if they last longer than the
    /// lease timeout the reclaimer wins and the next beat reports it.
    pub fn start(&self, lease: Lease, interval: Duration) -> HeartbeatHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let (signal_tx, signal_rx) = watch::channel(LeaseSignal::Alive);
        let manager = self.clone();

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the claim itself counts as the first beat
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {}
                }

                match manager.beat_lease(&lease).await {
                    Ok(_) => {}
                    Err(err) if err.is_lease_lost() => {
                        warn!(
                            worker = %lease.owner,
                            namespace = %lease.namespace,
                            task = %lease.task_id,
                            error = %err,
                            "lease lost"
                        );
                        let _ = signal_tx.send(LeaseSignal::Lost(err.to_string()));
                        break;
                    }
                    Err(err) => {
                        warn!(
                            worker = %lease.owner,
                            namespace = %lease.namespace,
                            task = %lease.task_id,
                            error = %err,
                            "heartbeat failed, will retry on next tick"
                        );
                    }
                }
            }
            info!(worker = %lease.owner, task = %lease.task_id, "heartbeat stopped");
        });

        HeartbeatHandle {
            stop_tx,
            signal_rx,
            join,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseSignal {
    Alive,
    Lost(String),
}

/// Background heartbeat for one lease.
/// - `stop()` で停止し、タスクの終了を待つ
/// - drop しても止まる（送信側が消えると `changed()` がエラーになる）
pub struct HeartbeatHandle {
    stop_tx: watch::Sender<bool>,
    signal_rx: watch::Receiver<LeaseSignal>,
    join: JoinHandle<()>,
}

impl HeartbeatHandle {
    pub fn signal(&self) -> LeaseSignal {
        self.signal_rx.borrow().clone()
    }

    /// Receiver that changes once, to `Lost`.
    pub fn subscribe(&self) -> watch::Receiver<LeaseSignal> {
        self.signal_rx.clone()
    }

    pub async fn stop(self) -> LeaseSignal {
        let _ = self.stop_tx.send(true);
        let _ = self.join.await;
        self.signal_rx.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Task, TaskState};
    use crate::ports::Clock;
    use crate::test_support::{Fixture, id, ns, worker};

    async fn claimed(fx: &Fixture, owner: &str) -> Task {
        let task = Task::new(ns("api"), id("T-1"), 1)
            .claim(&worker(owner), fx.clock.now())
            .unwrap();
        fx.put(task.clone()).await;
        task
    }

    #[tokio::test]
    async fn owner_renews_heartbeat() {
        let fx = Fixture::new();
        claimed(&fx, "w1").await;
        fx.clock.advance(Duration::from_secs(12));

        let renewed = fx
            .heartbeats()
            .beat(&fx.branch, &ns("api"), &id("T-1"), &worker("w1"))
            .await
            .unwrap();

        let task = fx.task(&ns("api"), &id("T-1")).await;
        let claim = task.claim_record().unwrap();
        assert_eq!(claim.last_heartbeat, Some(renewed.at));
        assert_eq!(renewed.at, fx.clock.now());
    }

    #[tokio::test]
    async fn other_worker_gets_ownership_mismatch() {
        let fx = Fixture::new();
        claimed(&fx, "w1").await;

        let err = fx
            .heartbeats()
            .beat(&fx.branch, &ns("api"), &id("T-1"), &worker("w2"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HeartbeatError::OwnershipMismatch { holder: Some(ref h), .. } if h == &worker("w1")
        ));
        assert!(err.is_lease_lost());
    }

    #[tokio::test]
    async fn completed_task_is_not_claimed() {
        let fx = Fixture::new();
        let task = claimed(&fx, "w1").await;
        fx.put(task.complete(&worker("w1"), fx.clock.now(), None).unwrap()).await;

        let err = fx
            .heartbeats()
            .beat(&fx.branch, &ns("api"), &id("T-1"), &worker("w1"))
            .await
            .unwrap_err();
        assert!(matches!(err, HeartbeatError::NotClaimed { state: TaskState::Completed, .. }));
    }

    #[tokio::test]
    async fn missing_task_is_not_found() {
        let fx = Fixture::new();
        let err = fx
            .heartbeats()
            .beat(&fx.branch, &ns("api"), &id("NOPE"), &worker("w1"))
            .await
            .unwrap_err();
        assert!(matches!(err, HeartbeatError::NotFound { .. }));
    }

    #[tokio::test]
    async fn rejections_are_retried_then_reported() {
        let fx = Fixture::new();
        claimed(&fx, "w1").await;
        fx.substrate.reject_next_publishes(2);

        fx.heartbeats()
            .beat(&fx.branch, &ns("api"), &id("T-1"), &worker("w1"))
            .await
            .unwrap();
        assert_eq!(fx.sleeper.delays().len(), 2);

        fx.substrate.reject_next_publishes(100);
        let err = fx
            .heartbeats()
            .beat(&fx.branch, &ns("api"), &id("T-1"), &worker("w1"))
            .await
            .unwrap_err();
        assert!(matches!(err, HeartbeatError::PublishFailed { attempts: 5, .. }));
        assert!(!err.is_lease_lost());
    }

    #[tokio::test(start_paused = true)]
    async fn background_heartbeat_signals_lost_lease() {
        let fx = Fixture::new();
        let task = claimed(&fx, "w1").await;
        let lease = fx.lease_for(&task).await;

        let handle = fx.heartbeats().start(lease, Duration::from_secs(10));
        let mut signal = handle.subscribe();

        // reclaimed behind the worker's back
        fx.put(task.expire().unwrap()).await;

        signal.changed().await.unwrap();
        assert!(matches!(handle.signal(), LeaseSignal::Lost(_)));
        assert!(matches!(handle.stop().await, LeaseSignal::Lost(_)));
        assert_eq!(fx.task(&ns("api"), &id("T-1")).await.state(), TaskState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn background_heartbeat_keeps_lease_fresh() {
        let fx = Fixture::new();
        let task = claimed(&fx, "w1").await;
        let lease = fx.lease_for(&task).await;

        let handle = fx.heartbeats().start(lease, Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(handle.stop().await, LeaseSignal::Alive);

        let task = fx.task(&ns("api"), &id("T-1")).await;
        assert!(task.claim_record().unwrap().last_heartbeat.is_some());
    }
}
