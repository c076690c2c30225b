//! ReaperLoop - stale lease recovery.
//!
//! # Flow
//! 1. sync once and list every stale claim in every namespace
//! 2. for each candidate: re-sync, re-check (same owner, same attempt, still
//!    stale), publish `claimed -> ready`
//! 3. a rejected or failed reclaim is logged and skipped for this pass
//!
//! Each reclaim is its own publish, so a sweep interrupted halfway leaves
//! nothing half-done and the next pass simply picks up what is left.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::Services;
use crate::domain::{BranchName, Lifecycle, Namespace, TaskId, WorkerId};
use crate::error::{RecordError, SubstrateError};
use crate::ports::PublishOutcome;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReclaimedTask {
    pub namespace: Namespace,
    pub task_id: TaskId,
    pub previous_owner: WorkerId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedTask {
    pub namespace: Namespace,
    pub task_id: TaskId,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimReport {
    pub reclaimed: Vec<ReclaimedTask>,
    pub skipped: Vec<SkippedTask>,
}

impl ReclaimReport {
    pub fn count_reclaimed(&self) -> usize {
        self.reclaimed.len()
    }

    fn skip(&mut self, namespace: Namespace, task_id: TaskId, reason: String) {
        warn!(namespace = %namespace, task = %task_id, reason = %reason, "reclaim skipped");
        self.skipped.push(SkippedTask {
            namespace,
            task_id,
            reason,
        });
    }
}

/// Why one candidate was not reclaimed.
enum Skip {
    /// Someone else touched the task first (heartbeat, completion, reclaim).
    NoLongerStale,
    Rejected,
    Failed(String),
}

impl From<SubstrateError> for Skip {
    fn from(err: SubstrateError) -> Self {
        Skip::Failed(err.to_string())
    }
}

impl From<RecordError> for Skip {
    fn from(err: RecordError) -> Self {
        Skip::Failed(err.to_string())
    }
}

#[derive(Clone)]
pub struct Reclaimer {
    services: Services,
}

impl Reclaimer {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    /// One pass over the branch. Only the discovery sync can fail the sweep.
    pub async fn sweep(
        &self,
        branch: &BranchName,
        timeout: Duration,
    ) -> Result<ReclaimReport, SubstrateError> {
        let backlog = self.services.load(branch).await?;
        let now = self.services.clock.now();
        let candidates: Vec<(Namespace, TaskId, WorkerId, u32)> = backlog
            .stale_claims(now, timeout)
            .into_iter()
            .filter_map(|task| {
                let claim = task.claim_record()?;
                Some((task.namespace.clone(), task.id.clone(), claim.owner.clone(), claim.attempt))
            })
            .collect();

        let mut report = ReclaimReport::default();
        for (namespace, task_id, owner, attempt) in candidates {
            match self
                .reclaim_one(branch, timeout, &namespace, &task_id, &owner, attempt)
                .await
            {
                Ok(()) => {
                    info!(namespace = %namespace, task = %task_id, previous_owner = %owner, "stale lease reclaimed");
                    report.reclaimed.push(ReclaimedTask {
                        namespace,
                        task_id,
                        previous_owner: owner,
                    });
                }
                Err(Skip::NoLongerStale) => {}
                Err(Skip::Rejected) => report.skip(namespace, task_id, "publish rejected".to_string()),
                Err(Skip::Failed(reason)) => report.skip(namespace, task_id, reason),
            }
        }
        Ok(report)
    }

    async fn reclaim_one(
        &self,
        branch: &BranchName,
        timeout: Duration,
        namespace: &Namespace,
        task_id: &TaskId,
        owner: &WorkerId,
        attempt: u32,
    ) -> Result<(), Skip> {
        let backlog = self.services.load(branch).await?;
        let now = self.services.clock.now();

        let Some(task) = backlog.get(namespace, task_id) else {
            return Err(Skip::NoLongerStale);
        };
        let still_stale = match &task.lifecycle {
            Lifecycle::Claimed(claim) => {
                claim.is_owned_by(owner) && claim.attempt == attempt && claim.is_stale(now, timeout)
            }
            _ => false,
        };
        if !still_stale {
            return Err(Skip::NoLongerStale);
        }

        let ready = task.expire().map_err(|e| Skip::Failed(e.to_string()))?;
        let message = format!("[RECLAIM] {namespace}/{task_id} from {owner}");
        match self
            .services
            .publish_task::<Skip>(branch, backlog.revision(), &ready, message)
            .await?
        {
            PublishOutcome::Published(_) => Ok(()),
            PublishOutcome::Rejected => Err(Skip::Rejected),
        }
    }
}

/// ReaperLoop runs a sweep every `interval` until shutdown.
/// - `shutdown()` で停止を要求し、ループの終了を待つ
pub struct ReaperLoop {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ReaperLoop {
    pub fn spawn(
        reclaimer: Reclaimer,
        branch: BranchName,
        timeout: Duration,
        interval: Duration,
    ) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {}
                }

                match reclaimer.sweep(&branch, timeout).await {
                    Ok(report) => info!(
                        branch = %branch,
                        reclaimed = report.reclaimed.len(),
                        skipped = report.skipped.len(),
                        "reclaim sweep finished"
                    ),
                    Err(err) => error!(branch = %branch, error = %err, "reclaim sweep failed"),
                }
            }
        });

        Self { shutdown_tx, join }
    }

    pub async fn shutdown(self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
        let _ = self.join.await;
    }
}
