//! WorkerLoop - claim -> heartbeat -> run -> complete.
//!
//! A failed run is *not* released: the only way back from `claimed` to `ready`
//! is lease expiry, so the task waits for the reclaimer and may run again
//! (at-least-once execution, exactly-one claimant).

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::Services;
use super::claim::{ClaimOutcome, ClaimProtocol, Lease, LeaseStatus};
use super::complete::{Completion, CompletionOutcome};
use super::heartbeat::{HeartbeatManager, LeaseSignal};
use super::router::NamespaceScope;
use crate::domain::{BranchName, Task, TaskId, WorkerId};
use crate::error::{ClaimError, CompleteError};

pub type RunError = Box<dyn std::error::Error + Send + Sync>;

/// The work itself. Implementations decide what a task means.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Returns an external reference for the completion record (commit, PR,
    /// artifact URL...), if there is one.
    async fn run(&self, task: &Task, lease: &Lease) -> Result<Option<String>, RunError>;
}

/// What one iteration of the loop did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Iteration {
    /// Nothing eligible.
    Idle,
    /// Every claim attempt lost a race.
    Contended,
    Completed { task: TaskId, unlocked: Vec<TaskId> },
    /// Someone else completed the task while this worker ran it.
    AlreadyCompleted { task: TaskId },
    /// Reclaimed (or otherwise lost) before completion; nothing published.
    LeaseLost { task: TaskId },
    /// The runner failed; the claim is left to expire.
    RunFailed { task: TaskId, error: String },
    /// Substrate or record failure.
    Failed(String),
}

impl Iteration {
    /// Everything except a finished task pauses the loop for `poll_interval`,
    /// so a runner that keeps failing cannot claim the whole backlog.
    fn should_wait(&self) -> bool {
        !matches!(self, Iteration::Completed { .. } | Iteration::AlreadyCompleted { .. })
    }
}

pub struct WorkerLoop {
    services: Services,
    worker: WorkerId,
    scope: NamespaceScope,
    capabilities: BTreeSet<String>,
    branch: BranchName,
    heartbeat_interval: Duration,
    poll_interval: Duration,
    runner: Arc<dyn TaskRunner>,
}

impl WorkerLoop {
    pub fn new(
        services: Services,
        worker: WorkerId,
        runner: Arc<dyn TaskRunner>,
    ) -> Self {
        Self {
            services,
            worker,
            scope: NamespaceScope::All,
            capabilities: BTreeSet::new(),
            branch: BranchName::default(),
            heartbeat_interval: Duration::from_secs(10),
            poll_interval: Duration::from_secs(5),
            runner,
        }
    }

    pub fn scope(mut self, scope: NamespaceScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn capabilities(mut self, capabilities: BTreeSet<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn branch(mut self, branch: BranchName) -> Self {
        self.branch = branch;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn worker(&self) -> &WorkerId {
        &self.worker
    }

    pub async fn run_once(&self) -> Iteration {
        let claims =
            ClaimProtocol::new(self.services.clone()).with_capabilities(self.capabilities.clone());
        let lease = match claims.claim(&self.worker, &self.scope, &self.branch).await {
            Ok(ClaimOutcome::Claimed(lease)) => lease,
            Ok(ClaimOutcome::NoEligibleTask) => return Iteration::Idle,
            Err(ClaimError::ExhaustedRetries { attempts }) => {
                debug!(worker = %self.worker, attempts, "claim contended");
                return Iteration::Contended;
            }
            Err(err) => {
                error!(worker = %self.worker, error = %err, "claim failed");
                return Iteration::Failed(err.to_string());
            }
        };
        self.work_on(lease).await
    }

    async fn work_on(&self, lease: Lease) -> Iteration {
        let task_id = lease.task_id.clone();

        // ランナーに渡すタスクは新しいビューから取る
        let task = match self.services.load(&self.branch).await {
            Ok(backlog) => match (lease.verify(&backlog), backlog.get(&lease.namespace, &task_id)) {
                (LeaseStatus::Held, Some(task)) => task.clone(),
                _ => return Iteration::LeaseLost { task: task_id },
            },
            Err(err) => return Iteration::Failed(err.to_string()),
        };

        let heartbeats = HeartbeatManager::new(self.services.clone());
        let heartbeat = heartbeats.start(lease.clone(), self.heartbeat_interval);
        let mut lost = heartbeat.subscribe();

        let result = tokio::select! {
            result = self.runner.run(&task, &lease) => Some(result),
            _ = async {
                // a closed channel means the heartbeat task is gone: treat as lost
                let _ = lost.wait_for(|signal| matches!(signal, LeaseSignal::Lost(_))).await;
            } => None,
        };
        heartbeat.stop().await;

        let external_ref = match result {
            None => {
                warn!(worker = %self.worker, task = %task_id, "lease lost while running, abandoning task");
                return Iteration::LeaseLost { task: task_id };
            }
            Some(Err(err)) => {
                warn!(worker = %self.worker, task = %task_id, error = %err, "task run failed, leaving it to the reclaimer");
                return Iteration::RunFailed {
                    task: task_id,
                    error: err.to_string(),
                };
            }
            Some(Ok(external_ref)) => external_ref,
        };

        let completion = Completion::new(self.services.clone());
        match completion
            .complete(&self.branch, &lease.namespace, &task_id, &self.worker, external_ref)
            .await
        {
            Ok(CompletionOutcome::Completed { unlocked, .. }) => Iteration::Completed {
                task: task_id,
                unlocked,
            },
            Ok(CompletionOutcome::AlreadyCompleted { .. }) => {
                Iteration::AlreadyCompleted { task: task_id }
            }
            Err(CompleteError::OwnershipMismatch { .. } | CompleteError::NotFound { .. }) => {
                warn!(worker = %self.worker, task = %task_id, "lease lost before completion");
                Iteration::LeaseLost { task: task_id }
            }
            Err(err) => {
                error!(worker = %self.worker, task = %task_id, error = %err, "completion failed");
                Iteration::Failed(err.to_string())
            }
        }
    }

    /// Run until shutdown. Shutdown is checked between tasks; a task that is
    /// already running is finished (or abandoned on lease loss) first.
    pub fn spawn(self) -> WorkerLoopHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(0usize);

        let join = tokio::spawn(async move {
            info!(worker = %self.worker, branch = %self.branch, "worker started");
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                let iteration = self.run_once().await;
                if matches!(iteration, Iteration::Completed { .. }) {
                    done_tx.send_modify(|n| *n += 1);
                }

                if iteration.should_wait() {
                    tokio::select! {
                        _ = shutdown_rx.changed() => {}
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
            info!(worker = %self.worker, "worker stopped");
        });

        WorkerLoopHandle {
            shutdown_tx,
            completed_rx: done_rx,
            join,
        }
    }
}

/// Worker handle.
/// - `request_shutdown()` stops taking new tasks
/// - `shutdown_and_join()` waits for the loop to finish
pub struct WorkerLoopHandle {
    shutdown_tx: watch::Sender<bool>,
    completed_rx: watch::Receiver<usize>,
    join: JoinHandle<()>,
}

impl WorkerLoopHandle {
    pub fn request_shutdown(&self) {
        // ignore send error: the loop may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    /// Receiver for the number of tasks this loop has completed.
    pub fn completed(&self) -> watch::Receiver<usize> {
        self.completed_rx.clone()
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        let _ = self.join.await;
    }
}
