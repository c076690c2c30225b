//! Completion and dependency unlock.
//!
//! Completing a task is one publish: the task's own record flips to
//! `completed`. Dependents are not rewritten; eligibility is derived from the
//! dependency set on every read, so the same publish is what unlocks them.
//! The outcome lists which dependents that publish made eligible.

use serde::Serialize;
use tracing::{debug, info};

use super::Services;
use crate::domain::{BranchName, Lifecycle, Namespace, TaskId, WorkerId};
use crate::error::CompleteError;
use crate::ports::{PublishOutcome, Revision};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CompletionOutcome {
    /// This caller's publish completed the task.
    Completed {
        revision: Revision,
        unlocked: Vec<TaskId>,
    },

    /// Someone had already completed it. Still a success.
    AlreadyCompleted { by: WorkerId },
}

#[derive(Clone)]
pub struct Completion {
    services: Services,
}

impl Completion {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    pub async fn complete(
        &self,
        branch: &BranchName,
        namespace: &Namespace,
        task_id: &TaskId,
        worker: &WorkerId,
        external_ref: Option<String>,
    ) -> Result<CompletionOutcome, CompleteError> {
        let retry = self.services.retry;

        for attempt in 0..retry.max_attempts {
            let backlog = self.services.load(branch).await?;
            let Some(task) = backlog.get(namespace, task_id) else {
                return Err(CompleteError::NotFound {
                    namespace: namespace.clone(),
                    task: task_id.clone(),
                });
            };

            match &task.lifecycle {
                Lifecycle::Completed(done) => {
                    debug!(worker = %worker, namespace = %namespace, task = %task_id, by = %done.completer, "already completed");
                    return Ok(CompletionOutcome::AlreadyCompleted {
                        by: done.completer.clone(),
                    });
                }
                Lifecycle::Claimed(claim) if claim.is_owned_by(worker) => {}
                _ => {
                    return Err(CompleteError::OwnershipMismatch {
                        namespace: namespace.clone(),
                        task: task_id.clone(),
                        worker: worker.clone(),
                        holder: task.holder().cloned(),
                    });
                }
            }

            let unlocked = backlog.dependents_unlocked_by(namespace, task_id);
            let done = task.complete(worker, self.services.clock.now(), external_ref.clone())?;
            let message = format!("[COMPLETE] {worker} completed {namespace}/{task_id}");

            match self
                .services
                .publish_task::<CompleteError>(branch, backlog.revision(), &done, message)
                .await?
            {
                PublishOutcome::Published(revision) => {
                    info!(
                        worker = %worker,
                        namespace = %namespace,
                        task = %task_id,
                        unlocked = unlocked.len(),
                        revision = %revision,
                        "task completed"
                    );
                    return Ok(CompletionOutcome::Completed { revision, unlocked });
                }
                PublishOutcome::Rejected => {
                    debug!(worker = %worker, namespace = %namespace, task = %task_id, attempt, "completion rejected");
                    if retry.allows_retry(attempt) {
                        self.services.back_off(attempt).await;
                    }
                }
            }
        }

        Err(CompleteError::PublishFailed {
            namespace: namespace.clone(),
            task: task_id.clone(),
            attempts: retry.max_attempts,
        })
    }
}
