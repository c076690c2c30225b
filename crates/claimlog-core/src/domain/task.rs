//! Task entity and its pure state transitions.
//!
//! Design:
//! - The lifecycle is a tagged variant, so "claimed without a claim record" or
//!   "completed and claimed at once" cannot be represented.
//! - Transitions take `&self` and return the next version of the task. Nothing
//!   here touches the substrate; publishing the result is the caller's job.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{Namespace, TaskId, WorkerId};
use super::state::TaskState;
use crate::error::TransitionError;

/// Advisory lease held by one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub owner: WorkerId,
    pub claimed_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,

    /// How many times the task has been claimed, including this claim.
    pub attempt: u32,
}

impl ClaimRecord {
    /// Last sign of life: the latest heartbeat, or the claim itself.
    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_heartbeat.unwrap_or(self.claimed_at)
    }

    pub fn age(&self, now: DateTime<Utc>) -> TimeDelta {
        now.signed_duration_since(self.last_seen())
    }

    /// A claim is stale once its age strictly exceeds `timeout`.
    ///
    /// Negative ages (clock skew between workers) are never stale.
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        let Ok(timeout) = TimeDelta::from_std(timeout) else {
            return false;
        };
        self.age(now) > timeout
    }

    pub fn is_owned_by(&self, worker: &WorkerId) -> bool {
        &self.owner == worker
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub completer: WorkerId,
    pub completed_at: DateTime<Utc>,

    /// Pointer to whatever the work produced (commit, PR, artifact URL...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<String>,
}

/// Lifecycle state together with the record that state requires.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Lifecycle {
    /// Planners create tasks without a lifecycle; they start here.
    #[default]
    Ready,
    Claimed(ClaimRecord),
    Completed(CompletionRecord),
}

impl Lifecycle {
    pub fn state(&self) -> TaskState {
        match self {
            Lifecycle::Ready => TaskState::Ready,
            Lifecycle::Claimed(_) => TaskState::Claimed,
            Lifecycle::Completed(_) => TaskState::Completed,
        }
    }
}

/// One unit of work in a namespace.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub namespace: Namespace,
    pub id: TaskId,

    /// Higher is more urgent.
    pub priority: i32,

    /// Prerequisites, by id, within the same namespace.
    pub dependencies: BTreeSet<TaskId>,

    /// A worker needs at least one of these to claim the task. Empty = anyone.
    pub required_capabilities: BTreeSet<String>,

    /// Number of successful claims over the task's whole life.
    pub claim_count: u32,

    pub lifecycle: Lifecycle,

    /// Planner-owned fields this crate does not interpret. Preserved verbatim
    /// whenever the task is rewritten.
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Task {
    /// A fresh `ready` task with no dependencies.
    pub fn new(namespace: Namespace, id: TaskId, priority: i32) -> Self {
        Self {
            namespace,
            id,
            priority,
            dependencies: BTreeSet::new(),
            required_capabilities: BTreeSet::new(),
            claim_count: 0,
            lifecycle: Lifecycle::Ready,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = TaskId>) -> Self {
        self.dependencies.extend(deps);
        self
    }

    pub fn with_required_capabilities<S: Into<String>>(
        mut self,
        capabilities: impl IntoIterator<Item = S>,
    ) -> Self {
        self.required_capabilities
            .extend(capabilities.into_iter().map(Into::into));
        self
    }

    /// Whether a worker offering `offered` may take this task.
    pub fn accepts(&self, offered: &BTreeSet<String>) -> bool {
        self.required_capabilities.is_empty()
            || self.required_capabilities.iter().any(|cap| offered.contains(cap))
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn state(&self) -> TaskState {
        self.lifecycle.state()
    }

    pub fn claim_record(&self) -> Option<&ClaimRecord> {
        match &self.lifecycle {
            Lifecycle::Claimed(claim) => Some(claim),
            _ => None,
        }
    }

    pub fn completion_record(&self) -> Option<&CompletionRecord> {
        match &self.lifecycle {
            Lifecycle::Completed(done) => Some(done),
            _ => None,
        }
    }

    /// Current lease holder, if any.
    pub fn holder(&self) -> Option<&WorkerId> {
        self.claim_record().map(|claim| &claim.owner)
    }

    /// ready -> claimed.
    pub fn claim(&self, owner: &WorkerId, now: DateTime<Utc>) -> Result<Task, TransitionError> {
        self.check(TaskState::Claimed)?;
        let attempt = self.claim_count.saturating_add(1);
        Ok(Task {
            claim_count: attempt,
            lifecycle: Lifecycle::Claimed(ClaimRecord {
                owner: owner.clone(),
                claimed_at: now,
                last_heartbeat: None,
                attempt,
            }),
            ..self.clone()
        })
    }

    /// Refresh `last_heartbeat`. Not a state transition: claimed stays claimed.
    pub fn renew(&self, now: DateTime<Utc>) -> Result<Task, TransitionError> {
        let Lifecycle::Claimed(claim) = &self.lifecycle else {
            return Err(self.transition_error(TaskState::Claimed));
        };
        Ok(Task {
            lifecycle: Lifecycle::Claimed(ClaimRecord {
                last_heartbeat: Some(now),
                ..claim.clone()
            }),
            ..self.clone()
        })
    }

    /// claimed -> ready. Drops the claim record.
    pub fn expire(&self) -> Result<Task, TransitionError> {
        self.check(TaskState::Ready)?;
        Ok(Task {
            lifecycle: Lifecycle::Ready,
            ..self.clone()
        })
    }

    /// claimed -> completed.
    pub fn complete(
        &self,
        completer: &WorkerId,
        now: DateTime<Utc>,
        external_ref: Option<String>,
    ) -> Result<Task, TransitionError> {
        self.check(TaskState::Completed)?;
        Ok(Task {
            lifecycle: Lifecycle::Completed(CompletionRecord {
                completer: completer.clone(),
                completed_at: now,
                external_ref,
            }),
            ..self.clone()
        })
    }

    fn check(&self, to: TaskState) -> Result<(), TransitionError> {
        if self.state().can_transition_to(to) {
            Ok(())
        } else {
            Err(self.transition_error(to))
        }
    }

    fn transition_error(&self, to: TaskState) -> TransitionError {
        TransitionError {
            namespace: self.namespace.clone(),
            task: self.id.clone(),
            from: self.state(),
            to,
        }
    }
}
