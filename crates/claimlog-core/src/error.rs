//! Error types.
//!
//! One enum per concern. "No work right now" is deliberately absent: the
//! claim protocol reports it as `ClaimOutcome::NoEligibleTask`, not an error.

use std::path::PathBuf;

use thiserror::Error;

use crate::domain::{Namespace, TaskId, TaskState, WorkerId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    #[error("invalid {kind} {value:?}: {reason}")]
    Invalid {
        kind: &'static str,
        value: String,
        reason: &'static str,
    },
}

/// Failures talking to the coordination substrate.
///
/// A rejected publish is *not* an error; see `PublishOutcome::Rejected`.
#[derive(Debug, Error)]
pub enum SubstrateError {
    #[error("substrate unreachable: {0}")]
    Unreachable(String),

    #[error("`{command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A task record that could not be decoded or encoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed task record at {path}: {reason}")]
pub struct RecordError {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition for {namespace}/{task}: {from} -> {to}")]
pub struct TransitionError {
    pub namespace: Namespace,
    pub task: TaskId,
    pub from: TaskState,
    pub to: TaskState,
}

#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("lost every contention race ({attempts} attempts)")]
    ExhaustedRetries { attempts: u32 },

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Substrate(#[from] SubstrateError),
}

#[derive(Debug, Error)]
pub enum HeartbeatError {
    #[error("task {namespace}/{task} not found")]
    NotFound { namespace: Namespace, task: TaskId },

    #[error("task {namespace}/{task} is not claimed (state: {state})")]
    NotClaimed {
        namespace: Namespace,
        task: TaskId,
        state: TaskState,
    },

    #[error("task {namespace}/{task} is no longer held by {worker} (holder: {holder:?})")]
    OwnershipMismatch {
        namespace: Namespace,
        task: TaskId,
        worker: WorkerId,
        holder: Option<WorkerId>,
    },

    #[error("heartbeat for {namespace}/{task} was rejected {attempts} times")]
    PublishFailed {
        namespace: Namespace,
        task: TaskId,
        attempts: u32,
    },

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Substrate(#[from] SubstrateError),
}

impl HeartbeatError {
    /// Permanent failures: the caller must stop acting on the task.
    pub fn is_lease_lost(&self) -> bool {
        matches!(
            self,
            HeartbeatError::NotFound { .. }
                | HeartbeatError::NotClaimed { .. }
                | HeartbeatError::OwnershipMismatch { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum CompleteError {
    #[error("task {namespace}/{task} not found")]
    NotFound { namespace: Namespace, task: TaskId },

    #[error("task {namespace}/{task} is not held by {worker} (holder: {holder:?})")]
    OwnershipMismatch {
        namespace: Namespace,
        task: TaskId,
        worker: WorkerId,
        holder: Option<WorkerId>,
    },

    #[error("completion of {namespace}/{task} was rejected {attempts} times")]
    PublishFailed {
        namespace: Namespace,
        task: TaskId,
        attempts: u32,
    },

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Substrate(#[from] SubstrateError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("environment variable {var}={value:?} is invalid: {reason}")]
    Env {
        var: String,
        value: String,
        reason: String,
    },

    #[error(transparent)]
    Name(#[from] NameError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
