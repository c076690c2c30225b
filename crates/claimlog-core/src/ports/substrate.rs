//! Substrate port - the versioned, branch-addressed store all workers share.
//!
//! The protocol needs exactly two things from it:
//! - `sync`: read the current head of a branch (files + revision).
//! - `publish`: apply a change set on top of a revision *only if* that revision
//!   is still the head. Otherwise the whole change set is dropped.
//!
//! That compare-and-swap is the only serialization point in the system. There
//! is no lock, no lease server and no notion of a connected session.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::BranchName;
use crate::error::SubstrateError;

/// Opaque head identifier (a commit id for git, a counter in memory).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(String);

impl Revision {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A branch head as seen by one caller at one moment.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub revision: Revision,

    /// Relative path (always `/`-separated) -> file contents.
    pub files: BTreeMap<String, Vec<u8>>,
}

/// Proposed file writes, applied all together or not at all.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub message: String,
    pub writes: BTreeMap<String, Vec<u8>>,
}

impl ChangeSet {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            writes: BTreeMap::new(),
        }
    }

    pub fn write(mut self, path: impl Into<String>, contents: Vec<u8>) -> Self {
        self.writes.insert(path.into(), contents);
        self
    }
}

/// Result of a publish attempt that reached the substrate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The change set is now part of the branch history.
    Published(Revision),

    /// The head moved since `base`. Nothing was applied.
    Rejected,
}

/// Substrate is the shared, append-only coordination log.
///
/// # Design
/// - Implementations never hold state across calls on behalf of the caller.
/// - A rejected publish must leave no trace, locally or remotely.
/// - `sync` on a branch that does not exist yet returns an empty snapshot.
#[async_trait]
pub trait Substrate: Send + Sync {
    async fn sync(&self, branch: &BranchName) -> Result<Snapshot, SubstrateError>;

    async fn publish(
        &self,
        branch: &BranchName,
        base: &Revision,
        changes: ChangeSet,
    ) -> Result<PublishOutcome, SubstrateError>;
}
