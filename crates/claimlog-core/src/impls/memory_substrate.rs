//! InMemorySubstrate - 開発用・テスト用の substrate
//!
//! Branch -> (head counter, files, commit log) behind a `tokio::sync::Mutex`.
//! `publish` is a compare-and-swap on the head counter, which is exactly the
//! guarantee a git remote gives for a non-forced push.
//!
//! Test knobs:
//! - `interleaved()`: yield before every operation to shuffle concurrent callers
//! - `reject_next_publishes(n)`: simulate lost races
//! - `set_unreachable(true)`: simulate a partition

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::backlog::Layout;
use crate::backlog::record;
use crate::domain::{BranchName, Task};
use crate::error::{RecordError, SubstrateError};
use crate::ports::{ChangeSet, PublishOutcome, Revision, Snapshot, Substrate};

#[derive(Debug, Default)]
struct BranchState {
    head: u64,
    files: BTreeMap<String, Vec<u8>>,
    /// Commit messages, oldest first.
    log: Vec<String>,
}

impl BranchState {
    fn revision(&self) -> Revision {
        Revision::new(self.head.to_string())
    }

    fn apply(&mut self, changes: ChangeSet) -> Revision {
        self.files.extend(changes.writes);
        self.log.push(changes.message);
        self.head += 1;
        self.revision()
    }
}

#[derive(Debug, Default)]
pub struct InMemorySubstrate {
    branches: Mutex<HashMap<BranchName, BranchState>>,
    interleave: bool,
    reject_next: AtomicU32,
    unreachable: AtomicBool,
}

impl InMemorySubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Yield to the scheduler before every sync and publish.
    pub fn interleaved() -> Self {
        Self {
            interleave: true,
            ..Self::default()
        }
    }

    /// The next `n` publishes are rejected regardless of their base.
    pub fn reject_next_publishes(&self, n: u32) {
        self.reject_next.store(n, Ordering::SeqCst);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Write a file outside the protocol (planner, test setup).
    pub async fn put_file(&self, branch: &BranchName, path: impl Into<String>, bytes: Vec<u8>) {
        let path = path.into();
        let mut branches = self.branches.lock().await;
        let state = branches.entry(branch.clone()).or_default();
        state.apply(ChangeSet::new(format!("[SEED] {path}")).write(path, bytes));
    }

    /// Write a task record in the default layout.
    pub async fn put_task(&self, branch: &BranchName, task: &Task) -> Result<(), RecordError> {
        self.put_task_in(&Layout::default(), branch, task).await
    }

    pub async fn put_task_in(
        &self,
        layout: &Layout,
        branch: &BranchName,
        task: &Task,
    ) -> Result<(), RecordError> {
        let (path, bytes) = record::encode(layout, task)?;
        self.put_file(branch, path, bytes).await;
        Ok(())
    }

    pub async fn file(&self, branch: &BranchName, path: &str) -> Option<Vec<u8>> {
        let branches = self.branches.lock().await;
        branches.get(branch)?.files.get(path).cloned()
    }

    /// Commit messages of a branch, oldest first.
    pub async fn history(&self, branch: &BranchName) -> Vec<String> {
        let branches = self.branches.lock().await;
        branches
            .get(branch)
            .map(|state| state.log.clone())
            .unwrap_or_default()
    }

    async fn enter(&self) -> Result<(), SubstrateError> {
        if self.interleave {
            tokio::task::yield_now().await;
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(SubstrateError::Unreachable("in-memory substrate is partitioned".into()));
        }
        Ok(())
    }

    fn take_forced_rejection(&self) -> bool {
        self.reject_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Substrate for InMemorySubstrate {
    async fn sync(&self, branch: &BranchName) -> Result<Snapshot, SubstrateError> {
        self.enter().await?;
        let branches = self.branches.lock().await;
        Ok(match branches.get(branch) {
            Some(state) => Snapshot {
                revision: state.revision(),
                files: state.files.clone(),
            },
            None => Snapshot {
                revision: BranchState::default().revision(),
                files: BTreeMap::new(),
            },
        })
    }

    async fn publish(
        &self,
        branch: &BranchName,
        base: &Revision,
        changes: ChangeSet,
    ) -> Result<PublishOutcome, SubstrateError> {
        self.enter().await?;
        if self.take_forced_rejection() {
            return Ok(PublishOutcome::Rejected);
        }

        let mut branches = self.branches.lock().await;
        let state = branches.entry(branch.clone()).or_default();
        if &state.revision() != base {
            return Ok(PublishOutcome::Rejected);
        }
        Ok(PublishOutcome::Published(state.apply(changes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn branch() -> BranchName {
        BranchName::default()
    }

    #[tokio::test]
    async fn unknown_branch_is_empty() {
        let substrate = InMemorySubstrate::new();
        let snapshot = substrate.sync(&branch()).await.unwrap();
        assert_eq!(snapshot.revision, Revision::new("0"));
        assert!(snapshot.files.is_empty());
    }

    #[tokio::test]
    async fn publish_is_compare_and_swap() {
        let substrate = InMemorySubstrate::new();
        let base = substrate.sync(&branch()).await.unwrap().revision;

        let first = substrate
            .publish(&branch(), &base, ChangeSet::new("one").write("a.json", b"1".to_vec()))
            .await
            .unwrap();
        assert_eq!(first, PublishOutcome::Published(Revision::new("1")));

        // same base again: the head moved
        let second = substrate
            .publish(&branch(), &base, ChangeSet::new("two").write("a.json", b"2".to_vec()))
            .await
            .unwrap();
        assert_eq!(second, PublishOutcome::Rejected);

        assert_eq!(substrate.file(&branch(), "a.json").await, Some(b"1".to_vec()));
        assert_eq!(substrate.history(&branch()).await, vec!["one".to_string()]);
    }

    #[tokio::test]
    async fn seeded_tasks_land_under_the_layout_root() {
        let substrate = InMemorySubstrate::new();
        let task = Task::new("api".parse().unwrap(), "T-1".parse().unwrap(), 3);
        substrate
            .put_task_in(&Layout::new("work"), &branch(), &task)
            .await
            .unwrap();

        let snapshot = substrate.sync(&branch()).await.unwrap();
        assert_eq!(snapshot.files.keys().collect::<Vec<_>>(), vec!["work/api/tasks/T-1.json"]);
        assert_eq!(
            substrate.history(&branch()).await,
            vec!["[SEED] work/api/tasks/T-1.json".to_string()]
        );
    }

    #[tokio::test]
    async fn branches_are_independent() {
        let substrate = InMemorySubstrate::new();
        let other: BranchName = "agents/other".parse().unwrap();
        substrate.put_file(&other, "x", Vec::new()).await;

        assert_eq!(substrate.sync(&branch()).await.unwrap().revision, Revision::new("0"));
        assert_eq!(substrate.sync(&other).await.unwrap().revision, Revision::new("1"));
    }

    #[tokio::test]
    async fn forced_rejections_run_out() {
        let substrate = InMemorySubstrate::new();
        substrate.reject_next_publishes(1);
        let base = substrate.sync(&branch()).await.unwrap().revision;

        let outcome = substrate.publish(&branch(), &base, ChangeSet::new("x")).await.unwrap();
        assert_eq!(outcome, PublishOutcome::Rejected);
        let outcome = substrate.publish(&branch(), &base, ChangeSet::new("x")).await.unwrap();
        assert!(matches!(outcome, PublishOutcome::Published(_)));
    }

    #[tokio::test]
    async fn partition_is_an_error() {
        let substrate = InMemorySubstrate::new();
        substrate.set_unreachable(true);
        assert!(matches!(
            substrate.sync(&branch()).await,
            Err(SubstrateError::Unreachable(_))
        ));
    }
}
