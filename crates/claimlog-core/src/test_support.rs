//! Shared fixtures for the protocol tests.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};

use crate::app::{ClaimProtocol, Completion, HeartbeatManager, Lease, Reclaimer, Services};
use crate::backlog::{Backlog, BackoffPolicy, Jitter, Layout, RetryPolicy};
use crate::domain::{BranchName, Namespace, Task, TaskId, WorkerId};
use crate::impls::InMemorySubstrate;
use crate::ports::{ManualClock, RecordingSleeper, Substrate};

pub fn id(raw: &str) -> TaskId {
    raw.parse().unwrap()
}

pub fn ns(raw: &str) -> Namespace {
    raw.parse().unwrap()
}

pub fn worker(raw: &str) -> WorkerId {
    raw.parse().unwrap()
}

/// In-memory substrate, frozen clock, sleeper that never waits.
pub struct Fixture {
    pub substrate: Arc<InMemorySubstrate>,
    pub clock: ManualClock,
    pub sleeper: RecordingSleeper,
    pub branch: BranchName,
    pub services: Services,
}

impl Fixture {
    pub fn new() -> Self {
        let substrate = Arc::new(InMemorySubstrate::new());
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());
        let sleeper = RecordingSleeper::new();
        let services = Services {
            substrate: substrate.clone(),
            clock: Arc::new(clock.clone()),
            sleeper: Arc::new(sleeper.clone()),
            layout: Layout::default(),
            retry: RetryPolicy {
                max_attempts: 5,
                backoff: BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(500)),
                jitter: Jitter::Fixed(7),
            },
        };
        Self {
            substrate,
            clock,
            sleeper,
            branch: BranchName::default(),
            services,
        }
    }

    pub async fn put(&self, task: Task) {
        self.substrate.put_task(&self.branch, &task).await.unwrap();
    }

    pub async fn put_raw(&self, path: &str, bytes: &[u8]) {
        self.substrate.put_file(&self.branch, path, bytes.to_vec()).await;
    }

    pub async fn backlog(&self) -> Backlog {
        self.services.load(&self.branch).await.unwrap()
    }

    pub async fn task(&self, namespace: &Namespace, id: &TaskId) -> Task {
        self.backlog()
            .await
            .get(namespace, id)
            .cloned()
            .unwrap_or_else(|| panic!("{namespace}/{id} missing"))
    }

    /// Lease matching a claimed task that is already on the branch.
    pub async fn lease_for(&self, task: &Task) -> Lease {
        let claim = task.claim_record().expect("task is claimed");
        let head = self.substrate.sync(&self.branch).await.unwrap().revision;
        Lease {
            namespace: task.namespace.clone(),
            task_id: task.id.clone(),
            owner: claim.owner.clone(),
            branch: self.branch.clone(),
            published_at: head,
            claimed_at: claim.claimed_at,
            attempt: claim.attempt,
        }
    }

    pub fn claims(&self) -> ClaimProtocol {
        ClaimProtocol::new(self.services.clone())
    }

    pub fn heartbeats(&self) -> HeartbeatManager {
        HeartbeatManager::new(self.services.clone())
    }

    pub fn completions(&self) -> Completion {
        Completion::new(self.services.clone())
    }

    pub fn reclaimer(&self) -> Reclaimer {
        Reclaimer::new(self.services.clone())
    }
}
