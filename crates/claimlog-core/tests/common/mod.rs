#![allow(dead_code)]

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use claimlog_core::backlog::Jitter;
use claimlog_core::config::CoordinationConfig;
use claimlog_core::domain::{BranchName, Namespace, Task, TaskId, WorkerId};
use claimlog_core::impls::InMemorySubstrate;
use claimlog_core::ports::{ManualClock, RecordingSleeper};
use claimlog_core::{Coordinator, CoordinatorBuilder};

pub fn id(raw: &str) -> TaskId {
    raw.parse().unwrap()
}

pub fn ns(raw: &str) -> Namespace {
    raw.parse().unwrap()
}

pub fn worker(raw: &str) -> WorkerId {
    raw.parse().unwrap()
}

pub struct Harness {
    pub substrate: Arc<InMemorySubstrate>,
    pub clock: ManualClock,
    pub sleeper: RecordingSleeper,
    pub coordinator: Coordinator,
}

impl Harness {
    pub fn new(substrate: InMemorySubstrate, config: CoordinationConfig) -> Self {
        let substrate = Arc::new(substrate);
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());
        let sleeper = RecordingSleeper::new();
        let coordinator = CoordinatorBuilder::new(substrate.clone())
            .config(config)
            .clock(Arc::new(clock.clone()))
            .sleeper(Arc::new(sleeper.clone()))
            .jitter(Jitter::Fixed(42))
            .build()
            .unwrap();
        Self {
            substrate,
            clock,
            sleeper,
            coordinator,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(InMemorySubstrate::new(), CoordinationConfig::default())
    }

    pub fn branch(&self) -> &BranchName {
        self.coordinator.branch()
    }

    pub async fn put(&self, task: Task) {
        self.substrate.put_task(self.branch(), &task).await.unwrap();
    }

    pub async fn task(&self, namespace: &Namespace, id: &TaskId) -> Task {
        self.coordinator
            .services()
            .load(self.branch())
            .await
            .unwrap()
            .get(namespace, id)
            .cloned()
            .unwrap()
    }

    pub async fn history(&self) -> Vec<String> {
        self.substrate.history(self.branch()).await
    }
}
