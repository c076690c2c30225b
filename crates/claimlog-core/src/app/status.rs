//! Status report for operators.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::backlog::Backlog;
use crate::domain::{Namespace, TaskId, TaskState, WorkerId};
use crate::ports::Revision;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NamespaceStatus {
    pub namespace: Option<Namespace>,
    /// Eligible right now.
    pub ready: usize,
    /// `ready` but waiting on a prerequisite.
    pub blocked: usize,
    pub claimed: usize,
    /// Claimed and past the lease timeout; the next sweep reclaims them.
    pub stale: usize,
    pub completed: usize,
    pub malformed: usize,
    /// Dependency cycles; their members can never become eligible.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cycles: Vec<Vec<TaskId>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BacklogStatus {
    pub revision: Revision,
    pub generated_at: DateTime<Utc>,
    pub namespaces: Vec<NamespaceStatus>,
    /// Workers holding a non-stale claim.
    pub active_workers: BTreeSet<WorkerId>,
    /// Records whose namespace directory name is itself invalid.
    pub unattributed_malformed: usize,
}

impl BacklogStatus {
    pub fn from_backlog(backlog: &Backlog, now: DateTime<Utc>, lease_timeout: Duration) -> Self {
        let mut active_workers = BTreeSet::new();
        let namespaces = backlog
            .namespaces()
            .map(|ns| {
                let mut status = NamespaceStatus {
                    namespace: Some(ns.clone()),
                    ..NamespaceStatus::default()
                };
                for task in backlog.tasks(ns) {
                    match task.state() {
                        TaskState::Ready if backlog.is_eligible(task) => status.ready += 1,
                        TaskState::Ready => status.blocked += 1,
                        TaskState::Claimed => {
                            status.claimed += 1;
                            if let Some(claim) = task.claim_record() {
                                if claim.is_stale(now, lease_timeout) {
                                    status.stale += 1;
                                } else {
                                    active_workers.insert(claim.owner.clone());
                                }
                            }
                        }
                        TaskState::Completed => status.completed += 1,
                    }
                }
                status.malformed = backlog
                    .malformed()
                    .iter()
                    .filter(|m| m.namespace.as_ref() == Some(ns))
                    .count();
                status.cycles = backlog.dependency_graph(ns).cycles();
                status
            })
            .collect();

        Self {
            revision: backlog.revision().clone(),
            generated_at: now,
            namespaces,
            active_workers,
            unattributed_malformed: backlog
                .malformed()
                .iter()
                .filter(|m| m.namespace.is_none())
                .count(),
        }
    }

    pub fn totals(&self) -> NamespaceStatus {
        self.namespaces
            .iter()
            .fold(NamespaceStatus::default(), |mut acc, ns| {
                acc.ready += ns.ready;
                acc.blocked += ns.blocked;
                acc.claimed += ns.claimed;
                acc.stale += ns.stale;
                acc.completed += ns.completed;
                acc.malformed += ns.malformed;
                acc.cycles.extend(ns.cycles.iter().cloned());
                acc
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Task;
    use crate::ports::Clock;
    use crate::test_support::{Fixture, id, ns, worker};

    #[tokio::test]
    async fn counts_every_state() {
        let fx = Fixture::new();
        let start = fx.clock.now();
        fx.put(Task::new(ns("api"), id("READY"), 1)).await;
        fx.put(Task::new(ns("api"), id("BLOCKED"), 1).with_dependencies([id("READY")])).await;
        fx.put(Task::new(ns("api"), id("OLD"), 1).claim(&worker("w1"), start).unwrap()).await;
        fx.clock.advance(Duration::from_secs(40));
        fx.put(Task::new(ns("api"), id("LIVE"), 1).claim(&worker("w2"), fx.clock.now()).unwrap())
            .await;
        fx.put(
            Task::new(ns("web"), id("DONE"), 1)
                .claim(&worker("w3"), start)
                .unwrap()
                .complete(&worker("w3"), start, None)
                .unwrap(),
        )
        .await;
        fx.put_raw("projects/web/tasks/BROKEN.json", b"{").await;

        let status = BacklogStatus::from_backlog(
            &fx.backlog().await,
            fx.clock.now(),
            Duration::from_secs(30),
        );

        let api = &status.namespaces[0];
        assert_eq!(api.namespace, Some(ns("api")));
        assert_eq!((api.ready, api.blocked, api.claimed, api.stale), (1, 1, 2, 1));

        let web = &status.namespaces[1];
        assert_eq!((web.completed, web.malformed), (1, 1));

        assert_eq!(status.active_workers, BTreeSet::from([worker("w2")]));
        assert_eq!(status.totals().claimed, 2);
    }

    #[tokio::test]
    async fn cycles_are_listed() {
        let fx = Fixture::new();
        fx.put(Task::new(ns("api"), id("A"), 1).with_dependencies([id("B")])).await;
        fx.put(Task::new(ns("api"), id("B"), 1).with_dependencies([id("A")])).await;

        let status = BacklogStatus::from_backlog(
            &fx.backlog().await,
            fx.clock.now(),
            Duration::from_secs(30),
        );
        assert_eq!(status.namespaces[0].blocked, 2);
        assert_eq!(status.namespaces[0].cycles, vec![vec![id("A"), id("B")]]);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["namespaces"][0]["cycles"][0][1], "B");
    }
}
