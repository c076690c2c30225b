//! Backlog - a decoded, read-only view of one substrate snapshot.
//!
//! A `Backlog` is built fresh from every `sync` and thrown away after the
//! decision it was built for. Nothing in the protocol keeps one across calls.
//!
//! # Modules
//! - **record**: file layout + JSON codec for task records
//! - **dependency**: dependency graph and cycle detection
//! - **backoff**: jittered exponential backoff for publish retries

pub mod backoff;
pub mod dependency;
pub mod record;

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::domain::{Namespace, Task, TaskId, TaskState};
use crate::error::RecordError;
use crate::ports::{Revision, Snapshot};

pub use self::backoff::{BackoffPolicy, Jitter, RetryPolicy};
pub use self::dependency::DependencyGraph;
pub use self::record::{DEFAULT_TASKS_ROOT, Layout};

/// A task record that could not be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedRecord {
    /// `None` when the namespace directory name itself is invalid.
    pub namespace: Option<Namespace>,
    pub error: RecordError,
}

#[derive(Debug, Clone)]
pub struct Backlog {
    revision: Revision,
    namespaces: BTreeMap<Namespace, BTreeMap<TaskId, Task>>,
    malformed: Vec<MalformedRecord>,
}

impl Backlog {
    /// Decode every task record under the layout root.
    ///
    /// Malformed records are logged and set aside. They never abort the view:
    /// the rest of the namespace keeps working.
    pub fn from_snapshot(layout: &Layout, snapshot: &Snapshot) -> Self {
        let mut namespaces: BTreeMap<Namespace, BTreeMap<TaskId, Task>> = BTreeMap::new();
        let mut malformed = Vec::new();

        for (path, bytes) in &snapshot.files {
            let Some(located) = layout.locate(path) else {
                continue;
            };

            let namespace = match located.namespace.parse::<Namespace>() {
                Ok(ns) => ns,
                Err(e) => {
                    if located.task.is_some() {
                        malformed.push(MalformedRecord {
                            namespace: None,
                            error: RecordError {
                                path: path.clone(),
                                reason: e.to_string(),
                            },
                        });
                    }
                    continue;
                }
            };
            let tasks = namespaces.entry(namespace.clone()).or_default();

            let Some(stem) = located.task else {
                continue;
            };
            let decoded = stem
                .parse::<TaskId>()
                .map_err(|e| RecordError {
                    path: path.clone(),
                    reason: e.to_string(),
                })
                .and_then(|id| record::decode(&namespace, &id, path, bytes));

            match decoded {
                Ok(task) => {
                    tasks.insert(task.id.clone(), task);
                }
                Err(error) => malformed.push(MalformedRecord {
                    namespace: Some(namespace),
                    error,
                }),
            }
        }

        for record in &malformed {
            warn!(
                revision = %snapshot.revision,
                path = %record.error.path,
                reason = %record.error.reason,
                "skipping malformed task record"
            );
        }

        Self {
            revision: snapshot.revision.clone(),
            namespaces,
            malformed,
        }
    }

    /// Revision this view was decoded from. Publishes must be based on it.
    pub fn revision(&self) -> &Revision {
        &self.revision
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &Namespace> {
        self.namespaces.keys()
    }

    pub fn has_namespace(&self, namespace: &Namespace) -> bool {
        self.namespaces.contains_key(namespace)
    }

    pub fn get(&self, namespace: &Namespace, id: &TaskId) -> Option<&Task> {
        self.namespaces.get(namespace)?.get(id)
    }

    /// Tasks of one namespace, in id order.
    pub fn tasks(&self, namespace: &Namespace) -> impl Iterator<Item = &Task> {
        self.namespaces.get(namespace).into_iter().flat_map(|t| t.values())
    }

    /// Every task, in (namespace, id) order.
    pub fn all_tasks(&self) -> impl Iterator<Item = &Task> {
        self.namespaces.values().flat_map(|t| t.values())
    }

    pub fn malformed(&self) -> &[MalformedRecord] {
        &self.malformed
    }

    /// Prerequisites of `task` that are not `completed`.
    ///
    /// Unknown and malformed prerequisites count as unmet.
    pub fn unmet_dependencies<'a>(&'a self, task: &'a Task) -> impl Iterator<Item = &'a TaskId> {
        task.dependencies.iter().filter(move |dep| {
            self.get(&task.namespace, dep)
                .is_none_or(|d| d.state() != TaskState::Completed)
        })
    }

    /// `ready` and every prerequisite `completed`.
    pub fn is_eligible(&self, task: &Task) -> bool {
        task.state() == TaskState::Ready && self.unmet_dependencies(task).next().is_none()
    }

    /// `ready` but still waiting on a prerequisite.
    pub fn is_blocked(&self, task: &Task) -> bool {
        task.state() == TaskState::Ready && self.unmet_dependencies(task).next().is_some()
    }

    /// Eligible tasks in the given namespaces that a worker offering
    /// `capabilities` may take, best candidate first.
    ///
    /// Order: priority descending, then namespace, then task id. Every worker
    /// looking at the same revision computes the same ranking.
    pub fn eligible<'a>(&'a self, namespaces: &[Namespace], capabilities: &BTreeSet<String>) -> Vec<&'a Task> {
        let mut ranked: Vec<&Task> = namespaces
            .iter()
            .flat_map(|ns| self.tasks(ns))
            .filter(|task| self.is_eligible(task) && task.accepts(capabilities))
            .collect();
        ranked.sort_by(|a, b| {
            Reverse(a.priority)
                .cmp(&Reverse(b.priority))
                .then_with(|| a.namespace.cmp(&b.namespace))
                .then_with(|| a.id.cmp(&b.id))
        });
        ranked.dedup_by(|a, b| a.namespace == b.namespace && a.id == b.id);
        ranked
    }

    /// Claimed tasks whose last sign of life is older than `timeout`.
    pub fn stale_claims(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<&Task> {
        self.all_tasks()
            .filter(|task| {
                task.claim_record()
                    .is_some_and(|claim| claim.is_stale(now, timeout))
            })
            .collect()
    }

    /// Dependents of `completed` (same namespace) that become eligible once it
    /// is `completed`, judged against this view.
    ///
    /// Only `ready` dependents are reported. They need no rewrite: eligibility
    /// is derived, never stored.
    pub fn dependents_unlocked_by(&self, namespace: &Namespace, completed: &TaskId) -> Vec<TaskId> {
        self.dependency_graph(namespace)
            .dependents_of(completed)
            .filter_map(|id| self.get(namespace, id))
            .filter(|task| task.state() == TaskState::Ready)
            .filter(|task| self.unmet_dependencies(task).all(|dep| dep == completed))
            .map(|task| task.id.clone())
            .collect()
    }

    pub fn dependency_graph(&self, namespace: &Namespace) -> DependencyGraph {
        DependencyGraph::from_tasks(self.tasks(namespace))
    }

    /// Distinct task ids of one namespace that sit on a dependency cycle.
    pub fn cyclic_tasks(&self, namespace: &Namespace) -> BTreeSet<TaskId> {
        self.dependency_graph(namespace).cycles().into_iter().flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::WorkerId;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn ns(raw: &str) -> Namespace {
        raw.parse().unwrap()
    }

    fn id(raw: &str) -> TaskId {
        raw.parse().unwrap()
    }

    fn worker(raw: &str) -> WorkerId {
        raw.parse().unwrap()
    }

    fn snapshot(tasks: &[Task], extra: &[(&str, &str)]) -> Snapshot {
        let layout = Layout::default();
        let mut files = BTreeMap::new();
        for task in tasks {
            let (path, bytes) = record::encode(&layout, task).unwrap();
            files.insert(path, bytes);
        }
        for (path, body) in extra {
            files.insert(path.to_string(), body.as_bytes().to_vec());
        }
        Snapshot {
            revision: Revision::new("r1"),
            files,
        }
    }

    fn view(tasks: &[Task], extra: &[(&str, &str)]) -> Backlog {
        Backlog::from_snapshot(&Layout::default(), &snapshot(tasks, extra))
    }

    #[test]
    fn ranks_by_priority_then_namespace_then_id() {
        let backlog = view(
            &[
                Task::new(ns("web"), id("T-1"), 5),
                Task::new(ns("api"), id("T-9"), 5),
                Task::new(ns("api"), id("T-2"), 5),
                Task::new(ns("api"), id("T-3"), 9),
                Task::new(ns("api"), id("T-0"), 1),
            ],
            &[],
        );
        let all: Vec<Namespace> = backlog.namespaces().cloned().collect();
        let order: Vec<String> = backlog
            .eligible(&all, &BTreeSet::new())
            .iter()
            .map(|t| format!("{}/{}", t.namespace, t.id))
            .collect();
        assert_eq!(order, vec!["api/T-3", "api/T-2", "api/T-9", "web/T-1", "api/T-0"]);
    }

    #[test]
    fn dependencies_gate_eligibility() {
        let b = Task::new(ns("api"), id("B"), 1);
        let a = Task::new(ns("api"), id("A"), 9).with_dependencies([id("B")]);
        let backlog = view(&[a.clone(), b.clone()], &[]);

        let eligible: Vec<&TaskId> = backlog.eligible(&[ns("api")], &BTreeSet::new()).iter().map(|t| &t.id).collect();
        assert_eq!(eligible, vec![&id("B")]);
        assert!(backlog.is_blocked(backlog.get(&ns("api"), &id("A")).unwrap()));
        assert_eq!(backlog.dependents_unlocked_by(&ns("api"), &id("B")), vec![id("A")]);

        let done = b
            .claim(&worker("w1"), at(0))
            .unwrap()
            .complete(&worker("w1"), at(1), None)
            .unwrap();
        let backlog = view(&[a, done], &[]);
        let eligible: Vec<&TaskId> = backlog.eligible(&[ns("api")], &BTreeSet::new()).iter().map(|t| &t.id).collect();
        assert_eq!(eligible, vec![&id("A")]);
    }

    #[test]
    fn capabilities_narrow_the_candidates() {
        let backlog = view(
            &[
                Task::new(ns("api"), id("GPU"), 9).with_required_capabilities(["gpu"]),
                Task::new(ns("api"), id("SQL"), 5).with_required_capabilities(["python", "sql"]),
                Task::new(ns("api"), id("ANY"), 1),
            ],
            &[],
        );
        let ids = |offered: &[&str]| -> Vec<TaskId> {
            let offered: BTreeSet<String> = offered.iter().map(|c| c.to_string()).collect();
            backlog
                .eligible(&[ns("api")], &offered)
                .iter()
                .map(|t| t.id.clone())
                .collect()
        };

        assert_eq!(ids(&[]), vec![id("ANY")]);
        assert_eq!(ids(&["sql"]), vec![id("SQL"), id("ANY")]);
        assert_eq!(ids(&["gpu", "sql"]), vec![id("GPU"), id("SQL"), id("ANY")]);
    }

    #[test]
    fn unknown_dependencies_are_never_satisfied() {
        let a = Task::new(ns("api"), id("A"), 1).with_dependencies([id("GHOST")]);
        let backlog = view(&[a], &[]);
        assert!(backlog.eligible(&[ns("api")], &BTreeSet::new()).is_empty());
    }

    #[test]
    fn partial_unlock_is_not_reported() {
        let a = Task::new(ns("api"), id("A"), 1).with_dependencies([id("B"), id("C")]);
        let b = Task::new(ns("api"), id("B"), 1);
        let c = Task::new(ns("api"), id("C"), 1);
        let backlog = view(&[a, b, c], &[]);
        assert!(backlog.dependents_unlocked_by(&ns("api"), &id("B")).is_empty());
    }

    #[test]
    fn malformed_records_are_set_aside() {
        let good = Task::new(ns("api"), id("OK"), 1);
        let backlog = view(
            &[good],
            &[
                ("projects/api/tasks/BAD.json", r#"{ "id": "BAD" }"#),
                ("projects/api/tasks/bad name.json", r#"{ "id": "x", "priority": 1 }"#),
                ("projects/api/README.md", "notes"),
            ],
        );

        assert_eq!(backlog.malformed().len(), 2);
        assert!(backlog.malformed().iter().all(|m| m.namespace == Some(ns("api"))));
        assert_eq!(backlog.tasks(&ns("api")).count(), 1);
        assert_eq!(backlog.eligible(&[ns("api")], &BTreeSet::new()).len(), 1);
    }

    #[test]
    fn namespaces_without_tasks_are_still_discovered() {
        let backlog = view(&[], &[("projects/empty/.keep", "")]);
        assert!(backlog.has_namespace(&ns("empty")));
        assert_eq!(backlog.tasks(&ns("empty")).count(), 0);
    }

    #[test]
    fn stale_claims_respect_heartbeats() {
        let timeout = Duration::from_secs(30);
        let silent = Task::new(ns("api"), id("SILENT"), 1)
            .claim(&worker("w1"), at(0))
            .unwrap();
        let alive = Task::new(ns("api"), id("ALIVE"), 1)
            .claim(&worker("w2"), at(0))
            .unwrap()
            .renew(at(20))
            .unwrap();
        let backlog = view(&[silent, alive], &[]);

        let stale: Vec<&TaskId> = backlog.stale_claims(at(35), timeout).iter().map(|t| &t.id).collect();
        assert_eq!(stale, vec![&id("SILENT")]);
    }

    #[test]
    fn cycles_are_reported_per_namespace() {
        let a = Task::new(ns("api"), id("A"), 1).with_dependencies([id("B")]);
        let b = Task::new(ns("api"), id("B"), 1).with_dependencies([id("A")]);
        let c = Task::new(ns("api"), id("C"), 1);
        let backlog = view(&[a, b, c], &[]);

        assert_eq!(backlog.cyclic_tasks(&ns("api")), BTreeSet::from([id("A"), id("B")]));
        assert!(backlog.eligible(&[ns("api")], &BTreeSet::new()).iter().all(|t| t.id == id("C")));
    }
}
