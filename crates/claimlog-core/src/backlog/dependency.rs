//! Dependency graph for one namespace.
//!
//! Design:
//! - Forward edges: task -> tasks it depends on (waits for)
//! - Reverse edges: task -> tasks that depend on it (waiting tasks)
//! - Invariant: edges and reverse_edges are always updated together
//!
//! The graph is rebuilt from every fresh backlog view. Nothing here is cached
//! across protocol calls.

use std::collections::{BTreeMap, BTreeSet};

use crate::domain::{Task, TaskId};

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// task -> tasks it waits for
    edges: BTreeMap<TaskId, BTreeSet<TaskId>>,

    /// task -> tasks waiting for it
    reverse_edges: BTreeMap<TaskId, BTreeSet<TaskId>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    /// On the current DFS path.
    Gray,
    /// Fully explored.
    Black,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut graph = Self::new();
        for task in tasks {
            for dep in &task.dependencies {
                graph.add_dependency(task.id.clone(), dep.clone());
            }
        }
        graph
    }

    /// `task` waits for `depends_on`.
    pub fn add_dependency(&mut self, task: TaskId, depends_on: TaskId) {
        self.edges
            .entry(task.clone())
            .or_default()
            .insert(depends_on.clone());
        self.reverse_edges.entry(depends_on).or_default().insert(task);
    }

    /// What `task` waits for.
    pub fn waiting_on(&self, task: &TaskId) -> impl Iterator<Item = &TaskId> {
        self.edges.get(task).into_iter().flatten()
    }

    /// Who waits for `task`. Callers still have to check the dependents'
    /// other prerequisites.
    pub fn dependents_of(&self, task: &TaskId) -> impl Iterator<Item = &TaskId> {
        self.reverse_edges.get(task).into_iter().flatten()
    }

    /// Every cycle reachable by a back edge, each listed from its entry point.
    ///
    /// Tasks on a cycle can never become eligible.
    pub fn cycles(&self) -> Vec<Vec<TaskId>> {
        let mut color: BTreeMap<&TaskId, Color> = BTreeMap::new();
        let mut path: Vec<&TaskId> = Vec::new();
        let mut found = Vec::new();

        for start in self.edges.keys() {
            if !color.contains_key(start) {
                self.visit(start, &mut color, &mut path, &mut found);
            }
        }
        found
    }

    /// Recursive DFS with white (absent) / gray / black coloring.
    fn visit<'a>(
        &'a self,
        node: &'a TaskId,
        color: &mut BTreeMap<&'a TaskId, Color>,
        path: &mut Vec<&'a TaskId>,
        found: &mut Vec<Vec<TaskId>>,
    ) {
        color.insert(node, Color::Gray);
        path.push(node);

        for dep in self.waiting_on(node) {
            match color.get(dep) {
                Some(Color::Gray) => {
                    // back edge: dep .. node is on the path
                    if let Some(pos) = path.iter().position(|n| *n == dep) {
                        found.push(path[pos..].iter().map(|id| (*id).clone()).collect());
                    }
                }
                Some(Color::Black) => {}
                None => self.visit(dep, color, path, found),
            }
        }

        path.pop();
        color.insert(node, Color::Black);
    }
}
