//! Task record codec: one JSON document per task.
//!
//! ```text
//! <root>/<namespace>/tasks/<task-id>.json
//! ```
//!
//! The path carries identity only. State lives in the `lifecycle` field, so a
//! transition rewrites one file and a task can never exist twice.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::domain::{Lifecycle, Namespace, Task, TaskId};
use crate::error::RecordError;

pub const DEFAULT_TASKS_ROOT: &str = "projects";

const TASKS_DIR: &str = "tasks";
const EXTENSION: &str = ".json";

/// Where task records live inside a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: String,
}

/// A snapshot path that belongs to a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Located<'a> {
    pub namespace: &'a str,

    /// File stem when the path is a task record.
    pub task: Option<&'a str>,
}

impl Layout {
    pub fn new(root: impl Into<String>) -> Self {
        let root: String = root.into();
        Self {
            root: root.trim_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn task_path(&self, namespace: &Namespace, id: &TaskId) -> String {
        if self.root.is_empty() {
            format!("{namespace}/{TASKS_DIR}/{id}{EXTENSION}")
        } else {
            format!("{}/{namespace}/{TASKS_DIR}/{id}{EXTENSION}", self.root)
        }
    }

    /// `None` for paths outside the root.
    pub(crate) fn locate<'a>(&self, path: &'a str) -> Option<Located<'a>> {
        let rest = if self.root.is_empty() {
            path
        } else {
            path.strip_prefix(self.root.as_str())?.strip_prefix('/')?
        };

        let mut parts = rest.split('/');
        let namespace = parts.next().filter(|ns| !ns.is_empty())?;
        // A bare file directly under the root is not a namespace.
        let second = parts.next()?;

        let task = match (second, parts.next(), parts.next()) {
            (TASKS_DIR, Some(file), None) => file.strip_suffix(EXTENSION),
            _ => None,
        };
        Some(Located { namespace, task })
    }
}

impl Default for Layout {
    fn default() -> Self {
        Self::new(DEFAULT_TASKS_ROOT)
    }
}

/// On-disk shape of a task.
///
/// Fields this crate does not know about (`title`, planner notes, ...) are
/// collected into `extra` and written back untouched.
#[derive(Debug, Serialize, Deserialize)]
struct TaskDocument {
    id: TaskId,
    priority: i32,

    #[serde(default)]
    dependencies: BTreeSet<TaskId>,

    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    required_capabilities: BTreeSet<String>,

    #[serde(default)]
    claim_count: u32,

    #[serde(default)]
    lifecycle: Lifecycle,

    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

/// Decode the record found at `path`.
///
/// The id inside the document must match the file name.
pub fn decode(
    namespace: &Namespace,
    id: &TaskId,
    path: &str,
    bytes: &[u8],
) -> Result<Task, RecordError> {
    let doc: TaskDocument = serde_json::from_slice(bytes).map_err(|e| RecordError {
        path: path.to_string(),
        reason: e.to_string(),
    })?;

    if &doc.id != id {
        return Err(RecordError {
            path: path.to_string(),
            reason: format!("record id {:?} does not match file name {:?}", doc.id.as_str(), id.as_str()),
        });
    }

    Ok(Task {
        namespace: namespace.clone(),
        id: doc.id,
        priority: doc.priority,
        dependencies: doc.dependencies,
        required_capabilities: doc.required_capabilities,
        claim_count: doc.claim_count,
        lifecycle: doc.lifecycle,
        metadata: doc.extra,
    })
}

/// Encode a task into `(path, bytes)`.
pub fn encode(layout: &Layout, task: &Task) -> Result<(String, Vec<u8>), RecordError> {
    let path = layout.task_path(&task.namespace, &task.id);
    let doc = TaskDocument {
        id: task.id.clone(),
        priority: task.priority,
        dependencies: task.dependencies.clone(),
        required_capabilities: task.required_capabilities.clone(),
        claim_count: task.claim_count,
        lifecycle: task.lifecycle.clone(),
        extra: task.metadata.clone(),
    };
    let mut bytes = serde_json::to_vec_pretty(&doc).map_err(|e| RecordError {
        path: path.clone(),
        reason: e.to_string(),
    })?;
    bytes.push(b'\n');
    Ok((path, bytes))
}
