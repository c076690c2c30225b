//! Domain model (names, lifecycle states, tasks).

pub mod ids;
pub mod state;
pub mod task;

pub use ids::{BranchName, DEFAULT_BRANCH, Namespace, NameMarker, TaskId, WorkerId};
pub use state::TaskState;
pub use task::{ClaimRecord, CompletionRecord, Lifecycle, Task};
