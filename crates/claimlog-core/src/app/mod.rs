//! App - the coordination protocol built on top of the ports.
//!
//! # Components
//! - **router**: which namespaces a caller may draw from
//! - **claim**: acquire one task (optimistic publish + backoff)
//! - **heartbeat**: keep a lease alive
//! - **complete**: finish a task, report unlocked dependents
//! - **reaper_loop**: reclaim stale leases, one publish per task
//! - **worker_loop**: claim -> heartbeat -> run -> complete
//! - **status**: backlog report
//! - **builder**: wiring + fail-fast validation (`Coordinator`)
//!
//! Every operation follows the same shape: sync, decide on the fresh view,
//! publish against the revision it read, and on rejection throw the local
//! mutation away and start over.

pub mod builder;
pub mod claim;
pub mod complete;
pub mod heartbeat;
pub mod reaper_loop;
pub mod router;
pub mod status;
pub mod worker_loop;

use std::sync::Arc;

use crate::backlog::{Backlog, Layout, RetryPolicy};
use crate::domain::{BranchName, Task};
use crate::error::{RecordError, SubstrateError};
use crate::ports::{ChangeSet, Clock, PublishOutcome, Revision, Sleeper, Substrate};

pub use self::builder::{Coordinator, CoordinatorBuilder};
pub use self::claim::{ClaimOutcome, ClaimProtocol, Lease, LeaseStatus};
pub use self::complete::{Completion, CompletionOutcome};
pub use self::heartbeat::{HeartbeatHandle, HeartbeatManager, LeaseSignal, Renewed};
pub use self::reaper_loop::{ReaperLoop, ReclaimReport, Reclaimer};
pub use self::router::NamespaceScope;
pub use self::status::{BacklogStatus, NamespaceStatus};
pub use self::worker_loop::{TaskRunner, WorkerLoop, WorkerLoopHandle};

/// Capabilities shared by every protocol component.
///
/// Cheap to clone; components keep their own copy.
#[derive(Clone)]
pub struct Services {
    pub substrate: Arc<dyn Substrate>,
    pub clock: Arc<dyn Clock>,
    pub sleeper: Arc<dyn Sleeper>,
    pub layout: Layout,
    pub retry: RetryPolicy,
}

impl Services {
    /// Fresh view of the branch head.
    pub async fn load(&self, branch: &BranchName) -> Result<Backlog, SubstrateError> {
        let snapshot = self.substrate.sync(branch).await?;
        Ok(Backlog::from_snapshot(&self.layout, &snapshot))
    }

    /// Propose one rewritten task on top of `base`.
    pub async fn publish_task<E>(
        &self,
        branch: &BranchName,
        base: &Revision,
        task: &Task,
        message: String,
    ) -> Result<PublishOutcome, E>
    where
        E: From<RecordError> + From<SubstrateError>,
    {
        let (path, bytes) = crate::backlog::record::encode(&self.layout, task)?;
        let changes = ChangeSet::new(message).write(path, bytes);
        Ok(self.substrate.publish(branch, base, changes).await?)
    }

    /// Sleep before retry number `attempt`.
    pub async fn back_off(&self, attempt: u32) {
        self.sleeper.sleep(self.retry.delay_after(attempt)).await;
    }
}
