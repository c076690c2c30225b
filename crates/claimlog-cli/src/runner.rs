//! ShellRunner - runs one shell command per claimed task.
//!
//! The task is described to the command through environment variables. A
//! non-empty last line on stdout becomes the completion's external reference.

use async_trait::async_trait;
use claimlog_core::app::Lease;
use claimlog_core::app::worker_loop::{RunError, TaskRunner};
use claimlog_core::domain::Task;
use tokio::process::Command;
use tracing::{debug, info};

pub struct ShellRunner {
    command: String,
}

impl ShellRunner {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl TaskRunner for ShellRunner {
    async fn run(&self, task: &Task, lease: &Lease) -> Result<Option<String>, RunError> {
        info!(namespace = %task.namespace, task = %task.id, command = %self.command, "running task");

        let dependencies = task
            .dependencies
            .iter()
            .map(|dep| dep.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("CLAIMLOG_NAMESPACE", task.namespace.as_str())
            .env("CLAIMLOG_TASK_ID", task.id.as_str())
            .env("CLAIMLOG_PRIORITY", task.priority.to_string())
            .env("CLAIMLOG_DEPENDENCIES", dependencies)
            .env("CLAIMLOG_WORKER", lease.owner.as_str())
            .env("CLAIMLOG_ATTEMPT", lease.attempt.to_string())
            .env("CLAIMLOG_METADATA", serde_json::Value::Object(task.metadata.clone()).to_string())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!("command exited with {}: {}", output.status, stderr.trim()).into());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let external_ref = stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string);
        debug!(task = %task.id, external_ref = ?external_ref, "command finished");
        Ok(external_ref)
    }
}
