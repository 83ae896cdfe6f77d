//! # Delivery Client
//!
//! Commit and deploy handoffs for tasks that cleared review. Command-backed
//! by default; the pipeline only sees the trait.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::state::Task;
use crate::tools::runner::CommandRunner;

/// Lands accepted changes
#[async_trait]
pub trait DeliveryClient: Send + Sync {
    async fn commit(&self, task: &Task) -> anyhow::Result<()>;
    async fn deploy(&self, task: &Task) -> anyhow::Result<()>;
}

/// Delivery via configured shell commands. Each template may use the
/// `{task_id}` and `{title}` placeholders.
pub struct CommandDelivery {
    runner: Arc<dyn CommandRunner>,
    commit_command: String,
    deploy_command: String,
    timeout: Duration,
}

impl CommandDelivery {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        commit_command: impl Into<String>,
        deploy_command: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            commit_command: commit_command.into(),
            deploy_command: deploy_command.into(),
            timeout,
        }
    }

    async fn run_step(&self, step: &str, template: &str, task: &Task) -> anyhow::Result<()> {
        let command = template
            .replace("{task_id}", &task.id)
            .replace("{title}", &task.title.replace('\'', ""));
        let out = self.runner.run(&command, self.timeout).await?;
        if !out.success() {
            anyhow::bail!(
                "{} failed for task {} (exit {}): {}",
                step,
                task.id,
                out.exit_code,
                out.stderr.trim()
            );
        }
        tracing::info!(task = %task.id, step = %step, "Delivery step complete");
        Ok(())
    }
}

#[async_trait]
impl DeliveryClient for CommandDelivery {
    async fn commit(&self, task: &Task) -> anyhow::Result<()> {
        self.run_step("commit", &self.commit_command, task).await
    }

    async fn deploy(&self, task: &Task) -> anyhow::Result<()> {
        self.run_step("deploy", &self.deploy_command, task).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::runner::ProcessRunner;

    #[tokio::test]
    async fn test_command_delivery_success_and_failure() {
        let runner = Arc::new(ProcessRunner::new("."));
        let delivery = CommandDelivery::new(
            runner,
            "true # {task_id}",
            "false",
            Duration::from_secs(5),
        );
        let task = crate::state::Task::new("t", "x");

        assert!(delivery.commit(&task).await.is_ok());
        assert!(delivery.deploy(&task).await.is_err());
    }
}
