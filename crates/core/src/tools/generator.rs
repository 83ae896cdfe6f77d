//! # Code Generator
//!
//! The seam where an external agent produces the actual change for a task.
//! The scheduler only cares about the trait; the default implementation
//! shells out to a configured command and reads the diff from stdout.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::state::Task;
use crate::tools::runner::CommandRunner;

/// A change produced for one task
#[derive(Debug, Clone)]
pub struct GeneratedChange {
    pub summary: String,
    /// Unified diff text, stored as the task payload for review
    pub diff: String,
    /// Files the change touches
    pub files: Vec<String>,
}

/// Produces a code change for a claimed task
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    /// Generate a change for `task`. `test_output` carries the failing test
    /// run that the change must turn green. `Err` means the generator
    /// itself broke; an unusable change should still come back `Ok` and be
    /// caught by the re-run of the test.
    async fn generate(&self, task: &Task, test_output: &str) -> anyhow::Result<GeneratedChange>;
}

/// Generator that shells out to an external command.
///
/// The command template may contain `{task_id}`, `{title}`, and `{concern}`
/// placeholders. The failing test output is piped in via the
/// `FORGE_TEST_OUTPUT` environment-style shell assignment, and the diff is
/// read from stdout.
pub struct CommandGenerator {
    runner: Arc<dyn CommandRunner>,
    command: String,
    timeout: Duration,
}

impl CommandGenerator {
    pub fn new(runner: Arc<dyn CommandRunner>, command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            runner,
            command: command.into(),
            timeout,
        }
    }

    fn render(&self, task: &Task) -> String {
        self.command
            .replace("{task_id}", &task.id)
            .replace("{title}", &shell_quote(&task.title))
            .replace("{concern}", task.concern.as_str())
    }
}

#[async_trait]
impl CodeGenerator for CommandGenerator {
    async fn generate(&self, task: &Task, test_output: &str) -> anyhow::Result<GeneratedChange> {
        let command = format!(
            "FORGE_TEST_OUTPUT={} {}",
            shell_quote(test_output),
            self.render(task)
        );
        let out = self.runner.run(&command, self.timeout).await?;
        if !out.success() {
            anyhow::bail!(
                "generator exited with {} for task {}: {}",
                out.exit_code,
                task.id,
                out.stderr.trim()
            );
        }

        Ok(GeneratedChange {
            summary: format!("generated change for {}", task.id),
            diff: out.stdout,
            files: task.files.clone(),
        })
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
