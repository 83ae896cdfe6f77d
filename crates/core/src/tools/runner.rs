//! # Command Runner
//!
//! Shell command execution with a hard timeout. Tests, builds, and hook
//! commands all go through this trait so the scheduler can be driven by a
//! scripted runner in tests.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// Captured result of one command run
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Executes shell commands on behalf of the pipeline
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command` through the shell, killing it at `timeout`. A timeout
    /// is reported as a failed run, not an error; `Err` means the command
    /// could not be spawned or its output could not be read.
    async fn run(&self, command: &str, timeout: Duration) -> anyhow::Result<RunOutput>;
}

/// Real subprocess runner rooted at a working directory
pub struct ProcessRunner {
    workdir: PathBuf,
}

impl ProcessRunner {
    pub fn new<P: AsRef<Path>>(workdir: P) -> Self {
        Self {
            workdir: workdir.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, command: &str, timeout: Duration) -> anyhow::Result<RunOutput> {
        tracing::debug!(command = %command, "Running command");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group so a timeout kill takes the whole tree
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn()?;
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        let wait = async {
            if let Some(pipe) = stdout_pipe.as_mut() {
                pipe.read_to_end(&mut stdout).await?;
            }
            if let Some(pipe) = stderr_pipe.as_mut() {
                pipe.read_to_end(&mut stderr).await?;
            }
            child.wait().await
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(status) => {
                let status = status?;
                Ok(RunOutput {
                    exit_code: status.code().unwrap_or(-1),
                    stdout: String::from_utf8_lossy(&stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&stderr).into_owned(),
                })
            }
            Err(_) => {
                tracing::warn!(command = %command, ?timeout, "Command timed out, killing");
                kill_group(&mut child).await;
                Ok(RunOutput {
                    exit_code: -1,
                    stdout: String::from_utf8_lossy(&stdout).into_owned(),
                    stderr: format!("timed out after {:?}", timeout),
                })
            }
        }
    }
}

/// Kill a timed-out command and everything it spawned. The child owns its
/// process group (see `process_group(0)` above), so signaling the negative
/// pgid reaches background and grandchild processes too.
#[cfg(unix)]
async fn kill_group(child: &mut tokio::process::Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
    child.kill().await.ok();
}

#[cfg(not(unix))]
async fn kill_group(child: &mut tokio::process::Child) {
    child.kill().await.ok();
}
