//! Shell execution seam.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;

use cffaas_common::error::{FaasError, Result};

/// Runs one user command in a working directory with an environment.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        cwd: &Path,
        envs: &HashMap<String, String>,
        command: &str,
    ) -> Result<()>;
}

/// Executes commands through `bash -c`, inheriting stdout/stderr so command
/// output lands in the worker's log stream.
pub struct ShellExecutor {
    timeout: Duration,
}

impl ShellExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    async fn execute(
        &self,
        cwd: &Path,
        envs: &HashMap<String, String>,
        command: &str,
    ) -> Result<()> {
        let mut cmd = tokio::process::Command::new("bash");
        cmd.arg("-c")
            .arg(command)
            .current_dir(cwd)
            .envs(envs)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let status = tokio::time::timeout(self.timeout, cmd.status())
            .await
            .map_err(|_| FaasError::DeadlineExceeded(self.timeout.as_millis() as u64))??;

        if !status.success() {
            return Err(FaasError::Execution(format!(
                "command exited with {}",
                status
            )));
        }

        Ok(())
    }
}
