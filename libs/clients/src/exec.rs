//! Remote command execution and file transfer.

use std::path::Path;

use async_trait::async_trait;
use rigpool_model::Credentials;
use tokio::process::Command;
use tracing::debug;

use crate::error::{ClientError, ClientResult};

/// Where and as whom to run a remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub address: String,
    pub user: String,
    pub credentials: Credentials,
}

/// Result of a remote command or transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct CommandOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn succeeded(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code: Some(exit_code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// A command that could not be *started* is an `Err`; a command that ran
/// and failed is an `Ok` output with `success == false`.
#[async_trait]
pub trait RemoteExec: Send + Sync {
    async fn run(&self, target: &RemoteTarget, command: &str) -> ClientResult<CommandOutput>;

    async fn copy_to(
        &self,
        target: &RemoteTarget,
        local: &Path,
        remote: &str,
    ) -> ClientResult<CommandOutput>;

    async fn copy_from(
        &self,
        target: &RemoteTarget,
        remote: &str,
        local: &Path,
    ) -> ClientResult<CommandOutput>;
}

/// Password-authenticated ssh/scp through `sshpass`.
///
/// The password is passed via the `SSHPASS` environment variable so it never
/// shows up in the process list.
#[derive(Debug, Clone)]
pub struct SshExec {
    connect_timeout_secs: u64,
}

impl SshExec {
    pub fn new(connect_timeout_secs: u64) -> Self {
        Self {
            connect_timeout_secs,
        }
    }

    fn common_options(&self) -> Vec<String> {
        vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
        ]
    }

    fn ssh_args(&self, target: &RemoteTarget, command: &str) -> Vec<String> {
        let mut args = vec!["-e".to_string(), "ssh".to_string()];
        args.extend(self.common_options());
        args.push(format!("{}@{}", target.user, target.address));
        args.push(command.to_string());
        args
    }

    fn scp_args(&self, from: String, to: String) -> Vec<String> {
        let mut args = vec!["-e".to_string(), "scp".to_string()];
        args.extend(self.common_options());
        args.push(from);
        args.push(to);
        args
    }

    async fn sshpass(&self, target: &RemoteTarget, args: Vec<String>) -> ClientResult<CommandOutput> {
        debug!(address = %target.address, program = %args[1], "Running remote operation");
        let output = Command::new("sshpass")
            .args(&args)
            .env("SSHPASS", &target.credentials.password)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ClientError::Spawn {
                program: "sshpass".to_string(),
                source,
            })?;

        Ok(CommandOutput {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

impl Default for SshExec {
    fn default() -> Self {
        Self::new(30)
    }
}

#[async_trait]
impl RemoteExec for SshExec {
    async fn run(&self, target: &RemoteTarget, command: &str) -> ClientResult<CommandOutput> {
        self.sshpass(target, self.ssh_args(target, command)).await
    }

    async fn copy_to(
        &self,
        target: &RemoteTarget,
        local: &Path,
        remote: &str,
    ) -> ClientResult<CommandOutput> {
        let args = self.scp_args(
            local.display().to_string(),
            format!("{}@{}:{}", target.user, target.address, remote),
        );
        self.sshpass(target, args).await
    }

    async fn copy_from(
        &self,
        target: &RemoteTarget,
        remote: &str,
        local: &Path,
    ) -> ClientResult<CommandOutput> {
        let args = self.scp_args(
            format!("{}@{}:{}", target.user, target.address, remote),
            local.display().to_string(),
        );
        self.sshpass(target, args).await
    }
}
