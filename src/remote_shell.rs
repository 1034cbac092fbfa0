//! The remote management channel: sends a framed shell command to a compute
//! instance and returns whatever it captured, however it went.
//!
//! `RemoteShell::run` never returns `Err` — every failure mode (network
//! fault, API throttling, instance unreachable, command timeout) is folded
//! into a `ShellOutput` with `status: Failed` and a synthetic stderr
//! message, the same way the original implementation swallows every
//! exception inside its `_execute_remote_command` and returns a failure
//! dict instead of raising.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Terminal status of a dispatched command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellStatus {
    Success,
    Failed,
}

/// Captured result of dispatching a command over the remote channel.
///
/// `return_code` is best-effort: on a channel-level failure (never reaching
/// the instance, or timing out before it reported back) it is `1` and
/// `stdout` holds whatever was captured before the failure — which, per
/// spec.md's design note, may be empty.
#[derive(Debug, Clone)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: ShellStatus,
    pub return_code: i32,
}

impl ShellOutput {
    fn failed(stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            status: ShellStatus::Failed,
            return_code: 1,
        }
    }
}

/// Dispatches a shell command to a remote compute instance.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run `command` with a soft `timeout_sec` budget. Never raises: every
    /// failure is reported as a `ShellOutput` with `status: Failed`.
    async fn run(&self, command: &str, timeout_sec: u64) -> ShellOutput;
}

/// Production `RemoteShell` backed by AWS Systems Manager `send_command`.
///
/// Grounded on the original's SSM dispatch: `send_command` with the
/// `AWS-RunShellScript` document, then poll `get_command_invocation` at a
/// 2-second interval for `max(30, timeout_sec / 2)` attempts before giving
/// up — reproducing the waiter configuration in
/// `core.py::_execute_remote_command` (the AWS SDK for Rust has no
/// `command_executed` waiter equivalent to boto3's, so it is replicated by
/// hand here).
pub struct SsmRemoteShell {
    client: aws_sdk_ssm::Client,
    instance_id: String,
}

impl SsmRemoteShell {
    pub fn new(client: aws_sdk_ssm::Client, instance_id: impl Into<String>) -> Self {
        Self {
            client,
            instance_id: instance_id.into(),
        }
    }

    /// Build a client from the ambient AWS config (profile, static keys, or
    /// instance role, in that order of precedence — same as
    /// `create_aws_client` in the original).
    pub async fn from_env(region: &str, instance_id: impl Into<String>) -> Self {
        let region_provider = aws_config::Region::new(region.to_string());
        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(region_provider)
            .load()
            .await;
        Self::new(aws_sdk_ssm::Client::new(&sdk_config), instance_id)
    }
}

#[async_trait]
impl RemoteShell for SsmRemoteShell {
    async fn run(&self, command: &str, timeout_sec: u64) -> ShellOutput {
        let timeout_seconds = i32::try_from(timeout_sec.min(3600)).unwrap_or(3600);

        let send_result = self
            .client
            .send_command()
            .instance_ids(&self.instance_id)
            .document_name("AWS-RunShellScript")
            .parameters("commands", vec![command.to_string()])
            .timeout_seconds(timeout_seconds)
            .send()
            .await;

        let command_id = match send_result {
            Ok(output) => match output.command().and_then(|c| c.command_id()) {
                Some(id) => id.to_string(),
                None => return ShellOutput::failed("SSM send_command returned no command id"),
            },
            Err(e) => {
                warn!(error = %e, "SSM send_command failed");
                return ShellOutput::failed(e.to_string());
            }
        };

        let max_attempts = (timeout_sec / 2).max(30);
        for attempt in 0..max_attempts {
            tokio::time::sleep(Duration::from_secs(2)).await;

            let invocation = self
                .client
                .get_command_invocation()
                .command_id(&command_id)
                .instance_id(&self.instance_id)
                .send()
                .await;

            match invocation {
                Ok(output) => {
                    let status = output.status().map(|s| s.as_str()).unwrap_or("Unknown");
                    if status == "Pending" || status == "InProgress" || status == "Delayed" {
                        debug!(attempt, %status, "Command still running");
                        continue;
                    }

                    let stdout = output.standard_output_content().unwrap_or_default().to_string();
                    let stderr = output.standard_error_content().unwrap_or_default().to_string();
                    let return_code = output.response_code();

                    return ShellOutput {
                        stdout,
                        stderr,
                        status: if status == "Success" {
                            ShellStatus::Success
                        } else {
                            ShellStatus::Failed
                        },
                        return_code,
                    };
                }
                Err(e) => {
                    warn!(error = %e, "get_command_invocation failed");
                    return ShellOutput::failed(e.to_string());
                }
            }
        }

        ShellOutput::failed(format!(
            "Command {command_id} did not complete within {max_attempts} polling attempts"
        ))
    }
}

/// `RemoteShell` that runs commands on the local machine via a subprocess
/// shell. Used by tests and by deployments without a live cloud management
/// channel.
///
/// Grounded on the teacher's `JailBackend::execute`: spawn with piped
/// stdio, write the command to a shell's stdin (here, pass it as `-c`
/// directly since there is no jail wrapper to feed via stdin), and await
/// with `tokio::time::timeout`.
#[derive(Debug, Default, Clone)]
pub struct ProcessRemoteShell;

impl ProcessRemoteShell {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RemoteShell for ProcessRemoteShell {
    async fn run(&self, command: &str, timeout_sec: u64) -> ShellOutput {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return ShellOutput::failed(format!("Failed to spawn shell: {e}")),
        };

        let timeout_duration = Duration::from_secs(timeout_sec);
        match tokio::time::timeout(timeout_duration, child.wait_with_output()).await {
            Ok(Ok(output)) => ShellOutput {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                status: if output.status.success() {
                    ShellStatus::Success
                } else {
                    ShellStatus::Failed
                },
                return_code: output.status.code().unwrap_or(1),
            },
            Ok(Err(e)) => ShellOutput::failed(format!("Failed to wait for process: {e}")),
            Err(_) => ShellOutput::failed(format!("Command timed out after {timeout_sec}s")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn process_shell_runs_successful_command() {
        let shell = ProcessRemoteShell::new();
        let out = shell.run("echo hello", 5).await;
        assert_eq!(out.status, ShellStatus::Success);
        assert_eq!(out.return_code, 0);
        assert!(out.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn process_shell_reports_nonzero_exit() {
        let shell = ProcessRemoteShell::new();
        let out = shell.run("exit 7", 5).await;
        assert_eq!(out.status, ShellStatus::Failed);
        assert_eq!(out.return_code, 7);
    }

    #[tokio::test]
    async fn process_shell_times_out_without_raising() {
        let shell = ProcessRemoteShell::new();
        let out = shell.run("sleep 5", 1).await;
        assert_eq!(out.status, ShellStatus::Failed);
        assert!(out.stderr.contains("timed out"));
    }
}
