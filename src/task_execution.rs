//! Task execution facade (component E): the public entry point for
//! `execute_code_in_sandbox`, sitting in front of `SandboxEnv::run_task`.
//!
//! Grounded on `strands_tools.py::execute_code_in_sandbox`'s 70 KiB guard
//! (the exact `MAX_CODE_SIZE = 71680` boundary and its multi-point
//! optimization-suggestion message) and on `sandbox.py`'s synthetic
//! `task_<unix_time>` id when the caller omits one.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::sandbox_env::{ExecutionRequest, ExecutionResult, SandboxEnv};

/// Encoded-code safety limit: AWS SSM's actual command-size ceiling is
/// close to 99 KiB; 70 KiB (71680 bytes) leaves headroom for the
/// surrounding shell framing (ulimits, env exports, sentinel echoes).
pub const MAX_CODE_SIZE_BYTES: usize = 71_680;

fn code_too_large_message(code_size: usize) -> String {
    format!(
        "Code too long ({code_size} bytes = {:.1}KB), exceeds the safe limit.\n\n\
         Limit details:\n\
         - AWS SSM actual limit: ~99KB (total command size)\n\
         - Maximum code limit: ~72KB (measured boundary)\n\
         - Safe code limit: 70KB (recommended)\n\
         - Current code size: {:.1}KB\n\n\
         Suggestions:\n\
         1. Remove unnecessary comments, blank lines, and debug code\n\
         2. Use more concise variable and function names\n\
         3. Split complex logic into multiple simple functions\n\
         4. Avoid duplicated code; use loops and function reuse\n\
         5. Remove unused imports and dependencies\n\
         6. Consider breaking large tasks into multiple smaller steps\n\
         7. Prefer file input over hardcoding large amounts of data",
        code_size as f64 / 1024.0,
        code_size as f64 / 1024.0,
    )
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is after the epoch")
        .as_secs()
}

/// Runs `code` in the given session's sandbox, enforcing the code-size cap
/// before ever touching `SandboxEnv`, and injecting a synthetic task id
/// when the caller did not provide one.
#[allow(clippy::too_many_arguments)]
pub async fn execute_code_in_sandbox(
    env: &SandboxEnv,
    session_id: &str,
    session_dir: &str,
    task_id: Option<&str>,
    code: &str,
    runtime: &str,
    files: HashMap<String, String>,
    env_vars: HashMap<String, String>,
    create_filesystem: bool,
) -> ExecutionResult {
    let code_size = code.len();
    if code_size > MAX_CODE_SIZE_BYTES {
        return ExecutionResult {
            success: false,
            stdout: String::new(),
            stderr: code_too_large_message(code_size),
            return_code: 1,
            execution_time_secs: 0.0,
            working_directory: String::new(),
            files_created: Vec::new(),
            task_hash: None,
            error_message: Some(format!(
                "Code too long: {code_size} bytes ({:.1}KB) exceeds {MAX_CODE_SIZE_BYTES} bytes (70KB) safe limit",
                code_size as f64 / 1024.0
            )),
        };
    }

    let synthetic_task_id = task_id.map_or_else(|| format!("task_{}", unix_now()), str::to_string);

    env.run_task(ExecutionRequest {
        session_id,
        session_dir,
        task_id: Some(&synthetic_task_id),
        code,
        runtime,
        files,
        env_vars,
        create_filesystem,
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use crate::instance_inspector::{CpuUtilization, InstanceInspector, InstanceStatus};
    use crate::remote_shell::ProcessRemoteShell;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct StubInspector;

    #[async_trait]
    impl InstanceInspector for StubInspector {
        async fn status(&self) -> anyhow::Result<InstanceStatus> {
            Ok(InstanceStatus {
                instance_id: "i-stub".to_string(),
                state: "running".to_string(),
                instance_type: "t3.micro".to_string(),
                public_ip: None,
                private_ip: None,
                launch_time: String::new(),
                os_name: "Unknown".to_string(),
                cpu_utilization: CpuUtilization::NoData {
                    message: "stub".to_string(),
                    period_minutes: 5,
                },
            })
        }
    }

    fn test_env(base_dir: &str) -> SandboxEnv {
        SandboxEnv::new(
            SandboxConfig {
                instance_id: "i-test".to_string(),
                region: "us-east-1".to_string(),
                aws_profile: Some("default".to_string()),
                access_key_id: None,
                secret_access_key: None,
                session_token: None,
                base_sandbox_dir: base_dir.to_string(),
                max_execution_time: 30,
                max_memory_mb: 512,
                cleanup_after_hours: 24,
                allowed_runtimes: vec!["bash".to_string()],
                notes: None,
            },
            Arc::new(ProcessRemoteShell::new()),
            Arc::new(StubInspector),
        )
    }

    #[tokio::test]
    async fn rejects_code_over_70kib_without_touching_sandbox_env() {
        let dir = tempfile::tempdir().unwrap();
        let env = test_env(dir.path().to_str().unwrap());
        let oversized = "x".repeat(MAX_CODE_SIZE_BYTES + 1);
        let result = execute_code_in_sandbox(
            &env,
            "s1",
            dir.path().to_str().unwrap(),
            None,
            &oversized,
            "bash",
            HashMap::new(),
            HashMap::new(),
            true,
        )
        .await;
        assert!(!result.success);
        assert!(result.stderr.contains("exceeds the safe limit"));
        assert!(result.task_hash.is_none());
    }

    #[tokio::test]
    async fn accepts_code_at_the_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let env = test_env(dir.path().to_str().unwrap());
        let result = execute_code_in_sandbox(
            &env,
            "s1",
            dir.path().to_str().unwrap(),
            None,
            "echo hi",
            "bash",
            HashMap::new(),
            HashMap::new(),
            true,
        )
        .await;
        assert!(result.success, "stderr: {}", result.stderr);
    }
}
