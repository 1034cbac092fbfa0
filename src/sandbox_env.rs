//! Sandbox environment (component D): the per-instance singleton that
//! provisions directories, frames shell commands, dispatches them over a
//! `RemoteShell`, and parses the result.
//!
//! Grounded on `core.py::EC2SandboxEnv` (singleton cache, base-directory
//! provisioning, task filesystem creation, command framing, result
//! parsing, purge) and `sandbox.py::SandboxInstance.execute_code`
//! (per-runtime command construction, ulimits, sentinel parsing).

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::SandboxConfig;
use crate::instance_inspector::{InstanceInspector, InstanceStatus};
use crate::remote_shell::{RemoteShell, ShellOutput, ShellStatus};
use crate::retention::RetentionSweeper;
use crate::safety::{self, sanitize_env_var, TaskFingerprint};

/// Result of one `execute_code_in_sandbox` call (spec.md §3).
///
/// Every failure mode this crate can hit while running a task — an unsafe
/// filename, a disallowed runtime, a channel fault — is folded into this
/// struct with `success: false` rather than surfaced as an `Err`, matching
/// `sandbox.py::execute_code`'s blanket `except Exception` wrapping.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub return_code: i32,
    pub execution_time_secs: f64,
    pub working_directory: String,
    pub files_created: Vec<String>,
    pub task_hash: Option<String>,
    pub error_message: Option<String>,
}

impl ExecutionResult {
    fn failure(task_hash: Option<String>, message: impl Into<String>, elapsed: f64) -> Self {
        let message = message.into();
        Self {
            success: false,
            stdout: String::new(),
            stderr: message.clone(),
            return_code: 1,
            execution_time_secs: elapsed,
            working_directory: String::new(),
            files_created: Vec::new(),
            task_hash,
            error_message: Some(message),
        }
    }
}

/// Request to run code in a task directory under a session.
pub struct ExecutionRequest<'a> {
    pub session_id: &'a str,
    pub session_dir: &'a str,
    pub task_id: Option<&'a str>,
    pub code: &'a str,
    pub runtime: &'a str,
    pub files: HashMap<String, String>,
    pub env_vars: HashMap<String, String>,
    pub create_filesystem: bool,
}

/// Per-`(instance_id, region)` singleton, mirroring the original's
/// `__new__`-based instance cache but exposed through a safe associated
/// function instead of a constructor side effect.
pub struct SandboxEnv {
    pub config: SandboxConfig,
    remote_shell: Arc<dyn RemoteShell>,
    inspector: Arc<dyn InstanceInspector>,
    fingerprint_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    sweeper: StdMutex<Option<RetentionSweeper>>,
}

type SandboxEnvRegistry = StdMutex<HashMap<(String, String), Arc<SandboxEnv>>>;

fn registry() -> &'static SandboxEnvRegistry {
    static REGISTRY: OnceLock<SandboxEnvRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| StdMutex::new(HashMap::new()))
}

impl SandboxEnv {
    /// Get the cached environment for `(instance_id, region)`, or build and
    /// cache one via `build` if this is the first request for that key.
    pub async fn get_or_init<F, Fut>(config: SandboxConfig, build: F) -> Arc<Self>
    where
        F: FnOnce(SandboxConfig) -> Fut,
        Fut: std::future::Future<Output = Self>,
    {
        let key = (config.instance_id.clone(), config.region.clone());

        if let Some(existing) = registry().lock().expect("registry mutex poisoned").get(&key) {
            info!(instance_id = %key.0, "Reusing existing sandbox environment");
            return Arc::clone(existing);
        }

        info!(instance_id = %key.0, "Initializing sandbox environment");
        let env = Arc::new(build(config).await);
        env.ensure_base_directory().await;

        let base_dir = env.config.base_sandbox_dir.clone();
        let sweeper = RetentionSweeper::start(Arc::clone(&env), base_dir, Duration::from_secs(3600));
        *env.sweeper.lock().expect("sweeper mutex poisoned") = Some(sweeper);

        let mut guard = registry().lock().expect("registry mutex poisoned");
        Arc::clone(guard.entry(key).or_insert(env))
    }

    pub fn new(config: SandboxConfig, remote_shell: Arc<dyn RemoteShell>, inspector: Arc<dyn InstanceInspector>) -> Self {
        Self {
            config,
            remote_shell,
            inspector,
            fingerprint_locks: Mutex::new(HashMap::new()),
            sweeper: StdMutex::new(None),
        }
    }

    /// Assemble a production `SandboxEnv` from a validated `SandboxConfig`,
    /// wiring up `SsmRemoteShell` and `Ec2InstanceInspector` against the
    /// AWS credentials the profile resolves to. Grounded on
    /// `utils.py::create_aws_client`'s precedence: an explicit profile
    /// wins, then static access keys (with optional session token), then
    /// the default chain (instance role).
    pub async fn from_config(config: SandboxConfig) -> Self {
        let sdk_config = build_sdk_config(&config).await;
        let remote_shell = Arc::new(crate::remote_shell::SsmRemoteShell::new(
            aws_sdk_ssm::Client::new(&sdk_config),
            config.instance_id.clone(),
        ));
        let inspector = Arc::new(crate::instance_inspector::Ec2InstanceInspector::new(
            aws_sdk_ec2::Client::new(&sdk_config),
            aws_sdk_cloudwatch::Client::new(&sdk_config),
            config.instance_id.clone(),
        ));
        Self::new(config, remote_shell, inspector)
    }

    async fn ensure_base_directory(&self) {
        let dir = &self.config.base_sandbox_dir;
        let command = format!("sudo mkdir -p {dir} && sudo chmod 755 {dir}");
        let result = self.remote_shell.run(&command, 30).await;
        if result.status != ShellStatus::Success {
            warn!(stderr = %result.stderr, "Failed to create base sandbox directory");
        }
    }

    async fn fingerprint_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.fingerprint_locks.lock().await;
        Arc::clone(locks.entry(key.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))))
    }

    /// Run one task end to end: validate the runtime, provision the task
    /// directory, frame the command, dispatch it, and parse the result.
    /// Concurrent calls that land on the identical `(session_dir, task
    /// fingerprint)` pair are serialized through a per-fingerprint lock
    /// (SPEC_FULL.md §9's open-question decision) rather than racing to
    /// create the same directory twice.
    pub async fn run_task(&self, request: ExecutionRequest<'_>) -> ExecutionResult {
        let start = Instant::now();

        if !self.config.allowed_runtimes.iter().any(|r| r == request.runtime) {
            return ExecutionResult::failure(
                None,
                format!(
                    "Runtime '{}' not allowed. Allowed: {:?}",
                    request.runtime, self.config.allowed_runtimes
                ),
                start.elapsed().as_secs_f64(),
            );
        }

        let hour_bucket = safety::current_hour_bucket();
        let fingerprint = TaskFingerprint::compute(
            request.code,
            request.runtime,
            request.session_id,
            hour_bucket,
        );
        let lock_key = format!("{}:{}", request.session_dir, fingerprint);
        let lock = self.fingerprint_lock(&lock_key).await;
        let _guard = lock.lock().await;

        self.run_task_locked(request, fingerprint, start).await
    }

    async fn run_task_locked(
        &self,
        request: ExecutionRequest<'_>,
        fingerprint: TaskFingerprint,
        start: Instant,
    ) -> ExecutionResult {
        let task_dir = format!("{}/{}", request.session_dir, fingerprint);

        let mut working_dir = String::new();
        if request.create_filesystem {
            match self.create_task_filesystem(&task_dir, &request.files).await {
                Ok(()) => working_dir = task_dir.clone(),
                Err(message) => {
                    return ExecutionResult::failure(
                        Some(fingerprint.to_string()),
                        message,
                        start.elapsed().as_secs_f64(),
                    )
                }
            }
        }

        let mut exec_commands: Vec<String> = Vec::new();

        for (key, value) in &request.env_vars {
            match sanitize_env_var(key, value) {
                Ok((safe_key, safe_value)) => {
                    exec_commands.push(format!("export {safe_key}='{safe_value}'"));
                }
                Err(e) => {
                    return ExecutionResult::failure(
                        Some(fingerprint.to_string()),
                        e.to_string(),
                        start.elapsed().as_secs_f64(),
                    )
                }
            }
        }

        exec_commands.push(format!("ulimit -t {}", self.config.max_execution_time));
        exec_commands.push(format!("ulimit -v {}", self.config.max_memory_mb * 1024));
        exec_commands.push("ulimit -f 100000".to_string());
        exec_commands.push("ulimit -n 1024".to_string());

        let encoded_code = BASE64.encode(request.code.as_bytes());
        exec_commands.push("echo '=== EXECUTION START ==='".to_string());
        match request.runtime {
            "python3" | "python" => {
                let code_file = format!("task_{fingerprint}.py");
                exec_commands.push(format!("echo '{encoded_code}' | base64 -d > {code_file}"));
                exec_commands.push(format!(
                    "timeout {} {} {code_file}; rc=$?",
                    self.config.max_execution_time, request.runtime
                ));
            }
            "node" => {
                let code_file = format!("task_{fingerprint}.js");
                exec_commands.push(format!("echo '{encoded_code}' | base64 -d > {code_file}"));
                exec_commands.push(format!(
                    "timeout {} node {code_file}; rc=$?",
                    self.config.max_execution_time
                ));
            }
            "bash" | "sh" => {
                exec_commands.push(format!(
                    "echo '{encoded_code}' | base64 -d | {}; rc=$?",
                    request.runtime
                ));
            }
            other => {
                return ExecutionResult::failure(
                    Some(fingerprint.to_string()),
                    format!("Unhandled runtime: {other}"),
                    start.elapsed().as_secs_f64(),
                )
            }
        }
        exec_commands.push("echo '=== EXECUTION END ==='".to_string());
        exec_commands.push("echo \"EXIT_CODE: $rc\"".to_string());

        exec_commands.push("echo '--- FILES_CREATED ---'".to_string());
        exec_commands.push("ls -la".to_string());

        let full_command = if working_dir.is_empty() {
            exec_commands.join(" && ")
        } else {
            format!("cd {working_dir} && {}", exec_commands.join(" && "))
        };

        let timeout = u64::try_from(self.config.max_execution_time).unwrap_or(300);
        let output = self.remote_shell.run(&full_command, timeout).await;

        if output.status != ShellStatus::Success {
            return ExecutionResult::failure(
                Some(fingerprint.to_string()),
                if output.stderr.is_empty() {
                    "Remote channel failure".to_string()
                } else {
                    output.stderr.clone()
                },
                start.elapsed().as_secs_f64(),
            );
        }

        let files_created = output
            .stdout
            .split_once("--- FILES_CREATED ---")
            .map(|(_, section)| parse_file_list(section))
            .unwrap_or_default();

        let (program_output, return_code) = parse_sentinel_output(&output.stdout);

        ExecutionResult {
            success: return_code == 0,
            stdout: program_output,
            stderr: output.stderr.clone(),
            return_code,
            execution_time_secs: start.elapsed().as_secs_f64(),
            working_directory: working_dir,
            files_created,
            task_hash: Some(fingerprint.to_string()),
            error_message: if output.stderr.is_empty() { None } else { Some(output.stderr) },
        }
    }

    async fn create_task_filesystem(
        &self,
        task_dir: &str,
        files: &HashMap<String, String>,
    ) -> Result<(), String> {
        let mut commands = vec![
            format!("mkdir -p {task_dir}"),
            format!("chmod 755 {task_dir}"),
            format!("cd {task_dir}"),
        ];

        for (filename, content) in files {
            if !safety::is_safe_filename(filename) {
                return Err(format!("Unsafe filename: {filename}"));
            }
            let encoded = BASE64.encode(content.as_bytes());
            commands.push(format!("echo '{encoded}' | base64 -d > '{filename}'"));
        }

        let result = self.remote_shell.run(&commands.join(" && "), 30).await;
        if result.return_code != 0 {
            return Err(format!("Failed to create task filesystem: {}", result.stderr));
        }
        Ok(())
    }

    /// Read a single file or every file in a task directory, matching
    /// `_get_task_files_by_hash`.
    pub async fn read_task_files(
        &self,
        task_dir: &str,
        filename: Option<&str>,
    ) -> HashMap<String, String> {
        let mut files = HashMap::new();

        if let Some(filename) = filename {
            let result = self.remote_shell.run(&format!("cat {task_dir}/{filename}"), 30).await;
            if result.return_code == 0 {
                files.insert(filename.to_string(), result.stdout);
            }
            return files;
        }

        let list_command = format!("find {task_dir} -maxdepth 1 -type f -exec basename {{}} \\;");
        let list_result = self.remote_shell.run(&list_command, 30).await;
        if list_result.return_code != 0 {
            return files;
        }
        for name in list_result.stdout.lines().filter(|l| !l.is_empty()) {
            let cat_result = self.remote_shell.run(&format!("cat {task_dir}/{name}"), 30).await;
            if cat_result.return_code == 0 {
                files.insert(name.to_string(), cat_result.stdout);
            } else {
                files.insert(name.to_string(), format!("<read failed: {}>", cat_result.stderr));
            }
        }
        files
    }

    /// Purge task directories under `base_dir` older than `hours`,
    /// matching `cleanup_old_tasks`. `hours` defaults to the configured
    /// `cleanup_after_hours` when `None`.
    pub async fn purge(&self, base_dir: &str, hours: Option<i64>) -> ShellOutput {
        let cleanup_hours = hours.unwrap_or(self.config.cleanup_after_hours);
        let cleanup_minutes = cleanup_hours * 60;
        let command = format!(
            "find {base_dir} -maxdepth 1 -type d -mmin +{cleanup_minutes} ! -path {base_dir} -exec rm -rf {{}} + 2>/dev/null || true"
        );
        let result = self.remote_shell.run(&command, 60).await;
        info!(cleanup_hours, "Purge sweep completed");
        result
    }

    pub async fn check_instance_status(&self) -> anyhow::Result<InstanceStatus> {
        self.inspector.status().await
    }

    pub async fn run_raw(&self, command: &str, timeout_sec: u64) -> ShellOutput {
        self.remote_shell.run(command, timeout_sec).await
    }
}

/// Resolve the AWS SDK config a `SandboxConfig` should use, honoring the
/// same auth-method precedence as `auth_method_for` in `config.rs`.
async fn build_sdk_config(config: &SandboxConfig) -> aws_config::SdkConfig {
    let region = aws_config::Region::new(config.region.clone());
    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest()).region(region);

    if let Some(profile) = config.aws_profile.as_deref().filter(|p| !p.is_empty()) {
        loader = loader.profile_name(profile);
    } else if let (Some(access_key), Some(secret_key)) = (
        config.access_key_id.as_deref(),
        config.secret_access_key.as_deref(),
    ) {
        let credentials = aws_credential_types::Credentials::new(
            access_key,
            secret_key,
            config.session_token.clone(),
            None,
            "sandbox-broker-config",
        );
        loader = loader.credentials_provider(credentials);
    }

    loader.load().await
}

/// Parses an `ls -la` listing section into a list of created filenames,
/// excluding `.`, `..`, the `total N` header, and directory entries (leading
/// `d`).
fn parse_file_list(section: &str) -> Vec<String> {
    let mut files = Vec::new();
    for line in section.trim().lines() {
        if !line.starts_with('-') {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 9 {
            continue;
        }
        let filename = parts[8..].join(" ");
        if filename != "." && filename != ".." {
            files.push(filename);
        }
    }
    files
}

/// Pull the program's own output and real exit code out of the sentinel
/// framing `run_task_locked` wraps around the runtime invocation. The
/// surrounding `ulimit`/`timeout` plumbing has its own exit status, which is
/// why the inner program's `$?` is captured and echoed separately rather
/// than trusted from the command chain's overall result.
fn parse_sentinel_output(stdout: &str) -> (String, i32) {
    let program_output = stdout
        .split_once("=== EXECUTION START ===")
        .and_then(|(_, after_start)| after_start.split_once("=== EXECUTION END ==="))
        .map(|(body, _)| body.trim().to_string())
        .unwrap_or_default();

    let return_code = stdout
        .split_once("EXIT_CODE:")
        .and_then(|(_, after)| after.split_whitespace().next())
        .and_then(|token| token.parse::<i32>().ok())
        .unwrap_or(0);

    (program_output, return_code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance_inspector::{CpuUtilization, InstanceInspector, InstanceStatus};
    use crate::remote_shell::ProcessRemoteShell;
    use async_trait::async_trait;

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

    fn test_config(base_dir: &str) -> SandboxConfig {
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
            allowed_runtimes: vec!["bash".to_string(), "python3".to_string()],
            notes: None,
        }
    }

    fn test_env(base_dir: &str) -> SandboxEnv {
        SandboxEnv::new(
            test_config(base_dir),
            Arc::new(ProcessRemoteShell::new()),
            Arc::new(StubInspector),
        )
    }

    #[test]
    fn parse_file_list_skips_dot_entries_and_headers() {
        let section = "total 8\n-rw-r--r-- 1 u g 12 Jan 1 00:00 out.txt\ndrwxr-xr-x 2 u g 4096 Jan 1 00:00 .\ndrwxr-xr-x 2 u g 4096 Jan 1 00:00 ..\n";
        let files = parse_file_list(section);
        assert_eq!(files, vec!["out.txt".to_string()]);
    }

    #[tokio::test]
    async fn run_task_rejects_disallowed_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let env = test_env(dir.path().to_str().unwrap());
        let result = env
            .run_task(ExecutionRequest {
                session_id: "s1",
                session_dir: dir.path().to_str().unwrap(),
                task_id: None,
                code: "echo hi",
                runtime: "ruby",
                files: HashMap::new(),
                env_vars: HashMap::new(),
                create_filesystem: false,
            })
            .await;
        assert!(!result.success);
        assert!(result.error_message.unwrap().contains("not allowed"));
    }

    #[tokio::test]
    async fn run_task_rejects_unsafe_filenames() {
        let dir = tempfile::tempdir().unwrap();
        let env = test_env(dir.path().to_str().unwrap());
        let mut files = HashMap::new();
        files.insert("../escape".to_string(), "x".to_string());
        let result = env
            .run_task(ExecutionRequest {
                session_id: "s1",
                session_dir: dir.path().to_str().unwrap(),
                task_id: None,
                code: "echo hi",
                runtime: "bash",
                files,
                env_vars: HashMap::new(),
                create_filesystem: true,
            })
            .await;
        assert!(!result.success);
        assert!(result.error_message.unwrap().contains("Unsafe filename"));
    }

    #[tokio::test]
    async fn run_task_executes_shell_code_successfully() {
        let dir = tempfile::tempdir().unwrap();
        let env = test_env(dir.path().to_str().unwrap());
        let result = env
            .run_task(ExecutionRequest {
                session_id: "s1",
                session_dir: dir.path().to_str().unwrap(),
                task_id: None,
                code: "echo hello-from-task",
                runtime: "bash",
                files: HashMap::new(),
                env_vars: HashMap::new(),
                create_filesystem: true,
            })
            .await;
        assert!(result.success, "stderr: {}", result.stderr);
        assert_eq!(result.stdout.trim(), "hello-from-task");
        assert_eq!(result.return_code, 0);
        assert!(result.task_hash.is_some());
    }

    #[tokio::test]
    async fn run_task_reports_nonzero_exit_code_without_breaking_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let env = test_env(dir.path().to_str().unwrap());
        let result = env
            .run_task(ExecutionRequest {
                session_id: "s1",
                session_dir: dir.path().to_str().unwrap(),
                task_id: None,
                code: "echo partial-output; exit 7",
                runtime: "bash",
                files: HashMap::new(),
                env_vars: HashMap::new(),
                create_filesystem: true,
            })
            .await;
        assert!(!result.success);
        assert_eq!(result.return_code, 7);
        assert_eq!(result.stdout.trim(), "partial-output");
    }

    #[test]
    fn parse_sentinel_output_extracts_trimmed_body_and_exit_code() {
        let stdout = "=== EXECUTION START ===\n4\n=== EXECUTION END ===\nEXIT_CODE: 0\n--- FILES_CREATED ---\ntotal 0\n";
        let (body, rc) = parse_sentinel_output(stdout);
        assert_eq!(body, "4");
        assert_eq!(rc, 0);
    }

    #[test]
    fn parse_sentinel_output_defaults_exit_code_when_marker_missing() {
        let (body, rc) = parse_sentinel_output("no sentinels here");
        assert_eq!(body, "");
        assert_eq!(rc, 0);
    }
}
