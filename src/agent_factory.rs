//! Agent factory (component G): builds the five session-bound tools on
//! demand and keeps each session pinned to the `SandboxEnv` it started
//! with.
//!
//! Grounded on `strands_tools.py::create_strands_tools` for the tool set
//! and argument/response shapes, and on the teacher's per-session object
//! lifecycle (`daemon/src/session.rs`) for the registry/lock shape. Unlike
//! `strands_tools.py`, which temporarily mutates
//! `sandbox_env.config.base_sandbox_dir` to the session path around every
//! call — an approach spec.md's design notes call out as unsafe under
//! concurrency — every operation here takes the session directory as an
//! explicit argument instead.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::warn;

use crate::remote_shell::ShellStatus;
use crate::sandbox_env::{ExecutionResult, SandboxEnv};
use crate::session::SessionRegistry;
use crate::task_execution;
use crate::tool_envelope::ToolOutcome;

/// A session's execution result, with session bookkeeping folded in —
/// matching the original's pattern of adding `session_id`/`task_count`
/// onto the `ExecutionResult` it returns from the execute-code tool.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    #[serde(flatten)]
    pub result: ExecutionResult,
    pub session_id: String,
    pub task_count: u64,
}

/// The sandbox environment a session is currently bound to. Rebinding
/// (`AgentFactory::rebind`) lets a session move to a different environment
/// without losing its activity history in `SessionRegistry`.
#[derive(Clone)]
pub struct ToolBundle {
    pub session_id: String,
    pub env: Arc<SandboxEnv>,
}

impl ToolBundle {
    fn session_dir(&self) -> String {
        format!("{}/{}", self.env.config.base_sandbox_dir, self.session_id)
    }
}

/// Builds and caches per-session `ToolBundle`s, and implements the five
/// tool operations against them.
pub struct AgentFactory {
    registry: Arc<SessionRegistry>,
    bundles: RwLock<HashMap<String, ToolBundle>>,
}

impl AgentFactory {
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            bundles: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve the session (creating it if needed) and its tool bundle. A
    /// session's first call determines which `SandboxEnv` it binds to;
    /// later calls reuse that binding regardless of which `env` is passed,
    /// unless the caller explicitly `rebind`s it.
    async fn bundle_for(&self, session_id: Option<&str>, env: &Arc<SandboxEnv>) -> (String, ToolBundle) {
        let session = self.registry.get_or_create(session_id).await;

        {
            let bundles = self.bundles.read().await;
            if let Some(bundle) = bundles.get(&session.session_id) {
                return (session.session_id, bundle.clone());
            }
        }

        let bundle = ToolBundle {
            session_id: session.session_id.clone(),
            env: Arc::clone(env),
        };
        let mut bundles = self.bundles.write().await;
        let bundle = bundles
            .entry(session.session_id.clone())
            .or_insert(bundle)
            .clone();
        (session.session_id, bundle)
    }

    /// Rebind an existing session to a different `SandboxEnv`.
    pub async fn rebind(&self, session_id: &str, env: Arc<SandboxEnv>) {
        let mut bundles = self.bundles.write().await;
        bundles.insert(
            session_id.to_string(),
            ToolBundle {
                session_id: session_id.to_string(),
                env,
            },
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn execute_code_in_sandbox(
        &self,
        session_id: Option<&str>,
        env: &Arc<SandboxEnv>,
        task_id: Option<&str>,
        code: &str,
        runtime: &str,
        files: HashMap<String, String>,
        env_vars: HashMap<String, String>,
        create_filesystem: bool,
    ) -> ExecutionReport {
        let exec_lock = self.registry.lock_for(session_id.unwrap_or_default()).await;
        let _guard = exec_lock.lock().await;

        let (resolved_id, bundle) = self.bundle_for(session_id, env).await;
        let session_dir = bundle.session_dir();

        let result = task_execution::execute_code_in_sandbox(
            &bundle.env,
            &resolved_id,
            &session_dir,
            task_id,
            code,
            runtime,
            files,
            env_vars,
            create_filesystem,
        )
        .await;

        let task_count = self
            .registry
            .get(&resolved_id)
            .await
            .map_or(0, |s| s.task_count);

        ExecutionReport {
            result,
            session_id: resolved_id,
            task_count,
        }
    }

    pub async fn get_session_files(
        &self,
        session_id: Option<&str>,
        env: &Arc<SandboxEnv>,
        filename: Option<&str>,
        task_hash: Option<&str>,
    ) -> ToolOutcome<serde_json::Value> {
        let (resolved_id, bundle) = self.bundle_for(session_id, env).await;

        if filename.is_none() && task_hash.is_none() {
            return ToolOutcome::err(
                resolved_id,
                "Provide either 'filename' or 'task_hash'. To see the session layout, use list_session_structure.",
            );
        }

        let session_path = bundle.session_dir();

        if let Some(filename) = filename {
            let find_command = match task_hash {
                Some(hash) => format!("find {session_path}/{hash} -name '{filename}' -type f -maxdepth 1 2>/dev/null"),
                None => format!("find {session_path} -name '{filename}' -type f 2>/dev/null"),
            };
            let find_result = bundle.env.run_raw(&find_command, 30).await;
            let first_match = find_result.stdout.lines().find(|l| !l.trim().is_empty());

            return match (find_result.status, first_match) {
                (ShellStatus::Success, Some(file_path)) => {
                    let cat_result = bundle.env.run_raw(&format!("cat '{file_path}'"), 30).await;
                    let found_in_task = file_path
                        .rsplit_once('/')
                        .and_then(|(dir, _)| dir.rsplit_once('/'))
                        .map_or("", |(_, task)| task);

                    ToolOutcome::ok(
                        resolved_id,
                        serde_json::json!({
                            "filename": filename,
                            "content": cat_result.stdout,
                            "found_in_task": found_in_task,
                            "full_path": file_path,
                        }),
                        format!("Retrieved file: {filename}"),
                    )
                }
                _ => {
                    let scope = task_hash.map_or_else(|| "all tasks".to_string(), |h| format!("task {h}"));
                    ToolOutcome::err(resolved_id, format!("File not found: {filename} (searched: {scope})"))
                }
            };
        }

        let Some(task_hash) = task_hash else {
            return ToolOutcome::err(resolved_id, "task_hash is required when filename is omitted");
        };
        let task_dir = format!("{session_path}/{task_hash}");
        let check = bundle.env.run_raw(&format!("test -d '{task_dir}' && echo exists"), 30).await;
        if check.status != ShellStatus::Success || !check.stdout.contains("exists") {
            return ToolOutcome::err(resolved_id, format!("Task directory does not exist: {task_hash}"));
        }

        let files = bundle.env.read_task_files(&task_dir, None).await;
        let total_files = files.len();
        ToolOutcome::ok(
            resolved_id,
            serde_json::json!({ "task_hash": task_hash, "files": files, "total_files": total_files }),
            format!("Retrieved {total_files} file(s) from task {task_hash}"),
        )
    }

    pub async fn cleanup_expired_tasks(
        &self,
        session_id: Option<&str>,
        env: &Arc<SandboxEnv>,
        hours: Option<i64>,
    ) -> ToolOutcome<serde_json::Value> {
        let (resolved_id, bundle) = self.bundle_for(session_id, env).await;
        let base_dir = bundle.env.config.base_sandbox_dir.clone();
        let result = bundle.env.purge(&base_dir, hours).await;

        if result.status != ShellStatus::Success {
            warn!(stderr = %result.stderr, "Cleanup sweep reported a failure");
        }

        ToolOutcome::ok(
            resolved_id,
            serde_json::json!({ "hours": hours }),
            "Cleanup completed",
        )
    }

    pub async fn check_sandbox_status(
        &self,
        session_id: Option<&str>,
        env: &Arc<SandboxEnv>,
    ) -> ToolOutcome<serde_json::Value> {
        let (resolved_id, bundle) = self.bundle_for(session_id, env).await;

        let status = match bundle.env.check_instance_status().await {
            Ok(status) => status,
            Err(e) => return ToolOutcome::err(resolved_id, format!("Status check failed: {e}")),
        };

        let session = self.registry.get(&resolved_id).await;
        let session_dir = bundle.session_dir();
        let list_command = format!("find {session_dir} -maxdepth 1 -type d ! -path {session_dir} 2>/dev/null");
        let list_result = bundle.env.run_raw(&list_command, 30).await;
        let session_tasks: Vec<String> = list_result
            .stdout
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|path| path.rsplit('/').next().map(str::to_string))
            .collect();

        let mut payload = serde_json::to_value(&status).unwrap_or_default();
        if let serde_json::Value::Object(ref mut map) = payload {
            map.insert("session_tasks".to_string(), serde_json::json!(session_tasks));
            map.insert(
                "task_count".to_string(),
                serde_json::json!(session.map_or(0, |s| s.task_count)),
            );
            map.insert(
                "allowed_runtimes".to_string(),
                serde_json::json!(bundle.env.config.allowed_runtimes),
            );
        }

        ToolOutcome::ok(resolved_id, payload, "Sandbox status check completed")
    }

    pub async fn list_session_structure(
        &self,
        session_id: Option<&str>,
        env: &Arc<SandboxEnv>,
    ) -> ToolOutcome<serde_json::Value> {
        let (resolved_id, bundle) = self.bundle_for(session_id, env).await;
        let session_path = bundle.session_dir();
        let task_count = self.registry.get(&resolved_id).await.map_or(0, |s| s.task_count);

        let list_dirs_command = format!("find {session_path} -maxdepth 1 -type d ! -path {session_path} 2>/dev/null");
        let dirs_result = bundle.env.run_raw(&list_dirs_command, 30).await;

        let mut tasks = serde_json::Map::new();
        if dirs_result.status == ShellStatus::Success {
            for task_dir_path in dirs_result.stdout.lines().filter(|l| !l.trim().is_empty()) {
                let task_name = task_dir_path.rsplit('/').next().unwrap_or(task_dir_path);
                let files_result = bundle.env.run_raw(&format!("ls -la {task_dir_path} 2>/dev/null"), 30).await;
                let files = parse_ls_entries(&files_result.stdout);
                tasks.insert(
                    task_name.to_string(),
                    serde_json::json!({ "path": task_dir_path, "files": files }),
                );
            }
        }

        let task_total = tasks.len();
        ToolOutcome::ok(
            resolved_id,
            serde_json::json!({
                "session_path": session_path,
                "task_count": task_count,
                "tasks": tasks,
            }),
            format!("Retrieved session structure with {task_total} task(s)"),
        )
    }
}

/// Parses `ls -la` output into `{name, permissions, size, modified}`
/// entries, matching `list_session_structure`'s parsing in the original.
fn parse_ls_entries(output: &str) -> Vec<serde_json::Value> {
    let mut entries = Vec::new();
    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("total") || line.starts_with('d') {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 9 {
            continue;
        }
        let filename = parts[8..].join(" ");
        if filename == "." || filename == ".." {
            continue;
        }
        entries.push(serde_json::json!({
            "name": filename,
            "permissions": parts[0],
            "size": parts[4],
            "modified": parts[5..8].join(" "),
        }));
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ls_entries_skips_directories_and_totals() {
        let output = "total 4\n-rw-r--r-- 1 u g 12 Jan 1 00:00 out.txt\n";
        let entries = parse_ls_entries(output);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["name"], "out.txt");
    }
}
