//! MCP server implementation using rmcp.
//!
//! Exposes the sandbox broker's five session-bound tools
//! (`execute_code_in_sandbox`, `get_session_files`,
//! `list_session_structure`, `cleanup_expired_tasks`,
//! `check_sandbox_status`), grounded on the teacher's `#[tool_router]`/
//! `#[tool]` wiring generalized to route by an explicit `environment` +
//! `session_id` pair on every call, since the tool set here is built per
//! session rather than fixed for the process.

use std::collections::HashMap;
use std::sync::Arc;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo};
use rmcp::schemars;
use rmcp::transport::stdio;
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::agent_factory::AgentFactory;
use crate::config::EnvironmentRegistry;
use crate::sandbox_env::SandboxEnv;
use crate::session::SessionRegistry;

fn json_content<T: Serialize>(value: &T) -> Content {
    Content::text(serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string()))
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecuteCodeParams {
    #[schemars(description = "Name of the configured sandbox environment to run against")]
    pub environment: String,
    #[schemars(description = "Session id grouping related tasks; omit to start a new session")]
    pub session_id: Option<String>,
    #[schemars(description = "Explicit task id; omit to generate one")]
    pub task_id: Option<String>,
    #[schemars(description = "Source code to run")]
    pub code: String,
    #[schemars(description = "Runtime to run the code with (python3, node, bash, sh)")]
    pub runtime: String,
    #[serde(default)]
    #[schemars(description = "Extra files to write into the task directory before running")]
    pub files: HashMap<String, String>,
    #[serde(default)]
    #[schemars(description = "Environment variables exported before running")]
    pub env_vars: HashMap<String, String>,
    #[serde(default = "default_true")]
    #[schemars(description = "Whether to provision the task directory first (default true)")]
    pub create_filesystem: bool,
}

const fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GetSessionFilesParams {
    pub environment: String,
    pub session_id: Option<String>,
    #[schemars(description = "File to retrieve; searches the whole session unless task_hash is given")]
    pub filename: Option<String>,
    #[schemars(description = "Task hash to scope the search or list to")]
    pub task_hash: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListSessionStructureParams {
    pub environment: String,
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CleanupExpiredTasksParams {
    pub environment: String,
    pub session_id: Option<String>,
    #[schemars(description = "Override the configured retention window, in hours")]
    pub hours: Option<i64>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CheckSandboxStatusParams {
    pub environment: String,
    pub session_id: Option<String>,
}

/// MCP server exposing the sandbox broker's tool set.
#[derive(Clone)]
pub struct SandboxServer {
    environments: Arc<EnvironmentRegistry>,
    factory: Arc<AgentFactory>,
    tool_router: ToolRouter<Self>,
}

impl SandboxServer {
    #[must_use]
    pub fn new(environments: EnvironmentRegistry, registry: Arc<SessionRegistry>) -> Self {
        Self {
            environments: Arc::new(environments),
            factory: Arc::new(AgentFactory::new(registry)),
            tool_router: Self::tool_router(),
        }
    }

    async fn resolve_env(&self, name: &str) -> Result<Arc<SandboxEnv>, McpError> {
        let config = self.environments.environments.get(name).cloned().ok_or_else(|| {
            let available: Vec<_> = self.environments.environments.keys().collect();
            McpError::invalid_params(
                format!("Unknown environment: '{name}'. Available: {available:?}"),
                None,
            )
        })?;
        Ok(SandboxEnv::get_or_init(config, SandboxEnv::from_config).await)
    }
}

#[tool_router]
impl SandboxServer {
    #[tool(description = "Run code in a session's sandbox directory and return stdout/stderr/files created")]
    async fn execute_code_in_sandbox(
        &self,
        Parameters(params): Parameters<ExecuteCodeParams>,
    ) -> Result<CallToolResult, McpError> {
        let env = self.resolve_env(&params.environment).await?;
        info!(environment = %params.environment, runtime = %params.runtime, "Executing code");

        let report = self
            .factory
            .execute_code_in_sandbox(
                params.session_id.as_deref(),
                &env,
                params.task_id.as_deref(),
                &params.code,
                &params.runtime,
                params.files,
                params.env_vars,
                params.create_filesystem,
            )
            .await;

        let is_error = !report.result.success;
        let content = vec![json_content(&report)];
        Ok(if is_error {
            CallToolResult::error(content)
        } else {
            CallToolResult::success(content)
        })
    }

    #[tool(description = "Fetch a file from a session's tasks, or every file under a given task hash")]
    async fn get_session_files(
        &self,
        Parameters(params): Parameters<GetSessionFilesParams>,
    ) -> Result<CallToolResult, McpError> {
        let env = self.resolve_env(&params.environment).await?;
        let outcome = self
            .factory
            .get_session_files(
                params.session_id.as_deref(),
                &env,
                params.filename.as_deref(),
                params.task_hash.as_deref(),
            )
            .await;
        Ok(CallToolResult::success(vec![json_content(&outcome)]))
    }

    #[tool(description = "List the task directories and files under a session")]
    async fn list_session_structure(
        &self,
        Parameters(params): Parameters<ListSessionStructureParams>,
    ) -> Result<CallToolResult, McpError> {
        let env = self.resolve_env(&params.environment).await?;
        let outcome = self
            .factory
            .list_session_structure(params.session_id.as_deref(), &env)
            .await;
        Ok(CallToolResult::success(vec![json_content(&outcome)]))
    }

    #[tool(description = "Purge task directories older than the retention window (or an explicit hours override)")]
    async fn cleanup_expired_tasks(
        &self,
        Parameters(params): Parameters<CleanupExpiredTasksParams>,
    ) -> Result<CallToolResult, McpError> {
        let env = self.resolve_env(&params.environment).await?;
        let outcome = self
            .factory
            .cleanup_expired_tasks(params.session_id.as_deref(), &env, params.hours)
            .await;
        Ok(CallToolResult::success(vec![json_content(&outcome)]))
    }

    #[tool(description = "Check the sandbox instance's reachability, state and load")]
    async fn check_sandbox_status(
        &self,
        Parameters(params): Parameters<CheckSandboxStatusParams>,
    ) -> Result<CallToolResult, McpError> {
        let env = self.resolve_env(&params.environment).await?;
        let outcome = self
            .factory
            .check_sandbox_status(params.session_id.as_deref(), &env)
            .await;
        Ok(CallToolResult::success(vec![json_content(&outcome)]))
    }
}

#[tool_handler]
impl ServerHandler for SandboxServer {
    fn get_info(&self) -> ServerInfo {
        let envs: Vec<_> = self.environments.environments.keys().collect();
        let notes: Vec<String> = self
            .environments
            .environments
            .values()
            .filter_map(|c| c.notes.clone())
            .collect();

        let mut instructions = format!(
            "Execute code in a remote sandbox instance over a cloud management channel.\n\
             Available environments: {envs:?}\n\
             \n\
             Tools: execute_code_in_sandbox, get_session_files, list_session_structure,\n\
             cleanup_expired_tasks, check_sandbox_status. Every tool takes an `environment`\n\
             name and an optional `session_id`; omitting `session_id` starts a new session."
        );
        if !notes.is_empty() {
            instructions.push_str(&format!("\n\nNotes: {}", notes.join("; ")));
        }

        ServerInfo {
            protocol_version: rmcp::model::ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "sandbox-broker".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(instructions),
        }
    }
}

/// Serve the sandbox broker over stdio.
pub async fn serve_stdio(environments: EnvironmentRegistry, registry: Arc<SessionRegistry>) -> anyhow::Result<()> {
    let server = SandboxServer::new(environments, registry);

    info!("Starting MCP server on stdio");

    let service = server
        .serve(stdio())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start MCP server: {e}"))?;

    service
        .waiting()
        .await
        .map_err(|e| anyhow::anyhow!("MCP server error: {e}"))?;

    Ok(())
}
