//! sandbox-broker library
//!
//! Core functionality for the sandbox broker daemon:
//! - Configuration profiles with environment-variable overrides
//! - Safety predicates for filenames, env vars and task fingerprints
//! - A remote shell channel and instance inspector over a cloud management
//!   plane
//! - The sandbox environment, task execution and session/retention layers
//! - MCP server wiring using rmcp

pub mod agent_factory;
pub mod config;
pub mod instance_inspector;
pub mod mcp;
pub mod remote_shell;
pub mod retention;
pub mod safety;
pub mod sandbox_env;
pub mod session;
pub mod task_execution;
pub mod tool_envelope;
