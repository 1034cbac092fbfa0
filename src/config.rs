//! Configuration: JSON profiles plus environment-variable overrides.
//!
//! Grounded on the original `config_manager.py::ConfigManager` (profile
//! loading, env-var merge table, validation rules, template generation)
//! and on the teacher's `config.rs` (`Deserialize`-driven metadata struct
//! with `#[serde(default = ...)]` for optional numeric fields).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Runtimes the broker knows how to frame a command for (component E).
const KNOWN_RUNTIMES: &[&str] = &["python3", "python", "node", "bash", "sh"];

/// Configuration errors surfaced at the config/CLI boundary.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("failed to parse configuration file: {0}")]
    ParseFailure(#[from] serde_json::Error),

    #[error("unknown environment '{0}', available: {1:?}")]
    UnknownEnvironment(String, Vec<String>),

    #[error("'{0}' is required")]
    MissingField(&'static str),

    #[error("either 'aws_profile' or 'access_key_id'/'secret_access_key' must be provided")]
    NoAuthMethod,

    #[error("'{field}' must be an integer between {min} and {max}, got {actual}")]
    OutOfRange {
        field: &'static str,
        min: i64,
        max: i64,
        actual: i64,
    },

    #[error("'allowed_runtimes' cannot be empty")]
    EmptyRuntimeList,

    #[error("unknown runtime '{0}', allowed: {1:?}")]
    UnknownRuntime(String, Vec<String>),

    #[error("failed to write configuration template: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-environment sandbox configuration (spec.md §3).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SandboxConfig {
    pub instance_id: String,
    pub region: String,
    #[serde(default)]
    pub aws_profile: Option<String>,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    #[serde(default)]
    pub session_token: Option<String>,
    #[serde(default = "default_base_dir")]
    pub base_sandbox_dir: String,
    #[serde(default = "default_execution_time")]
    pub max_execution_time: i64,
    #[serde(default = "default_memory_mb")]
    pub max_memory_mb: i64,
    #[serde(default = "default_cleanup_hours")]
    pub cleanup_after_hours: i64,
    #[serde(default = "default_runtimes")]
    pub allowed_runtimes: Vec<String>,
    /// Free-text note surfaced in the MCP tool description, e.g. to flag
    /// GPU-accelerated runtimes — generalized from the original's
    /// GPU-specific docstring mention (SPEC_FULL.md §10).
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_base_dir() -> String {
    "/opt/sandbox".to_string()
}

const fn default_execution_time() -> i64 {
    300
}

const fn default_memory_mb() -> i64 {
    1024
}

const fn default_cleanup_hours() -> i64 {
    24
}

fn default_runtimes() -> Vec<String> {
    KNOWN_RUNTIMES.iter().map(|s| (*s).to_string()).collect()
}

/// Authentication method a profile resolves to, for `--auth` / display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Profile,
    AccessKeys,
    TemporaryCredentials,
    Unknown,
}

impl AuthMethod {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Profile => "profile",
            Self::AccessKeys => "access_keys",
            Self::TemporaryCredentials => "temporary_credentials",
            Self::Unknown => "unknown",
        }
    }
}

/// Environment-variable override table, matching
/// `ConfigManager._merge_env_vars`.
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("EC2_INSTANCE_ID", "instance_id"),
    ("AWS_DEFAULT_REGION", "region"),
    ("AWS_PROFILE", "aws_profile"),
    ("AWS_ACCESS_KEY_ID", "access_key_id"),
    ("AWS_SECRET_ACCESS_KEY", "secret_access_key"),
    ("AWS_SESSION_TOKEN", "session_token"),
    ("SANDBOX_BASE_DIR", "base_sandbox_dir"),
    ("MAX_EXECUTION_TIME", "max_execution_time"),
    ("MAX_MEMORY_MB", "max_memory_mb"),
    ("CLEANUP_AFTER_HOURS", "cleanup_after_hours"),
];

const NUMERIC_FIELDS: &[&str] = &["max_execution_time", "max_memory_mb", "cleanup_after_hours"];

/// Loads and validates JSON configuration profiles from a file.
pub struct ConfigManager {
    profiles: serde_json::Map<String, serde_json::Value>,
}

impl ConfigManager {
    /// Load profiles from `path`. Fields starting with `_` are comments
    /// (e.g. `_instructions`) and are excluded from `list_environments`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }
        let raw = std::fs::read_to_string(path)?;
        let parsed: serde_json::Value = serde_json::from_str(&raw)?;
        let profiles = parsed
            .as_object()
            .cloned()
            .ok_or_else(|| ConfigError::ParseFailure(serde::de::Error::custom(
                "configuration root must be a JSON object",
            )))?;
        Ok(Self { profiles })
    }

    #[must_use]
    pub fn list_environments(&self) -> Vec<String> {
        self.profiles
            .keys()
            .filter(|k| !k.starts_with('_'))
            .cloned()
            .collect()
    }

    /// Resolve a named environment into a validated `SandboxConfig`,
    /// applying environment-variable overrides first.
    pub fn get_config(&self, environment: &str) -> Result<SandboxConfig, ConfigError> {
        let profile = self.profiles.get(environment).ok_or_else(|| {
            ConfigError::UnknownEnvironment(environment.to_string(), self.list_environments())
        })?;

        let mut merged = profile
            .as_object()
            .cloned()
            .ok_or_else(|| ConfigError::UnknownEnvironment(environment.to_string(), vec![]))?;

        apply_env_overrides(&mut merged);
        validate_profile(&merged)?;

        let config: SandboxConfig = serde_json::from_value(serde_json::Value::Object(merged))?;
        Ok(config)
    }

    #[must_use]
    pub fn auth_method(&self, environment: &str) -> AuthMethod {
        let Some(profile) = self.profiles.get(environment).and_then(|v| v.as_object()) else {
            return AuthMethod::Unknown;
        };
        auth_method_for(profile)
    }

    /// Write a starter configuration file, matching
    /// `create_config_template`.
    pub fn write_template(path: &Path) -> Result<(), ConfigError> {
        let template = serde_json::json!({
            "_comment": "Sandbox broker configuration template",
            "_instructions": {
                "1": "Copy this template to config.json and modify as needed",
                "2": "Replace placeholder values with your actual AWS resources",
                "3": "Choose authentication method: aws_profile OR access_key_id/secret_access_key",
                "4": "Add session_token for temporary credentials (STS)"
            },
            "default": {
                "instance_id": "i-YOUR_INSTANCE_ID_HERE",
                "region": "us-east-1",
                "aws_profile": "default",
                "base_sandbox_dir": "/tmp/sandbox",
                "max_execution_time": 300,
                "max_memory_mb": 1024,
                "cleanup_after_hours": 24,
                "allowed_runtimes": ["python3", "python", "node", "bash", "sh"]
            },
            "example_with_keys": {
                "instance_id": "i-YOUR_INSTANCE_ID_HERE",
                "region": "us-west-2",
                "access_key_id": "YOUR_ACCESS_KEY_ID",
                "secret_access_key": "YOUR_SECRET_ACCESS_KEY",
                "base_sandbox_dir": "/tmp/sandbox",
                "max_execution_time": 300,
                "max_memory_mb": 1024,
                "cleanup_after_hours": 24,
                "allowed_runtimes": ["python3", "python", "node", "bash", "sh"]
            }
        });
        std::fs::write(path, serde_json::to_string_pretty(&template)?)?;
        Ok(())
    }
}

fn apply_env_overrides(profile: &mut serde_json::Map<String, serde_json::Value>) {
    for (env_var, key) in ENV_OVERRIDES {
        let Ok(value) = std::env::var(env_var) else {
            continue;
        };
        if value.is_empty() {
            continue;
        }
        if NUMERIC_FIELDS.contains(key) {
            match value.parse::<i64>() {
                Ok(n) => {
                    profile.insert((*key).to_string(), serde_json::json!(n));
                }
                Err(_) => {
                    tracing::warn!(env_var, value, "invalid integer override, ignoring");
                }
            }
        } else {
            profile.insert((*key).to_string(), serde_json::json!(value));
        }
    }
}

fn auth_method_for(profile: &serde_json::Map<String, serde_json::Value>) -> AuthMethod {
    let has_profile = profile
        .get("aws_profile")
        .and_then(|v| v.as_str())
        .is_some_and(|s| !s.is_empty());
    let access_key = profile.get("access_key_id").and_then(|v| v.as_str());
    let secret_key = profile.get("secret_access_key").and_then(|v| v.as_str());
    let has_keys = access_key.is_some_and(|s| !s.is_empty()) && secret_key.is_some_and(|s| !s.is_empty());
    let has_session_token = profile
        .get("session_token")
        .and_then(|v| v.as_str())
        .is_some_and(|s| !s.is_empty());

    if has_profile {
        AuthMethod::Profile
    } else if has_keys && has_session_token {
        AuthMethod::TemporaryCredentials
    } else if has_keys {
        AuthMethod::AccessKeys
    } else {
        AuthMethod::Unknown
    }
}

fn validate_profile(profile: &serde_json::Map<String, serde_json::Value>) -> Result<(), ConfigError> {
    for field in ["instance_id", "region"] {
        let present = profile
            .get(field)
            .and_then(|v| v.as_str())
            .is_some_and(|s| !s.is_empty());
        if !present {
            return Err(ConfigError::MissingField(match field {
                "instance_id" => "instance_id",
                _ => "region",
            }));
        }
    }

    if auth_method_for(profile) == AuthMethod::Unknown {
        return Err(ConfigError::NoAuthMethod);
    }

    let ranges: &[(&str, i64, i64, i64)] = &[
        ("max_execution_time", 30, 3600, default_execution_time()),
        ("max_memory_mb", 128, 16384, default_memory_mb()),
        ("cleanup_after_hours", 1, 168, default_cleanup_hours()),
    ];
    for (field, min, max, default) in ranges {
        let actual = profile
            .get(*field)
            .and_then(serde_json::Value::as_i64)
            .unwrap_or(*default);
        if actual < *min || actual > *max {
            return Err(ConfigError::OutOfRange {
                field,
                min: *min,
                max: *max,
                actual,
            });
        }
    }

    let allowed_runtimes: Vec<String> = profile
        .get("allowed_runtimes")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_else(default_runtimes);

    if allowed_runtimes.is_empty() {
        return Err(ConfigError::EmptyRuntimeList);
    }

    for runtime in &allowed_runtimes {
        if !KNOWN_RUNTIMES.contains(&runtime.as_str()) {
            return Err(ConfigError::UnknownRuntime(
                runtime.clone(),
                KNOWN_RUNTIMES.iter().map(|s| (*s).to_string()).collect(),
            ));
        }
    }

    Ok(())
}

/// Environment-metadata registry (component "Configuration" in
/// SPEC_FULL.md §2) — maps environment names to their `SandboxConfig`,
/// analogous to the teacher's `Config { environments: HashMap<...> }`.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentRegistry {
    pub environments: HashMap<String, SandboxConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_fixture(json: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_and_lists_environments_skipping_comments() {
        let file = write_fixture(
            r#"{
                "_comment": "ignored",
                "default": {"instance_id": "i-1", "region": "us-east-1", "aws_profile": "p"}
            }"#,
        );
        let manager = ConfigManager::load(file.path()).unwrap();
        assert_eq!(manager.list_environments(), vec!["default".to_string()]);
    }

    #[test]
    fn validates_required_fields() {
        let file = write_fixture(r#"{"bad": {"region": "us-east-1", "aws_profile": "p"}}"#);
        let manager = ConfigManager::load(file.path()).unwrap();
        let err = manager.get_config("bad").unwrap_err();
        assert!(matches!(err, ConfigError::MissingField("instance_id")));
    }

    #[test]
    fn validates_auth_method_precedence() {
        let file = write_fixture(r#"{"bad": {"instance_id": "i-1", "region": "us-east-1"}}"#);
        let manager = ConfigManager::load(file.path()).unwrap();
        assert!(matches!(
            manager.get_config("bad").unwrap_err(),
            ConfigError::NoAuthMethod
        ));
    }

    #[test]
    fn validates_numeric_ranges() {
        let file = write_fixture(
            r#"{"bad": {"instance_id": "i-1", "region": "us-east-1", "aws_profile": "p", "max_execution_time": 5}}"#,
        );
        let manager = ConfigManager::load(file.path()).unwrap();
        assert!(matches!(
            manager.get_config("bad").unwrap_err(),
            ConfigError::OutOfRange { field: "max_execution_time", .. }
        ));
    }

    #[test]
    fn validates_runtime_allow_list() {
        let file = write_fixture(
            r#"{"bad": {"instance_id": "i-1", "region": "us-east-1", "aws_profile": "p", "allowed_runtimes": ["ruby"]}}"#,
        );
        let manager = ConfigManager::load(file.path()).unwrap();
        assert!(matches!(
            manager.get_config("bad").unwrap_err(),
            ConfigError::UnknownRuntime(runtime, _) if runtime == "ruby"
        ));
    }

    #[test]
    fn env_override_wins_over_profile_value() {
        let file = write_fixture(
            r#"{"default": {"instance_id": "i-1", "region": "us-east-1", "aws_profile": "p"}}"#,
        );
        std::env::set_var("SANDBOX_BASE_DIR", "/custom/dir");
        let manager = ConfigManager::load(file.path()).unwrap();
        let config = manager.get_config("default").unwrap();
        std::env::remove_var("SANDBOX_BASE_DIR");
        assert_eq!(config.base_sandbox_dir, "/custom/dir");
    }

    #[test]
    fn good_profile_resolves_defaults() {
        let file = write_fixture(
            r#"{"default": {"instance_id": "i-1", "region": "us-east-1", "aws_profile": "p"}}"#,
        );
        let manager = ConfigManager::load(file.path()).unwrap();
        let config = manager.get_config("default").unwrap();
        assert_eq!(config.max_execution_time, 300);
        assert_eq!(config.allowed_runtimes.len(), 5);
        assert_eq!(manager.auth_method("default"), AuthMethod::Profile);
    }
}
