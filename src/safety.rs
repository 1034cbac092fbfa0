//! Filename and environment-variable safety predicates, and task fingerprinting.
//!
//! These are the command-injection perimeter: every filename offered by a
//! caller and every environment variable name/value is checked here before
//! it is allowed anywhere near a shell command string.

use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};

const RESERVED_DEVICE_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

const DANGEROUS_ENV_CHARS: &[char] = &['`', '$', '\\', '"', '\'', ';', '&', '|', '<', '>'];

fn filename_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("valid regex"))
}

fn env_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid regex"))
}

/// Checks a filename against the safe-filename predicate (spec.md §4.C).
///
/// Rejects traversal, absolute paths, shell metacharacters, control
/// characters, reserved device names, and anything over 255 bytes.
#[must_use]
pub fn is_safe_filename(name: &str) -> bool {
    if name.is_empty() || name.len() > 255 {
        return false;
    }
    if name.contains("..") || name.starts_with('/') || name.starts_with('\\') {
        return false;
    }
    if name
        .chars()
        .any(|c| "|&;$`<>".contains(c) || c.is_ascii_control())
    {
        return false;
    }
    let stem = name.split('.').next().unwrap_or(name).to_ascii_uppercase();
    if RESERVED_DEVICE_NAMES.contains(&stem.as_str()) {
        return false;
    }
    filename_pattern().is_match(name)
}

/// Error raised when an environment variable name fails the safety check.
#[derive(Debug, thiserror::Error)]
#[error("Invalid environment variable name: {0}")]
pub struct UnsafeEnvVarName(pub String);

/// Validates an environment variable name and escapes dangerous characters
/// in its value (spec.md §4.C). Idempotent: sanitizing an already-sanitized
/// value is a no-op (P6), since every occurrence of a dangerous character is
/// escaped with a leading backslash that is not itself in the dangerous set.
pub fn sanitize_env_var(key: &str, value: &str) -> Result<(String, String), UnsafeEnvVarName> {
    if !env_name_pattern().is_match(key) {
        return Err(UnsafeEnvVarName(key.to_string()));
    }

    let mut sanitized = String::with_capacity(value.len());
    for c in value.chars() {
        if DANGEROUS_ENV_CHARS.contains(&c) {
            sanitized.push('\\');
        }
        sanitized.push(c);
    }

    Ok((key.to_string(), sanitized))
}

/// A 16-hex-character task fingerprint (spec.md §3).
///
/// Deterministic over `(code, runtime, session_id, hour_bucket)` with keys
/// sorted in the hashed JSON, matching the original implementation's
/// `hashlib.sha256(json.dumps(..., sort_keys=True))[:16]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskFingerprint(String);

impl TaskFingerprint {
    /// Computes the fingerprint for the given inputs and hour bucket.
    #[must_use]
    pub fn compute(code: &str, runtime: &str, session_id: &str, hour_bucket: u64) -> Self {
        // Field order matches the sorted-key JSON object the hash is taken
        // over: code, hour_bucket (serialized as "timestamp" upstream),
        // runtime, session_id.
        let canonical = format!(
            "{{\"code\":{},\"runtime\":{},\"session_id\":{},\"timestamp\":{hour_bucket}}}",
            serde_json::to_string(code).expect("string serializes"),
            serde_json::to_string(runtime).expect("string serializes"),
            serde_json::to_string(session_id).expect("string serializes"),
        );

        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let digest = hasher.finalize();
        let full_hex = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();
        Self(full_hex[..16].to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Returns the current hour bucket used for fingerprint grouping:
/// `floor(unix_time / 3600)`.
#[must_use]
pub fn current_hour_bucket() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock is after the epoch")
        .as_secs()
        / 3600
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_simple_names() {
        assert!(is_safe_filename("input.txt"));
        assert!(is_safe_filename("out-2.json"));
        assert!(is_safe_filename("a_b.c"));
    }

    #[test]
    fn rejects_traversal_and_absolute_paths() {
        assert!(!is_safe_filename("../escape"));
        assert!(!is_safe_filename("..\\escape"));
        assert!(!is_safe_filename("/etc/passwd"));
        assert!(!is_safe_filename("\\windows\\system32"));
    }

    #[test]
    fn rejects_shell_metacharacters_and_control_chars() {
        assert!(!is_safe_filename("a;b"));
        assert!(!is_safe_filename("a|b"));
        assert!(!is_safe_filename("a&b"));
        assert!(!is_safe_filename("a$b"));
        assert!(!is_safe_filename("a`b"));
        assert!(!is_safe_filename("a<b"));
        assert!(!is_safe_filename("a>b"));
        assert!(!is_safe_filename("a\tb"));
    }

    #[test]
    fn rejects_reserved_device_names() {
        assert!(!is_safe_filename("CON"));
        assert!(!is_safe_filename("con.txt"));
        assert!(!is_safe_filename("COM1"));
        assert!(!is_safe_filename("lpt9.log"));
    }

    #[test]
    fn rejects_overlong_names() {
        let name = "a".repeat(256);
        assert!(!is_safe_filename(&name));
        let ok = "a".repeat(255);
        assert!(is_safe_filename(&ok));
    }

    #[test]
    fn sanitize_env_var_rejects_bad_names() {
        assert!(sanitize_env_var("1BAD", "x").is_err());
        assert!(sanitize_env_var("BAD-NAME", "x").is_err());
        assert!(sanitize_env_var("GOOD_NAME", "x").is_ok());
    }

    #[test]
    fn sanitize_env_var_escapes_dangerous_chars() {
        let (k, v) = sanitize_env_var("KEY", "a;b&c|d$e").unwrap();
        assert_eq!(k, "KEY");
        assert_eq!(v, "a\\;b\\&c\\|d\\$e");
    }

    #[test]
    fn sanitize_env_var_is_idempotent() {
        let (_, once) = sanitize_env_var("KEY", "a;b").unwrap();
        let (_, twice) = sanitize_env_var("KEY", &once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn fingerprint_is_deterministic_within_hour_bucket() {
        let a = TaskFingerprint::compute("print(1)", "python", "s1", 100);
        let b = TaskFingerprint::compute("print(1)", "python", "s1", 100);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 16);
    }

    #[test]
    fn fingerprint_differs_across_sessions_and_hours() {
        let base = TaskFingerprint::compute("print(1)", "python", "s1", 100);
        let other_session = TaskFingerprint::compute("print(1)", "python", "s2", 100);
        let other_hour = TaskFingerprint::compute("print(1)", "python", "s1", 101);
        assert_ne!(base, other_session);
        assert_ne!(base, other_hour);
    }
}
