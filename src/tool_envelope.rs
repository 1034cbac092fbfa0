//! Uniform tool response envelope.
//!
//! Non-execution tools (everything except `execute_code_in_sandbox`, which
//! returns its own `ExecutionResult`) respond through `ToolOutcome<T>`, a
//! tagged sum type that serializes to a flat `{success, session_id, data,
//! message, error_message}` JSON object.

use serde::Serialize;

/// Outcome of a non-execution tool call.
#[derive(Debug, Clone)]
pub enum ToolOutcome<T> {
    Ok {
        session_id: Option<String>,
        data: T,
        message: Option<String>,
    },
    Err {
        session_id: Option<String>,
        error_message: String,
        data: Option<serde_json::Value>,
    },
}

impl<T> ToolOutcome<T> {
    pub fn ok(session_id: impl Into<String>, data: T, message: impl Into<String>) -> Self {
        Self::Ok {
            session_id: Some(session_id.into()),
            data,
            message: Some(message.into()),
        }
    }

    pub fn err(session_id: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self::Err {
            session_id: Some(session_id.into()),
            error_message: error_message.into(),
            data: None,
        }
    }

    pub fn err_unbound(error_message: impl Into<String>) -> Self {
        Self::Err {
            session_id: None,
            error_message: error_message.into(),
            data: None,
        }
    }
}

/// Wire shape shared by both variants; `Serialize` is implemented by hand
/// so the enum's tag never leaks into the JSON (callers see `success`, not
/// an internal `Ok`/`Err` discriminant).
impl<T: Serialize> Serialize for ToolOutcome<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        #[derive(Serialize)]
        struct Wire<'a, T> {
            success: bool,
            session_id: &'a Option<String>,
            data: Option<&'a T>,
            message: &'a Option<String>,
            error_message: &'a Option<String>,
        }

        match self {
            Self::Ok {
                session_id,
                data,
                message,
            } => Wire {
                success: true,
                session_id,
                data: Some(data),
                message,
                error_message: &None,
            }
            .serialize(serializer),
            Self::Err {
                session_id,
                error_message,
                data,
            } => {
                let error_message = Some(error_message.clone());
                let data_value: Option<&serde_json::Value> = data.as_ref();
                #[derive(Serialize)]
                struct ErrWire<'a> {
                    success: bool,
                    session_id: &'a Option<String>,
                    data: Option<&'a serde_json::Value>,
                    message: &'a Option<String>,
                    error_message: &'a Option<String>,
                }
                ErrWire {
                    success: false,
                    session_id,
                    data: data_value,
                    message: &None,
                    error_message: &error_message,
                }
                .serialize(serializer)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_serializes_to_flat_shape() {
        let outcome = ToolOutcome::ok("sid_1", serde_json::json!({"k": "v"}), "done");
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["session_id"], "sid_1");
        assert_eq!(value["data"]["k"], "v");
        assert_eq!(value["message"], "done");
        assert!(value["error_message"].is_null());
    }

    #[test]
    fn err_serializes_to_flat_shape() {
        let outcome: ToolOutcome<serde_json::Value> = ToolOutcome::err("sid_2", "file not found");
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["session_id"], "sid_2");
        assert_eq!(value["error_message"], "file not found");
        assert!(value["data"].is_null());
    }

    #[test]
    fn err_unbound_has_no_session_id() {
        let outcome: ToolOutcome<serde_json::Value> = ToolOutcome::err_unbound("not initialized");
        let value = serde_json::to_value(&outcome).unwrap();
        assert!(value["session_id"].is_null());
    }
}
