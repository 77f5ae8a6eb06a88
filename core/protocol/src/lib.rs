//! Sync protocol types and validation for chat-tally.
//!
//! This crate is shared by the coordinator, the monitor hosts and observers so
//! the message contract cannot drift between them. The coordinator remains the
//! authority on validation, but every sender can reuse the same types to build
//! well-formed messages.
//!
//! Delivery is best-effort: nothing in this contract acknowledges a
//! [`SyncMessage`] beyond "accepted", and a sender with no listener simply
//! drops the message.

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB
/// Responses carry whole identity lists, so they get far more room.
pub const MAX_RESPONSE_BYTES: usize = 64 * 1024 * 1024; // 64MB
pub const MAX_SESSION_ID_LEN: usize = 128;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    Event,
    QuerySessionState,
    QueryGlobalState,
    ListSessions,
    EvictSession,
    SetForeground,
    Subscribe,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(method: Method, id: Option<String>, params: Option<Value>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            method,
            id,
            params,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

/// Every state-changing notification a monitor host can send.
///
/// Queries are not part of this enum: they travel as [`Method`] requests and
/// get a reply, while these are fire-and-forget.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum SyncMessage {
    IdentityAccepted {
        session_id: String,
        identity: String,
        is_new: bool,
        current_count: usize,
    },
    ExclusionListUpdated {
        session_id: String,
        exclusions: Vec<String>,
    },
    SessionCleared {
        session_id: String,
    },
    WatchStarted {
        session_id: String,
        started_at: String,
    },
    WatchStopped {
        session_id: String,
    },
    SubjectChanged {
        session_id: String,
        #[serde(default)]
        subject_label: Option<String>,
    },
}

impl SyncMessage {
    pub fn session_id(&self) -> &str {
        match self {
            SyncMessage::IdentityAccepted { session_id, .. }
            | SyncMessage::ExclusionListUpdated { session_id, .. }
            | SyncMessage::SessionCleared { session_id }
            | SyncMessage::WatchStarted { session_id, .. }
            | SyncMessage::WatchStopped { session_id }
            | SyncMessage::SubjectChanged { session_id, .. } => session_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::IdentityAccepted { .. } => "identity_accepted",
            SyncMessage::ExclusionListUpdated { .. } => "exclusion_list_updated",
            SyncMessage::SessionCleared { .. } => "session_cleared",
            SyncMessage::WatchStarted { .. } => "watch_started",
            SyncMessage::WatchStopped { .. } => "watch_stopped",
            SyncMessage::SubjectChanged { .. } => "subject_changed",
        }
    }

    pub fn validate(&self) -> Result<(), ErrorInfo> {
        validate_session_id(self.session_id())?;

        match self {
            SyncMessage::IdentityAccepted { identity, .. } => {
                require_non_empty(identity, "identity")?;
            }
            SyncMessage::WatchStarted { started_at, .. } => {
                if DateTime::parse_from_rfc3339(started_at).is_err() {
                    return Err(ErrorInfo::new(
                        "invalid_timestamp",
                        "started_at must be RFC3339",
                    ));
                }
            }
            SyncMessage::ExclusionListUpdated { .. }
            | SyncMessage::SessionCleared { .. }
            | SyncMessage::WatchStopped { .. }
            | SyncMessage::SubjectChanged { .. } => {}
        }

        Ok(())
    }
}

/// Read-only view of one session as served to observers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub user_count: usize,
    pub unique_identities: Vec<String>,
    pub excluded_identities: Vec<String>,
    pub active: bool,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub last_identity: Option<String>,
    #[serde(default)]
    pub last_updated_at: Option<String>,
    #[serde(default)]
    pub subject_label: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct GlobalAggregate {
    pub total_unique_identities: usize,
    pub active_session_count: usize,
}

/// Pushed to every connected observer after a coordinator mutation.
///
/// `session` is `None` when the mutation removed the session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateUpdate {
    pub session_id: String,
    pub cause: String,
    #[serde(default)]
    pub session: Option<SessionSnapshot>,
    pub global: GlobalAggregate,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SessionParams {
    pub session_id: String,
}

pub fn parse_message(params: Value) -> Result<SyncMessage, ErrorInfo> {
    let message: SyncMessage = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("sync message is invalid JSON: {}", err),
        )
    })?;
    message.validate()?;
    Ok(message)
}

pub fn parse_session_params(params: Option<Value>) -> Result<SessionParams, ErrorInfo> {
    let params =
        params.ok_or_else(|| ErrorInfo::new("invalid_params", "session_id is required"))?;
    let parsed: SessionParams = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("session params are invalid JSON: {}", err),
        )
    })?;
    validate_session_id(&parsed.session_id)?;
    Ok(parsed)
}

fn validate_session_id(session_id: &str) -> Result<(), ErrorInfo> {
    require_non_empty(session_id, "session_id")?;
    if session_id.len() > MAX_SESSION_ID_LEN {
        return Err(ErrorInfo::new(
            "invalid_session_id",
            "session_id must be 128 characters or fewer",
        ));
    }
    Ok(())
}

fn require_non_empty(value: &str, field: &str) -> Result<(), ErrorInfo> {
    if value.trim().is_empty() {
        return Err(ErrorInfo::new(
            "missing_field",
            format!("{} is required", field),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn accepted(session_id: &str, identity: &str) -> SyncMessage {
        SyncMessage::IdentityAccepted {
            session_id: session_id.to_string(),
            identity: identity.to_string(),
            is_new: true,
            current_count: 1,
        }
    }

    #[test]
    fn validates_identity_accepted() {
        assert!(accepted("tab-1", "foo_bar").validate().is_ok());
    }

    #[test]
    fn rejects_empty_identity() {
        let err = accepted("tab-1", "  ").validate().unwrap_err();
        assert_eq!(err.code, "missing_field");
    }

    #[test]
    fn rejects_missing_session_id() {
        let err = accepted("", "foo").validate().unwrap_err();
        assert_eq!(err.code, "missing_field");
    }

    #[test]
    fn rejects_long_session_id() {
        let err = accepted(&"a".repeat(256), "foo").validate().unwrap_err();
        assert_eq!(err.code, "invalid_session_id");
    }

    #[test]
    fn rejects_bad_watch_timestamp() {
        let message = SyncMessage::WatchStarted {
            session_id: "tab-1".to_string(),
            started_at: "not-a-time".to_string(),
        };
        assert_eq!(message.validate().unwrap_err().code, "invalid_timestamp");
    }

    #[test]
    fn parses_tagged_message() {
        let message = parse_message(json!({
            "type": "exclusion_list_updated",
            "session_id": "tab-1",
            "exclusions": ["nightbot"]
        }))
        .expect("parse");

        assert_eq!(message.kind(), "exclusion_list_updated");
        assert_eq!(message.session_id(), "tab-1");
    }

    #[test]
    fn subject_label_defaults_to_none() {
        let message = parse_message(json!({
            "type": "subject_changed",
            "session_id": "tab-1"
        }))
        .expect("parse");

        assert_eq!(
            message,
            SyncMessage::SubjectChanged {
                session_id: "tab-1".to_string(),
                subject_label: None,
            }
        );
    }

    #[test]
    fn rejects_unknown_message_type() {
        let err = parse_message(json!({"type": "user_count_update", "session_id": "tab-1"}))
            .unwrap_err();
        assert_eq!(err.code, "invalid_params");
    }

    #[test]
    fn session_params_require_session_id() {
        assert!(parse_session_params(None).is_err());
        assert!(parse_session_params(Some(json!({"session_id": ""}))).is_err());
        let parsed = parse_session_params(Some(json!({"session_id": "tab-2"}))).expect("parse");
        assert_eq!(parsed.session_id, "tab-2");
    }
}
