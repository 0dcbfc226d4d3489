use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    errors::{Error, Result, ValidationError},
    identifiers::{AssistantId, MessageId, RunId, ThreadId},
};

/// Application credential issued by the DingTalk developer console.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credential {
    app_key: String,
    app_secret: String,
}

impl Credential {
    /// Build a credential, rejecting empty or whitespace-only values.
    pub fn new(app_key: impl Into<String>, app_secret: impl Into<String>) -> Result<Self> {
        let app_key = app_key.into().trim().to_string();
        let app_secret = app_secret.into().trim().to_string();
        if app_key.is_empty() {
            return Err(Error::Config(
                ValidationError::new("is required").with_field("app_key"),
            ));
        }
        if app_secret.is_empty() {
            return Err(Error::Config(
                ValidationError::new("is required").with_field("app_secret"),
            ));
        }
        Ok(Self {
            app_key,
            app_secret,
        })
    }

    pub fn app_key(&self) -> &str {
        &self.app_key
    }

    pub fn app_secret(&self) -> &str {
        &self.app_secret
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("app_key", &self.app_key)
            .field("app_secret", &"***")
            .finish()
    }
}

/// Author of a thread message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }

    /// Roles this client does not model (e.g. `system`) yield `None`.
    fn from_wire(role: &str) -> Option<Self> {
        match role.trim().to_ascii_lowercase().as_str() {
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            _ => None,
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run status reported in `thread.run.completed` (`statusEnum`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RunStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    Expired,
    Other(String),
}

impl RunStatus {
    pub fn as_str(&self) -> &str {
        match self {
            RunStatus::Queued => "QUEUED",
            RunStatus::InProgress => "IN_PROGRESS",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
            RunStatus::Cancelled => "CANCELLED",
            RunStatus::Expired => "EXPIRED",
            RunStatus::Other(other) => other.as_str(),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, RunStatus::Failed)
    }
}

impl From<&str> for RunStatus {
    fn from(value: &str) -> Self {
        RunStatus::from(value.to_string())
    }
}

impl From<String> for RunStatus {
    fn from(value: String) -> Self {
        let normalized = value.trim().to_uppercase();
        match normalized.as_str() {
            "QUEUED" => RunStatus::Queued,
            "IN_PROGRESS" | "RUNNING" => RunStatus::InProgress,
            "COMPLETED" | "SUCCESS" => RunStatus::Completed,
            "FAILED" => RunStatus::Failed,
            "CANCELLED" | "CANCELED" => RunStatus::Cancelled,
            "EXPIRED" => RunStatus::Expired,
            _ => RunStatus::Other(value.trim().to_string()),
        }
    }
}

impl From<RunStatus> for String {
    fn from(value: RunStatus) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Request payload for `POST /v1.0/oauth2/accessToken`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AccessTokenRequest<'a> {
    pub app_key: &'a str,
    pub app_secret: &'a str,
}

/// Response payload for `POST /v1.0/oauth2/accessToken`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessTokenResponse {
    pub access_token: String,
    /// Lifetime in seconds.
    pub expire_in: u64,
}

#[derive(Debug, Serialize)]
pub(crate) struct ThreadCreateRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

/// Raw thread body; the service has been seen to return either `threadId` or `id`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ThreadResponseBody {
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl ThreadResponseBody {
    pub fn normalize(self) -> Thread {
        Thread {
            id: pick_id(self.thread_id, self.id).map(ThreadId::from),
            created_at: self.created_at,
            metadata: self.metadata,
        }
    }
}

/// An assistant thread as returned by the create call.
#[derive(Debug, Clone, PartialEq)]
pub struct Thread {
    /// `None` when the response carried neither `threadId` nor `id`.
    pub id: Option<ThreadId>,
    pub created_at: Option<i64>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Serialize)]
pub(crate) struct MessageCreateRequest<'a> {
    pub role: MessageRole,
    pub content: &'a str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MessageResponseBody {
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub created_at: Option<i64>,
}

impl MessageResponseBody {
    pub fn normalize(self, thread_id: &ThreadId) -> Message {
        Message {
            id: pick_id(self.message_id, self.id).map(MessageId::from),
            thread_id: thread_id.clone(),
            role: self.role.as_deref().and_then(MessageRole::from_wire),
            created_at: self.created_at,
        }
    }
}

/// A message stored in a thread.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: Option<MessageId>,
    pub thread_id: ThreadId,
    pub role: Option<MessageRole>,
    pub created_at: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RunCreateRequest<'a> {
    pub assistant_id: &'a AssistantId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<&'a str>,
    pub stream: bool,
}

fn pick_id(primary: Option<String>, fallback: Option<String>) -> Option<String> {
    primary
        .filter(|s| !s.trim().is_empty())
        .or_else(|| fallback.filter(|s| !s.trim().is_empty()))
}

/// Discriminant of a decoded [`StreamEvent`], matching the wire event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamEventKind {
    RunCreated,
    MessageCreated,
    MessageDelta,
    MessageCompleted,
    RunCompleted,
    Done,
}

impl StreamEventKind {
    pub fn from_event_name(name: &str) -> Option<Self> {
        match name {
            "thread.run.created" => Some(Self::RunCreated),
            "thread.message.created" => Some(Self::MessageCreated),
            "thread.message.delta" => Some(Self::MessageDelta),
            "thread.message.completed" => Some(Self::MessageCompleted),
            "thread.run.completed" => Some(Self::RunCompleted),
            "done" => Some(Self::Done),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamEventKind::RunCreated => "thread.run.created",
            StreamEventKind::MessageCreated => "thread.message.created",
            StreamEventKind::MessageDelta => "thread.message.delta",
            StreamEventKind::MessageCompleted => "thread.message.completed",
            StreamEventKind::RunCompleted => "thread.run.completed",
            StreamEventKind::Done => "done",
        }
    }
}

/// A decoded run event.
///
/// Delta and completed events carry the cumulative text of the current message, not
/// just the increment.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    RunCreated {
        run_id: Option<RunId>,
        data: Value,
    },
    MessageCreated {
        message_id: Option<MessageId>,
        data: Value,
    },
    MessageDelta {
        delta: String,
        text: String,
        data: Value,
    },
    MessageCompleted {
        text: String,
        /// Full message text from the payload, when the service includes it.
        content: Option<String>,
        data: Value,
    },
    RunCompleted {
        status: RunStatus,
        /// Set when `status` is `FAILED`; defaults to "Unknown error".
        error: Option<String>,
        data: Value,
    },
    Done,
}

impl StreamEvent {
    pub fn kind(&self) -> StreamEventKind {
        match self {
            StreamEvent::RunCreated { .. } => StreamEventKind::RunCreated,
            StreamEvent::MessageCreated { .. } => StreamEventKind::MessageCreated,
            StreamEvent::MessageDelta { .. } => StreamEventKind::MessageDelta,
            StreamEvent::MessageCompleted { .. } => StreamEventKind::MessageCompleted,
            StreamEvent::RunCompleted { .. } => StreamEventKind::RunCompleted,
            StreamEvent::Done => StreamEventKind::Done,
        }
    }

    /// Cumulative text for delta/completed events.
    pub fn text(&self) -> Option<&str> {
        match self {
            StreamEvent::MessageDelta { text, .. } | StreamEvent::MessageCompleted { text, .. } => {
                Some(text.as_str())
            }
            _ => None,
        }
    }

    /// Whether this event ends the run (a completed run or the end-of-stream marker).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamEvent::RunCompleted { .. } | StreamEvent::Done
        )
    }
}

/// Aggregate of a whole run, produced by `RunStream::collect_text`.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutput {
    pub run_id: Option<RunId>,
    pub text: String,
    pub status: Option<RunStatus>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_rejects_blank_values() {
        let err = Credential::new("  ", "secret").unwrap_err();
        assert_eq!(err.to_string(), "configuration error: app_key: is required");
        let err = Credential::new("key", "").unwrap_err();
        assert_eq!(err.to_string(), "configuration error: app_secret: is required");
    }

    #[test]
    fn credential_debug_hides_secret() {
        let cred = Credential::new("ding_key", "top-secret").unwrap();
        let rendered = format!("{cred:?}");
        assert!(rendered.contains("ding_key"));
        assert!(!rendered.contains("top-secret"));
    }

    #[test]
    fn thread_id_prefers_thread_id_field() {
        let body: ThreadResponseBody =
            serde_json::from_str(r#"{"threadId":"t-primary","id":"t-fallback"}"#).unwrap();
        assert_eq!(body.normalize().id, Some(ThreadId::new("t-primary")));

        let body: ThreadResponseBody = serde_json::from_str(r#"{"id":"t-fallback"}"#).unwrap();
        assert_eq!(body.normalize().id, Some(ThreadId::new("t-fallback")));

        let body: ThreadResponseBody = serde_json::from_str(r#"{"object":"thread"}"#).unwrap();
        assert_eq!(body.normalize().id, None);
    }

    #[test]
    fn message_id_falls_back_to_id() {
        let body: MessageResponseBody =
            serde_json::from_str(r#"{"messageId":"","id":"m-1","role":"user"}"#).unwrap();
        let msg = body.normalize(&ThreadId::new("t"));
        assert_eq!(msg.id, Some(MessageId::new("m-1")));
        assert_eq!(msg.role, Some(MessageRole::User));
    }

    #[test]
    fn unknown_message_role_is_tolerated() {
        let body: MessageResponseBody =
            serde_json::from_str(r#"{"messageId":"m-2","role":"system"}"#).unwrap();
        let msg = body.normalize(&ThreadId::new("t"));
        assert_eq!(msg.id, Some(MessageId::new("m-2")));
        assert!(msg.role.is_none());
    }

    #[test]
    fn run_status_parses_known_values() {
        assert_eq!(RunStatus::from("FAILED"), RunStatus::Failed);
        assert_eq!(RunStatus::from("completed"), RunStatus::Completed);
        assert_eq!(
            RunStatus::from("PAUSED"),
            RunStatus::Other("PAUSED".to_string())
        );
    }

    #[test]
    fn run_request_omits_missing_instructions() {
        let assistant = AssistantId::new("asst");
        let body = serde_json::to_value(RunCreateRequest {
            assistant_id: &assistant,
            instructions: None,
            stream: true,
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"assistantId": "asst", "stream": true}));
    }

    #[test]
    fn event_kind_round_trips_wire_names() {
        for name in [
            "thread.run.created",
            "thread.message.created",
            "thread.message.delta",
            "thread.message.completed",
            "thread.run.completed",
            "done",
        ] {
            let kind = StreamEventKind::from_event_name(name).expect("known event");
            assert_eq!(kind.as_str(), name);
        }
        assert!(StreamEventKind::from_event_name("thread.run.step.created").is_none());
    }
}
