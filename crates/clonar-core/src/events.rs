use serde::{Deserialize, Serialize};

use crate::ids::{EventId, SessionId};

/// One entry in a session's event log. The `id` is assigned by the store at
/// append time and is what clients use to deduplicate after a reconnect.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub id: EventId,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Outbound stream events.
///
/// Ordering contract per session: `Start → Data* → (End | Error)`. Exactly one
/// terminal event is ever appended.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Start { session_id: SessionId },
    Data { payload: DataPayload },
    End { reason: EndReason },
    Error { message: String },
}

/// Partial output carried by a `data` event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataPayload {
    /// A chunk of the generated answer.
    Token { text: String },
    /// A structured update (intent, plan, step result, sources, follow-ups).
    Block {
        name: String,
        value: serde_json::Value,
    },
}

impl DataPayload {
    pub fn token(text: impl Into<String>) -> Self {
        Self::Token { text: text.into() }
    }

    pub fn block(name: impl Into<String>, value: serde_json::Value) -> Self {
        Self::Block {
            name: name.into(),
            value,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Completed,
    Aborted,
}

/// How a session finished. `Errored` carries the message shown to clients.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Aborted,
    Errored(String),
}

impl Outcome {
    pub fn into_event_kind(self) -> EventKind {
        match self {
            Self::Completed => EventKind::End {
                reason: EndReason::Completed,
            },
            Self::Aborted => EventKind::End {
                reason: EndReason::Aborted,
            },
            Self::Errored(message) => EventKind::Error { message },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::Errored(_) => "errored",
        }
    }
}

impl EventKind {
    /// Wire event name (`event:` field of the SSE frame).
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Data { .. } => "data",
            Self::End { .. } => "end",
            Self::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::End { .. } | Self::Error { .. })
    }
}
