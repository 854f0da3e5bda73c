use serde::{Deserialize, Serialize};

use crate::ids::SessionId;
use crate::plan::ExtractedFilters;

/// A single prior exchange in the conversation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: String,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// Queue priority. Follow-up queries outrank fresh ones so an ongoing
/// conversation stays responsive under load.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Fresh,
    FollowUp,
}

/// Inbound query request.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default, alias = "conversationHistory")]
    pub conversation_history: Vec<Turn>,
    #[serde(default, alias = "userId")]
    pub user_id: Option<String>,
    #[serde(default, alias = "sessionId")]
    pub session_id: Option<SessionId>,
    #[serde(default, alias = "priorityHint")]
    pub priority_hint: Option<Priority>,
    /// Facts remembered about the user, supplied by the caller.
    #[serde(default)]
    pub memory: Vec<String>,
    /// Pre-extracted filters; extracted lexically when absent.
    #[serde(default)]
    pub filters: Option<ExtractedFilters>,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    /// Explicit hint wins; otherwise any prior history marks a follow-up.
    pub fn priority(&self) -> Priority {
        self.priority_hint.unwrap_or(if self.conversation_history.is_empty() {
            Priority::Fresh
        } else {
            Priority::FollowUp
        })
    }
}
