use clonar_core::errors::{CollaboratorError, ToolError};

/// Failures inside the query pipeline. None of these reach clients as HTTP
/// errors: the pipeline degrades and, at worst, ends the stream with one
/// `error` event.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("session aborted")]
    Aborted,

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    /// Message safe to show a client.
    pub fn client_message(&self) -> &'static str {
        match self {
            Self::Aborted => "request aborted",
            _ => "internal error while answering the query",
        }
    }
}
