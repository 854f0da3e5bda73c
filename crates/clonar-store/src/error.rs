use clonar_core::ids::SessionId;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("session not found: {0}")]
    NotFound(SessionId),
}

impl StoreError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "session_not_found",
        }
    }
}
