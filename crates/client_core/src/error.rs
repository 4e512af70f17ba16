use shared::{domain::ConversationId, error::ApiError};
use thiserror::Error;

/// Failure taxonomy of the client core. `Clone` so a single renewal outcome
/// can be handed to every waiter.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("authentication expired (status {status})")]
    AuthExpired { status: u16 },
    #[error("session renewal rejected: {0}")]
    RefreshInvalid(String),
    #[error("network failure: {0}")]
    Network(String),
    #[error("access to conversation {0} revoked")]
    AccessRevoked(ConversationId),
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("request failed with status {status}")]
    Status {
        status: u16,
        body: Option<ApiError>,
    },
    #[error("malformed response: {0}")]
    Decode(String),
    #[error("access token expiry could not be decoded: {0}")]
    InvalidToken(String),
    #[error("not logged in")]
    LoggedOut,
    #[error("durable state failure: {0}")]
    Storage(String),
}

impl ClientError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::AuthExpired { status } | ClientError::Status { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }

    pub fn is_access_loss(&self) -> bool {
        matches!(self, ClientError::Status { status: 403 | 404, .. })
    }

    pub fn ends_session(&self) -> bool {
        matches!(
            self,
            ClientError::RefreshInvalid(_) | ClientError::InvalidToken(_) | ClientError::LoggedOut
        )
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(value: serde_json::Error) -> Self {
        ClientError::Decode(value.to_string())
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(value: reqwest::Error) -> Self {
        ClientError::Network(value.to_string())
    }
}
