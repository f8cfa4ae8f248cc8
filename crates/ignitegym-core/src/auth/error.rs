use thiserror::Error;

use crate::api::ApiError;
use crate::models::UserId;
use crate::store::StorageError;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Not signed in")]
    NotAuthenticated,

    #[error("Another sign-in or sign-out is in progress")]
    TransitionInProgress,

    #[error("Profile belongs to user {found}, but the session is for user {expected}")]
    IdentityMismatch { expected: UserId, found: UserId },

    #[error("Invalid sign-in response: {0}")]
    InvalidResponse(String),
}

impl SessionError {
    /// Message suitable for showing to the user.
    pub fn user_message(&self) -> String {
        match self {
            SessionError::Api(e) => e.user_message(),
            SessionError::Storage(_) => "Could not access saved session data.".to_string(),
            SessionError::NotAuthenticated => "Please sign in first.".to_string(),
            SessionError::TransitionInProgress => "Please wait, still signing in or out.".to_string(),
            SessionError::IdentityMismatch { .. } => "That profile does not belong to you.".to_string(),
            SessionError::InvalidResponse(_) => "The server sent an unexpected response.".to_string(),
        }
    }
}
