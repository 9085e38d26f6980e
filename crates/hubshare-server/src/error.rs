use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use hubshare_shared::protocol::HubEvent;
use hubshare_shared::ShareError;
use hubshare_store::StoreError;

#[derive(Debug, Error)]
pub enum HubError {
    #[error(transparent)]
    Share(#[from] ShareError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type HubResult<T> = Result<T, HubError>;

impl HubError {
    pub fn share(&self) -> Option<&ShareError> {
        match self {
            HubError::Share(e) => Some(e),
            _ => None,
        }
    }

    /// Render as an `error` wire message. Storage details stay server-side.
    pub fn to_event(&self) -> HubEvent {
        match self {
            HubError::Share(e) => HubEvent::error(e),
            HubError::Store(_) | HubError::Internal(_) => HubEvent::Error {
                text: "Internal server error".to_string(),
                code: Some("INTERNAL_ERROR".to_string()),
            },
        }
    }
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            HubError::Share(ShareError::AuthenticationFailed) => {
                (StatusCode::UNAUTHORIZED, self.to_string())
            }
            HubError::Share(
                ShareError::NotOwner | ShareError::AccessDenied | ShareError::TokenFileMismatch,
            ) => (StatusCode::FORBIDDEN, self.to_string()),
            HubError::Share(ShareError::FileNotFound | ShareError::TokenNotFound) => {
                (StatusCode::NOT_FOUND, self.to_string())
            }
            HubError::Share(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            HubError::Store(_) | HubError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_are_not_leaked() {
        let err = HubError::Store(StoreError::Migration { version: 1, reason: "secret path".into() });
        match err.to_event() {
            HubEvent::Error { text, code } => {
                assert!(!text.contains("secret"));
                assert_eq!(code.as_deref(), Some("INTERNAL_ERROR"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn auth_failure_is_401() {
        let response = HubError::Share(ShareError::AuthenticationFailed).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
