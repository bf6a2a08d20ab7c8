use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use murmur_shared::{Username, UsernameError};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Invalid session")]
    InvalidSession,

    #[error("User {0} already has an active connection")]
    AdmissionConflict(Username),

    #[error("Invalid request: {0}")]
    BadRequest(String),
}

impl From<UsernameError> for ServerError {
    fn from(err: UsernameError) -> Self {
        ServerError::BadRequest(err.to_string())
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::NotAuthenticated | ServerError::InvalidSession => {
                (StatusCode::UNAUTHORIZED, self.to_string())
            }
            ServerError::AdmissionConflict(_) => (StatusCode::CONFLICT, self.to_string()),
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}

/// Why an envelope could not be placed on a connection's outbound queue.
/// Either way the connection is torn down.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("outbound queue full")]
    QueueFull,

    #[error("outbound queue closed")]
    QueueClosed,
}

/// Fatal condition for a connection's pump pair.
#[derive(Debug, Error)]
pub enum PumpError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("write deadline of {0:?} exceeded")]
    WriteTimeout(std::time::Duration),

    #[error("no traffic within read deadline of {0:?}")]
    ReadTimeout(std::time::Duration),
}
