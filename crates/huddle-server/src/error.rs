use crate::sfu::{RegistryError, RelayError};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use huddle_protocol::{RequestSubject, ServerMessage};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("Access denied")]
    Forbidden,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    BadRequest(String),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),

    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            AppError::Forbidden => (StatusCode::FORBIDDEN, self.to_string()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            AppError::Jwt(_) => (StatusCode::UNAUTHORIZED, "Invalid token".to_string()),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

/// Failure of a signaling request
#[derive(Error, Debug)]
pub enum SignalError {
    /// Refused before any shared state changed
    #[error("{0}")]
    Rejected(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl SignalError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, SignalError::Relay(e) if e.is_fatal())
    }

    /// The reply owed to the requester for a failed `request`
    pub fn to_message(&self, request: &str, subject: Option<RequestSubject>) -> ServerMessage {
        let request = request.to_string();
        match self {
            SignalError::Rejected(reason) => ServerMessage::RequestRejected {
                request,
                reason: reason.clone(),
                subject,
            },
            SignalError::Registry(e) => ServerMessage::RequestRejected {
                request,
                reason: e.to_string(),
                subject,
            },
            SignalError::Relay(RelayError::Unsupported(reason)) => {
                ServerMessage::RequestRejected {
                    request,
                    reason: reason.clone(),
                    subject,
                }
            }
            SignalError::Relay(e) if e.is_fatal() => ServerMessage::Error {
                message: "media relay unavailable".to_string(),
            },
            SignalError::Relay(e) => ServerMessage::RequestFailed {
                request,
                reason: e.to_string(),
                subject,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_protocol::ProducerSource;
    use uuid::Uuid;

    #[test]
    fn test_registry_errors_become_rejections() {
        let err = SignalError::from(RegistryError::SourceActive(ProducerSource::Mic));
        let subject = Some(RequestSubject::Produce {
            source: ProducerSource::Mic,
        });
        assert_eq!(
            err.to_message("produce", subject),
            ServerMessage::RequestRejected {
                request: "produce".to_string(),
                reason: "source mic is already being produced".to_string(),
                subject,
            }
        );
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_relay_failures_are_typed_replies() {
        let producer_id = Uuid::new_v4();
        let subject = Some(RequestSubject::Consume { producer_id });
        let err = SignalError::from(RelayError::Failed("a failed: b failed: c".to_string()));

        assert_eq!(
            err.to_message("consume", subject),
            ServerMessage::RequestFailed {
                request: "consume".to_string(),
                reason: "relay request failed: a failed: b failed: c".to_string(),
                subject,
            }
        );
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_worker_death_is_fatal_and_opaque() {
        let err = SignalError::from(RelayError::WorkerDied(2));
        assert!(err.is_fatal());
        assert_eq!(
            err.to_message("consume", None),
            ServerMessage::Error {
                message: "media relay unavailable".to_string(),
            }
        );
    }
}
