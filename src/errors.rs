use crate::services::{
    metadata_client::MetadataError, queue::QueueError, topic::TopicError,
    workflow_store::WorkflowError,
};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    /// Shortcut for 403 Forbidden
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, msg)
    }

    /// Storage is reachable in principle but failed this time.
    fn unavailable(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = self.status.as_u16(), error = %self.message, "request failed");
        }

        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<QueueError> for AppError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Unauthorized { .. } => AppError::forbidden(err.to_string()),
            QueueError::MessageNotFound(_) => AppError::not_found(err.to_string()),
            QueueError::Encode(_) => AppError::bad_request(err.to_string()),
            QueueError::Sqlx(_) => AppError::unavailable(err.to_string()),
        }
    }
}

impl From<TopicError> for AppError {
    fn from(err: TopicError) -> Self {
        match err {
            TopicError::Unauthorized { .. } => AppError::forbidden(err.to_string()),
            TopicError::Delivery { ref source, .. } if source.is_transient() => {
                AppError::unavailable(err.to_string())
            }
            TopicError::Delivery { .. } => AppError::internal(err.to_string()),
        }
    }
}

impl From<WorkflowError> for AppError {
    fn from(err: WorkflowError) -> Self {
        match err {
            WorkflowError::NotFound(_) => AppError::not_found(err.to_string()),
            WorkflowError::Sqlx(_) => AppError::unavailable(err.to_string()),
            WorkflowError::Corrupt { .. } | WorkflowError::Encode(_) => {
                AppError::internal(err.to_string())
            }
        }
    }
}

impl From<MetadataError> for AppError {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::EmptyKey => AppError::bad_request(err.to_string()),
            MetadataError::Sqlx(_) => AppError::unavailable(err.to_string()),
            MetadataError::Encode(_) => AppError::internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_errors_map_to_statuses() {
        let unauthorized = TopicError::Unauthorized {
            topic: "t".into(),
            source_identity: "intruder".into(),
        };
        assert_eq!(AppError::from(unauthorized).status, StatusCode::FORBIDDEN);

        let missing = WorkflowError::NotFound("ingest-x".into());
        assert_eq!(AppError::from(missing).status, StatusCode::NOT_FOUND);

        let busy = QueueError::Sqlx(sqlx::Error::PoolTimedOut);
        assert_eq!(AppError::from(busy).status, StatusCode::SERVICE_UNAVAILABLE);

        assert_eq!(
            AppError::from(MetadataError::EmptyKey).status,
            StatusCode::BAD_REQUEST
        );
    }
}
