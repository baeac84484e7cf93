use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write. Callers use this as a race-breaker.
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),
    #[error("record not found")]
    NotFound,
    /// The agent already holds `max_concurrent_chats` live conversations.
    #[error("agent {0} is at capacity")]
    AgentAtCapacity(String),
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
    #[error("invalid stored value: {0}")]
    Decode(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                StoreError::UniqueViolation(db.constraint().unwrap_or("unknown").to_string())
            }
            other => StoreError::Database(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("missing whatsapp accessToken or phoneNumberId")]
    MissingCredentials,
    #[error("provider request failed: {0}")]
    Request(String),
    #[error("provider api error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("unexpected provider response: {0}")]
    InvalidResponse(String),
    #[error("media exceeds {0} bytes")]
    TooLarge(usize),
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError::Request(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("media storage failed: {0}")]
    Storage(String),
}

/// Failures of synchronous handlers, rendered as `{"error": ...}` JSON.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Conflict(String),
    /// The provider rejected the call; `record` carries whatever was persisted.
    #[error("{message}")]
    Upstream { message: String, record: Option<Value> },
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UniqueViolation(constraint) => {
                ApiError::Conflict(format!("duplicate record ({constraint})"))
            }
            StoreError::NotFound => ApiError::NotFound("record not found".to_string()),
            StoreError::AgentAtCapacity(agent_id) => {
                ApiError::Conflict(format!("agent {agent_id} is at capacity"))
            }
            other => {
                tracing::error!(error = %other, "store failure in request handler");
                ApiError::Internal("internal error".to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match self {
            ApiError::Upstream { message, record } => json!({
                "error": message,
                "message": record,
            }),
            other => json!({ "error": other.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_http_classes() {
        let conflict: ApiError = StoreError::UniqueViolation("contacts_org_phone".into()).into();
        assert_eq!(conflict.status_code(), StatusCode::CONFLICT);

        let full: ApiError = StoreError::AgentAtCapacity("a2".into()).into();
        assert_eq!(full.status_code(), StatusCode::CONFLICT);
        assert_eq!(full.to_string(), "agent a2 is at capacity");

        let missing: ApiError = StoreError::NotFound.into();
        assert_eq!(missing.status_code(), StatusCode::NOT_FOUND);

        let corrupt: ApiError = StoreError::Decode("status 'weird'".into()).into();
        assert_eq!(corrupt.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(corrupt.to_string(), "internal error");
    }

    #[test]
    fn upstream_failure_is_bad_gateway() {
        let err = ApiError::Upstream {
            message: "provider api error 400".into(),
            record: Some(json!({ "status": "failed" })),
        };
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }
}
