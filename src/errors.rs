use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Failures of the link store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("gave up minting a unique slug after {attempts} attempts")]
    SlugGenerationExhausted { attempts: u32 },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Failures to obtain a usable upstream access token.
#[derive(Debug, Error)]
pub enum AuthFailure {
    #[error("identity provider returned {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("token request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("identity provider sent an unreadable token response: {0}")]
    InvalidResponse(String),

    #[error("token cache unavailable: {0}")]
    Store(#[from] StoreError),

    #[error("token cache could not be sealed: {0}")]
    Seal(String),
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("link not found")]
    NotFound,

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("upstream authorization failed: {0}")]
    UpstreamAuthFailure(#[from] AuthFailure),

    #[error("upstream rejected request with status {0}")]
    UpstreamRejected(StatusCode),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("gave up minting a unique slug after {attempts} attempts")]
    SlugGenerationExhausted { attempts: u32 },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::SlugGenerationExhausted { attempts } => {
                AppError::SlugGenerationExhausted { attempts }
            }
            StoreError::Database(e) => AppError::Database(e),
        }
    }
}

impl AppError {
    /// Status code the client sees for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AppError::UpstreamAuthFailure(_) | AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AppError::UpstreamRejected(status)
                if status.is_client_error() || status.is_server_error() =>
            {
                *status
            }
            AppError::UpstreamRejected(_)
            | AppError::SlugGenerationExhausted { .. }
            | AppError::Database(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (error_type, code, msg) = match &self {
            AppError::NotFound => (
                "not_found_error",
                "link_not_found",
                "nothing to see here".to_string(),
            ),
            AppError::MethodNotAllowed => (
                "invalid_request_error",
                "method_not_allowed",
                "only GET and HEAD are supported".to_string(),
            ),
            AppError::InvalidRequest(reason) => {
                ("invalid_request_error", "invalid_request", reason.clone())
            }
            AppError::UpstreamAuthFailure(e) => {
                tracing::error!("Upstream token unavailable: {}", e);
                (
                    "upstream_error",
                    "upstream_auth_failed",
                    "could not authorize against the storage provider".to_string(),
                )
            }
            AppError::UpstreamRejected(upstream) => (
                "upstream_error",
                "upstream_rejected",
                format!("storage provider answered {}", upstream.as_u16()),
            ),
            AppError::Upstream(_) => (
                "upstream_error",
                "upstream_failed",
                "storage provider unreachable".to_string(),
            ),
            AppError::SlugGenerationExhausted { attempts } => {
                tracing::error!(attempts, "Slug generation exhausted");
                (
                    "internal_error",
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (
                    "internal_error",
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {}", e);
                (
                    "internal_error",
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "message": msg,
                "type": error_type,
                "code": code,
            }
        }));

        (status, body).into_response()
    }
}
