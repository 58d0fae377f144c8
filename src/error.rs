use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Error taxonomy shared by the pipeline, the adapters and the HTTP layer.
///
/// Callers match on the variant instead of inspecting messages: the HTTP
/// layer maps each one to a fixed status code.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Connection refused, timed out or otherwise unreachable.
    #[error("{service} unavailable: {detail}")]
    Unavailable { service: &'static str, detail: String },

    /// The upstream answered, but with a non-success status.
    #[error("{service} error ({status}): {detail}")]
    Upstream {
        service: &'static str,
        status: u16,
        detail: String,
    },

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    pub fn unavailable(service: &'static str, detail: impl ToString) -> Self {
        Self::Unavailable {
            service,
            detail: detail.to_string(),
        }
    }

    pub fn upstream(service: &'static str, status: u16, detail: impl ToString) -> Self {
        Self::Upstream {
            service,
            status,
            detail: detail.to_string(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream { .. } => StatusCode::BAD_GATEWAY,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Maps a reqwest failure for `service` onto the taxonomy.
    pub fn from_reqwest(service: &'static str, err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::unavailable(service, err)
        } else if let Some(status) = err.status() {
            Self::upstream(service, status.as_u16(), err)
        } else if err.is_decode() {
            Self::upstream(service, 200, format!("unexpected response format: {}", err))
        } else {
            Self::unavailable(service, err)
        }
    }
}

impl From<qdrant_client::QdrantError> for GatewayError {
    fn from(err: qdrant_client::QdrantError) -> Self {
        match err {
            qdrant_client::QdrantError::ResponseError { status } => {
                let code = status.code() as i32;
                if matches!(code, tonic_code::UNAVAILABLE | tonic_code::DEADLINE_EXCEEDED) {
                    Self::unavailable("vector store", status.message())
                } else {
                    Self::upstream("vector store", code as u16, status.message())
                }
            }
            other => Self::unavailable("vector store", other),
        }
    }
}

/// Numeric gRPC codes, avoiding a direct dependency on tonic.
mod tonic_code {
    pub const DEADLINE_EXCEEDED: i32 = 4;
    pub const UNAVAILABLE: i32 = 14;
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("JSON error: {}", err))
    }
}

/// Attached to error responses so request logging can see what went wrong.
#[derive(Debug, Clone)]
pub struct ErrorDetail(pub String);

#[derive(Serialize)]
struct ErrorBody {
    detail: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let logged = self.to_string();
        let detail = match &self {
            Self::Internal(detail) => {
                tracing::error!(%detail, "Unhandled internal error");
                "Internal server error".to_string()
            }
            Self::Unavailable { service, detail } => {
                tracing::warn!(service, %detail, "Upstream unavailable");
                format!("Could not connect to {}: {}", service, detail)
            }
            Self::Upstream {
                service,
                status,
                detail,
            } => {
                tracing::warn!(service, status, %detail, "Upstream rejected request");
                format!("{} API error: {}", service, detail)
            }
            other => other.to_string(),
        };

        let mut response = (status, Json(ErrorBody { detail })).into_response();
        response.extensions_mut().insert(ErrorDetail(logged));
        if status == StatusCode::UNAUTHORIZED {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, header::HeaderValue::from_static("ApiKey"));
        }
        response
    }
}
