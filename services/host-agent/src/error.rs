use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use crate::pool::PoolError;
use crate::ports::PortError;

/// RFC 7807 problem document.
#[derive(Debug, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub code: String,
    pub retryable: bool,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl ApiError {
    fn with_status(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        let code = code.into();
        let problem = ProblemDetails {
            r#type: format!("https://devlab.dev/problems/{code}"),
            title: status
                .canonical_reason()
                .unwrap_or("Unknown Error")
                .to_string(),
            status: status.as_u16(),
            detail: detail.into(),
            code,
            retryable: status == StatusCode::SERVICE_UNAVAILABLE,
        };
        Self {
            status,
            problem: Box::new(problem),
        }
    }

    pub fn bad_request(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::with_status(StatusCode::BAD_REQUEST, code, detail)
    }

    pub fn not_found(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::with_status(StatusCode::NOT_FOUND, code, detail)
    }

    pub fn conflict(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::with_status(StatusCode::CONFLICT, code, detail)
    }

    pub fn service_unavailable(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::with_status(StatusCode::SERVICE_UNAVAILABLE, code, detail)
    }

    pub fn internal(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::with_status(StatusCode::INTERNAL_SERVER_ERROR, code, detail)
    }
}

impl From<PoolError> for ApiError {
    fn from(err: PoolError) -> Self {
        let detail = err.to_string();
        match err {
            PoolError::Ports(PortError::Exhausted { .. }) => {
                Self::service_unavailable("ports_exhausted", detail)
            }
            PoolError::Ports(PortError::InvalidLayout(_)) => {
                error!(error = %detail, "Port layout error");
                Self::internal("internal_error", detail)
            }
            PoolError::AlreadyBound { .. } => Self::conflict("driver_already_bound", detail),
            PoolError::Launch { .. } => Self::service_unavailable("driver_launch_failed", detail),
            PoolError::Unhealthy { .. } => Self::service_unavailable("driver_unhealthy", detail),
            PoolError::Kill { .. } => {
                error!(error = %detail, "Driver kill failed");
                Self::internal("driver_stop_failed", detail)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}
