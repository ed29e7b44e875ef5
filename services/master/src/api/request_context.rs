//! Request-scoped context extracted from HTTP requests.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use devlab_model::headers;

use crate::allocation::SessionContext;
use crate::api::error::ApiError;

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub user: Option<String>,
    pub team: Option<String>,
    pub job_link: Option<String>,
    pub requestor_ip: Option<String>,
}

impl RequestContext {
    pub fn session(&self) -> SessionContext {
        SessionContext {
            request_id: self.request_id.clone(),
            user: self.user.clone(),
            requestor_ip: self.requestor_ip.clone(),
            team: self.team.clone(),
            job_link: self.job_link.clone(),
        }
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let request_id = header_string(&parts.headers, headers::REQUEST_ID)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        if request_id.len() > 128 {
            return Err(ApiError::bad_request(
                "invalid_request_id",
                "request id must be at most 128 characters",
            ));
        }

        // x-forwarded-for may carry a chain; the first entry is the client.
        let requestor_ip = header_string(&parts.headers, headers::REQUESTOR_IP).or_else(|| {
            header_string(&parts.headers, headers::FORWARDED_FOR)
                .and_then(|chain| chain.split(',').next().map(|ip| ip.trim().to_string()))
        });

        Ok(Self {
            user: header_string(&parts.headers, headers::USER),
            team: header_string(&parts.headers, headers::TEAM),
            job_link: header_string(&parts.headers, headers::JOB_LINK),
            requestor_ip,
            request_id,
        })
    }
}
