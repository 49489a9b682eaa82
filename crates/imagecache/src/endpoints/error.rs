use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use imagecache_service::caching::CacheError;
use sentry::integrations::anyhow::capture_anyhow;
use serde::{Deserialize, Serialize};

#[derive(Debug)]
pub struct ResponseError {
    status: StatusCode,
    err: anyhow::Error,
}

impl From<CacheError> for ResponseError {
    fn from(err: CacheError) -> Self {
        let status = match err {
            CacheError::FetchFailed(_) => StatusCode::BAD_GATEWAY,
            CacheError::StoreFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            err: err.into(),
        }
    }
}

impl IntoResponse for ResponseError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            capture_anyhow(&self.err);
        }
        let mut response = Json(ApiErrorResponse::from(self.err)).into_response();
        *response.status_mut() = self.status;
        response
    }
}

/// An error response from the api.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct ApiErrorResponse {
    pub error: String,
}

impl From<anyhow::Error> for ApiErrorResponse {
    fn from(err: anyhow::Error) -> Self {
        ApiErrorResponse {
            error: err.to_string(),
        }
    }
}
