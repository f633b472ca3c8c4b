use http::header::CONTENT_TYPE;
use http::{HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};
use shardq_core::{Body, Response};

/// Error taxonomy shared with Prometheus-compatible HTTP APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorType {
    #[serde(rename = "")]
    None,
    #[serde(rename = "timeout")]
    Timeout,
    #[serde(rename = "canceled")]
    Canceled,
    #[serde(rename = "execution")]
    Exec,
    #[serde(rename = "bad_data")]
    BadData,
    #[serde(rename = "internal")]
    Internal,
    #[serde(rename = "unavailable")]
    Unavailable,
    #[serde(rename = "not_found")]
    NotFound,
    #[serde(rename = "too_many_requests")]
    TooManyRequests,
    #[serde(rename = "too_large_entry")]
    TooLargeEntry,
    #[serde(rename = "not_acceptable")]
    NotAcceptable,
}

impl ErrorType {
    pub fn status_code(self) -> StatusCode {
        match self {
            ErrorType::BadData => StatusCode::BAD_REQUEST,
            ErrorType::Exec => StatusCode::UNPROCESSABLE_ENTITY,
            // nginx-style "client closed request"
            ErrorType::Canceled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
            ErrorType::Timeout | ErrorType::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorType::Internal | ErrorType::None => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorType::NotFound => StatusCode::NOT_FOUND,
            ErrorType::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            ErrorType::TooLargeEntry => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorType::NotAcceptable => StatusCode::NOT_ACCEPTABLE,
        }
    }
}

/// Structured, caller-facing error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct ApiError {
    pub kind: ErrorType,
    pub message: String,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    status: &'static str,
    #[serde(rename = "errorType", skip_serializing_if = "is_none")]
    error_type: ErrorType,
    #[serde(skip_serializing_if = "str::is_empty")]
    error: &'a str,
}

fn is_none(t: &ErrorType) -> bool { *t == ErrorType::None }

impl ApiError {
    pub fn new(kind: ErrorType, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn bad_data(message: impl Into<String>) -> Self { Self::new(ErrorType::BadData, message) }
    pub fn internal(message: impl Into<String>) -> Self { Self::new(ErrorType::Internal, message) }
    pub fn canceled(message: impl Into<String>) -> Self { Self::new(ErrorType::Canceled, message) }

    pub fn status_code(&self) -> StatusCode { self.kind.status_code() }

    /// Retrying the same request is expected to fail the same way for every
    /// type except `internal`.
    pub fn is_non_retryable(&self) -> bool { self.kind != ErrorType::Internal }

    /// Render as a Prometheus-style JSON error response.
    pub fn into_response(self) -> Response {
        let body = ErrorBody { status: "error", error_type: self.kind, error: &self.message };
        let bytes = serde_json::to_vec(&body).unwrap_or_else(|_| b"{}".to_vec());
        let mut resp = Response::new(Body::from(bytes));
        *resp.status_mut() = self.status_code();
        resp.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        resp
    }
}

/// Render `err` if it wraps an [`ApiError`]; `None` for any other error.
pub fn response_from_error(err: &anyhow::Error) -> Option<Response> {
    err.downcast_ref::<ApiError>().map(|e| e.clone().into_response())
}
