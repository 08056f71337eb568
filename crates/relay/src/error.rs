// HTTP error envelope and per-request id plumbing.
//
// Every non-2xx REST response has the shape
//   { "error": { "code", "message", "retryable", "request_id", "details" } }
// and echoes the request id in `x-request-id`.

use std::{fmt, future::Future};

use axum::{
    http::{header::HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    static REQUEST_ID: String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ValidationFailed,
    AuthInvalidToken,
    AuthInvalidCredentials,
    AuthForbidden,
    NotFound,
    Conflict,
    PayloadTooLarge,
    InternalError,
    StoreUnavailable,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::AuthInvalidToken => "AUTH_INVALID_TOKEN",
            Self::AuthInvalidCredentials => "AUTH_INVALID_CREDENTIALS",
            Self::AuthForbidden => "AUTH_FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            Self::InternalError => "INTERNAL_ERROR",
            Self::StoreUnavailable => "STORE_UNAVAILABLE",
        }
    }

    pub const fn status(self) -> StatusCode {
        match self {
            Self::ValidationFailed => StatusCode::BAD_REQUEST,
            Self::AuthInvalidToken | Self::AuthInvalidCredentials => StatusCode::UNAUTHORIZED,
            Self::AuthForbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict => StatusCode::CONFLICT,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
            Self::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Only server-side failures are worth retrying unchanged.
    pub fn retryable(self) -> bool {
        self.status().is_server_error()
    }

    pub const fn default_message(self) -> &'static str {
        match self {
            Self::ValidationFailed => "request validation failed",
            Self::AuthInvalidToken => "invalid authentication token",
            Self::AuthInvalidCredentials => "invalid credentials",
            Self::AuthForbidden => "caller lacks required permission",
            Self::NotFound => "requested resource not found",
            Self::Conflict => "resource already exists",
            Self::PayloadTooLarge => "payload exceeds maximum allowed size",
            Self::InternalError => "internal server error",
            Self::StoreUnavailable => "canvas store is unavailable",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct RelayError {
    code: ErrorCode,
    message: String,
    details: Map<String, Value>,
}

#[derive(Serialize)]
struct Envelope<'a> {
    error: EnvelopeBody<'a>,
}

#[derive(Serialize)]
struct EnvelopeBody<'a> {
    code: &'static str,
    message: &'a str,
    retryable: bool,
    request_id: Option<&'a str>,
    details: &'a Map<String, Value>,
}

impl RelayError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), details: Map::new() }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Non-object values are ignored; `details` is always an object on the wire.
    pub fn with_details(mut self, details: Value) -> Self {
        if let Value::Object(map) = details {
            self.details = map;
        }
        self
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for RelayError {}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let request_id = current_request_id();
        let envelope = Envelope {
            error: EnvelopeBody {
                code: self.code.as_str(),
                message: &self.message,
                retryable: self.code.retryable(),
                request_id: request_id.as_deref(),
                details: &self.details,
            },
        };

        let mut response = (self.code.status(), Json(envelope)).into_response();
        if let Some(request_id) = &request_id {
            attach_request_id_header(&mut response, request_id);
        }
        response
    }
}

/// Runs `future` with `request_id` visible to `current_request_id`.
pub async fn with_request_id_scope<F: Future>(request_id: String, future: F) -> F::Output {
    REQUEST_ID.scope(request_id, future).await
}

pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(String::clone).ok()
}

/// A client-supplied id is kept as long as it is a non-blank header value.
pub fn request_id_from_headers_or_generate(headers: &HeaderMap) -> String {
    match headers.get(REQUEST_ID_HEADER).and_then(|value| value.to_str().ok()) {
        Some(value) if !value.trim().is_empty() => value.to_owned(),
        _ => Uuid::new_v4().to_string(),
    }
}

pub fn attach_request_id_header(response: &mut Response, request_id: &str) {
    match HeaderValue::from_str(request_id) {
        Ok(value) => {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
        Err(_) => tracing::debug!("request id is not a valid header value"),
    }
}
