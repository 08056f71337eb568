// Request body extraction and the account/canvas field rules applied by the
// REST handlers.

use axum::{
    extract::{rejection::JsonRejection, FromRequest, Request},
    http::StatusCode,
    Json,
};
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::error::{ErrorCode, RelayError};

/// Maximum REST request body in bytes (1 MiB).
pub const MAX_REST_BODY_BYTES: usize = 1024 * 1024;

pub const MIN_PASSWORD_LENGTH: usize = 8;
pub const MAX_NAME_LENGTH: usize = 200;
const MAX_EMAIL_LENGTH: usize = 254;

pub const WEAK_PASSWORD_MESSAGE: &str = "password should contain at least 8 characters, 1 lowercase, 1 uppercase, 1 number, and 1 symbol";

/// `Json<T>` with rejections rendered as the relay error envelope.
///
/// An oversized body is `PAYLOAD_TOO_LARGE`; anything else the body parser
/// refuses is `VALIDATION_FAILED` with `details.kind` naming the failure.
pub struct ValidatedJson<T>(pub T);

impl<S, T> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
{
    type Rejection = RelayError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let rejection = match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => return Ok(ValidatedJson(value)),
            Err(rejection) => rejection,
        };

        let kind = BodyFault::of(&rejection);
        Err(RelayError::new(kind.code(), kind.message(&rejection))
            .with_details(json!({ "kind": kind.as_str() })))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyFault {
    NotJson,
    Malformed,
    WrongShape,
    TooLarge,
    Unreadable,
}

impl BodyFault {
    fn of(rejection: &JsonRejection) -> Self {
        match rejection {
            _ if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => Self::TooLarge,
            JsonRejection::MissingJsonContentType(_) => Self::NotJson,
            JsonRejection::JsonSyntaxError(_) => Self::Malformed,
            JsonRejection::JsonDataError(_) => Self::WrongShape,
            _ => Self::Unreadable,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::NotJson => "missing_content_type",
            Self::Malformed => "syntax_error",
            Self::WrongShape => "data_error",
            Self::TooLarge => "body_too_large",
            Self::Unreadable => "body_error",
        }
    }

    fn code(self) -> ErrorCode {
        match self {
            Self::TooLarge => ErrorCode::PayloadTooLarge,
            _ => ErrorCode::ValidationFailed,
        }
    }

    fn message(self, rejection: &JsonRejection) -> String {
        match self {
            Self::NotJson => "expected Content-Type: application/json".to_owned(),
            Self::TooLarge => ErrorCode::PayloadTooLarge.default_message().to_owned(),
            Self::Malformed => format!("malformed JSON: {}", rejection.body_text()),
            Self::WrongShape => format!("invalid JSON payload: {}", rejection.body_text()),
            Self::Unreadable => format!("request body error: {}", rejection.body_text()),
        }
    }
}

/// Structural email check: one `@`, a non-empty local part and a dotted domain.
pub fn is_valid_email(email: &str) -> bool {
    if email.is_empty() || email.len() > MAX_EMAIL_LENGTH {
        return false;
    }
    if email.chars().any(|character| character.is_whitespace() || character.is_control()) {
        return false;
    }

    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') {
        return false;
    }

    let labels: Vec<&str> = domain.split('.').collect();
    labels.len() >= 2
        && labels.iter().all(|label| {
            !label.is_empty()
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|character| character.is_alphanumeric() || character == '-')
        })
}

/// At least 8 characters with one lowercase, one uppercase, one digit and one symbol.
pub fn is_strong_password(password: &str) -> bool {
    password.chars().count() >= MIN_PASSWORD_LENGTH
        && password.chars().any(char::is_lowercase)
        && password.chars().any(char::is_uppercase)
        && password.chars().any(|character| character.is_ascii_digit())
        && password
            .chars()
            .any(|character| !character.is_alphanumeric() && !character.is_whitespace())
}

/// Trims and checks a display name; `None` when blank or too long.
pub fn normalize_name(name: &str) -> Option<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed.chars().count() > MAX_NAME_LENGTH {
        return None;
    }
    Some(trimmed.to_owned())
}
