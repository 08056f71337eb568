use easel_common::protocol::realtime::ServerEvent;

/// Failures raised while handling a realtime event.
///
/// Only [`RealtimeError::AuthenticationFailure`] ends a connection (at the
/// handshake); every other kind is reported to the originating connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RealtimeError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("unauthorized to access this canvas")]
    AccessDenied,
    #[error("{0}")]
    InvalidRequest(String),
    #[error("authentication failed")]
    AuthenticationFailure,
    #[error("canvas store unavailable")]
    Unavailable,
}

impl RealtimeError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::AccessDenied => "ACCESS_DENIED",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::AuthenticationFailure => "AUTHENTICATION_FAILED",
            Self::Unavailable => "UNAVAILABLE",
        }
    }

    pub fn to_event(&self, canvas_id: Option<&str>) -> ServerEvent {
        ServerEvent::Error {
            code: self.code().to_owned(),
            message: self.to_string(),
            canvas_id: canvas_id.map(ToOwned::to_owned),
        }
    }
}
