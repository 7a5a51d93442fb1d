//! Crate-wide error type.
//!
//! One `Error` enum backs both the inline WS error frames (`code()`, §7 of
//! the relay spec) and the HTTP surface (`ResponseError`), so the two never
//! drift apart the way two hand-maintained taxonomies would.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use derive_more::{Display, From};

/// Inline error code taxonomy returned to WS clients as `{type: "error",
/// code, message}`.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum ErrorCode {
    NoDevice,
    NotAuthorized,
    DeviceOffline,
    TurnError,
    ForwardFailed,
    RateLimited,
    StaleCommand,
    MessageTooLarge,
}

impl ErrorCode {
    /// The wire string for this code, e.g. `"NO_DEVICE"`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoDevice => "NO_DEVICE",
            Self::NotAuthorized => "NOT_AUTHORIZED",
            Self::DeviceOffline => "DEVICE_OFFLINE",
            Self::TurnError => "TURN_ERROR",
            Self::ForwardFailed => "FORWARD_FAILED",
            Self::RateLimited => "RATE_LIMITED",
            Self::StaleCommand => "STALE_COMMAND",
            Self::MessageTooLarge => "MESSAGE_TOO_LARGE",
        }
    }
}

/// Errors that can occur while servicing a connection or an HTTP request.
#[derive(Debug, Display, From)]
pub enum Error {
    /// Target device is not owned by the acting user, or owned by no one.
    #[display(fmt = "no device to route to")]
    NoDevice,

    /// Caller does not own the device it is trying to act on.
    #[display(fmt = "not authorized for this device")]
    NotAuthorized,

    /// Target robot has no live connection.
    #[display(fmt = "device is offline")]
    DeviceOffline,

    /// TURN credential minting failed.
    #[display(fmt = "TURN error: {}", _0)]
    Turn(TurnError),

    /// Write to the target socket failed for a reason other than the
    /// peer simply being offline.
    #[display(fmt = "forward failed")]
    ForwardFailed,

    /// Caller exceeded the configured rate limit.
    #[display(fmt = "rate limited: {}", _0)]
    RateLimited(String),

    /// Caller-supplied timestamp is too old.
    #[display(fmt = "stale command, age {}ms", _0)]
    StaleCommand(u64),

    /// Frame exceeded the soft size cap.
    #[display(fmt = "message too large")]
    MessageTooLarge,

    /// Auth failed (bad HMAC signature / bad or expired token).
    #[display(fmt = "authentication failed")]
    AuthFailed,

    /// Malformed request (missing/garbled auth parameters).
    #[display(fmt = "bad request: {}", _0)]
    BadRequest(String),

    /// An external collaborator store failed.
    #[display(fmt = "store error: {}", _0)]
    #[from(ignore)]
    Store(String),
}

impl Error {
    /// Maps this error onto the inline `code` taxonomy, for errors that are
    /// ever surfaced to a WS client. Panics if called on a variant that is
    /// never surfaced inline (a programming error, not a runtime one).
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NoDevice => ErrorCode::NoDevice,
            Self::NotAuthorized => ErrorCode::NotAuthorized,
            Self::DeviceOffline => ErrorCode::DeviceOffline,
            Self::Turn(_) => ErrorCode::TurnError,
            Self::ForwardFailed => ErrorCode::ForwardFailed,
            Self::RateLimited(_) => ErrorCode::RateLimited,
            Self::StaleCommand(_) => ErrorCode::StaleCommand,
            Self::MessageTooLarge => ErrorCode::MessageTooLarge,
            Self::AuthFailed | Self::BadRequest(_) | Self::Store(_) => {
                ErrorCode::NotAuthorized
            }
        }
    }
}

impl ResponseError for Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::AuthFailed => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NoDevice | Self::DeviceOffline => StatusCode::NOT_FOUND,
            Self::NotAuthorized => StatusCode::FORBIDDEN,
            Self::Turn(_) | Self::Store(_) | Self::ForwardFailed => {
                StatusCode::BAD_GATEWAY
            }
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::StaleCommand(_) => StatusCode::BAD_REQUEST,
            Self::MessageTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(serde_json::json!({
            "error": self.to_string(),
        }))
    }
}

/// Errors minting TURN credentials.
#[derive(Clone, Debug, Display)]
pub enum TurnError {
    /// No TURN provider key/token configured.
    #[display(fmt = "TURN provider not configured")]
    NotConfigured,

    /// The provider responded with a non-success HTTP status.
    #[display(fmt = "TURN provider returned HTTP {}", _0)]
    Http(u16),

    /// Transport-level failure talking to the provider.
    #[display(fmt = "TURN provider network error: {}", _0)]
    Network(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_error_wraps_into_error_and_keeps_turn_error_code() {
        let err: Error = TurnError::Http(502).into();
        assert_eq!(err.code(), ErrorCode::TurnError);
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn status_codes_match_the_inline_error_taxonomy_intent() {
        assert_eq!(Error::DeviceOffline.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(Error::RateLimited("x".into()).status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(Error::MessageTooLarge.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
