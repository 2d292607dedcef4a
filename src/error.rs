//! Error taxonomy for mutation calls and JSON error responses for the
//! dispatch path.

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Error kind surfaced to configuration mutators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Referenced key absent.
    NotFound,
    /// Duplicate listener address under a different id.
    AlreadyExists,
    /// Malformed URL, unparseable route predicate, invalid TLS material.
    InvalidArgument,
    /// Deleting a backend still referenced, or updating an immutable field.
    Conflict,
    /// Socket bind failure, factory crash, transport construction failure.
    Internal,
}

/// Error returned by every mux mutation. The graph is never mutated when
/// one of these is returned.
#[derive(Debug)]
pub struct MuxError {
    kind: ErrorKind,
    message: String,
}

impl MuxError {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self {
            kind: ErrorKind::NotFound,
            message: format!("{} not found", what),
        }
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::AlreadyExists,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::InvalidArgument,
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Conflict,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Internal,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for MuxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            ErrorKind::NotFound => "not found",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{}: {}", kind, self.message)
    }
}

impl std::error::Error for MuxError {}

impl From<std::io::Error> for MuxError {
    fn from(err: std::io::Error) -> Self {
        MuxError::internal(err.to_string())
    }
}

/// Error codes attached to responses synthesized by the proxy itself.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// No upstream server configured for the backend
    NoServers,
    /// Failed to connect to the selected upstream
    ConnectionFailed,
    /// Upstream did not answer within the request timeout
    RequestTimeout,
    /// Request body exceeded the frontend's buffering limit
    BodyTooLarge,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::NoServers => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::NoServers => "NO_SERVERS",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::BodyTooLarge => "BODY_TOO_LARGE",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: ProxyErrorCode,
    message: String,
    status: u16,
}

/// Body type flowing out of every handler in the proxy.
pub type HttpBody = BoxBody<Bytes, hyper::Error>;

/// Box a fully-buffered body into the common handler body type.
pub fn full_body(bytes: impl Into<Bytes>) -> HttpBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}

/// Create a JSON error response with an X-Proxy-Error header
pub fn json_error_response(code: ProxyErrorCode, message: impl Into<String>) -> Response<HttpBody> {
    let error = ErrorResponse {
        status: code.status_code().as_u16(),
        code,
        message: message.into(),
    };
    let body = serde_json::to_string(&error).unwrap_or_else(|_| {
        format!(
            r#"{{"code":"{}","status":{}}}"#,
            code.as_header_value(),
            error.status
        )
    });

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            ProxyErrorCode::NoServers.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProxyErrorCode::ConnectionFailed.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyErrorCode::RequestTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_json_error_response_shape() {
        let response = json_error_response(ProxyErrorCode::RequestTimeout, "upstream timed out");

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "REQUEST_TIMEOUT"
        );
    }

    #[test]
    fn test_mux_error_kinds() {
        assert_eq!(MuxError::not_found("backend b1").kind(), ErrorKind::NotFound);
        assert_eq!(
            MuxError::conflict("still referenced").kind(),
            ErrorKind::Conflict
        );
        assert!(MuxError::not_found("backend b1")
            .to_string()
            .contains("backend b1 not found"));
    }
}
