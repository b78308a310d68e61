//! Error taxonomy and JSON error responses

use crate::headers::CorsPolicy;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::net::SocketAddr;

/// Header carrying the machine-readable error code
pub const X_GATEWAY_ERROR: &str = "x-gateway-error";

/// Failures the gateway distinguishes between
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The backend executable could not be launched
    #[error("failed to launch server '{name}' ({command}): {source}")]
    Spawn {
        name: String,
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The backend port never accepted a connection
    #[error("port {port} did not accept connections after {attempts} attempts")]
    ReadinessTimeout { port: u16, attempts: u32 },

    /// Connection refused, reset or timed out before response headers
    #[error("server '{server}' is unreachable: {message}")]
    BackendUnreachable { server: String, message: String },

    /// The backend closed its stream after headers were sent
    #[error("stream from server '{server}' was interrupted: {message}")]
    StreamInterrupted { server: String, message: String },

    /// The backend exited without being asked to
    #[error("server '{name}' exited unexpectedly ({detail})")]
    ProcessExited { name: String, detail: String },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Error codes for gateway error responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// No route matches the first path segment
    UnknownRoute,
    /// Route exists but its backend is not ready
    BackendNotReady,
    /// Connecting to the backend failed before a response started
    BackendUnreachable,
    /// Request could not be turned into an outbound request
    InternalError,
}

impl ErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::UnknownRoute => StatusCode::NOT_FOUND,
            ErrorCode::BackendNotReady => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::BackendUnreachable => StatusCode::BAD_GATEWAY,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::UnknownRoute => "UNKNOWN_ROUTE",
            ErrorCode::BackendNotReady => "BACKEND_NOT_READY",
            ErrorCode::BackendUnreachable => "BACKEND_UNREACHABLE",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Reason phrase of the status code
    pub error: String,
    /// Route the request was addressed to, if any
    pub server: Option<String>,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, server: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            error: code
                .status_code()
                .canonical_reason()
                .unwrap_or("Error")
                .to_string(),
            server: server.map(str::to_string),
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"error":"{}","server":null,"message":"{}"}}"#,
                self.error,
                self.message.replace('\"', "\\\"")
            )
        })
    }
}

/// Create a JSON error response carrying the CORS headers
pub fn json_error_response(
    code: ErrorCode,
    server: Option<&str>,
    message: impl Into<String>,
    cors: &CorsPolicy,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = ErrorResponse::new(code, server, message).to_json();

    let mut response = Response::new(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed());
    *response.status_mut() = code.status_code();

    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(X_GATEWAY_ERROR, HeaderValue::from_static(code.as_header_value()));
    cors.apply(headers);

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::ACCESS_CONTROL_ALLOW_ORIGIN;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(ErrorCode::UnknownRoute.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            ErrorCode::BackendNotReady.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ErrorCode::BackendUnreachable.status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(
            ErrorCode::BackendUnreachable,
            Some("supabase"),
            "connection refused",
        );
        let json: serde_json::Value = serde_json::from_str(&error.to_json()).unwrap();

        assert_eq!(json["error"], "Bad Gateway");
        assert_eq!(json["server"], "supabase");
        assert_eq!(json["message"], "connection refused");
    }

    #[test]
    fn test_error_response_without_server() {
        let error = ErrorResponse::new(ErrorCode::UnknownRoute, None, "no route");
        let json: serde_json::Value = serde_json::from_str(&error.to_json()).unwrap();

        assert_eq!(json["error"], "Not Found");
        assert!(json["server"].is_null());
    }

    #[test]
    fn test_json_error_response_has_cors_and_code() {
        let cors = CorsPolicy::new("*").unwrap();
        let response = json_error_response(
            ErrorCode::BackendNotReady,
            Some("files"),
            "Server 'files' is starting",
            &cors,
        );

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get(X_GATEWAY_ERROR).unwrap(),
            "BACKEND_NOT_READY"
        );
        assert_eq!(
            response.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "*"
        );
    }

    #[test]
    fn test_readiness_timeout_message() {
        let err = GatewayError::ReadinessTimeout {
            port: 8100,
            attempts: 60,
        };
        assert_eq!(
            err.to_string(),
            "port 8100 did not accept connections after 60 attempts"
        );
    }
}
