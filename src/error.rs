//! Error types and JSON error responses for the router

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Errors detected while loading or validating configuration.
///
/// All of these are fatal at startup: no listener is started.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse JSON configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to parse TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("no servers configured")]
    NoServers,

    #[error("servers[{server}]: port must be greater than 0")]
    InvalidPort { server: usize },

    #[error("port {port} is configured for both servers[{first}] and servers[{second}]")]
    DuplicatePort {
        port: u16,
        first: usize,
        second: usize,
    },

    #[error("servers[{server}] (port {port}) rules[{rule}]: invalid pattern '{pattern}': {source}")]
    Pattern {
        server: usize,
        port: u16,
        rule: usize,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("servers[{server}] (port {port}) rules[{rule}]: {message}")]
    Scheme {
        server: usize,
        port: u16,
        rule: usize,
        message: String,
    },

    #[error("servers[{server}] (port {port}): static root '{}' is not a directory", .path.display())]
    StaticRoot {
        server: usize,
        port: u16,
        path: PathBuf,
    },

    #[error("invalid bind address '{bind}': {source}")]
    Bind {
        bind: String,
        #[source]
        source: std::net::AddrParseError,
    },
}

/// Errors from the certificate provider
#[derive(Debug, Error)]
pub enum CertError {
    #[error("certificate cache path '{}' is unusable: {reason}", .path.display())]
    CachePath { path: PathBuf, reason: String },

    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse PEM in {}: {source}", .path.display())]
    Pem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no private key found for certificate {}", .path.display())]
    MissingKey { path: PathBuf },

    #[error("no certificate found in {}", .path.display())]
    NoCertificate { path: PathBuf },

    #[error("failed to parse certificate in {}: {message}", .path.display())]
    X509 { path: PathBuf, message: String },

    #[error("unsupported private key in {}: {message}", .path.display())]
    Key { path: PathBuf, message: String },

    #[error("failed to generate self-signed certificate for '{name}': {message}")]
    Generate { name: String, message: String },

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),
}

/// Errors from the forwarding engine
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("failed to set up upstream TLS: {0}")]
    Tls(#[from] rustls::Error),

    #[error("invalid upstream URI '{uri}': {message}")]
    InvalidUri { uri: String, message: String },

    #[error("upstream request failed: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
}

/// Errors from listener orchestration
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Forward(#[from] ForwardError),

    #[error(transparent)]
    Cert(#[from] CertError),

    #[error("all listeners exited")]
    AllListenersExited,
}

/// Error codes for responses produced by the router itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Missing Host header in request
    MissingHostHeader,
    /// No routing rule produced an upstream target
    NoRoute,
    /// Failed to connect to the upstream
    ConnectionFailed,
    /// Upstream did not answer in time
    RequestTimeout,
    /// Static file not found
    NotFound,
    /// Static listeners only answer GET and HEAD
    MethodNotAllowed,
    /// Internal router error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::NoRoute => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::NotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::NoRoute => "NO_ROUTE",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::NotFound => "NOT_FOUND",
            ProxyErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let body = error.to_json();

    Response::builder()
        .status(code.status_code())
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
