//! Error types for the proxy.

use http::StatusCode;
use std::io;
use thiserror::Error;

use crate::render::RenderError;

/// Errors surfaced by the proxy core.
///
/// Configuration variants are fatal at startup; the remaining variants are
/// request-scoped and map to an HTTP status via [`ProxyError::status`].
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ConfigRead { path: String, source: io::Error },

    /// Failed to parse the configuration YAML.
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Failed to decode a base64-encoded configuration blob.
    #[error("failed to decode base64 config: {0}")]
    ConfigDecode(#[from] base64::DecodeError),

    /// Two routes compiled to the same `(path, method)` pair.
    #[error(
        "duplicate route: {method} {path} is declared by both \
         group '{first}' and group '{second}'"
    )]
    DuplicateRoute {
        method: String,
        path: String,
        first: String,
        second: String,
    },

    /// The configured base endpoint did not resolve to a valid URL.
    #[error("invalid base endpoint '{endpoint}': {reason}")]
    BaseEndpoint { endpoint: String, reason: String },

    /// A route forwards upstream but no base endpoint is configured.
    #[error("route {path} has an outbound mapping but no base endpoint")]
    MissingBaseEndpoint { path: String },

    /// An outbound method string in the config is not a valid HTTP method.
    #[error("invalid HTTP method '{method}' on route {path}")]
    InvalidMethod { method: String, path: String },

    /// Template or expression evaluation failed.
    #[error(transparent)]
    Render(#[from] RenderError),

    /// The upstream origin could not be reached or its body not read.
    #[error("upstream request failed: {0}")]
    Upstream(#[source] reqwest::Error),

    /// A header value source failed (missing file, bad sub-request result).
    #[error("header source error: {0}")]
    HeaderSource(String),

    /// A rendered header value contains bytes HTTP does not allow.
    #[error("invalid value for header '{name}': {reason}")]
    InvalidHeader { name: String, reason: String },

    /// RFC 6902 patch application failed.
    #[error("json patch error: {0}")]
    Patch(String),

    /// Internal forwarding exceeded the hop limit.
    #[error("forward loop detected after {hops} hops")]
    ForwardLoop { hops: u8 },

    /// A rendered forward path was empty.
    #[error("forward path rendered empty for route {path}")]
    EmptyForwardPath { path: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// HTTP status this error maps to when it aborts a request.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Upstream(_) | ProxyError::HeaderSource(_) => StatusCode::BAD_GATEWAY,
            ProxyError::ForwardLoop { .. } => StatusCode::LOOP_DETECTED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Result alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
