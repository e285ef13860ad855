/// Error Module
///
/// Typed error kinds for the harvester. Each kind maps to one handling policy:
/// configuration errors are fatal at startup, transport and write errors are retried
/// locally, decode errors skip the affected unit.
use thiserror::Error;

/// Bad endpoint or flags. Fatal before any worker starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),

    #[error("invalid endpoint `{url}`: {reason}")]
    InvalidEndpoint { url: String, reason: String },

    #[error("invalid value for {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },
}

/// Remote node unreachable, timed out or answered with an RPC error.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http request `{method}` failed: {source}")]
    Http {
        method: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("rpc `{method}` returned error {code}: {message}")]
    Rpc { method: &'static str, code: i64, message: String },

    #[error("rpc `{method}` response carried neither result nor error")]
    EmptyResponse { method: &'static str },
}

impl TransportError {
    /// True when the failure happened before a response arrived (connect/timeout/send).
    pub fn is_connection_failure(&self) -> bool {
        match self {
            Self::Http { source, .. } => source.is_connect() || source.is_timeout() || source.is_request(),
            _ => false,
        }
    }

    /// Request-shape JSON-RPC errors and 4xx statuses repeat identically on every attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http { source, .. } => match source.status() {
                Some(status) => {
                    !status.is_client_error()
                        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
                        || status == reqwest::StatusCode::REQUEST_TIMEOUT
                }
                None => true,
            },
            Self::Rpc { code, .. } => !matches!(*code, PARSE_ERROR | INVALID_REQUEST | METHOD_NOT_FOUND | INVALID_PARAMS),
            Self::EmptyResponse { .. } => true,
        }
    }
}

// JSON-RPC 2.0 reserved codes that describe the request rather than the node's state
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;

/// Malformed payload. Never retried: the same bytes decode the same way.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The payload does not have the expected overall shape (null, not an object, missing array).
    #[error("structural decode error: {0}")]
    Structural(String),

    /// The shape is right but a single field could not be decoded.
    #[error("field `{path}` could not be decoded: {message}")]
    Field { path: String, message: String },
}

impl DecodeError {
    pub fn field(path: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Field { path: path.into(), message: err.to_string() }
    }
}

/// Sink unreachable or write rejected.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("database write failed: {0}")]
    Database(sqlx::Error),

    #[error("sink unavailable: {0}")]
    Unavailable(String),

    #[error("write rejected: {0}")]
    Rejected(String),
}

impl From<sqlx::Error> for WriteError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => Self::Unavailable(e.to_string()),
            other => Self::Database(other),
        }
    }
}

/// Failure of a single fetch-and-decode unit (a block or one account's enrichment).
#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl FetchError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Decode(_) => "decode",
        }
    }

    /// Decode errors never heal on retry; transport errors depend on their cause
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_retryable(),
            Self::Decode(_) => false,
        }
    }
}
