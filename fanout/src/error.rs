//! Error types for signing, transport, and batch dispatch.
//!
//! Failures are layered the same way requests flow:
//! - [`SigningError`]: the invocation URL or credentials cannot produce a valid signature.
//! - [`TransportError`]: the request never produced an HTTP response.
//! - [`InvokeError`]: one invocation failed (wraps the two above plus response-level failures).
//! - [`BatchError`]: what the batch caller sees, either a configuration problem found before any
//!   network activity or the invocation that ended the batch.

use std::fmt;

use http::StatusCode;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    #[error("invalid invocation url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("unsupported url scheme {scheme} (expected http or https)")]
    UnsupportedScheme { scheme: String },

    #[error("invocation url {url} has no host")]
    MissingHost { url: String },

    /// The host does not look like `<service>.<region>.<domain>`, so no signing scope can be
    /// derived from it.
    #[error("host {host} does not follow the <service>.<region>.<domain> naming convention")]
    UnrecognizedHost { host: String },

    #[error("payload is not serializable: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("value for header {name} is not a valid header value")]
    InvalidHeaderValue { name: &'static str },
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invocation timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Request(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::Connect(err.to_string())
        } else {
            Self::Request(err.to_string())
        }
    }
}

/// Failure of a single invocation.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error(transparent)]
    Signing(#[from] SigningError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The service rejected the signature or the credentials behind it.
    #[error("authentication rejected (status {status}): {message}")]
    Authentication { status: StatusCode, message: String },

    #[error("lambda returned status {status}: {message}")]
    Status { status: StatusCode, message: String },

    #[error("response body is not valid JSON: {0}")]
    ResponseFormat(#[source] serde_json::Error),
}

impl InvokeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Signing(_) => ErrorKind::Signing,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Authentication { .. } => ErrorKind::Authentication,
            Self::Status { .. } => ErrorKind::Status,
            Self::ResponseFormat(_) => ErrorKind::ResponseFormat,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
/// Coarse classification of a failure, suitable for reporting alongside settled results.
pub enum ErrorKind {
    Configuration,
    Signing,
    Transport,
    Authentication,
    Status,
    ResponseFormat,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Configuration => "configuration",
            Self::Signing => "signing",
            Self::Transport => "transport",
            Self::Authentication => "authentication",
            Self::Status => "status",
            Self::ResponseFormat => "response_format",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestProblem {
    #[error("no region given on the request and no default region configured")]
    MissingRegion,

    #[error("region {0:?} is not a valid region name")]
    InvalidRegion(String),

    #[error("function name is empty")]
    EmptyFunctionName,

    #[error("invalid endpoint {0}")]
    InvalidEndpoint(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A request rejected while planning a batch.
pub struct InvalidRequest {
    pub index: usize,
    pub problem: RequestProblem,
}

impl fmt::Display for InvalidRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request {}: {}", self.index, self.problem)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    /// Raised before any invocation is issued. Lists every offending request.
    #[error("invalid batch: {}", join_invalid(.invalid))]
    Configuration { invalid: Vec<InvalidRequest> },

    #[error("invocation {index} ({function_name}) failed: {source}")]
    Invocation {
        index: usize,
        function_name: String,
        #[source]
        source: InvokeError,
    },
}

impl BatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::Invocation { source, .. } => source.kind(),
        }
    }

    /// Indices of requests that had no resolvable region.
    pub fn missing_region_indices(&self) -> Vec<usize> {
        match self {
            Self::Configuration { invalid } => invalid
                .iter()
                .filter(|r| r.problem == RequestProblem::MissingRegion)
                .map(|r| r.index)
                .collect(),
            Self::Invocation { .. } => Vec::new(),
        }
    }
}

fn join_invalid(invalid: &[InvalidRequest]) -> String {
    invalid
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
