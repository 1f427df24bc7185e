//! Error taxonomy of the execution engine.
//!
//! Only [`ConfigError`] ever aborts a run. Every other error is
//! folded into the [`CaseResult`](crate::model::CaseResult) of the
//! case that produced it.

use std::time::Duration;
use thiserror::Error;

/// Malformed suite, assertion or run configuration. Fatal: the run
/// is rejected before any request is sent.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The suite could not be decoded at all.
    #[error("failed to parse suite: {0}")]
    Parse(String),

    /// Two cases share the same id.
    #[error("duplicate test case id '{0}'")]
    DuplicateCaseId(String),

    /// A case id is empty.
    #[error("test case #{0} has an empty id")]
    EmptyCaseId(usize),

    /// A required field is missing.
    #[error("case '{case_id}': missing required field '{field}'")]
    MissingField {
        case_id: String,
        field: &'static str,
    },

    /// An assertion other than `exists` has no `value`.
    #[error(
        "case '{case_id}': assertion #{index} ({operator}) requires a value"
    )]
    MissingAssertionValue {
        case_id: String,
        index: usize,
        operator: String,
    },

    /// `type_is` names a type that does not exist.
    #[error("case '{case_id}': unknown type name '{type_name}' for type_is")]
    UnknownTypeName { case_id: String, type_name: String },

    /// A `matches` pattern does not compile.
    #[error("case '{case_id}': invalid regular expression '{pattern}': {source}")]
    InvalidPattern {
        case_id: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// An assertion or extraction path does not parse.
    #[error("case '{case_id}': invalid path '{path}': {reason}")]
    InvalidPath {
        case_id: String,
        path: String,
        reason: String,
    },

    /// The configured base URL is not a valid absolute URL.
    #[error("invalid base URL '{url}': {source}")]
    InvalidBaseUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    /// A relative endpoint with no base URL to join it to.
    #[error(
        "case '{case_id}': endpoint '{endpoint}' is relative but no base URL is configured"
    )]
    MissingBaseUrl { case_id: String, endpoint: String },

    /// A run option is out of range.
    #[error("invalid run option '{option}': {reason}")]
    InvalidOption {
        option: &'static str,
        reason: String,
    },
}

/// A `{{name}}` token refers to a variable the store does not hold.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("variable '{name}' is not defined")]
pub struct VariableNotFound {
    pub name: String,
}

impl VariableNotFound {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Interpolation failed for a specific case. Fatal to that case only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("case '{case_id}' references undefined variable '{variable}'")]
pub struct VariableResolutionError {
    pub case_id: String,
    pub variable: String,
}

impl VariableResolutionError {
    pub fn new(case_id: &str, missing: VariableNotFound) -> Self {
        Self {
            case_id: case_id.to_string(),
            variable: missing.name,
        }
    }
}

/// The executor could not complete the exchange.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    /// Connection refused, DNS failure, reset.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The attempt did not finish within the per-request timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Any other transport-level failure while sending or reading.
    #[error("transport error: {0}")]
    Transport(String),

    /// A 5xx answer, retried because `retry_on_server_error` is set.
    #[error("server error status {0}")]
    ServerError(u16),

    /// The request could not be built (bad URL, header, method).
    /// Never retried.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl NetworkError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, NetworkError::InvalidRequest(_))
    }

    /// Short machine-readable kind for reports.
    pub fn kind(&self) -> &'static str {
        match self {
            NetworkError::Connect(_) => "connect",
            NetworkError::Timeout(_) => "timeout",
            NetworkError::Transport(_) => "transport",
            NetworkError::ServerError(_) => "server_error",
            NetworkError::InvalidRequest(_) => "invalid_request",
        }
    }
}
