//! Suite definitions, run configuration and result types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::json_path::JsonPath;

/// An ordered collection of test cases executed as one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSuite {
    /// Name of the API under test.
    #[serde(default = "default_api_name")]
    pub api_name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Fallback base URL, used when the run config has none.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Variables seeded into the store at run start.
    #[serde(default, alias = "env")]
    pub variables: HashMap<String, Value>,
    /// Cases in declaration order.
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
}

/// A single declarative API test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    /// Unique within the suite.
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub method: HttpMethod,
    /// Path or absolute URL; may contain `{{var}}` tokens.
    pub endpoint: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, alias = "query_params")]
    pub query: BTreeMap<String, String>,
    #[serde(default, alias = "request_body")]
    pub body: Option<Value>,
    /// Checked only when present.
    #[serde(default)]
    pub expected_status: Option<u16>,
    #[serde(default)]
    pub expected_response: ExpectedResponse,
    /// Variable name to JSON path, applied after a completed exchange.
    #[serde(default)]
    pub extract: BTreeMap<String, String>,
}

impl TestCase {
    /// Shorthand for the declared assertions.
    pub fn assertions(&self) -> &[Assertion] {
        &self.expected_response.assertions
    }
}

/// Structural expectations on the response body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExpectedResponse {
    #[serde(default)]
    pub assertions: Vec<Assertion>,
}

/// A single typed check against a path in the response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assertion {
    pub path: String,
    pub operator: Operator,
    /// `Some(Value::Null)` is an explicit `null`; `None` means the
    /// field was omitted.
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub value: Option<Value>,
}

impl Assertion {
    pub fn new(
        path: impl Into<String>,
        operator: Operator,
        value: Option<Value>,
    ) -> Self {
        Self {
            path: path.into(),
            operator,
            value,
        }
    }
}

fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// The closed set of assertion operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    NotEquals,
    Exists,
    Contains,
    GreaterThan,
    LessThan,
    TypeIs,
    Matches,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Equals => "equals",
            Operator::NotEquals => "not_equals",
            Operator::Exists => "exists",
            Operator::Contains => "contains",
            Operator::GreaterThan => "greater_than",
            Operator::LessThan => "less_than",
            Operator::TypeIs => "type_is",
            Operator::Matches => "matches",
        }
    }

    /// Every operator except `exists` compares against a value.
    pub fn requires_value(&self) -> bool {
        !matches!(self, Operator::Exists)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP method of a test case. Accepts upper or lower case.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    #[serde(alias = "get")]
    Get,
    #[serde(alias = "post")]
    Post,
    #[serde(alias = "put")]
    Put,
    #[serde(alias = "delete")]
    Delete,
    #[serde(alias = "patch")]
    Patch,
    #[serde(alias = "head")]
    Head,
    #[serde(alias = "options")]
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }

    /// Only POST, PUT and PATCH send a request body.
    pub fn allows_body(&self) -> bool {
        matches!(self, HttpMethod::Post | HttpMethod::Put | HttpMethod::Patch)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options for one run, passed explicitly into the runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Where the CLI writes reports.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    /// Overrides the suite's `base_url`.
    #[serde(default)]
    pub api_base_url: Option<String>,
    /// Per-attempt timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub max_retries: u32,
    /// Base delay between attempts; doubles after every retry.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Treat 5xx answers as retryable network failures.
    #[serde(default)]
    pub retry_on_server_error: bool,
    #[serde(default)]
    pub stop_on_first_failure: bool,
    #[serde(default)]
    pub parallel: bool,
    /// Worker pool size in parallel mode.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Sent with every request unless the case overrides them.
    #[serde(default)]
    pub default_headers: BTreeMap<String, String>,
    /// Deadline for the whole run in seconds.
    #[serde(default)]
    pub run_timeout: Option<u64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            output_dir: None,
            api_base_url: None,
            timeout: default_timeout(),
            max_retries: 0,
            retry_backoff_ms: default_retry_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            retry_on_server_error: false,
            stop_on_first_failure: false,
            parallel: false,
            workers: default_workers(),
            default_headers: BTreeMap::new(),
            run_timeout: None,
        }
    }
}

impl RunConfig {
    /// Reject option values the runner cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout == 0 {
            return Err(ConfigError::InvalidOption {
                option: "timeout",
                reason: "must be at least 1 second".to_string(),
            });
        }
        if self.max_retries > MAX_RETRIES {
            return Err(ConfigError::InvalidOption {
                option: "max_retries",
                reason: format!("must be at most {MAX_RETRIES}"),
            });
        }
        if self.workers == 0 {
            return Err(ConfigError::InvalidOption {
                option: "workers",
                reason: "must be at least 1".to_string(),
            });
        }
        if let Some(url) = &self.api_base_url {
            crate::executor::parse_base_url(url)?;
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn run_deadline(&self) -> Option<Duration> {
        self.run_timeout.map(Duration::from_secs)
    }
}

/// Upper bound for `RunConfig::max_retries`.
pub const MAX_RETRIES: u32 = 100;

fn default_api_name() -> String {
    "api".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_workers() -> usize {
    5
}

impl TestSuite {
    /// Deserialize a suite from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Deserialize a suite from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Reject malformed cases before anything is sent: duplicate or
    /// empty ids, empty endpoints, relative endpoints without a base
    /// URL, and assertions or extraction rules that can never be
    /// evaluated.
    pub fn validate(&self, base_url: Option<&str>) -> Result<(), ConfigError> {
        if let Some(url) = base_url {
            crate::executor::parse_base_url(url)?;
        }

        let mut seen = HashSet::new();
        for (idx, case) in self.test_cases.iter().enumerate() {
            if case.id.trim().is_empty() {
                return Err(ConfigError::EmptyCaseId(idx + 1));
            }
            if !seen.insert(case.id.as_str()) {
                return Err(ConfigError::DuplicateCaseId(case.id.clone()));
            }
            if case.endpoint.trim().is_empty() {
                return Err(ConfigError::MissingField {
                    case_id: case.id.clone(),
                    field: "endpoint",
                });
            }
            if base_url.is_none() && !crate::executor::is_absolute_endpoint(&case.endpoint) {
                return Err(ConfigError::MissingBaseUrl {
                    case_id: case.id.clone(),
                    endpoint: case.endpoint.clone(),
                });
            }
            for (index, assertion) in case.assertions().iter().enumerate() {
                crate::assertion::validate(&case.id, index + 1, assertion)?;
            }
            for path in case.extract.values() {
                JsonPath::parse(path).map_err(|reason| ConfigError::InvalidPath {
                    case_id: case.id.clone(),
                    path: path.clone(),
                    reason,
                })?;
            }
        }
        Ok(())
    }

    /// Effective base URL: the run config wins over the suite.
    pub fn effective_base_url<'a>(&'a self, config: &'a RunConfig) -> Option<&'a str> {
        config
            .api_base_url
            .as_deref()
            .or(self.base_url.as_deref())
            .filter(|url| !url.trim().is_empty())
    }
}

/// Terminal outcome of a case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    /// Status and every assertion matched.
    Passed,
    /// The API answered but did not satisfy the expectations.
    Failed,
    /// The exchange could not be completed.
    Error,
    /// Never started.
    Skipped,
}

impl CaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaseStatus::Passed => "passed",
            CaseStatus::Failed => "failed",
            CaseStatus::Error => "error",
            CaseStatus::Skipped => "skipped",
        }
    }

    /// `failed` and `error` trip `stop_on_first_failure`.
    pub fn is_failure(&self) -> bool {
        matches!(self, CaseStatus::Failed | CaseStatus::Error)
    }
}

impl fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one assertion, with the diff used for reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssertionResult {
    pub path: String,
    pub operator: Operator,
    pub passed: bool,
    /// `None` when the path resolved to nothing.
    pub actual: Option<Value>,
    pub expected: Option<Value>,
    pub message: String,
}

/// Expected vs actual HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCheck {
    pub expected: u16,
    pub actual: u16,
    pub passed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    VariableResolution,
    Network,
    /// A worker task died before reporting.
    Internal,
}

/// Why a case ended in `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
    /// The missing variable for resolution errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable: Option<String>,
    /// Network error class (`connect`, `timeout`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

/// Why a case never started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    StopOnFirstFailure,
    Cancelled,
    RunTimeout,
}

/// The request as actually sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestInfo {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub query: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// A captured response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseInfo {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: ResponseBody,
}

/// Response body, parsed when it is JSON. Serialized as
/// `{"type": "json" | "text", "content": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum ResponseBody {
    Json(Value),
    Text(String),
}

impl ResponseBody {
    pub fn json(&self) -> Option<&Value> {
        match self {
            ResponseBody::Json(value) => Some(value),
            ResponseBody::Text(_) => None,
        }
    }
}

/// Result of a single case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseResult {
    pub case_id: String,
    pub title: String,
    pub status: CaseStatus,
    pub http_status: Option<u16>,
    pub duration_ms: u64,
    /// Executor attempts, retries included. Zero when never sent.
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_check: Option<StatusCheck>,
    #[serde(default)]
    pub assertion_results: Vec<AssertionResult>,
    /// Variables bound by this case's `extract` rules.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extracted: Vec<String>,
    /// Present only when `status` is `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<ErrorDetail>,
    /// Present only when `status` is `skipped`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
}

impl CaseResult {
    pub(crate) fn blank(case: &TestCase, status: CaseStatus) -> Self {
        Self {
            case_id: case.id.clone(),
            title: case.title.clone(),
            status,
            http_status: None,
            duration_ms: 0,
            attempts: 0,
            request: None,
            response: None,
            status_check: None,
            assertion_results: Vec::new(),
            extracted: Vec::new(),
            error_detail: None,
            skip_reason: None,
        }
    }

    /// A case that was never started.
    pub fn skipped(case: &TestCase, reason: SkipReason) -> Self {
        Self {
            skip_reason: Some(reason),
            ..Self::blank(case, CaseStatus::Skipped)
        }
    }

    /// A case that ended in `error`.
    pub fn errored(case: &TestCase, detail: ErrorDetail) -> Self {
        Self {
            error_detail: Some(detail),
            ..Self::blank(case, CaseStatus::Error)
        }
    }

    /// The assertions that did not hold.
    pub fn mismatches(&self) -> impl Iterator<Item = &AssertionResult> {
        self.assertion_results.iter().filter(|r| !r.passed)
    }
}

/// Per-status counts of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub error: usize,
    pub skipped: usize,
}

/// Duration statistics over cases that were actually sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingSummary {
    pub executed: usize,
    pub avg_ms: f64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

/// A failed or errored case with what went wrong, for renderers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureDigest {
    pub case_id: String,
    pub title: String,
    pub status: CaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_check: Option<StatusCheck>,
    pub mismatches: Vec<AssertionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<ErrorDetail>,
}

/// Structured result of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub api_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// `100 × passed / total`, `0` for an empty suite.
    pub pass_rate: f64,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub error: usize,
    pub skipped: usize,
    /// Stopped by a cancel signal or the run deadline.
    #[serde(default)]
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub timing: TimingSummary,
    pub failures: Vec<FailureDigest>,
    /// In suite declaration order.
    pub results: Vec<CaseResult>,
}

impl RunResult {
    pub fn counts(&self) -> StatusCounts {
        StatusCounts {
            total: self.total,
            passed: self.passed,
            failed: self.failed,
            error: self.error,
            skipped: self.skipped,
        }
    }

    /// Whether every case passed.
    pub fn success(&self) -> bool {
        self.passed == self.total
    }

    pub fn result(&self, case_id: &str) -> Option<&CaseResult> {
        self.results.iter().find(|r| r.case_id == case_id)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}
