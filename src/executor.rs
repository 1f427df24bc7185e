//! Request execution: the per-case contract shared by every target,
//! and the HTTP implementation of it.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Method as ReqMethod};
use serde_json::Value;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};
use url::Url;

use crate::error::{ConfigError, NetworkError};
use crate::model::{HttpMethod, RequestInfo, ResponseBody, ResponseInfo, RunConfig};

static SCHEME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9+.\-]*://").expect("failed to compile scheme regex")
});

/// A case with every template resolved, ready to send.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRequest {
    pub case_id: String,
    pub method: HttpMethod,
    /// The interpolated endpoint as declared.
    pub endpoint: String,
    /// `endpoint` joined with the base URL.
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub body: Option<Value>,
}

impl ResolvedRequest {
    pub fn info(&self) -> RequestInfo {
        RequestInfo {
            method: self.method.to_string(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            query: self.query.clone(),
            body: self.body.clone(),
        }
    }
}

/// A completed exchange with the system under test.
#[derive(Debug, Clone, PartialEq)]
pub struct Exchange {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: ResponseBody,
    pub duration: Duration,
}

impl Exchange {
    pub fn info(&self) -> ResponseInfo {
        ResponseInfo {
            status: self.status,
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }
}

/// Executes one resolved case against a target. HTTP is one
/// implementation; device-driven UI runners can be another.
#[async_trait]
pub trait CaseExecutor: Send + Sync {
    /// Perform a single attempt. Retries are applied by the caller.
    async fn execute(&self, request: &ResolvedRequest) -> Result<Exchange, NetworkError>;
}

/// HTTP executor backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpExecutor {
    client: Client,
    default_headers: BTreeMap<String, String>,
    timeout: Duration,
}

impl HttpExecutor {
    /// Build a client honouring the per-request timeout and default
    /// headers from `config`.
    pub fn new(config: &RunConfig) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ConfigError::InvalidOption {
                option: "timeout",
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            default_headers: config.default_headers.clone(),
            timeout: config.request_timeout(),
        })
    }

    /// Use a preconfigured client. `timeout` is only used to label
    /// timeout errors; the client enforces its own.
    pub fn with_client(
        client: Client,
        default_headers: BTreeMap<String, String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            default_headers,
            timeout,
        }
    }

    fn convert_method(&self, method: HttpMethod) -> ReqMethod {
        match method {
            HttpMethod::Get => ReqMethod::GET,
            HttpMethod::Post => ReqMethod::POST,
            HttpMethod::Put => ReqMethod::PUT,
            HttpMethod::Delete => ReqMethod::DELETE,
            HttpMethod::Patch => ReqMethod::PATCH,
            HttpMethod::Head => ReqMethod::HEAD,
            HttpMethod::Options => ReqMethod::OPTIONS,
        }
    }

    /// Defaults first so case headers override them, compared
    /// case-insensitively.
    fn build_headers(&self, request: &ResolvedRequest) -> Result<HeaderMap, NetworkError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if request.body.is_some() && request.method.allows_body() {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }

        for (name, value) in self.default_headers.iter().chain(&request.headers) {
            let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                NetworkError::InvalidRequest(format!("invalid header name `{name}`: {e}"))
            })?;
            let header_value = HeaderValue::from_str(value).map_err(|e| {
                NetworkError::InvalidRequest(format!("invalid header value for `{name}`: {e}"))
            })?;
            headers.insert(header_name, header_value);
        }
        Ok(headers)
    }
}

#[async_trait]
impl CaseExecutor for HttpExecutor {
    #[instrument(skip(self, request), fields(case = %request.case_id, method = %request.method, url = %request.url))]
    async fn execute(&self, request: &ResolvedRequest) -> Result<Exchange, NetworkError> {
        let url = Url::parse(&request.url)
            .map_err(|e| NetworkError::InvalidRequest(format!("invalid URL '{}': {e}", request.url)))?;
        let headers = self.build_headers(request)?;

        let mut req_builder = self
            .client
            .request(self.convert_method(request.method), url)
            .headers(headers);

        if !request.query.is_empty() {
            req_builder = req_builder.query(&request.query);
        }

        if let Some(body) = &request.body {
            if request.method.allows_body() {
                let body_json = serde_json::to_vec(body)
                    .map_err(|e| NetworkError::InvalidRequest(format!("unserializable body: {e}")))?;
                req_builder = req_builder.body(body_json);
            }
        }

        let started = Instant::now();
        debug!("Sending request to {}", request.url);
        let response = req_builder
            .send()
            .await
            .map_err(|e| classify(e, self.timeout))?;
        let status = response.status().as_u16();
        debug!("Received response with status: {}", status);

        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .map(|(name, value)| (
                    name.to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                ))
            .collect();

        let text = response
            .text()
            .await
            .map_err(|e| classify(e, self.timeout))?;
        let content_type = headers.get("content-type").map(String::as_str);

        Ok(Exchange {
            status,
            body: parse_body(content_type, text),
            headers,
            duration: started.elapsed(),
        })
    }
}

fn classify(err: reqwest::Error, timeout: Duration) -> NetworkError {
    if err.is_timeout() {
        NetworkError::Timeout(timeout)
    } else if err.is_connect() {
        NetworkError::Connect(err.to_string())
    } else if err.is_builder() {
        NetworkError::InvalidRequest(err.to_string())
    } else {
        NetworkError::Transport(err.to_string())
    }
}

/// Parse the body as JSON when the content type says so. Without a
/// content type the body is parsed if it happens to be JSON.
pub fn parse_body(content_type: Option<&str>, text: String) -> ResponseBody {
    let json_declared = content_type.map(|ct| ct.to_ascii_lowercase().contains("json"));
    match json_declared {
        Some(false) => ResponseBody::Text(text),
        Some(true) | None => match serde_json::from_str::<Value>(&text) {
            Ok(json) => ResponseBody::Json(json),
            Err(_) => ResponseBody::Text(text),
        },
    }
}

/// Validate a base URL.
pub fn parse_base_url(url: &str) -> Result<Url, ConfigError> {
    Url::parse(url.trim()).map_err(|source| ConfigError::InvalidBaseUrl {
        url: url.to_string(),
        source,
    })
}

/// True when `endpoint` starts with a URL scheme such as `https://`.
/// A `://` later in the path or query does not count.
pub fn has_scheme(endpoint: &str) -> bool {
    SCHEME_RE.is_match(endpoint.trim_start())
}

/// Absolute URLs, or endpoints that start with a token which may
/// expand to one, need no base URL.
pub fn is_absolute_endpoint(endpoint: &str) -> bool {
    has_scheme(endpoint) || endpoint.trim_start().starts_with("{{")
}

/// Join an interpolated endpoint with the base URL. Absolute
/// endpoints pass through untouched.
pub fn join_url(base_url: Option<&str>, endpoint: &str) -> String {
    if has_scheme(endpoint) {
        return endpoint.trim_start().to_string();
    }
    match base_url {
        Some(base) if endpoint.is_empty() => base.to_string(),
        Some(base) => format!(
            "{}/{}",
            base.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        ),
        None => endpoint.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_url() {
        assert_eq!(
            join_url(Some("http://localhost:8080/api/"), "/users/1"),
            "http://localhost:8080/api/users/1"
        );
        assert_eq!(
            join_url(Some("http://localhost:8080/api"), "users/1"),
            "http://localhost:8080/api/users/1"
        );
        assert_eq!(
            join_url(Some("http://localhost"), "https://other.test/x"),
            "https://other.test/x"
        );
        assert_eq!(join_url(None, "/relative"), "/relative");
    }

    #[test]
    fn test_join_url_keeps_urls_inside_query_relative() {
        assert_eq!(
            join_url(Some("http://api.test"), "/login?next=https://app.test/home"),
            "http://api.test/login?next=https://app.test/home"
        );
        assert_eq!(
            join_url(Some("http://api.test/"), "redirect/https://app.test"),
            "http://api.test/redirect/https://app.test"
        );
        assert_eq!(
            join_url(Some("http://api.test"), "/search?q=a&page=2"),
            "http://api.test/search?q=a&page=2"
        );
    }

    #[test]
    fn test_absolute_endpoint_detection() {
        assert!(is_absolute_endpoint("http://x/y"));
        assert!(is_absolute_endpoint("  HTTPS://x/y"));
        assert!(is_absolute_endpoint("svn+ssh://x/y"));
        assert!(is_absolute_endpoint("{{host}}/y"));
        assert!(!is_absolute_endpoint("/users"));
        assert!(!is_absolute_endpoint("/login?next=https://app.test/home"));
        assert!(!is_absolute_endpoint("users/http://x"));
        assert!(!is_absolute_endpoint("1http://x"));
    }

    #[test]
    fn test_parse_body_follows_content_type() {
        assert_eq!(
            parse_body(Some("application/json; charset=utf-8"), r#"{"a":1}"#.into()),
            ResponseBody::Json(json!({"a": 1}))
        );
        assert_eq!(
            parse_body(Some("application/problem+json"), r#"{"a":1}"#.into()),
            ResponseBody::Json(json!({"a": 1}))
        );
        assert_eq!(
            parse_body(Some("text/plain"), r#"{"a":1}"#.into()),
            ResponseBody::Text(r#"{"a":1}"#.into())
        );
        assert_eq!(
            parse_body(Some("application/json"), "not json".into()),
            ResponseBody::Text("not json".into())
        );
        assert_eq!(parse_body(None, "[1]".into()), ResponseBody::Json(json!([1])));
    }

    #[test]
    fn test_header_merge_lets_case_override_defaults() {
        let mut defaults = BTreeMap::new();
        defaults.insert("X-Env".to_string(), "staging".to_string());
        defaults.insert("Accept".to_string(), "text/plain".to_string());
        let executor = HttpExecutor::with_client(Client::new(), defaults, Duration::from_secs(1));

        let mut headers = BTreeMap::new();
        headers.insert("x-env".to_string(), "prod".to_string());
        let request = ResolvedRequest {
            case_id: "c".into(),
            method: HttpMethod::Post,
            endpoint: "/x".into(),
            url: "http://localhost/x".into(),
            headers,
            query: BTreeMap::new(),
            body: Some(json!({"a": 1})),
        };

        let built = executor.build_headers(&request).unwrap();
        assert_eq!(built.get("x-env").unwrap(), "prod");
        assert_eq!(built.get(ACCEPT).unwrap(), "text/plain");
        assert_eq!(built.get(CONTENT_TYPE).unwrap(), "application/json");
    }

    #[test]
    fn test_invalid_header_is_invalid_request() {
        let executor = HttpExecutor::with_client(Client::new(), BTreeMap::new(), Duration::from_secs(1));
        let mut headers = BTreeMap::new();
        headers.insert("bad header".to_string(), "v".to_string());
        let request = ResolvedRequest {
            case_id: "c".into(),
            method: HttpMethod::Get,
            endpoint: "/x".into(),
            url: "http://localhost/x".into(),
            headers,
            query: BTreeMap::new(),
            body: None,
        };
        assert!(matches!(
            executor.build_headers(&request),
            Err(NetworkError::InvalidRequest(_))
        ));
    }
}
