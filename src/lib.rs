//! Declarative API test-suite execution engine.
//!
//! A [`TestSuite`] is an ordered list of test cases. Each case is an
//! HTTP request with templated fields, an optional expected status and
//! a list of JSON-path assertions. Values extracted from one response
//! can be referenced as `{{name}}` by later cases. A run produces a
//! [`RunResult`] with per-case outcomes and a pass rate.

pub mod assertion;
pub mod config;
pub mod error;
pub mod executor;
pub mod json_path;
pub mod model;
pub mod plan;
pub mod report;
pub mod retry;
pub mod runner;
pub mod variables;

pub use config::*;
pub use error::*;
pub use executor::{CaseExecutor, Exchange, HttpExecutor, ResolvedRequest};
pub use model::*;
pub use report::ReportAggregator;
pub use retry::RetryPolicy;
pub use runner::*;
pub use variables::VariableStore;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Run `suite` over HTTP with `config`.
///
/// Fails only on a [`ConfigError`]; every case-level problem is
/// reported inside the returned [`RunResult`].
pub async fn run(suite: &TestSuite, config: RunConfig) -> Result<RunResult, ConfigError> {
    DefaultTestRunner::new(config)?.run(suite).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_suite_yaml_round_trip_keeps_cases() {
        let suite = TestSuite::from_json(
            &json!({
                "api_name": "テストAPI",
                "test_cases": [{
                    "id": "TC001",
                    "title": "ステップ1",
                    "method": "POST",
                    "endpoint": "/items",
                    "body": {"name": "{{name}}"},
                    "expected_status": 201,
                    "extract": {"item_id": "$.id"}
                }]
            })
            .to_string(),
        )
        .unwrap();

        let yaml = suite.to_yaml().unwrap();
        let deserialized = TestSuite::from_yaml(&yaml).unwrap();

        assert_eq!(suite.api_name, deserialized.api_name);
        assert_eq!(deserialized.test_cases.len(), 1);
        assert_eq!(deserialized.test_cases[0].method, HttpMethod::Post);
        assert_eq!(deserialized.test_cases[0].extract.get("item_id").unwrap(), "$.id");
    }

    #[test]
    fn test_run_result_report_shape() {
        let run = ReportAggregator::new("api", None).aggregate(Vec::new());
        let value = serde_json::to_value(&run).unwrap();
        for key in ["pass_rate", "total", "passed", "failed", "error", "skipped", "results"] {
            assert!(value.get(key).is_some(), "missing key {key}");
        }
    }

    #[tokio::test]
    async fn test_run_rejects_invalid_config() {
        let suite = TestSuite::from_yaml("test_cases: []\n").unwrap();
        let config = RunConfig {
            timeout: 0,
            ..RunConfig::default()
        };
        let err = run(&suite, config).await.unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOption { option: "timeout", .. }));
    }
}
