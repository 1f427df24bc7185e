//! Folding case results into a [`RunResult`]. No formatting happens
//! here; renderers consume the structured result.

use chrono::Utc;
use std::time::Instant;
use tracing::info;

use crate::model::{
    CaseResult, CaseStatus, FailureDigest, RunResult, StatusCounts, TimingSummary,
};

/// Collects run metadata and aggregates the per-case results.
#[derive(Debug, Clone)]
pub struct ReportAggregator {
    api_name: String,
    base_url: Option<String>,
    started_at: chrono::DateTime<Utc>,
    started: Instant,
    cancelled: bool,
}

impl ReportAggregator {
    /// Start the clock for a run.
    pub fn new(api_name: impl Into<String>, base_url: Option<String>) -> Self {
        Self {
            api_name: api_name.into(),
            base_url,
            started_at: Utc::now(),
            started: Instant::now(),
            cancelled: false,
        }
    }

    /// Record that the run was stopped by cancellation or deadline.
    pub fn mark_cancelled(&mut self) {
        self.cancelled = true;
    }

    /// Build the run result. `results` must already be in suite order.
    pub fn aggregate(self, results: Vec<CaseResult>) -> RunResult {
        let counts = count(&results);
        let pass_rate = pass_rate(counts.passed, counts.total);
        let timing = timing_summary(&results);
        let failures = results
            .iter()
            .filter(|r| r.status.is_failure())
            .map(|r| FailureDigest {
                case_id: r.case_id.clone(),
                title: r.title.clone(),
                status: r.status,
                status_check: r.status_check.filter(|check| !check.passed),
                mismatches: r.mismatches().cloned().collect(),
                error_detail: r.error_detail.clone(),
            })
            .collect();

        let duration_ms = self.started.elapsed().as_millis() as u64;
        info!(
            "Run of {} finished: {}/{} passed, {} failed, {} error, {} skipped ({} ms)",
            self.api_name,
            counts.passed,
            counts.total,
            counts.failed,
            counts.error,
            counts.skipped,
            duration_ms
        );

        RunResult {
            api_name: self.api_name,
            base_url: self.base_url,
            pass_rate,
            total: counts.total,
            passed: counts.passed,
            failed: counts.failed,
            error: counts.error,
            skipped: counts.skipped,
            cancelled: self.cancelled,
            started_at: self.started_at,
            finished_at: Utc::now(),
            duration_ms,
            timing,
            failures,
            results,
        }
    }
}

/// Per-status counts.
pub fn count(results: &[CaseResult]) -> StatusCounts {
    let mut counts = StatusCounts {
        total: results.len(),
        ..StatusCounts::default()
    };
    for result in results {
        match result.status {
            CaseStatus::Passed => counts.passed += 1,
            CaseStatus::Failed => counts.failed += 1,
            CaseStatus::Error => counts.error += 1,
            CaseStatus::Skipped => counts.skipped += 1,
        }
    }
    counts
}

/// `100 × passed / total`, or `0` for an empty run.
pub fn pass_rate(passed: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        100.0 * passed as f64 / total as f64
    }
}

/// Duration statistics over the cases that reached the executor.
pub fn timing_summary(results: &[CaseResult]) -> TimingSummary {
    let mut durations: Vec<u64> = results
        .iter()
        .filter(|r| r.attempts > 0)
        .map(|r| r.duration_ms)
        .collect();
    if durations.is_empty() {
        return TimingSummary::default();
    }
    durations.sort_unstable();

    let total: u64 = durations.iter().sum();
    TimingSummary {
        executed: durations.len(),
        avg_ms: total as f64 / durations.len() as f64,
        min_ms: durations[0],
        max_ms: durations[durations.len() - 1],
        p95_ms: percentile(&durations, 95.0),
        p99_ms: percentile(&durations, 99.0),
    }
}

/// Nearest-rank percentile over sorted values.
fn percentile(sorted: &[u64], pct: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let index = (((pct / 100.0) * sorted.len() as f64).ceil() as usize)
        .saturating_sub(1)
        .min(sorted.len() - 1);
    sorted[index]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        AssertionResult, ErrorDetail, ErrorKind, Operator, SkipReason, StatusCheck, TestCase,
    };
    use serde_json::json;

    fn case(id: &str) -> TestCase {
        serde_json::from_value(json!({"id": id, "title": format!("case {id}"), "endpoint": "/x"}))
            .unwrap()
    }

    fn executed(id: &str, status: CaseStatus, duration_ms: u64) -> CaseResult {
        let mut result = CaseResult::skipped(&case(id), SkipReason::Cancelled);
        result.status = status;
        result.skip_reason = None;
        result.attempts = 1;
        result.duration_ms = duration_ms;
        result.http_status = Some(200);
        result
    }

    #[test]
    fn test_counts_and_pass_rate() {
        let results = vec![
            executed("a", CaseStatus::Passed, 10),
            executed("b", CaseStatus::Failed, 20),
            executed("c", CaseStatus::Passed, 30),
        ];
        let run = ReportAggregator::new("api", None).aggregate(results);

        assert_eq!(run.total, 3);
        assert_eq!(run.passed, 2);
        assert_eq!(run.failed, 1);
        assert_eq!(run.pass_rate, 200.0 / 3.0);
        assert!(!run.success());
        assert!(!run.cancelled);
    }

    #[test]
    fn test_empty_run_has_zero_pass_rate() {
        let run = ReportAggregator::new("api", None).aggregate(Vec::new());
        assert_eq!(run.total, 0);
        assert_eq!(run.pass_rate, 0.0);
        assert_eq!(run.timing, TimingSummary::default());
        assert!(run.failures.is_empty());
    }

    #[test]
    fn test_skipped_cases_count_against_pass_rate() {
        let results = vec![
            executed("a", CaseStatus::Passed, 5),
            executed("b", CaseStatus::Failed, 5),
            CaseResult::skipped(&case("c"), SkipReason::StopOnFirstFailure),
            CaseResult::skipped(&case("d"), SkipReason::StopOnFirstFailure),
        ];
        let run = ReportAggregator::new("api", None).aggregate(results);
        assert_eq!(run.skipped, 2);
        assert_eq!(run.pass_rate, 25.0);
        assert_eq!(run.timing.executed, 2);
    }

    #[test]
    fn test_failures_carry_diffs_in_suite_order() {
        let mut failed = executed("b", CaseStatus::Failed, 5);
        failed.status_check = Some(StatusCheck {
            expected: 200,
            actual: 404,
            passed: false,
        });
        failed.assertion_results = vec![
            AssertionResult {
                path: "$.id".into(),
                operator: Operator::Equals,
                passed: true,
                actual: Some(json!(1)),
                expected: Some(json!(1)),
                message: "ok".into(),
            },
            AssertionResult {
                path: "$.name".into(),
                operator: Operator::Equals,
                passed: false,
                actual: Some(json!("bob")),
                expected: Some(json!("alice")),
                message: "expected \"alice\", got \"bob\"".into(),
            },
        ];
        let errored = CaseResult::errored(
            &case("c"),
            ErrorDetail {
                kind: ErrorKind::VariableResolution,
                message: "variable 'token' is not defined".into(),
                variable: Some("token".into()),
                cause: None,
            },
        );
        let results = vec![executed("a", CaseStatus::Passed, 1), failed, errored];
        let run = ReportAggregator::new("api", Some("http://x".into())).aggregate(results);

        assert_eq!(run.failures.len(), 2);
        assert_eq!(run.failures[0].case_id, "b");
        assert_eq!(run.failures[0].mismatches.len(), 1);
        assert_eq!(run.failures[0].mismatches[0].path, "$.name");
        assert_eq!(run.failures[0].status_check.unwrap().actual, 404);
        assert_eq!(run.failures[1].case_id, "c");
        assert_eq!(
            run.failures[1].error_detail.as_ref().unwrap().variable.as_deref(),
            Some("token")
        );
        assert_eq!(run.base_url.as_deref(), Some("http://x"));
    }

    #[test]
    fn test_timing_summary_ignores_unsent_cases() {
        let mut results: Vec<CaseResult> = (1..=20)
            .map(|i| executed(&format!("c{i}"), CaseStatus::Passed, i * 10))
            .collect();
        results.push(CaseResult::skipped(&case("never"), SkipReason::Cancelled));

        let timing = timing_summary(&results);
        assert_eq!(timing.executed, 20);
        assert_eq!(timing.min_ms, 10);
        assert_eq!(timing.max_ms, 200);
        assert_eq!(timing.avg_ms, 105.0);
        assert_eq!(timing.p95_ms, 190);
        assert_eq!(timing.p99_ms, 200);
    }

    #[test]
    fn test_cancelled_flag() {
        let mut aggregator = ReportAggregator::new("api", None);
        aggregator.mark_cancelled();
        let run = aggregator.aggregate(vec![CaseResult::skipped(&case("a"), SkipReason::Cancelled)]);
        assert!(run.cancelled);
        assert_eq!(run.skipped, 1);
    }
}
