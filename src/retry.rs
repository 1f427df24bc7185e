//! Per-attempt timeout and retry with exponential backoff around any
//! [`CaseExecutor`].

use std::time::Duration;
use tracing::{debug, warn};

use crate::error::NetworkError;
use crate::executor::{CaseExecutor, Exchange, ResolvedRequest};
use crate::model::RunConfig;

/// How failed attempts are retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub timeout: Duration,
    pub backoff: Duration,
    pub max_backoff: Duration,
    /// Retry 5xx answers as if they were transport failures.
    pub retry_on_server_error: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RunConfig::default())
    }
}

/// Outcome of a retried execution.
#[derive(Debug)]
pub struct Attempted {
    pub outcome: Result<Exchange, NetworkError>,
    /// Total attempts made, the first one included.
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            timeout: config.request_timeout(),
            backoff: Duration::from_millis(config.retry_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            retry_on_server_error: config.retry_on_server_error,
        }
    }

    /// Delay before retry number `attempt + 1` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.backoff.saturating_mul(factor).min(self.max_backoff)
    }

    /// Run `executor` until it yields a response, a non-retryable
    /// error, or the retry budget is spent. Status mismatches are
    /// legitimate answers and never retried; only 5xx may be, and only
    /// when `retry_on_server_error` is set.
    pub async fn execute<E>(&self, executor: &E, request: &ResolvedRequest) -> Attempted
    where
        E: CaseExecutor + ?Sized,
    {
        let mut attempt = 0u32;
        loop {
            let result = match tokio::time::timeout(self.timeout, executor.execute(request)).await {
                Ok(result) => result,
                Err(_) => Err(NetworkError::Timeout(self.timeout)),
            };

            let error = match result {
                Ok(exchange)
                    if self.retry_on_server_error && (500..600).contains(&exchange.status) =>
                {
                    NetworkError::ServerError(exchange.status)
                }
                Ok(exchange) => {
                    debug!(
                        case = %request.case_id,
                        attempt = attempt.saturating_add(1),
                        status = exchange.status,
                        "exchange completed"
                    );
                    return Attempted {
                        outcome: Ok(exchange),
                        attempts: attempt.saturating_add(1),
                    };
                }
                Err(err) => err,
            };

            if !error.is_retryable() || attempt >= self.max_retries {
                return Attempted {
                    outcome: Err(error),
                    attempts: attempt.saturating_add(1),
                };
            }

            let delay = self.delay_for(attempt);
            warn!(
                case = %request.case_id,
                error = %error,
                attempt = attempt.saturating_add(1),
                "request failed, retrying in {:?}",
                delay
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HttpMethod, ResponseBody};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::Mutex;

    /// Replays a fixed script of outcomes, one per attempt.
    struct Scripted {
        script: Mutex<VecDeque<Step>>,
        calls: Mutex<u32>,
    }

    enum Step {
        Fail(NetworkError),
        Status(u16),
        Hang,
    }

    impl Scripted {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                script: Mutex::new(steps.into()),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl CaseExecutor for Scripted {
        async fn execute(&self, _request: &ResolvedRequest) -> Result<Exchange, NetworkError> {
            *self.calls.lock().unwrap() += 1;
            let step = self.script.lock().unwrap().pop_front();
            match step {
                Some(Step::Fail(err)) => Err(err),
                Some(Step::Status(status)) => Ok(Exchange {
                    status,
                    headers: BTreeMap::new(),
                    body: ResponseBody::Json(json!({})),
                    duration: Duration::from_millis(1),
                }),
                Some(Step::Hang) => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(NetworkError::Transport("unreachable".into()))
                }
                None => Err(NetworkError::Transport("script exhausted".into())),
            }
        }
    }

    fn request() -> ResolvedRequest {
        ResolvedRequest {
            case_id: "case".into(),
            method: HttpMethod::Get,
            endpoint: "/x".into(),
            url: "http://localhost/x".into(),
            headers: BTreeMap::new(),
            query: BTreeMap::new(),
            body: None,
        }
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            timeout: Duration::from_secs(5),
            backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            retry_on_server_error: false,
        }
    }

    fn refused() -> Step {
        Step::Fail(NetworkError::Connect("connection refused".into()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_make_initial_plus_retries_attempts() {
        let executor = Scripted::new(vec![refused(), refused(), refused()]);
        let attempted = policy(2).execute(&executor, &request()).await;

        assert_eq!(attempted.attempts, 3);
        assert_eq!(executor.calls(), 3);
        assert!(matches!(attempted.outcome, Err(NetworkError::Connect(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failure() {
        let executor = Scripted::new(vec![refused(), Step::Status(200)]);
        let attempted = policy(3).execute(&executor, &request()).await;

        assert_eq!(attempted.attempts, 2);
        assert_eq!(attempted.outcome.unwrap().status, 200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_mismatch_is_never_retried() {
        let executor = Scripted::new(vec![Step::Status(404), Step::Status(200)]);
        let attempted = policy(3).execute(&executor, &request()).await;

        assert_eq!(attempted.attempts, 1);
        assert_eq!(attempted.outcome.unwrap().status, 404);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_errors_retried_only_when_enabled() {
        let executor = Scripted::new(vec![Step::Status(503), Step::Status(200)]);
        let attempted = policy(3).execute(&executor, &request()).await;
        assert_eq!(attempted.attempts, 1);
        assert_eq!(attempted.outcome.unwrap().status, 503);

        let executor = Scripted::new(vec![Step::Status(503), Step::Status(502), Step::Status(200)]);
        let retrying = RetryPolicy {
            retry_on_server_error: true,
            ..policy(3)
        };
        let attempted = retrying.execute(&executor, &request()).await;
        assert_eq!(attempted.attempts, 3);
        assert_eq!(attempted.outcome.unwrap().status, 200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_error_exhaustion_is_network_error() {
        let executor = Scripted::new(vec![Step::Status(500), Step::Status(500)]);
        let retrying = RetryPolicy {
            retry_on_server_error: true,
            ..policy(1)
        };
        let attempted = retrying.execute(&executor, &request()).await;
        assert_eq!(attempted.attempts, 2);
        assert_eq!(attempted.outcome.unwrap_err(), NetworkError::ServerError(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retryable() {
        let executor = Scripted::new(vec![Step::Hang, Step::Status(200)]);
        let attempted = policy(1).execute(&executor, &request()).await;

        assert_eq!(attempted.attempts, 2);
        assert_eq!(attempted.outcome.unwrap().status, 200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_exhaustion() {
        let executor = Scripted::new(vec![Step::Hang]);
        let attempted = policy(0).execute(&executor, &request()).await;

        assert_eq!(attempted.attempts, 1);
        assert_eq!(
            attempted.outcome.unwrap_err(),
            NetworkError::Timeout(Duration::from_secs(5))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_request_is_not_retried() {
        let executor = Scripted::new(vec![
            Step::Fail(NetworkError::InvalidRequest("bad url".into())),
            Step::Status(200),
        ]);
        let attempted = policy(5).execute(&executor, &request()).await;
        assert_eq!(attempted.attempts, 1);
        assert!(attempted.outcome.is_err());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = policy(10);
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(5), Duration::from_secs(1));
        assert_eq!(policy.delay_for(40), Duration::from_secs(1));
    }
}
