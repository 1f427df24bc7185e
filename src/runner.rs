//! Test execution logic

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::assertion;
use crate::error::{ConfigError, NetworkError, VariableNotFound, VariableResolutionError};
use crate::executor::{join_url, CaseExecutor, HttpExecutor, ResolvedRequest};
use crate::json_path::JsonPath;
use crate::model::*;
use crate::plan::ExecutionPlan;
use crate::report::ReportAggregator;
use crate::retry::RetryPolicy;
use crate::variables::VariableStore;

/// Test runner trait
#[async_trait]
pub trait TestRunner: Send + Sync {
    /// Execute every case of `suite`. Only a [`ConfigError`] aborts
    /// the run; every case-level problem ends up in the result.
    async fn run(&self, suite: &TestSuite) -> Result<RunResult, ConfigError>;
}

/// External stop request. Cases not yet started when it fires are
/// reported as skipped; in-flight requests finish on their own.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Initialized,
    Running,
    Completed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunState::Initialized => "INITIALIZED",
            RunState::Running => "RUNNING",
            RunState::Completed => "COMPLETED",
        })
    }
}

/// What every case execution needs, shared with worker tasks.
struct CaseContext {
    executor: Arc<dyn CaseExecutor>,
    retry: RetryPolicy,
    base_url: Option<String>,
}

/// Default test runner
pub struct DefaultTestRunner {
    executor: Arc<dyn CaseExecutor>,
    config: RunConfig,
}

impl fmt::Debug for DefaultTestRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultTestRunner")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DefaultTestRunner {
    /// Create a runner that talks HTTP.
    pub fn new(config: RunConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let executor = HttpExecutor::new(&config)?;
        Ok(Self::with_executor(Arc::new(executor), config))
    }

    /// Create a runner on top of any executor.
    pub fn with_executor(executor: Arc<dyn CaseExecutor>, config: RunConfig) -> Self {
        Self { executor, config }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Like [`TestRunner::run`], stopping early once `cancel` fires.
    #[instrument(skip(self, suite, cancel), fields(api = %suite.api_name, cases = suite.test_cases.len()))]
    pub async fn run_with_cancel(
        &self,
        suite: &TestSuite,
        cancel: &CancelSignal,
    ) -> Result<RunResult, ConfigError> {
        self.config.validate()?;
        let base_url = suite.effective_base_url(&self.config).map(str::to_string);
        suite.validate(base_url.as_deref())?;

        let mut state = RunState::Initialized;
        debug!("Run state: {}", state);
        let mut aggregator = ReportAggregator::new(suite.api_name.clone(), base_url.clone());
        let ctx = Arc::new(CaseContext {
            executor: Arc::clone(&self.executor),
            retry: RetryPolicy::from_config(&self.config),
            base_url,
        });
        let deadline = self.config.run_deadline().map(|d| Instant::now() + d);

        transition(&mut state, RunState::Running);
        info!(
            "Starting suite: {} ({} cases, {})",
            suite.api_name,
            suite.test_cases.len(),
            if self.config.parallel {
                "parallel"
            } else {
                "sequential"
            }
        );

        let (results, halted) = if self.config.parallel {
            self.run_parallel(suite, &ctx, cancel, deadline).await
        } else {
            self.run_sequential(suite, &ctx, cancel, deadline).await
        };

        if matches!(halted, Some(SkipReason::Cancelled | SkipReason::RunTimeout)) {
            aggregator.mark_cancelled();
        }
        transition(&mut state, RunState::Completed);
        Ok(aggregator.aggregate(results))
    }

    async fn run_sequential(
        &self,
        suite: &TestSuite,
        ctx: &CaseContext,
        cancel: &CancelSignal,
        deadline: Option<Instant>,
    ) -> (Vec<CaseResult>, Option<SkipReason>) {
        let mut store = VariableStore::seeded(&suite.variables);
        let mut results = Vec::with_capacity(suite.test_cases.len());
        let mut halted = None;

        for (idx, case) in suite.test_cases.iter().enumerate() {
            if halted.is_none() {
                halted = interruption(cancel, deadline);
            }
            if let Some(reason) = halted {
                debug!(case = %case.id, "pending -> skipped ({:?})", reason);
                results.push(CaseResult::skipped(case, reason));
                continue;
            }

            info!(
                "Running case {}/{}: {}",
                idx + 1,
                suite.test_cases.len(),
                case.id
            );
            let (result, extracted) = execute_case(ctx, case, &store).await;
            store.extend(extracted);

            if result.status.is_failure() && self.config.stop_on_first_failure {
                info!("Stopping run after failure of case {}", case.id);
                halted = Some(SkipReason::StopOnFirstFailure);
            }
            results.push(result);
        }

        (results, halted)
    }

    async fn run_parallel(
        &self,
        suite: &TestSuite,
        ctx: &Arc<CaseContext>,
        cancel: &CancelSignal,
        deadline: Option<Instant>,
    ) -> (Vec<CaseResult>, Option<SkipReason>) {
        let plan = ExecutionPlan::new(suite);
        let total = suite.test_cases.len();
        let mut slots: Vec<Slot> = (0..total).map(|_| Slot::Pending).collect();
        let mut extractions: Vec<Vec<(String, Value)>> = vec![Vec::new(); total];
        let mut workers = JoinSet::new();
        let mut in_flight: HashMap<tokio::task::Id, usize> = HashMap::new();
        let mut halted = None;

        loop {
            if halted.is_none() {
                halted = interruption(cancel, deadline);
            }

            if halted.is_none() {
                for idx in 0..total {
                    if workers.len() >= self.config.workers {
                        break;
                    }
                    if !matches!(slots[idx], Slot::Pending) {
                        continue;
                    }
                    let deps = plan.dependencies(idx);
                    if !deps.iter().all(|&d| matches!(slots[d], Slot::Done(_))) {
                        continue;
                    }

                    let mut view = VariableStore::seeded(&suite.variables);
                    for &dep in deps {
                        view.extend(extractions[dep].iter().cloned());
                    }

                    let case = suite.test_cases[idx].clone();
                    let ctx = Arc::clone(ctx);
                    debug!(case = %case.id, deps = ?deps, "pending -> running");
                    let handle = workers.spawn(async move {
                        let outcome = execute_case(&ctx, &case, &view).await;
                        (idx, outcome)
                    });
                    in_flight.insert(handle.id(), idx);
                    slots[idx] = Slot::Running;
                }
            }

            let (idx, result, extracted) = match workers.join_next_with_id().await {
                None => break,
                Some(Ok((id, (idx, (result, extracted))))) => {
                    in_flight.remove(&id);
                    (idx, result, extracted)
                }
                Some(Err(join_error)) => {
                    let Some(idx) = in_flight.remove(&join_error.id()) else {
                        error!("Worker task failed outside any case: {}", join_error);
                        continue;
                    };
                    let case = &suite.test_cases[idx];
                    error!(case = %case.id, "Worker task failed: {}", join_error);
                    let detail = ErrorDetail {
                        kind: ErrorKind::Internal,
                        message: format!("worker task failed: {join_error}"),
                        variable: None,
                        cause: None,
                    };
                    (idx, CaseResult::errored(case, detail), Vec::new())
                }
            };

            if result.status.is_failure() && self.config.stop_on_first_failure && halted.is_none()
            {
                info!("Stopping run after failure of case {}", result.case_id);
                halted = Some(SkipReason::StopOnFirstFailure);
            }
            extractions[idx] = extracted;
            slots[idx] = Slot::Done(result);
        }

        let results = slots
            .into_iter()
            .zip(&suite.test_cases)
            .map(|(slot, case)| match slot {
                Slot::Done(result) => result,
                Slot::Pending | Slot::Running => {
                    let reason = halted.unwrap_or(SkipReason::Cancelled);
                    debug!(case = %case.id, "pending -> skipped ({:?})", reason);
                    CaseResult::skipped(case, reason)
                }
            })
            .collect();
        (results, halted)
    }
}

#[async_trait]
impl TestRunner for DefaultTestRunner {
    async fn run(&self, suite: &TestSuite) -> Result<RunResult, ConfigError> {
        self.run_with_cancel(suite, &CancelSignal::new()).await
    }
}

/// Per-case scheduling state in parallel mode.
enum Slot {
    Pending,
    Running,
    Done(CaseResult),
}

fn transition(state: &mut RunState, next: RunState) {
    debug!("Run state: {} -> {}", state, next);
    *state = next;
}

fn interruption(cancel: &CancelSignal, deadline: Option<Instant>) -> Option<SkipReason> {
    if cancel.is_cancelled() {
        info!("Run cancelled; remaining cases will be skipped");
        return Some(SkipReason::Cancelled);
    }
    match deadline {
        Some(deadline) if Instant::now() >= deadline => {
            warn!("Run deadline exceeded; remaining cases will be skipped");
            Some(SkipReason::RunTimeout)
        }
        _ => None,
    }
}

/// Interpolate every templated field of `case`. Fields are resolved
/// in the order endpoint, headers, query, body.
pub fn resolve_request(
    case: &TestCase,
    vars: &VariableStore,
    base_url: Option<&str>,
) -> Result<ResolvedRequest, VariableResolutionError> {
    let fail = |missing: VariableNotFound| VariableResolutionError::new(&case.id, missing);
    let interpolate_map = |map: &BTreeMap<String, String>| {
        map.iter()
            .map(|(name, value)| {
                vars.interpolate(value)
                    .map(|resolved| (name.clone(), resolved))
                    .map_err(fail)
            })
            .collect::<Result<BTreeMap<_, _>, _>>()
    };

    let endpoint = vars.interpolate(&case.endpoint).map_err(fail)?;
    let headers = interpolate_map(&case.headers)?;
    let query = interpolate_map(&case.query)?;
    let body = case
        .body
        .as_ref()
        .map(|body| vars.interpolate_value(body).map_err(fail))
        .transpose()?;

    Ok(ResolvedRequest {
        case_id: case.id.clone(),
        method: case.method,
        url: join_url(base_url, &endpoint),
        endpoint,
        headers,
        query,
        body,
    })
}

/// Values bound by the extraction rules of `case`. Paths that do not
/// resolve bind nothing.
pub fn extract_variables(case: &TestCase, body: &ResponseBody) -> Vec<(String, Value)> {
    if case.extract.is_empty() {
        return Vec::new();
    }
    let Some(json) = body.json() else {
        warn!(case = %case.id, "Response body is not JSON; nothing extracted");
        return Vec::new();
    };

    let mut bound = Vec::with_capacity(case.extract.len());
    for (name, path) in &case.extract {
        let resolved = JsonPath::parse(path)
            .ok()
            .and_then(|path| path.resolve(json).cloned());
        match resolved {
            Some(value) => {
                debug!(case = %case.id, "Extracted variable '{}' = {}", name, value);
                bound.push((name.clone(), value));
            }
            None => warn!(
                case = %case.id,
                "Extraction path '{}' for variable '{}' not found in response",
                path,
                name
            ),
        }
    }
    bound
}

/// Run one case to a terminal status. Never fails: every problem is
/// folded into the returned result.
#[instrument(skip(ctx, case, vars), fields(case = %case.id))]
async fn execute_case(
    ctx: &CaseContext,
    case: &TestCase,
    vars: &VariableStore,
) -> (CaseResult, Vec<(String, Value)>) {
    let started = Instant::now();

    let request = match resolve_request(case, vars, ctx.base_url.as_deref()) {
        Ok(request) => request,
        Err(err) => {
            warn!("Case {} not sent: {}", case.id, err);
            let detail = ErrorDetail {
                kind: ErrorKind::VariableResolution,
                message: err.to_string(),
                variable: Some(err.variable),
                cause: None,
            };
            return (CaseResult::errored(case, detail), Vec::new());
        }
    };

    let attempted = ctx.retry.execute(ctx.executor.as_ref(), &request).await;
    let mut result = CaseResult::blank(case, CaseStatus::Error);
    result.attempts = attempted.attempts;
    result.request = Some(request.info());

    let extracted = match attempted.outcome {
        Err(err) => {
            error!(
                "Case {} failed after {} attempt(s): {}",
                case.id, attempted.attempts, err
            );
            result.error_detail = Some(network_detail(&err));
            Vec::new()
        }
        Ok(exchange) => {
            result.http_status = Some(exchange.status);
            result.status_check = assertion::check_status(case.expected_status, exchange.status);
            result.assertion_results = case
                .assertions()
                .iter()
                .map(|a| assertion::evaluate(&exchange.body, a))
                .collect();
            result.status = if assertion::case_passed(
                result.status_check.as_ref(),
                &result.assertion_results,
            ) {
                CaseStatus::Passed
            } else {
                CaseStatus::Failed
            };

            let extracted = extract_variables(case, &exchange.body);
            result.extracted = extracted.iter().map(|(name, _)| name.clone()).collect();
            result.response = Some(exchange.info());
            extracted
        }
    };

    result.duration_ms = started.elapsed().as_millis() as u64;
    info!(
        "Case {} -> {} ({} ms)",
        case.id, result.status, result.duration_ms
    );
    (result, extracted)
}

fn network_detail(err: &NetworkError) -> ErrorDetail {
    ErrorDetail {
        kind: ErrorKind::Network,
        message: err.to_string(),
        variable: None,
        cause: Some(err.kind().to_string()),
    }
}
