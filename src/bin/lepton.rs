//! lepton CLI - run declarative API test suites.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Parser, ValueEnum};
use lepton::{
    CaseStatus, DefaultTestRunner, ResponseBody, RunConfig, RunResult, SuiteLoader, TestRunner,
    TestSuite,
};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::time::Instant;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, EnvFilter};

/// lepton - declarative API test-suite runner.
#[derive(Parser, Debug)]
#[command(name = "lepton", version, about)]
struct Cli {
    /// Suite file or directory of suites.
    #[arg(short = 'p', long = "path", env = "LEPTON_PATH")]
    test_path: Option<String>,

    /// Only run suites whose api_name contains this text.
    #[arg(short = 'f', long = "filter")]
    suite_filter: Option<String>,

    /// Enable verbose logging.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Base URL override for all suites.
    #[arg(short = 'b', long = "base-url", env = "LEPTON_BASE_URL")]
    base_url: Option<String>,

    /// Timeout in seconds per request attempt.
    #[arg(short = 't', long = "timeout", env = "LEPTON_TIMEOUT", default_value_t = 30)]
    timeout: u64,

    /// Retries after the first attempt on network errors.
    #[arg(long = "max-retries", env = "LEPTON_MAX_RETRIES", default_value_t = 0)]
    max_retries: u32,

    /// Base delay between retries in milliseconds.
    #[arg(long = "retry-backoff-ms", env = "LEPTON_RETRY_BACKOFF_MS", default_value_t = 500)]
    retry_backoff_ms: u64,

    /// Also retry 5xx responses.
    #[arg(long = "retry-on-server-error", env = "LEPTON_RETRY_ON_SERVER_ERROR")]
    retry_on_server_error: bool,

    /// Skip the remaining cases after the first failure.
    #[arg(long = "stop-on-first-failure", env = "LEPTON_STOP_ON_FIRST_FAILURE")]
    stop_on_first_failure: bool,

    /// Run independent cases concurrently.
    #[arg(long = "parallel", env = "LEPTON_PARALLEL")]
    parallel: bool,

    /// Worker pool size for --parallel.
    #[arg(long = "workers", env = "LEPTON_WORKERS", default_value_t = 5)]
    workers: usize,

    /// Deadline in seconds for each suite run.
    #[arg(long = "run-timeout", env = "LEPTON_RUN_TIMEOUT")]
    run_timeout: Option<u64>,

    /// Default request header, `Name: value`. Repeatable.
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Directory to save run reports.
    #[arg(short = 'o', long = "output-dir", env = "LEPTON_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Report output format.
    #[arg(long = "report-format", default_value = "json")]
    report_format: ReportFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, ValueEnum)]
enum ReportFormat {
    Json,
    Yaml,
}

impl Cli {
    fn run_config(&self) -> Result<RunConfig> {
        Ok(RunConfig {
            output_dir: self.output_dir.clone(),
            api_base_url: self.base_url.clone(),
            timeout: self.timeout,
            max_retries: self.max_retries,
            retry_backoff_ms: self.retry_backoff_ms,
            retry_on_server_error: self.retry_on_server_error,
            stop_on_first_failure: self.stop_on_first_failure,
            parallel: self.parallel,
            workers: self.workers,
            default_headers: parse_headers(&self.headers)?,
            run_timeout: self.run_timeout,
            ..RunConfig::default()
        })
    }
}

fn parse_headers(raw: &[String]) -> Result<BTreeMap<String, String>> {
    raw.iter()
        .map(|header| {
            let (name, value) = header
                .split_once(':')
                .ok_or_else(|| anyhow!("Invalid header '{header}', expected 'Name: value'"))?;
            Ok((name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

fn init_tracing(verbose: bool) {
    if tracing::dispatcher::has_been_set() {
        return;
    }

    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .try_init();
}

fn print_run_result(result: &RunResult, verbose: bool) {
    let status = if result.success() {
        "\x1b[32mPASS\x1b[0m"
    } else {
        "\x1b[31mFAIL\x1b[0m"
    };
    info!(
        "{} suite: {} ({:.1}% passed, {} ms)",
        status, result.api_name, result.pass_rate, result.duration_ms
    );

    for (i, case) in result.results.iter().enumerate() {
        let mark = match case.status {
            CaseStatus::Passed => "\x1b[32m✓\x1b[0m",
            CaseStatus::Failed => "\x1b[31m✗\x1b[0m",
            CaseStatus::Error => "\x1b[31m!\x1b[0m",
            CaseStatus::Skipped => "\x1b[33m-\x1b[0m",
        };
        info!(
            "  {}. {} {} {} ({} ms)",
            i + 1,
            mark,
            case.case_id,
            case.title,
            case.duration_ms
        );

        if let Some(check) = case.status_check.filter(|c| !c.passed) {
            error!(
                "     \x1b[31mStatus: expected {}, got {}\x1b[0m",
                check.expected, check.actual
            );
        }
        for mismatch in case.mismatches() {
            error!(
                "     \x1b[31m{} {}: {}\x1b[0m",
                mismatch.path, mismatch.operator, mismatch.message
            );
        }
        if let Some(detail) = &case.error_detail {
            error!("     \x1b[31mError: {}\x1b[0m", detail.message);
        }

        if verbose {
            if let Some(request) = &case.request {
                debug!("     Request: {} {}", request.method, request.url);
            }
            if let Some(response) = &case.response {
                debug!("     Response: Status {}", response.status);
                let body = match &response.body {
                    ResponseBody::Json(json) => json.to_string(),
                    ResponseBody::Text(text) => text.clone(),
                };
                let truncated = if body.len() > 500 {
                    let cut = (0..=500).rev().find(|i| body.is_char_boundary(*i)).unwrap_or(0);
                    format!("{}...(truncated)", &body[..cut])
                } else {
                    body
                };
                debug!("     Response body: {}", truncated);
            }
        }
    }
}

fn save_run_report(result: &RunResult, report_dir: &Path, format: ReportFormat) -> Result<PathBuf> {
    if !report_dir.exists() {
        fs::create_dir_all(report_dir)
            .context(format!("Failed to create {}", report_dir.display()))?;
    }

    let timestamp = Utc::now().timestamp();
    let sanitized_name = result.api_name.replace([' ', '/'], "_");

    let (filename, content) = match format {
        ReportFormat::Json => (
            format!("{sanitized_name}-{timestamp}.json"),
            result.to_json()?,
        ),
        ReportFormat::Yaml => (
            format!("{sanitized_name}-{timestamp}.yaml"),
            result.to_yaml()?,
        ),
    };

    let file_path = report_dir.join(filename);
    let mut file = File::create(&file_path)?;
    file.write_all(content.as_bytes())?;

    Ok(file_path)
}

fn prepare_suites(test_path: Option<&str>, filter: Option<&str>) -> Result<Vec<TestSuite>> {
    let mut loader = SuiteLoader::new();
    if Path::new("suites").exists() {
        loader.add_path("suites");
    }

    let suites = match test_path {
        Some(path) => loader
            .load_path(path)
            .context(format!("Failed to load suites from {path}"))?,
        None => loader.load_all_suites()?,
    };

    let suites: Vec<TestSuite> = match filter {
        Some(filter) => {
            let filter = filter.to_lowercase();
            suites
                .into_iter()
                .filter(|s| s.api_name.to_lowercase().contains(&filter))
                .collect()
        }
        None => suites,
    };

    if suites.is_empty() {
        return Err(anyhow!("No test suites found"));
    }
    Ok(suites)
}

async fn run_all_suites(
    suites: Vec<TestSuite>,
    config: RunConfig,
    verbose: bool,
    report_format: ReportFormat,
) -> Result<bool> {
    let runner = DefaultTestRunner::new(config).context("Invalid run configuration")?;
    let report_dir = runner.config().output_dir.clone();
    let total_start = Instant::now();
    let mut all_success = true;
    let (mut passed, mut failed) = (0, 0);

    let total_suites = suites.len();
    info!("Running {} suite(s)...", total_suites);

    for (idx, suite) in suites.iter().enumerate() {
        info!("Suite {}/{}: {}", idx + 1, total_suites, suite.api_name);
        match runner.run(suite).await {
            Ok(result) => {
                print_run_result(&result, verbose);

                if let Some(dir) = &report_dir {
                    match save_run_report(&result, dir, report_format) {
                        Ok(path) => info!("Report saved: {}", path.display()),
                        Err(e) => error!("Failed to save report: {:#}", e),
                    }
                }

                if result.success() {
                    passed += 1;
                } else {
                    all_success = false;
                    failed += 1;
                }
            }
            Err(e) => {
                error!(
                    "\x1b[31mSuite rejected: {} - {}\x1b[0m",
                    suite.api_name, e
                );
                all_success = false;
                failed += 1;
            }
        }
    }

    info!(
        "Summary:\n  Suites: {}\n  \x1b[32mPassed: {}\x1b[0m\n  \x1b[31mFailed: {}\x1b[0m\n  Duration: {} ms",
        passed + failed,
        passed,
        failed,
        total_start.elapsed().as_millis()
    );

    Ok(all_success)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    init_tracing(args.verbose);

    let config = args.run_config()?;
    let suites = prepare_suites(args.test_path.as_deref(), args.suite_filter.as_deref())?;
    let success = run_all_suites(suites, config, args.verbose, args.report_format).await?;

    if !success {
        exit(1);
    }

    Ok(())
}
