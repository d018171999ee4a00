//! Sequential test runner.
//!
//! Each selected test gets a fresh [`TestContext`]; failures in tear-down are
//! appended to the failure of the test body rather than replacing it.

use std::{
    fmt,
    io::{self, Write},
    path::PathBuf,
    time::Instant,
};

use colored::Colorize;
use regex::Regex;
use serde::Serialize;

use crate::{
    configuration::{OutputFormat, TestConfig},
    error::HarnessError,
    test_case::{TestCase, TestContext},
};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Passed,
    /// An assertion or protocol expectation did not hold.
    Failed,
    /// The test could not run: setup failure, client crash or I/O error.
    Errored,
}

impl TestStatus {
    fn of(error: &HarnessError) -> Self {
        match error {
            HarnessError::Assertion(_)
            | HarnessError::UnexpectedMessage { .. }
            | HarnessError::UnexpectedCode { .. }
            | HarnessError::MissingOption(_) => TestStatus::Failed,
            e if e.is_timeout() => TestStatus::Failed,
            _ => TestStatus::Errored,
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            TestStatus::Passed => write!(f, "PASS"),
            TestStatus::Failed => write!(f, "FAIL"),
            TestStatus::Errored => write!(f, "ERROR"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub name: String,
    pub status: TestStatus,
    pub duration_secs: f64,
    pub error: Option<String>,
    pub log_dir: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Summary {
    pub results: Vec<TestResult>,
}

impl Summary {
    fn count(&self, status: TestStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    #[must_use]
    pub fn passed(&self) -> usize {
        self.count(TestStatus::Passed)
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(TestStatus::Failed)
    }

    #[must_use]
    pub fn errored(&self) -> usize {
        self.count(TestStatus::Errored)
    }

    #[must_use]
    pub fn success(&self) -> bool {
        self.passed() == self.results.len()
    }

    /// Writes the summary in the selected format.
    ///
    /// # Errors
    /// Returns the write error.
    pub fn write_to<W: Write>(&self, out: &mut W, format: OutputFormat) -> io::Result<()> {
        match format {
            OutputFormat::Json => {
                serde_json::to_writer_pretty(&mut *out, self)?;
                writeln!(out)
            }
            OutputFormat::Text => self.write_text(out),
        }
    }

    fn write_text<W: Write>(&self, out: &mut W) -> io::Result<()> {
        for result in &self.results {
            let status = match result.status {
                TestStatus::Passed => result.status.to_string().green(),
                TestStatus::Failed => result.status.to_string().red(),
                TestStatus::Errored => result.status.to_string().yellow(),
            };
            writeln!(out, "{status:>5} {} ({:.2}s)", result.name, result.duration_secs)?;
            if let Some(error) = &result.error {
                for line in error.lines() {
                    writeln!(out, "      {line}")?;
                }
                writeln!(out, "      logs: {}", result.log_dir.display())?;
            }
        }
        let totals = format!(
            "{} tests: {} passed, {} failed, {} errored",
            self.results.len(),
            self.passed(),
            self.failed(),
            self.errored()
        );
        if self.success() {
            writeln!(out, "{}", totals.green().bold())
        } else {
            writeln!(out, "{}", totals.red().bold())
        }
    }
}

/// Owns the registered tests and the run settings.
pub struct Runner {
    config: TestConfig,
    tests: Vec<Box<dyn TestCase>>,
}

impl Runner {
    #[must_use]
    pub fn new(config: TestConfig, tests: Vec<Box<dyn TestCase>>) -> Self {
        Self { config, tests }
    }

    /// Tests whose `suite.name` matches `filter`, in registration order.
    pub fn matching<'a>(&'a self, filter: &'a Regex) -> impl Iterator<Item = &'a dyn TestCase> + 'a {
        self.tests
            .iter()
            .map(Box::as_ref)
            .filter(move |t| filter.is_match(&t.full_name()))
    }

    pub async fn run(&self, filter: &Regex) -> Summary {
        let mut summary = Summary::default();
        for test in self.matching(filter) {
            let result = self.run_one(test).await;
            match result.status {
                TestStatus::Passed => log::info!("{} passed", result.name),
                _ => log::error!("{} {}", result.name, result.status),
            }
            summary.results.push(result);
        }
        summary
    }

    /// Runs one test in a fresh context.
    pub async fn run_one(&self, test: &dyn TestCase) -> TestResult {
        let name = test.full_name();
        let log_dir = self.config.test_log_dir(test.suite(), test.name());
        let started = Instant::now();
        log::info!("Running {name}");

        let outcome = match TestContext::set_up(&self.config, test).await {
            Ok(mut ctx) => {
                ctx.note(&format!("test {name} started"));
                let body = test.run(&mut ctx).await;
                if let Err(e) = &body {
                    ctx.note(&format!("test {name} failed: {e}"));
                }
                let teardown = ctx.tear_down(body.is_ok()).await;
                merge_failures(body, teardown)
            }
            Err(e) => Err((TestStatus::Errored, format!("set-up: {e}"))),
        };

        let (status, error) = match outcome {
            Ok(()) => (TestStatus::Passed, None),
            Err((status, message)) => {
                write_failure_trace(&log_dir, &message);
                (status, Some(message))
            }
        };
        TestResult {
            name,
            status,
            duration_secs: started.elapsed().as_secs_f64(),
            error,
            log_dir,
        }
    }
}

fn merge_failures(
    body: Result<(), HarnessError>,
    teardown: Result<(), HarnessError>,
) -> Result<(), (TestStatus, String)> {
    match (body, teardown) {
        (Ok(()), Ok(())) => Ok(()),
        (Err(e), Ok(())) => Err((TestStatus::of(&e), e.to_string())),
        (Ok(()), Err(t)) => Err((TestStatus::of(&t), format!("tear-down: {t}"))),
        (Err(e), Err(t)) => Err((TestStatus::of(&e), format!("{e}\ntear-down: {t}"))),
    }
}

fn write_failure_trace(log_dir: &std::path::Path, message: &str) {
    let written = std::fs::create_dir_all(log_dir)
        .and_then(|()| std::fs::write(log_dir.join("failure.txt"), format!("{message}\n")));
    if let Err(e) = written {
        log::warn!("Cannot write failure trace into {}: {e}", log_dir.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;

    fn result(name: &str, status: TestStatus) -> TestResult {
        TestResult {
            name: name.into(),
            status,
            duration_secs: 0.5,
            error: (status != TestStatus::Passed).then(|| "boom".to_string()),
            log_dir: PathBuf::from("log").join(name),
        }
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(TestStatus::of(&HarnessError::assertion("x")), TestStatus::Failed);
        assert_eq!(TestStatus::of(&TransportError::Timeout.into()), TestStatus::Failed);
        assert_eq!(TestStatus::of(&HarnessError::Setup("x".into())), TestStatus::Errored);
    }

    #[test]
    fn test_teardown_error_is_appended() {
        let merged = merge_failures(Err(HarnessError::assertion("body")), Err(HarnessError::Setup("td".into())));
        let (status, message) = merged.unwrap_err();
        assert_eq!(status, TestStatus::Failed);
        assert!(message.starts_with("Assertion failed: body"));
        assert!(message.ends_with("tear-down: Setup failed: td"));

        let (status, message) = merge_failures(Ok(()), Err(HarnessError::Setup("td".into()))).unwrap_err();
        assert_eq!(status, TestStatus::Errored);
        assert!(message.starts_with("tear-down:"));
        assert!(merge_failures(Ok(()), Ok(())).is_ok());
    }

    #[test]
    fn test_summary_output() {
        colored::control::set_override(false);
        let summary = Summary {
            results: vec![result("a.one", TestStatus::Passed), result("a.two", TestStatus::Failed)],
        };
        assert!(!summary.success());
        assert_eq!((summary.passed(), summary.failed(), summary.errored()), (1, 1, 0));

        let mut text = Vec::new();
        summary.write_to(&mut text, OutputFormat::Text).unwrap();
        let text = String::from_utf8(text).unwrap();
        assert!(text.contains(" PASS a.one (0.50s)"));
        assert!(text.contains(" FAIL a.two"));
        assert!(text.contains("      boom"));
        assert!(text.ends_with("2 tests: 1 passed, 1 failed, 0 errored\n"));

        let mut json = Vec::new();
        summary.write_to(&mut json, OutputFormat::Json).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&json).unwrap();
        assert_eq!(parsed["results"][1]["status"], "failed");
        assert_eq!(parsed["results"][0]["error"], serde_json::Value::Null);
    }
}
