//! Runner and test context driving a stand-in client that echoes its
//! command channel.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;

use lwm2m_harness::configuration::{OutputFormat, TestConfig};
use lwm2m_harness::error::HarnessError;
use lwm2m_harness::runner::{Runner, TestStatus};
use lwm2m_harness::test_case::{SetupOptions, TestCase, TestContext, TestFuture};
use lwm2m_harness::time::Deadline;

fn echo_client(dir: &Path) -> PathBuf {
    let script = dir.join("echo-client.sh");
    std::fs::write(&script, "#!/bin/sh\nexec cat\n").unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    script
}

struct Echo;

impl TestCase for Echo {
    fn suite(&self) -> &'static str {
        "channel"
    }

    fn name(&self) -> &'static str {
        "echo"
    }

    fn setup_options(&self) -> SetupOptions {
        SetupOptions::default().auto_register(false)
    }

    fn run<'a>(&'a self, ctx: &'a mut TestContext) -> TestFuture<'a> {
        Box::pin(async move {
            let pattern = Regex::new(r"^SOCKET_COUNT==(\d+)$").unwrap();
            let groups = ctx
                .client()?
                .communicate("SOCKET_COUNT==3", Some(&pattern), Deadline::after(Duration::from_secs(2)))
                .await?
                .unwrap_or_default();
            if groups.get(1).map(String::as_str) != Some("3") {
                return Err(HarnessError::assertion(format!("unexpected groups {groups:?}")));
            }
            Ok(())
        })
    }
}

struct AlwaysFails;

impl TestCase for AlwaysFails {
    fn suite(&self) -> &'static str {
        "channel"
    }

    fn name(&self) -> &'static str {
        "fails"
    }

    fn setup_options(&self) -> SetupOptions {
        SetupOptions::default().auto_register(false)
    }

    fn run<'a>(&'a self, _ctx: &'a mut TestContext) -> TestFuture<'a> {
        Box::pin(async { Err(HarnessError::assertion("expected failure")) })
    }
}

struct NeverRegisters;

impl TestCase for NeverRegisters {
    fn suite(&self) -> &'static str {
        "register"
    }

    fn name(&self) -> &'static str {
        "nothing_arrives"
    }

    fn run<'a>(&'a self, _ctx: &'a mut TestContext) -> TestFuture<'a> {
        Box::pin(async { Ok(()) })
    }
}

fn runner(dir: &Path) -> Runner {
    let config = TestConfig::new(echo_client(dir), dir.join("log"));
    Runner::new(config, vec![Box::new(Echo), Box::new(AlwaysFails), Box::new(NeverRegisters)])
}

#[tokio::test]
async fn filter_selects_by_full_name() {
    let dir = tempfile::tempdir().unwrap();
    let runner = runner(dir.path());
    let names: Vec<String> = runner
        .matching(&Regex::new(r"^channel\.").unwrap())
        .map(|t| t.full_name())
        .collect();
    assert_eq!(names, ["channel.echo", "channel.fails"]);
    assert_eq!(runner.matching(&Regex::new("").unwrap()).count(), 3);
}

#[tokio::test]
async fn run_reports_each_outcome() {
    let dir = tempfile::tempdir().unwrap();
    let runner = runner(dir.path());
    let summary = runner.run(&Regex::new("").unwrap()).await;

    let statuses: Vec<TestStatus> = summary.results.iter().map(|r| r.status).collect();
    // the stand-in client never registers, so auto-register times out
    assert_eq!(statuses, [TestStatus::Passed, TestStatus::Failed, TestStatus::Errored]);
    assert!(!summary.success());

    let passed = &summary.results[0];
    assert!(!passed.log_dir.exists(), "logs of passing tests are removed");

    let failed = &summary.results[1];
    assert_eq!(failed.error.as_deref(), Some("Assertion failed: expected failure"));
    let trace = std::fs::read_to_string(failed.log_dir.join("failure.txt")).unwrap();
    assert!(trace.contains("expected failure"));
    assert!(failed.log_dir.join("client.log").exists());

    let setup = &summary.results[2];
    assert!(setup.error.as_deref().unwrap_or_default().starts_with("set-up:"));

    let mut json = Vec::new();
    summary.write_to(&mut json, OutputFormat::Json).unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&json).unwrap();
    assert_eq!(parsed["results"][0]["name"], "channel.echo");
}
