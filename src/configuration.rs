//! Command-line configuration of the test runner and the per-run settings
//! derived from it and from the environment.

use std::{
    fmt,
    path::{Path, PathBuf},
};

pub use clap::{Parser, ValueEnum};
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

/// Environment variable selecting the log level.
pub const ENV_LOGLEVEL: &str = "LOGLEVEL";
/// Environment variable enabling (and optionally overriding) the memory checker.
pub const ENV_VALGRIND: &str = "VALGRIND";
/// Environment variable disabling packet capture.
pub const ENV_NO_PCAP: &str = "NO_PCAP";
/// Environment variable enabling `rr record`.
pub const ENV_RR: &str = "RR";

/// Memory-checker command used when `VALGRIND` is set but empty.
pub const DEFAULT_MEMCHECK_COMMAND: &str =
    "valgrind --leak-check=full --track-origins=yes -q --suppressions=/dev/null";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Invalid test filter {pattern:?}: {reason}")]
    InvalidFilter { pattern: String, reason: String },

    #[error("Client binary {0} does not exist")]
    ClientNotFound(PathBuf),
}

/// Summary output format.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[clap(version, about = "Runs LwM2M client integration tests against mock servers", long_about = None)]
pub struct Configuration {
    /// List matching tests instead of running them
    #[clap(short, long)]
    pub list: bool,
    /// Path to the LwM2M client binary under test
    #[clap(short, long, default_value = "output/bin/demo")]
    pub client: PathBuf,
    /// Keep logs of tests that passed
    #[clap(short, long)]
    pub keep_success_logs: bool,
    /// Directory for per-test logs and captures
    #[clap(short, long, default_value = "log")]
    pub target_logs_path: PathBuf,
    /// Summary format
    #[clap(short, long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    /// Regular expression matched against `suite.name`
    pub filter: Option<String>,
}

impl Configuration {
    /// Checks the filter and, unless only listing, the client path.
    ///
    /// # Errors
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.filter_regex()?;
        if !self.list && !self.client.exists() {
            return Err(ConfigurationError::ClientNotFound(self.client.clone()));
        }
        Ok(())
    }

    /// The compiled filter; matches everything when none was given.
    ///
    /// # Errors
    /// Returns `InvalidFilter` for a malformed pattern.
    pub fn filter_regex(&self) -> Result<Regex, ConfigurationError> {
        let pattern = self.filter.as_deref().unwrap_or("");
        Regex::new(pattern).map_err(|e| ConfigurationError::InvalidFilter {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Settings shared by every test context of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestConfig {
    pub client_path: PathBuf,
    pub logs_dir: PathBuf,
    pub keep_success_logs: bool,
    /// Memory-checker command line, when enabled.
    pub memcheck: Option<Vec<String>>,
    pub pcap: bool,
    pub record: bool,
}

impl TestConfig {
    /// Builds the run settings, reading the environment once.
    #[must_use]
    pub fn from_configuration(conf: &Configuration) -> Self {
        Self::from_configuration_with_env(conf, |key| std::env::var(key).ok())
    }

    /// Like [`Self::from_configuration`] with an explicit environment lookup.
    pub fn from_configuration_with_env<F>(conf: &Configuration, env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let memcheck = env(ENV_VALGRIND).map(|value| {
            let command = if value.trim().is_empty() || value.trim() == "1" {
                DEFAULT_MEMCHECK_COMMAND
            } else {
                value.as_str()
            };
            command.split_whitespace().map(String::from).collect()
        });
        Self {
            client_path: conf.client.clone(),
            logs_dir: conf.target_logs_path.clone(),
            keep_success_logs: conf.keep_success_logs,
            memcheck,
            pcap: env(ENV_NO_PCAP).is_none(),
            record: env(ENV_RR).is_some(),
        }
    }

    /// Settings for running `client_path` with logs under `logs_dir` and no
    /// wrappers or capture.
    #[must_use]
    pub fn new(client_path: impl Into<PathBuf>, logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            client_path: client_path.into(),
            logs_dir: logs_dir.into(),
            keep_success_logs: false,
            memcheck: None,
            pcap: false,
            record: false,
        }
    }

    /// Directory holding the logs of one test.
    #[must_use]
    pub fn test_log_dir(&self, suite: &str, name: &str) -> PathBuf {
        self.logs_dir.join(suite).join(name)
    }

    #[must_use]
    pub fn client_path(&self) -> &Path {
        &self.client_path
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn conf(args: &[&str]) -> Configuration {
        Configuration::parse_from(std::iter::once("runtest").chain(args.iter().copied()))
    }

    #[test]
    fn validate_configuration_correct_test() {
        let conf = conf(&["--list", "register.*"]);
        assert_eq!(conf.validate(), Ok(()));
        assert!(conf.filter_regex().unwrap().is_match("register.initial"));
        assert_eq!(conf.format, OutputFormat::Text);
    }

    #[test]
    fn validate_configuration_incorrect_test() {
        assert!(matches!(
            conf(&["--list", "(unclosed"]).validate(),
            Err(ConfigurationError::InvalidFilter { .. })
        ));
        assert_eq!(
            conf(&["--client", "/nonexistent/demo"]).validate(),
            Err(ConfigurationError::ClientNotFound("/nonexistent/demo".into()))
        );
    }

    #[test]
    fn test_config_from_environment() {
        let conf = conf(&["--client", "/bin/demo", "-k", "--format", "json"]);
        assert_eq!(conf.format, OutputFormat::Json);

        let env: HashMap<&str, &str> = [(ENV_VALGRIND, ""), (ENV_NO_PCAP, "1")].into();
        let config = TestConfig::from_configuration_with_env(&conf, |k| env.get(k).map(|v| v.to_string()));
        assert!(config.keep_success_logs);
        assert!(!config.pcap);
        assert!(!config.record);
        assert_eq!(config.memcheck.as_ref().unwrap()[0], "valgrind");

        let custom: HashMap<&str, &str> = [(ENV_VALGRIND, "valgrind --tool=helgrind"), (ENV_RR, "1")].into();
        let config = TestConfig::from_configuration_with_env(&conf, |k| custom.get(k).map(|v| v.to_string()));
        assert_eq!(
            config.memcheck,
            Some(vec!["valgrind".to_string(), "--tool=helgrind".to_string()])
        );
        assert!(config.pcap);
        assert!(config.record);
        assert_eq!(
            config.test_log_dir("register", "initial"),
            PathBuf::from("log/register/initial")
        );
    }
}
