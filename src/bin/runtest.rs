#[macro_use]
extern crate log;

use std::{io, process::ExitCode};

use lwm2m_harness::configuration::{Configuration, Parser, TestConfig, ENV_LOGLEVEL};
use lwm2m_harness::runner::Runner;
use lwm2m_harness::suites;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::new().filter_or(ENV_LOGLEVEL, "info")).init();

    let conf = Configuration::parse();
    if let Err(e) = conf.validate() {
        error!("Configuration is broken: {e}");
        return ExitCode::FAILURE;
    }
    let filter = match conf.filter_regex() {
        Ok(filter) => filter,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let runner = Runner::new(TestConfig::from_configuration(&conf), suites::all());
    if conf.list {
        for test in runner.matching(&filter) {
            println!("{}", test.full_name());
        }
        return ExitCode::SUCCESS;
    }

    info!("Configuration valid. Running tests against {}", conf.client.display());
    let summary = runner.run(&filter).await;
    if let Err(e) = summary.write_to(&mut io::stdout().lock(), conf.format) {
        error!("Cannot print the summary: {e}");
        return ExitCode::FAILURE;
    }
    if summary.success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
