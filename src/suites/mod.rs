//! Built-in end-to-end scenarios run against the demo client.

use crate::test_case::TestCase;

pub mod bootstrap;
pub mod download;
pub mod observe;
pub mod offline;
pub mod register;
pub mod retransmissions;
pub mod update;

/// Every built-in test, in the order the runner executes them.
#[must_use]
pub fn all() -> Vec<Box<dyn TestCase>> {
    let mut tests: Vec<Box<dyn TestCase>> = vec![
        Box::new(register::InitialRegister),
        Box::new(register::BlockwiseRegister),
        Box::new(update::UpdateOnShortLifetime),
        Box::new(offline::OfflineThenExitOffline),
        Box::new(download::CoapDownload),
        Box::new(bootstrap::BootstrapThenRegister),
        Box::new(observe::ObserveThenCancel),
    ];
    tests.extend(
        retransmissions::grid()
            .into_iter()
            .map(|t| Box::new(t) as Box<dyn TestCase>),
    );
    tests
}
