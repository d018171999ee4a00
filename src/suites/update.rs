use std::time::Duration;

use crate::{
    assertions::{assert_demo_updates_registration, Field},
    coap::Code,
    test_case::{SetupOptions, TestCase, TestContext, TestFuture},
    time::Deadline,
};

const LIFETIME: u32 = 5;
/// Half the lifetime plus slack.
const UPDATE_WAIT: Duration = Duration::from_secs(3);

/// The client refreshes a short registration before it lapses.
pub struct UpdateOnShortLifetime;

impl TestCase for UpdateOnShortLifetime {
    fn suite(&self) -> &'static str {
        "update"
    }

    fn name(&self) -> &'static str {
        "short_lifetime"
    }

    fn setup_options(&self) -> SetupOptions {
        SetupOptions::default().lifetime(LIFETIME)
    }

    fn memcheck_compatible(&self) -> bool {
        false
    }

    fn run<'a>(&'a self, ctx: &'a mut TestContext) -> TestFuture<'a> {
        Box::pin(async move {
            let server = ctx.server(0)?;
            for _ in 0..2 {
                assert_demo_updates_registration(server, Field::Any, Code::CHANGED, Deadline::after(UPDATE_WAIT))
                    .await?;
            }
            Ok(())
        })
    }
}
