use std::time::Duration;

use crate::{
    assertions::{assert_demo_updates_registration, assert_no_message, Field},
    coap::Code,
    test_case::{TestCase, TestContext, TestFuture},
    time::Deadline,
};

/// No traffic while offline; an immediate Update once back online.
pub struct OfflineThenExitOffline;

impl TestCase for OfflineThenExitOffline {
    fn suite(&self) -> &'static str {
        "offline"
    }

    fn name(&self) -> &'static str {
        "exit_offline_updates"
    }

    fn run<'a>(&'a self, ctx: &'a mut TestContext) -> TestFuture<'a> {
        Box::pin(async move {
            let (client, server) = ctx.client_and_server(0)?;
            client.enter_offline().await?;
            assert_no_message(server, Duration::from_secs(4)).await?;

            client.exit_offline().await?;
            assert_demo_updates_registration(server, Field::Any, Code::CHANGED, Deadline::after(Duration::from_secs(1)))
                .await?;
            Ok(())
        })
    }
}
