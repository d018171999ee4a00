use std::time::Duration;

use crate::{
    assertions::expect_message,
    dm::{self, DmOptions},
    error::HarnessError,
    messages::MessageKind,
    path::Lwm2mPath,
    test_case::{TestCase, TestContext, TestFuture},
    time::Deadline,
};

const PMAX: u64 = 1;

/// Notifications carry the Observe token and stop after cancellation.
pub struct ObserveThenCancel;

impl TestCase for ObserveThenCancel {
    fn suite(&self) -> &'static str {
        "observe"
    }

    fn name(&self) -> &'static str {
        "then_cancel"
    }

    fn run<'a>(&'a self, ctx: &'a mut TestContext) -> TestFuture<'a> {
        Box::pin(async move {
            let server = ctx.server(0)?;
            let current_time = Lwm2mPath::resource(3, 0, 13);
            let pmax = PMAX.to_string();
            dm::write_attributes(server, &current_time, &[("pmax", pmax.as_str())], DmOptions::new()).await?;
            let token = dm::observe(server, &current_time, DmOptions::new()).await?.token().clone();

            let pmax_window = Duration::from_secs(PMAX + 1);
            for _ in 0..2 {
                let notify = expect_message(server, MessageKind::Notify, Deadline::after(pmax_window)).await?;
                if notify.token != token {
                    return Err(HarnessError::assertion(format!(
                        "notification with token {:?}, expected {token:?}",
                        notify.token
                    )));
                }
            }

            dm::cancel_observe(server, &current_time, token.clone(), DmOptions::new()).await?;
            server.drain().await?;
            if server.observation(&token).is_some() {
                return Err(HarnessError::assertion("observation still tracked after cancel"));
            }

            let quiet = Deadline::after(pmax_window);
            loop {
                match server.recv(quiet).await {
                    Ok(msg) if msg.kind() == MessageKind::Notify && msg.token == token => {
                        return Err(HarnessError::assertion(format!("notification after cancel: {msg}")));
                    }
                    Ok(msg) => log::debug!("ignoring {msg} while waiting for silence"),
                    Err(e) if e.is_timeout() => return Ok(()),
                    Err(e) => return Err(e),
                }
            }
        })
    }
}
