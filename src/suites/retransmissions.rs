//! Register retransmission timing for a grid of transmission parameters.

use std::time::Duration;

use tokio::time::Instant;

use crate::{
    assertions::expect_message,
    error::HarnessError,
    messages::MessageKind,
    server::TransmissionParams,
    test_case::{SetupOptions, TestCase, TestContext, TestFuture},
    time::Deadline,
};

const ACK_RANDOM_FACTOR: f64 = 1.5;
/// Scheduling slack allowed on every measured gap.
const TOLERANCE: Duration = Duration::from_millis(300);

/// The client must send exactly `MAX_RETRANSMIT + 1` copies of an
/// unacknowledged Register, with doubling gaps.
#[derive(Debug, Clone, Copy)]
pub struct RegisterRetransmissions {
    name: &'static str,
    ack_timeout_secs: u64,
    max_retransmit: u32,
}

/// Every combination of `ACK_TIMEOUT` in {1, 2} and `MAX_RETRANSMIT` in {0, 1, 2}.
#[must_use]
pub fn grid() -> Vec<RegisterRetransmissions> {
    const NAMES: [[&str; 3]; 2] = [
        [
            "register_ack1_retransmit0",
            "register_ack1_retransmit1",
            "register_ack1_retransmit2",
        ],
        [
            "register_ack2_retransmit0",
            "register_ack2_retransmit1",
            "register_ack2_retransmit2",
        ],
    ];
    let mut tests = Vec::with_capacity(6);
    for (ack_index, ack_timeout_secs) in [1u64, 2].into_iter().enumerate() {
        for max_retransmit in 0..3u32 {
            tests.push(RegisterRetransmissions {
                name: NAMES[ack_index][max_retransmit as usize],
                ack_timeout_secs,
                max_retransmit,
            });
        }
    }
    tests
}

impl RegisterRetransmissions {
    fn params(&self) -> TransmissionParams {
        TransmissionParams::new(
            Duration::from_secs(self.ack_timeout_secs),
            ACK_RANDOM_FACTOR,
            self.max_retransmit,
        )
    }
}

/// Transmissions of the first Register are collected until MAX_TRANSMIT_WAIT
/// after it arrived.
fn transmission_window(started: Instant, params: &TransmissionParams) -> Deadline {
    Deadline::at(started + params.max_transmit_wait())
}

/// Checks gaps between consecutive transmissions: the first lies in
/// `[ACK_TIMEOUT, ACK_TIMEOUT * ACK_RANDOM_FACTOR]`, each next one doubles.
fn check_backoff(gaps: &[Duration], params: &TransmissionParams) -> Result<(), String> {
    let Some(first) = gaps.first() else {
        return Ok(());
    };
    let low = params.ack_timeout.saturating_sub(TOLERANCE);
    let high = params.max_initial_timeout() + TOLERANCE;
    if *first < low || *first > high {
        return Err(format!("first retransmission after {first:?}, expected {low:?}..{high:?}"));
    }
    for pair in gaps.windows(2) {
        let expected = pair[0] * 2;
        let slack = TOLERANCE * 2;
        if pair[1] + slack < expected || pair[1] > expected + slack {
            return Err(format!(
                "gap {:?} after {:?} is not doubled (expected {expected:?})",
                pair[1], pair[0]
            ));
        }
    }
    Ok(())
}

impl TestCase for RegisterRetransmissions {
    fn suite(&self) -> &'static str {
        "retransmissions"
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn setup_options(&self) -> SetupOptions {
        SetupOptions::default()
            .auto_register(false)
            .transmission_params(self.params())
            .extra_args([
                "--ack-timeout".to_string(),
                self.ack_timeout_secs.to_string(),
                "--ack-random-factor".to_string(),
                ACK_RANDOM_FACTOR.to_string(),
                "--max-retransmit".to_string(),
                self.max_retransmit.to_string(),
            ])
    }

    fn memcheck_compatible(&self) -> bool {
        false
    }

    fn run<'a>(&'a self, ctx: &'a mut TestContext) -> TestFuture<'a> {
        Box::pin(async move {
            let params = self.params();
            let server = ctx.server(0)?;

            let first = expect_message(server, MessageKind::Register, Deadline::after(Duration::from_secs(5))).await?;
            let started = Instant::now();
            let mut arrivals = vec![started];
            let window = transmission_window(started, &params);
            loop {
                match server.recv(window).await {
                    Ok(msg) if msg.kind() == MessageKind::Register && msg.message_id == first.message_id => {
                        arrivals.push(Instant::now());
                    }
                    Ok(msg) => {
                        log::info!("New exchange after giving up: {msg}");
                        break;
                    }
                    Err(e) if e.is_timeout() => break,
                    Err(e) => return Err(e),
                }
            }

            let expected = params.max_retransmit as usize + 1;
            if arrivals.len() != expected {
                return Err(HarnessError::assertion(format!(
                    "{} Register transmissions, expected {expected}",
                    arrivals.len()
                )));
            }
            let gaps: Vec<Duration> = arrivals.windows(2).map(|w| w[1] - w[0]).collect();
            check_backoff(&gaps, &params).map_err(HarnessError::assertion)?;
            Ok(())
        })
    }
}
