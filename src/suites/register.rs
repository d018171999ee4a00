use crate::{
    assertions::{assert_demo_registers, assert_no_message, expect_message, Field, RegisterExpectation, DEMO_LOCATION},
    coap::OptionNumber,
    error::HarnessError,
    link_format::parse_links,
    messages::{Lwm2mMessage, MessageKind},
    test_case::{SetupOptions, TestCase, TestContext, TestFuture, DEFAULT_ENDPOINT},
    time::Deadline,
};

use std::time::Duration;

/// Plain first registration with the client defaults.
pub struct InitialRegister;

impl TestCase for InitialRegister {
    fn suite(&self) -> &'static str {
        "register"
    }

    fn name(&self) -> &'static str {
        "initial"
    }

    fn setup_options(&self) -> SetupOptions {
        SetupOptions::default().auto_register(false)
    }

    fn run<'a>(&'a self, ctx: &'a mut TestContext) -> TestFuture<'a> {
        Box::pin(async move {
            let server = ctx.server(0)?;
            let expectation = RegisterExpectation {
                version: Field::Is("1.0".to_string()),
                ..RegisterExpectation::default()
                    .with_endpoint(DEFAULT_ENDPOINT)
                    .with_lifetime(Some(86400))
            };
            assert_demo_registers(server, &expectation, Deadline::after(Duration::from_secs(2))).await?;
            assert_no_message(server, Duration::from_secs(5)).await
        })
    }
}

/// Register split into Block1 fragments by small client buffers.
pub struct BlockwiseRegister;

impl TestCase for BlockwiseRegister {
    fn suite(&self) -> &'static str {
        "register"
    }

    fn name(&self) -> &'static str {
        "blockwise"
    }

    fn setup_options(&self) -> SetupOptions {
        SetupOptions::default()
            .auto_register(false)
            .extra_args(["--inbuf-size", "64", "--outbuf-size", "128"])
    }

    fn run<'a>(&'a self, ctx: &'a mut TestContext) -> TestFuture<'a> {
        Box::pin(async move {
            let server = ctx.server(0)?;
            let deadline = Deadline::after(Duration::from_secs(5));
            let mut payload = Vec::new();
            let mut block_size = None;
            let mut seq = 0;
            loop {
                let fragment = expect_message(server, MessageKind::Register, deadline).await?;
                let block = fragment
                    .block1()?
                    .ok_or(HarnessError::MissingOption(OptionNumber::BLOCK1))?;
                if block.seq_num != seq {
                    return Err(HarnessError::assertion(format!(
                        "Register block {} arrived, expected {seq}",
                        block.seq_num
                    )));
                }
                if *block_size.get_or_insert(block.size) != block.size {
                    return Err(HarnessError::assertion(format!("Register block size changed to {}", block.size)));
                }
                payload.extend_from_slice(&fragment.payload);

                if block.more {
                    server.send(Lwm2mMessage::continue_matching(&fragment, block)).await?;
                    seq += 1;
                } else {
                    let created = Lwm2mMessage::created_matching(&fragment, Some(DEMO_LOCATION))
                        .into_message()
                        .with_block1(block);
                    server.send(created).await?;
                    break;
                }
            }

            if seq == 0 {
                return Err(HarnessError::assertion("Register was not split into blocks"));
            }
            let links = parse_links(&payload)?;
            if links.is_empty() {
                return Err(HarnessError::assertion("reassembled Register lists no objects"));
            }
            log::info!("Register reassembled from {} blocks, {} links", seq + 1, links.len());
            Ok(())
        })
    }
}
