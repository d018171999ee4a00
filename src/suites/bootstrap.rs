use std::time::Duration;

use crate::{
    assertions::{assert_demo_registers, assert_demo_requests_bootstrap, Field, RegisterExpectation, DEMO_LOCATION},
    dm::{self, DmOptions},
    path::Lwm2mPath,
    test_case::{SetupOptions, TestCase, TestContext, TestFuture},
    time::Deadline,
    tlv::{self, Tlv},
};

const SHORT_SERVER_ID: i64 = 1;
const SECURITY_MODE_NOSEC: i64 = 3;

/// Security object instance pointing the client at `uri` without security.
fn security_instance(uri: &str) -> Vec<Tlv> {
    vec![
        Tlv::resource_str(0, uri),
        Tlv::resource_bool(1, false),
        Tlv::resource_int(2, SECURITY_MODE_NOSEC),
        Tlv::resource(3, Vec::new()),
        Tlv::resource(4, Vec::new()),
        Tlv::resource(5, Vec::new()),
        Tlv::resource_int(10, SHORT_SERVER_ID),
    ]
}

fn server_instance(lifetime: i64) -> Vec<Tlv> {
    vec![
        Tlv::resource_int(0, SHORT_SERVER_ID),
        Tlv::resource_int(1, lifetime),
        Tlv::resource_bool(6, false),
        Tlv::resource_str(7, "U"),
    ]
}

/// Request-Bootstrap, provisioning of a regular server, then Register there.
pub struct BootstrapThenRegister;

impl TestCase for BootstrapThenRegister {
    fn suite(&self) -> &'static str {
        "bootstrap"
    }

    fn name(&self) -> &'static str {
        "then_register"
    }

    fn setup_options(&self) -> SetupOptions {
        SetupOptions::default().with_bootstrap_server()
    }

    fn run<'a>(&'a self, ctx: &'a mut TestContext) -> TestFuture<'a> {
        Box::pin(async move {
            let endpoint = ctx.options().endpoint.clone();
            let server_uri = ctx.server(0)?.uri();

            let bootstrap = ctx.bootstrap()?;
            assert_demo_requests_bootstrap(bootstrap, Field::Is(endpoint.clone()), Deadline::after(Duration::from_secs(5)))
                .await?;
            dm::bootstrap_write(
                bootstrap,
                &Lwm2mPath::instance(1, 1),
                tlv::encode_all(&server_instance(86400))?,
                DmOptions::new(),
            )
            .await?;
            dm::bootstrap_write(
                bootstrap,
                &Lwm2mPath::instance(0, 2),
                tlv::encode_all(&security_instance(&server_uri))?,
                DmOptions::new(),
            )
            .await?;
            dm::bootstrap_finish(bootstrap, DmOptions::new()).await?;

            let expectation = RegisterExpectation::default()
                .with_endpoint(&endpoint)
                .with_location(DEMO_LOCATION);
            assert_demo_registers(ctx.server(0)?, &expectation, Deadline::after(Duration::from_secs(5))).await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instances_encode() {
        let security = tlv::encode_all(&security_instance("coap://127.0.0.1:5683")).unwrap();
        let parsed = tlv::parse_all(&security).unwrap();
        assert_eq!(parsed.len(), 7);
        assert_eq!(parsed[0].as_string().unwrap(), "coap://127.0.0.1:5683");
        assert_eq!(parsed[6].as_int().unwrap(), SHORT_SERVER_ID);

        let server = tlv::parse_all(&tlv::encode_all(&server_instance(60)).unwrap()).unwrap();
        assert_eq!(server[1].as_int().unwrap(), 60);
        assert_eq!(server[3].as_string().unwrap(), "U");
    }
}
