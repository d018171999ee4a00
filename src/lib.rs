//! LwM2M Harness - mock LwM2M servers and an integration test harness for
//! LwM2M client implementations.
//!
//! The harness launches the client under test as a child process, impersonates
//! one or more LwM2M servers over CoAP/DTLS on loopback, drives the client
//! through scripted exchanges and asserts on what it sends.
//!
//! # Usage
//!
//! Run every built-in test against a client binary:
//! ```bash
//! runtest --client output/bin/demo
//! ```
//!
//! Run only the registration tests and keep their logs:
//! ```bash
//! runtest -k 'register\..*'
//! ```

/// Assertion helpers over received messages.
pub mod assertions;
/// Client subprocess and its command channel.
pub mod client;
/// CoAP message codec.
pub mod coap;
/// Command-line configuration and per-run settings.
pub mod configuration;
/// PSK material and HMAC helpers.
pub mod crypto;
/// Device-management operations performed by a mock server.
pub mod dm;
/// Crate-level error type.
pub mod error;
/// Blockwise CoAP file server.
pub mod file_server;
/// CoRE link format.
pub mod link_format;
/// LwM2M message classification and construction.
pub mod messages;
/// LwM2M data model paths.
pub mod path;
/// Loopback packet capture.
pub mod pcap;
/// Factory-provisioning payloads and firmware packages.
pub mod provisioning;
/// Sequential test runner.
pub mod runner;
/// SenML JSON and CBOR codecs.
pub mod senml;
/// Mock LwM2M server.
pub mod server;
/// Built-in end-to-end scenarios.
pub mod suites;
/// Test-case trait and per-test context.
pub mod test_case;
/// Deadlines and timestamp helpers.
pub mod time;
/// OMA LwM2M TLV codec.
pub mod tlv;
/// UDP and DTLS 1.2 transport.
pub mod transport;
