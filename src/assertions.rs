//! Assertion primitives over messages received by mock servers.

use std::{fmt, time::Duration};

use crate::{
    coap::{Code, CoapOption, Message, MessageType, Token},
    error::{HarnessError, Result},
    link_format::{parse_links, Link},
    messages::{response_to, Lwm2mMessage, MessageKind, RegistrationParams},
    server::MockServer,
    time::Deadline,
};

/// Time the demo assertions wait for a message by default.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(5);

/// Location assigned to a single registered client.
pub const DEMO_LOCATION: &str = "/rd/demo";

/// One expected field: either any value or exactly this one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field<T> {
    Any,
    Is(T),
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Field::Any
    }
}

impl<T: PartialEq + fmt::Debug> Field<T> {
    fn check(&self, name: &str, actual: &T, failures: &mut Vec<String>) {
        if let Field::Is(expected) = self {
            if expected != actual {
                failures.push(format!("{name}: expected {expected:?}, got {actual:?}"));
            }
        }
    }
}

impl<T> From<T> for Field<T> {
    fn from(value: T) -> Self {
        Field::Is(value)
    }
}

/// A message pattern for [`assert_msg_equal`].
#[derive(Debug, Clone, Default)]
pub struct Expected {
    pub kind: Field<MessageKind>,
    pub msg_type: Field<MessageType>,
    pub code: Field<Code>,
    pub message_id: Field<u16>,
    pub token: Field<Token>,
    pub options: Field<Vec<CoapOption>>,
    pub payload: Field<Vec<u8>>,
}

impl Expected {
    /// Matches every field of `msg`.
    #[must_use]
    pub fn message(msg: &Lwm2mMessage) -> Self {
        Self {
            kind: Field::Is(msg.kind()),
            msg_type: Field::Is(msg.msg_type),
            code: Field::Is(msg.code),
            message_id: Field::Is(msg.message_id),
            token: Field::Is(msg.token.clone()),
            options: Field::Is(msg.options.clone()),
            payload: Field::Is(msg.payload.clone()),
        }
    }

    /// Matches any message of the given kind.
    #[must_use]
    pub fn kind(kind: MessageKind) -> Self {
        Self {
            kind: Field::Is(kind),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn any_message_id(mut self) -> Self {
        self.message_id = Field::Any;
        self
    }

    #[must_use]
    pub fn any_token(mut self) -> Self {
        self.token = Field::Any;
        self
    }

    #[must_use]
    pub fn any_options(mut self) -> Self {
        self.options = Field::Any;
        self
    }

    #[must_use]
    pub fn any_payload(mut self) -> Self {
        self.payload = Field::Any;
        self
    }

    #[must_use]
    pub fn with_code(mut self, code: Code) -> Self {
        self.code = Field::Is(code);
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = Field::Is(payload.into());
        self
    }
}

fn sorted_options(options: &[CoapOption]) -> Vec<CoapOption> {
    let mut sorted = options.to_vec();
    sorted.sort_by_key(|o| o.number);
    sorted
}

/// Compares `actual` against `expected`, ignoring `Any` fields. Options are
/// compared in wire order.
///
/// # Errors
/// Returns an assertion failure listing every mismatching field together
/// with the decoded message and its raw bytes.
pub fn assert_msg_equal(expected: &Expected, actual: &Lwm2mMessage) -> Result<()> {
    let mut failures = Vec::new();
    expected.kind.check("kind", &actual.kind(), &mut failures);
    expected.msg_type.check("type", &actual.msg_type, &mut failures);
    expected.code.check("code", &actual.code, &mut failures);
    expected
        .message_id
        .check("message_id", &actual.message_id, &mut failures);
    expected.token.check("token", &actual.token, &mut failures);
    if let Field::Is(options) = &expected.options {
        Field::Is(sorted_options(options)).check(
            "options",
            &sorted_options(&actual.options),
            &mut failures,
        );
    }
    expected.payload.check("payload", &actual.payload, &mut failures);

    if failures.is_empty() {
        return Ok(());
    }
    Err(HarnessError::assertion(format!(
        "message mismatch:\n  {}\nactual: {actual}\nraw: {}",
        failures.join("\n  "),
        hex::encode(actual.encode())
    )))
}

/// Receives the next message and checks its kind.
///
/// # Errors
/// `UnexpectedMessage` for another kind, or the receive error.
pub async fn expect_message(server: &mut MockServer, kind: MessageKind, deadline: Deadline) -> Result<Lwm2mMessage> {
    let msg = server.recv(deadline).await?;
    if msg.kind() != kind {
        return Err(HarnessError::UnexpectedMessage {
            expected: kind.to_string(),
            actual: msg.to_string(),
        });
    }
    Ok(msg)
}

/// Asserts that nothing arrives within `timeout`.
///
/// # Errors
/// `UnexpectedMessage` carrying whatever arrived.
pub async fn assert_no_message(server: &mut MockServer, timeout: Duration) -> Result<()> {
    match server.recv(Deadline::after(timeout)).await {
        Ok(msg) => Err(HarnessError::UnexpectedMessage {
            expected: "no message".into(),
            actual: msg.to_string(),
        }),
        Err(e) if e.is_timeout() => Ok(()),
        Err(e) => Err(e),
    }
}

/// What a demo client's Register must look like.
#[derive(Debug, Clone)]
pub struct RegisterExpectation {
    pub endpoint: Field<String>,
    pub lifetime: Field<Option<u32>>,
    pub version: Field<String>,
    /// Links the payload must list, in order.
    pub links: Field<Vec<String>>,
    /// Location-Path of the 2.01 reply; no reply is sent when `None`.
    pub location: Option<String>,
}

impl Default for RegisterExpectation {
    fn default() -> Self {
        Self {
            endpoint: Field::Any,
            lifetime: Field::Any,
            version: Field::Any,
            links: Field::Any,
            location: Some(DEMO_LOCATION.to_string()),
        }
    }
}

impl RegisterExpectation {
    #[must_use]
    pub fn with_location(mut self, location: &str) -> Self {
        self.location = Some(location.to_string());
        self
    }

    #[must_use]
    pub fn without_reply(mut self) -> Self {
        self.location = None;
        self
    }

    #[must_use]
    pub fn with_lifetime(mut self, lifetime: Option<u32>) -> Self {
        self.lifetime = Field::Is(lifetime);
        self
    }

    #[must_use]
    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = Field::Is(endpoint.to_string());
        self
    }
}

fn link_targets(msg: &Message) -> Result<Vec<String>> {
    Ok(parse_links(&msg.payload)?
        .into_iter()
        .map(|Link { target, .. }| target)
        .collect())
}

/// Expects a Register matching `expectation` and replies 2.01 Created.
pub async fn assert_demo_registers(
    server: &mut MockServer,
    expectation: &RegisterExpectation,
    deadline: Deadline,
) -> Result<Lwm2mMessage> {
    let register = expect_message(server, MessageKind::Register, deadline).await?;
    let params = RegistrationParams::from_message(&register)?;

    let mut failures = Vec::new();
    expectation.endpoint.check(
        "endpoint",
        &params.endpoint.clone().unwrap_or_default(),
        &mut failures,
    );
    expectation.lifetime.check("lifetime", &params.lifetime, &mut failures);
    expectation.version.check(
        "version",
        &params.version.clone().unwrap_or_default(),
        &mut failures,
    );
    if let Field::Is(_) = expectation.links {
        expectation
            .links
            .check("links", &link_targets(&register)?, &mut failures);
    }
    if !failures.is_empty() {
        return Err(HarnessError::assertion(format!(
            "unexpected Register:\n  {}\nactual: {register}",
            failures.join("\n  ")
        )));
    }

    if let Some(location) = &expectation.location {
        server
            .send(Lwm2mMessage::created_matching(&register, Some(location.as_str())))
            .await?;
    }
    Ok(register)
}

/// Expects an Update to the current registration and replies with
/// `respond_with` (normally 2.04 Changed).
pub async fn assert_demo_updates_registration(
    server: &mut MockServer,
    lifetime: Field<Option<u32>>,
    respond_with: Code,
    deadline: Deadline,
) -> Result<Lwm2mMessage> {
    let update = expect_message(server, MessageKind::Update, deadline).await?;
    if let Some(location) = server.registration().location() {
        if update.uri_path() != location {
            return Err(HarnessError::assertion(format!(
                "Update sent to {} instead of {location}",
                update.uri_path()
            )));
        }
    }
    let params = RegistrationParams::from_message(&update)?;
    let mut failures = Vec::new();
    lifetime.check("lifetime", &params.lifetime, &mut failures);
    if !failures.is_empty() {
        return Err(HarnessError::assertion(format!(
            "unexpected Update: {}; actual: {update}",
            failures.join(", ")
        )));
    }

    server.send(response_to(&update, respond_with)).await?;
    Ok(update)
}

/// Expects a Deregister of the current registration and replies 2.02.
pub async fn assert_demo_deregisters(server: &mut MockServer, deadline: Deadline) -> Result<Lwm2mMessage> {
    let deregister = expect_message(server, MessageKind::Deregister, deadline).await?;
    let location = server.registration().location().unwrap_or(DEMO_LOCATION);
    if deregister.uri_path() != location {
        return Err(HarnessError::assertion(format!(
            "Deregister sent to {} instead of {location}",
            deregister.uri_path()
        )));
    }
    server
        .send(Lwm2mMessage::deleted_matching(&deregister))
        .await?;
    Ok(deregister)
}

/// Expects a Request-Bootstrap and replies 2.04 Changed.
pub async fn assert_demo_requests_bootstrap(
    server: &mut MockServer,
    endpoint: Field<String>,
    deadline: Deadline,
) -> Result<Lwm2mMessage> {
    let request = expect_message(server, MessageKind::RequestBootstrap, deadline).await?;
    let mut failures = Vec::new();
    endpoint.check(
        "endpoint",
        &request.query_param("ep").unwrap_or_default(),
        &mut failures,
    );
    if !failures.is_empty() {
        return Err(HarnessError::assertion(format!(
            "unexpected Request-Bootstrap: {}",
            failures.join(", ")
        )));
    }
    server
        .send(Lwm2mMessage::changed_matching(&request))
        .await?;
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coap::ContentFormat;

    fn register() -> Lwm2mMessage {
        Lwm2mMessage::register("demo", Some(60), "1.1", &[Link::new("/1/0"), Link::new("/3/0")])
            .with_ids(42, Token::new(vec![1, 2]).unwrap())
    }

    #[test]
    fn test_exact_match() {
        let msg = register();
        assert!(assert_msg_equal(&Expected::message(&msg), &msg).is_ok());
    }

    #[test]
    fn test_any_fields_are_ignored() {
        let msg = register();
        let other = msg.clone().with_ids(43, Token::new(vec![9]).unwrap());
        let expected = Expected::message(&msg).any_message_id().any_token();
        assert!(assert_msg_equal(&expected, &other).is_ok());
        assert!(assert_msg_equal(&Expected::kind(MessageKind::Register), &other).is_ok());
    }

    #[test]
    fn test_mismatch_lists_fields() {
        let msg = register();
        let expected = Expected::kind(MessageKind::Update)
            .with_code(Code::PUT)
            .with_payload(b"x".to_vec());
        let err = assert_msg_equal(&expected, &msg).unwrap_err().to_string();
        assert!(err.contains("kind: expected Update, got Register"), "{err}");
        assert!(err.contains("code:"), "{err}");
        assert!(err.contains("payload:"), "{err}");
        assert!(err.contains("raw: "), "{err}");
    }

    #[test]
    fn test_option_order_is_normalized() {
        let a = Lwm2mMessage::from_coap(
            Message::new(MessageType::Confirmable, Code::GET, 1, Token::empty())
                .with_uri_path("/3/0")
                .with_accept(ContentFormat::TEXT),
        );
        let mut reversed = a.message().clone();
        reversed.options.reverse();
        let expected = Expected::message(&a);
        // Uri-Path segments keep their relative order, so only Accept moves
        let mut shuffled = a.message().clone();
        let accept = shuffled.options.pop().unwrap();
        shuffled.options.insert(0, accept);
        assert!(assert_msg_equal(&expected, &Lwm2mMessage::from_coap(shuffled)).is_ok());
        assert!(assert_msg_equal(&expected, &Lwm2mMessage::from_coap(reversed)).is_err());
    }

    #[test]
    fn test_link_targets() {
        assert_eq!(link_targets(&register()).unwrap(), vec!["/1/0", "/3/0"]);
    }
}
