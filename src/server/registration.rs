//! Client registration as observed by one mock server.
//!
//! ```text
//! Unregistered --Register--> Registering --2.01--> Registered
//! Registered --Update--> Updating --2.04--> Registered
//!                                 --4.xx--> Unregistered
//! Registered --Deregister--> Deregistering --2.02--> Unregistered
//! ```

use std::{fmt, time::Duration};

use crate::{
    coap::{Message, MessageType, Token},
    messages::{Lwm2mMessage, MessageKind, RegistrationParams},
    time::Deadline,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegistrationState {
    #[default]
    Unregistered,
    Registering,
    Registered,
    Updating,
    Deregistering,
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone)]
struct InFlight {
    kind: MessageKind,
    msg_type: MessageType,
    message_id: u16,
    token: Token,
    params: RegistrationParams,
}

/// Registration bookkeeping driven by messages passing through the server.
#[derive(Debug, Clone, Default)]
pub struct Registration {
    state: RegistrationState,
    endpoint: Option<String>,
    lifetime: Option<u32>,
    version: Option<String>,
    location: Option<String>,
    expires: Option<Deadline>,
    updates: u32,
    in_flight: Option<InFlight>,
}

impl Registration {
    #[must_use]
    pub fn state(&self) -> RegistrationState {
        self.state
    }

    #[must_use]
    pub fn is_registered(&self) -> bool {
        matches!(
            self.state,
            RegistrationState::Registered | RegistrationState::Updating
        )
    }

    #[must_use]
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    /// Lifetime in seconds from the last Register or Update carrying `lt=`.
    #[must_use]
    pub fn lifetime(&self) -> Option<u32> {
        self.lifetime
    }

    #[must_use]
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Location assigned in the 2.01 reply to Register, e.g. `/rd/demo`.
    #[must_use]
    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    /// When the registration expires unless refreshed by an Update.
    #[must_use]
    pub fn expires(&self) -> Option<Deadline> {
        self.expires
    }

    /// Number of successful Updates since the last Register.
    #[must_use]
    pub fn updates(&self) -> u32 {
        self.updates
    }

    /// Records a request received from the client.
    pub fn on_request(&mut self, msg: &Lwm2mMessage) {
        let next = match msg.kind() {
            MessageKind::Register => RegistrationState::Registering,
            MessageKind::Update => RegistrationState::Updating,
            MessageKind::Deregister => RegistrationState::Deregistering,
            _ => return,
        };
        let params = match RegistrationParams::from_message(msg) {
            Ok(params) => params,
            Err(e) => {
                log::warn!("Ignoring {} with bad parameters: {e}", msg.kind());
                return;
            }
        };
        log::debug!("Registration: {} -> {next}", self.state);
        self.state = next;
        self.in_flight = Some(InFlight {
            kind: msg.kind(),
            msg_type: msg.msg_type,
            message_id: msg.message_id,
            token: msg.token.clone(),
            params,
        });
    }

    /// Records a response sent by the server.
    pub fn on_response(&mut self, msg: &Message) {
        let Some(in_flight) = &self.in_flight else {
            return;
        };
        let piggybacked = msg.msg_type == MessageType::Acknowledgement
            && in_flight.msg_type == MessageType::Confirmable
            && msg.message_id == in_flight.message_id;
        let separate = msg.msg_type != MessageType::Acknowledgement && msg.token == in_flight.token;
        if !(piggybacked || separate) || msg.code.is_empty() {
            return;
        }
        let Some(in_flight) = self.in_flight.take() else {
            return;
        };

        let previous = self.state;
        let success = msg.code.is_success();
        match (in_flight.kind, success) {
            (MessageKind::Register, true) => {
                self.state = RegistrationState::Registered;
                self.endpoint = in_flight.params.endpoint;
                self.lifetime = in_flight.params.lifetime;
                self.version = in_flight.params.version;
                self.location = Some(msg.location_path());
                self.updates = 0;
                self.refresh_expiry();
            }
            (MessageKind::Update, true) => {
                self.state = RegistrationState::Registered;
                if in_flight.params.lifetime.is_some() {
                    self.lifetime = in_flight.params.lifetime;
                }
                self.updates += 1;
                self.refresh_expiry();
            }
            (MessageKind::Deregister, true) | (MessageKind::Register | MessageKind::Update, false) => {
                self.clear();
            }
            (MessageKind::Deregister, false) => self.state = RegistrationState::Registered,
            _ => {}
        }
        log::debug!("Registration: {previous} -> {} ({})", self.state, msg.code);
    }

    fn refresh_expiry(&mut self) {
        self.expires = self
            .lifetime
            .map(|lt| Deadline::after(Duration::from_secs(u64::from(lt))));
    }

    fn clear(&mut self) {
        self.state = RegistrationState::Unregistered;
        self.location = None;
        self.expires = None;
        self.in_flight = None;
    }

    /// Forgets everything, e.g. after the transport was reset.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{coap::Code, link_format::Link};

    fn with_ids(msg: Lwm2mMessage, id: u16) -> Lwm2mMessage {
        msg.with_ids(id, Token::new(vec![id as u8]).unwrap())
    }

    #[test]
    fn test_register_update_deregister() {
        let mut reg = Registration::default();
        let register = with_ids(
            Lwm2mMessage::register("demo", Some(5), "1.1", &[Link::new("/3/0")]),
            1,
        );
        reg.on_request(&register);
        assert_eq!(reg.state(), RegistrationState::Registering);

        reg.on_response(&Lwm2mMessage::created_matching(&register, Some("/rd/demo")));
        assert_eq!(reg.state(), RegistrationState::Registered);
        assert_eq!(reg.location(), Some("/rd/demo"));
        assert_eq!(reg.endpoint(), Some("demo"));
        assert_eq!(reg.lifetime(), Some(5));
        assert!(reg.expires().is_some());

        let update = with_ids(Lwm2mMessage::update("/rd/demo", Some(10), None), 2);
        reg.on_request(&update);
        assert_eq!(reg.state(), RegistrationState::Updating);
        assert!(reg.is_registered());
        reg.on_response(&Lwm2mMessage::changed_matching(&update));
        assert_eq!(reg.state(), RegistrationState::Registered);
        assert_eq!(reg.lifetime(), Some(10));
        assert_eq!(reg.updates(), 1);

        let deregister = with_ids(Lwm2mMessage::deregister("/rd/demo"), 3);
        reg.on_request(&deregister);
        assert_eq!(reg.state(), RegistrationState::Deregistering);
        reg.on_response(&Lwm2mMessage::deleted_matching(&deregister));
        assert_eq!(reg.state(), RegistrationState::Unregistered);
        assert_eq!(reg.location(), None);
    }

    #[test]
    fn test_update_rejected_forces_unregistered() {
        let mut reg = Registration::default();
        let register = with_ids(Lwm2mMessage::register("demo", None, "1.1", &[]), 1);
        reg.on_request(&register);
        reg.on_response(&Lwm2mMessage::created_matching(&register, Some("/rd/demo")));

        let update = with_ids(Lwm2mMessage::update("/rd/demo", None, None), 2);
        reg.on_request(&update);
        // a response to some other request does not complete the Update
        reg.on_response(&Message::empty_ack(2));
        assert_eq!(reg.state(), RegistrationState::Updating);
        reg.on_response(&Lwm2mMessage::error_matching(&update, Code::NOT_FOUND));
        assert_eq!(reg.state(), RegistrationState::Unregistered);
    }
}
