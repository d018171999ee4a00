//! Typed LwM2M messages on top of the CoAP codec.
//!
//! Every received datagram is classified into one [`Lwm2mMessage`] variant by
//! inspecting its type, code, Uri-Path and a few options:
//!
//! | Variant            | Recognized by                                  |
//! |--------------------|------------------------------------------------|
//! | `Register`         | POST `/rd`                                     |
//! | `Update`           | POST `/rd/...`                                 |
//! | `Deregister`       | DELETE `/rd/...`                               |
//! | `RequestBootstrap` | POST `/bs` with `ep=`                          |
//! | `BootstrapFinish`  | POST `/bs` without `ep=`                       |
//! | `Send`             | POST `/dp`                                     |
//! | `Observe`          | GET or FETCH with Observe 0                    |
//! | `CancelObserve`    | GET or FETCH with Observe 1                    |
//! | `Discover`         | GET with Accept: application/link-format       |
//! | `Notify`           | non-ACK 2.05 with Observe                      |
//!
//! Responses are built with the `*_matching(request)` constructors, which
//! piggy-back on the request's message ID (ACK for CON) or reuse the token on
//! a fresh NON.

use std::fmt;

use crate::{
    coap::{
        BlockOption, Code, CoapError, CoapOption, ContentFormat, Message, MessageType,
        OptionNumber, Token,
    },
    link_format::{format_links, Link},
    path::Lwm2mPath,
};

/// LwM2M enabler version sent in Register.
pub const DEFAULT_LWM2M_VERSION: &str = "1.1";

macro_rules! lwm2m_messages {
    ($($variant:ident),+ $(,)?) => {
        /// A CoAP message classified as an LwM2M operation or response.
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub enum Lwm2mMessage {
            $($variant(Message),)+
        }

        /// Variant tag of an [`Lwm2mMessage`], used in assertions.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum MessageKind {
            $($variant,)+
        }

        impl Lwm2mMessage {
            #[must_use]
            pub fn kind(&self) -> MessageKind {
                match self {
                    $(Self::$variant(_) => MessageKind::$variant,)+
                }
            }

            /// The underlying CoAP message.
            #[must_use]
            pub fn message(&self) -> &Message {
                match self {
                    $(Self::$variant(m) => m,)+
                }
            }

            pub fn message_mut(&mut self) -> &mut Message {
                match self {
                    $(Self::$variant(m) => m,)+
                }
            }

            #[must_use]
            pub fn into_message(self) -> Message {
                match self {
                    $(Self::$variant(m) => m,)+
                }
            }
        }

        impl MessageKind {
            #[must_use]
            pub fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => stringify!($variant),)+
                }
            }
        }
    };
}

lwm2m_messages!(
    Register,
    Update,
    Deregister,
    RequestBootstrap,
    BootstrapFinish,
    Read,
    Write,
    WriteAttributes,
    Execute,
    Delete,
    Discover,
    Observe,
    CancelObserve,
    Notify,
    Create,
    ReadComposite,
    WriteComposite,
    ObserveComposite,
    Send,
    Created,
    Changed,
    Continue,
    Content,
    Deleted,
    Valid,
    ErrorResponse,
    Empty,
    Ping,
    Reset,
    Other,
);

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for Lwm2mMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind(), self.message())
    }
}

impl std::ops::Deref for Lwm2mMessage {
    type Target = Message;

    fn deref(&self) -> &Message {
        self.message()
    }
}

impl From<Lwm2mMessage> for Message {
    fn from(msg: Lwm2mMessage) -> Self {
        msg.into_message()
    }
}

impl Lwm2mMessage {
    /// Decodes and classifies a datagram.
    ///
    /// # Errors
    /// Returns `CoapError::MalformedMessage` for invalid CoAP.
    pub fn decode(buf: &[u8]) -> Result<Self, CoapError> {
        Ok(Self::from_coap(Message::decode(buf)?))
    }

    /// Classifies a CoAP message.
    #[must_use]
    pub fn from_coap(msg: Message) -> Self {
        if msg.code.is_empty() {
            return match msg.msg_type {
                MessageType::Acknowledgement => Self::Empty(msg),
                MessageType::Reset => Self::Reset(msg),
                MessageType::Confirmable => Self::Ping(msg),
                MessageType::NonConfirmable => Self::Other(msg),
            };
        }
        if msg.code.is_request() {
            return Self::classify_request(msg);
        }
        if msg.code.is_error() {
            return Self::ErrorResponse(msg);
        }
        match msg.code {
            Code::CONTENT => {
                let observed = matches!(msg.observe(), Ok(Some(_)));
                if observed && msg.msg_type != MessageType::Acknowledgement {
                    Self::Notify(msg)
                } else {
                    Self::Content(msg)
                }
            }
            Code::CREATED => Self::Created(msg),
            Code::CHANGED => Self::Changed(msg),
            Code::CONTINUE => Self::Continue(msg),
            Code::DELETED => Self::Deleted(msg),
            Code::VALID => Self::Valid(msg),
            _ => Self::Other(msg),
        }
    }

    fn classify_request(msg: Message) -> Self {
        let segments = msg.uri_path_segments();
        let first = segments.first().map(String::as_str);
        let observe = msg.observe().ok().flatten();

        match msg.code {
            Code::POST => match (first, segments.len()) {
                (Some("rd"), 1) => Self::Register(msg),
                (Some("rd"), _) => Self::Update(msg),
                (Some("bs"), 1) if msg.query_param("ep").is_some() => Self::RequestBootstrap(msg),
                (Some("bs"), 1) => Self::BootstrapFinish(msg),
                (Some("dp"), 1) => Self::Send(msg),
                (_, 1) => Self::Create(msg),
                (_, 2) => Self::Write(msg),
                (_, 3) => Self::Execute(msg),
                _ => Self::Other(msg),
            },
            Code::DELETE if first == Some("rd") => Self::Deregister(msg),
            Code::DELETE => Self::Delete(msg),
            Code::GET => match observe {
                Some(0) => Self::Observe(msg),
                Some(1) => Self::CancelObserve(msg),
                _ if matches!(msg.accept(), Ok(Some(ContentFormat::LINK_FORMAT))) => {
                    Self::Discover(msg)
                }
                _ => Self::Read(msg),
            },
            Code::PUT if !msg.uri_query().is_empty() && msg.payload.is_empty() => {
                Self::WriteAttributes(msg)
            }
            Code::PUT => Self::Write(msg),
            Code::FETCH => match observe {
                Some(0) => Self::ObserveComposite(msg),
                Some(1) => Self::CancelObserve(msg),
                _ => Self::ReadComposite(msg),
            },
            Code::IPATCH => Self::WriteComposite(msg),
            _ => Self::Other(msg),
        }
    }

    /// True for request variants.
    #[must_use]
    pub fn is_request(&self) -> bool {
        self.code.is_request()
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        self.message().encode()
    }

    /// Replaces message ID and token.
    #[must_use]
    pub fn with_ids(mut self, message_id: u16, token: Token) -> Self {
        let msg = self.message_mut();
        msg.message_id = message_id;
        msg.token = token;
        self
    }

    #[must_use]
    pub fn with_type(mut self, msg_type: MessageType) -> Self {
        self.message_mut().msg_type = msg_type;
        self
    }
}

fn request(code: Code, path: &Lwm2mPath) -> Message {
    let mut msg = Message::new(MessageType::Confirmable, code, 0, Token::empty());
    for option in path.to_uri_path_options() {
        msg.add_option(option);
    }
    msg
}

/// Server-originated requests. Message ID and token are assigned when sent.
impl Lwm2mMessage {
    #[must_use]
    pub fn read(path: &Lwm2mPath, accept: Option<ContentFormat>) -> Self {
        let mut msg = request(Code::GET, path);
        if let Some(format) = accept {
            msg = msg.with_accept(format);
        }
        Self::Read(msg)
    }

    /// Write with PUT (replace) or POST (partial update).
    #[must_use]
    pub fn write(path: &Lwm2mPath, format: ContentFormat, payload: Vec<u8>, partial: bool) -> Self {
        let code = if partial { Code::POST } else { Code::PUT };
        Self::Write(
            request(code, path)
                .with_content_format(format)
                .with_payload(payload),
        )
    }

    /// Write-Attributes: PUT with one Uri-Query per attribute, e.g. `pmin=5`.
    #[must_use]
    pub fn write_attributes(path: &Lwm2mPath, attributes: &[(&str, &str)]) -> Self {
        let mut msg = request(Code::PUT, path);
        for (name, value) in attributes {
            msg = msg.with_uri_query(&format!("{name}={value}"));
        }
        Self::WriteAttributes(msg)
    }

    #[must_use]
    pub fn execute(path: &Lwm2mPath, arguments: Option<&str>) -> Self {
        let mut msg = request(Code::POST, path);
        if let Some(args) = arguments {
            msg = msg
                .with_content_format(ContentFormat::TEXT)
                .with_payload(args.as_bytes().to_vec());
        }
        Self::Execute(msg)
    }

    #[must_use]
    pub fn delete(path: &Lwm2mPath) -> Self {
        Self::Delete(request(Code::DELETE, path))
    }

    #[must_use]
    pub fn discover(path: &Lwm2mPath, depth: Option<u8>) -> Self {
        let mut msg = request(Code::GET, path).with_accept(ContentFormat::LINK_FORMAT);
        if let Some(depth) = depth {
            msg = msg.with_uri_query(&format!("depth={depth}"));
        }
        Self::Discover(msg)
    }

    #[must_use]
    pub fn create(path: &Lwm2mPath, format: ContentFormat, payload: Vec<u8>) -> Self {
        Self::Create(
            request(Code::POST, path)
                .with_content_format(format)
                .with_payload(payload),
        )
    }

    #[must_use]
    pub fn observe(path: &Lwm2mPath, accept: Option<ContentFormat>) -> Self {
        let mut msg = request(Code::GET, path).with_observe(0);
        if let Some(format) = accept {
            msg = msg.with_accept(format);
        }
        Self::Observe(msg)
    }

    /// Cancel-Observe reusing the token of the original Observe.
    #[must_use]
    pub fn cancel_observe(path: &Lwm2mPath, token: Token) -> Self {
        let mut msg = request(Code::GET, path).with_observe(1);
        msg.token = token;
        Self::CancelObserve(msg)
    }

    #[must_use]
    pub fn read_composite(format: ContentFormat, accept: ContentFormat, payload: Vec<u8>) -> Self {
        Self::ReadComposite(
            request(Code::FETCH, &Lwm2mPath::root())
                .with_content_format(format)
                .with_accept(accept)
                .with_payload(payload),
        )
    }

    #[must_use]
    pub fn observe_composite(format: ContentFormat, accept: ContentFormat, payload: Vec<u8>) -> Self {
        Self::ObserveComposite(
            request(Code::FETCH, &Lwm2mPath::root())
                .with_observe(0)
                .with_content_format(format)
                .with_accept(accept)
                .with_payload(payload),
        )
    }

    #[must_use]
    pub fn write_composite(format: ContentFormat, payload: Vec<u8>) -> Self {
        Self::WriteComposite(
            request(Code::IPATCH, &Lwm2mPath::root())
                .with_content_format(format)
                .with_payload(payload),
        )
    }

    /// Bootstrap-Finish, POST `/bs`.
    #[must_use]
    pub fn bootstrap_finish() -> Self {
        Self::BootstrapFinish(
            Message::new(MessageType::Confirmable, Code::POST, 0, Token::empty())
                .with_uri_path("/bs"),
        )
    }

    /// Empty CON, answered by the client with Reset.
    #[must_use]
    pub fn ping() -> Self {
        Self::Ping(Message::new(
            MessageType::Confirmable,
            Code::EMPTY,
            0,
            Token::empty(),
        ))
    }
}

/// Client-originated requests, used by fake clients in tests and to build
/// expected messages.
impl Lwm2mMessage {
    #[must_use]
    pub fn register(endpoint: &str, lifetime: Option<u32>, version: &str, links: &[Link]) -> Self {
        let mut msg = Message::new(MessageType::Confirmable, Code::POST, 0, Token::empty())
            .with_uri_path("/rd")
            .with_uri_query(&format!("lwm2m={version}"))
            .with_uri_query(&format!("ep={endpoint}"));
        if let Some(lt) = lifetime {
            msg = msg.with_uri_query(&format!("lt={lt}"));
        }
        Self::Register(
            msg.with_content_format(ContentFormat::LINK_FORMAT)
                .with_payload(format_links(links).into_bytes()),
        )
    }

    /// Update to the registration `location`, e.g. `/rd/demo`.
    #[must_use]
    pub fn update(location: &str, lifetime: Option<u32>, links: Option<&[Link]>) -> Self {
        let mut msg = Message::new(MessageType::Confirmable, Code::POST, 0, Token::empty())
            .with_uri_path(location);
        if let Some(lt) = lifetime {
            msg = msg.with_uri_query(&format!("lt={lt}"));
        }
        if let Some(links) = links {
            msg = msg
                .with_content_format(ContentFormat::LINK_FORMAT)
                .with_payload(format_links(links).into_bytes());
        }
        Self::Update(msg)
    }

    #[must_use]
    pub fn deregister(location: &str) -> Self {
        Self::Deregister(
            Message::new(MessageType::Confirmable, Code::DELETE, 0, Token::empty())
                .with_uri_path(location),
        )
    }

    #[must_use]
    pub fn request_bootstrap(endpoint: &str) -> Self {
        Self::RequestBootstrap(
            Message::new(MessageType::Confirmable, Code::POST, 0, Token::empty())
                .with_uri_path("/bs")
                .with_uri_query(&format!("ep={endpoint}")),
        )
    }

    /// LwM2M 1.1 Send, POST `/dp`.
    #[must_use]
    pub fn send(format: ContentFormat, payload: Vec<u8>) -> Self {
        Self::Send(
            Message::new(MessageType::Confirmable, Code::POST, 0, Token::empty())
                .with_uri_path("/dp")
                .with_content_format(format)
                .with_payload(payload),
        )
    }

    /// Notification for the observation identified by `token`.
    #[must_use]
    pub fn notify(
        token: Token,
        sequence: u32,
        confirmable: bool,
        format: ContentFormat,
        payload: Vec<u8>,
    ) -> Self {
        let msg_type = if confirmable {
            MessageType::Confirmable
        } else {
            MessageType::NonConfirmable
        };
        Self::Notify(
            Message::new(msg_type, Code::CONTENT, 0, token)
                .with_observe(sequence)
                .with_content_format(format)
                .with_payload(payload),
        )
    }
}

/// A response skeleton for `request`: piggy-backed ACK for CON, NON with the
/// same token otherwise (its message ID is assigned when sent).
#[must_use]
pub fn response_to(request: &Message, code: Code) -> Message {
    match request.msg_type {
        MessageType::Confirmable => Message::new(
            MessageType::Acknowledgement,
            code,
            request.message_id,
            request.token.clone(),
        ),
        _ => Message::new(MessageType::NonConfirmable, code, 0, request.token.clone()),
    }
}

/// Response constructors.
impl Lwm2mMessage {
    /// 2.01 Created, with Location-Path when given (Register, Create).
    #[must_use]
    pub fn created_matching(request: &Message, location: Option<&str>) -> Self {
        let mut msg = response_to(request, Code::CREATED);
        if let Some(location) = location {
            msg = msg.with_location_path(location);
        }
        Self::Created(msg)
    }

    #[must_use]
    pub fn changed_matching(request: &Message) -> Self {
        Self::Changed(response_to(request, Code::CHANGED))
    }

    #[must_use]
    pub fn deleted_matching(request: &Message) -> Self {
        Self::Deleted(response_to(request, Code::DELETED))
    }

    #[must_use]
    pub fn valid_matching(request: &Message, etag: &[u8]) -> Self {
        Self::Valid(response_to(request, Code::VALID).with_etag(etag))
    }

    /// 2.31 Continue acknowledging one Block1 fragment.
    #[must_use]
    pub fn continue_matching(request: &Message, block1: BlockOption) -> Self {
        Self::Continue(response_to(request, Code::CONTINUE).with_block1(block1))
    }

    #[must_use]
    pub fn content_matching(request: &Message, format: Option<ContentFormat>, payload: Vec<u8>) -> Self {
        let mut msg = response_to(request, Code::CONTENT);
        if let Some(format) = format {
            msg = msg.with_content_format(format);
        }
        Self::Content(msg.with_payload(payload))
    }

    #[must_use]
    pub fn error_matching(request: &Message, code: Code) -> Self {
        Self::ErrorResponse(response_to(request, code))
    }

    /// Empty ACK for a CON request or notification.
    #[must_use]
    pub fn empty_matching(request: &Message) -> Self {
        Self::Empty(Message::empty_ack(request.message_id))
    }

    #[must_use]
    pub fn reset_matching(request: &Message) -> Self {
        Self::Reset(Message::reset(request.message_id))
    }
}

/// Registration parameters carried by Register and Update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationParams {
    pub endpoint: Option<String>,
    pub lifetime: Option<u32>,
    pub version: Option<String>,
    pub binding: Option<String>,
    pub queue_mode: bool,
}

impl RegistrationParams {
    /// # Errors
    /// Returns `CoapError::InvalidOptionValue` if `lt=` is not a number.
    pub fn from_message(msg: &Message) -> Result<Self, CoapError> {
        let lifetime = msg
            .query_param("lt")
            .map(|lt| {
                lt.parse::<u32>().map_err(|_| CoapError::InvalidOptionValue {
                    number: OptionNumber::URI_QUERY.0,
                    reason: format!("lt={lt} is not a number"),
                })
            })
            .transpose()?;
        Ok(Self {
            endpoint: msg.query_param("ep"),
            lifetime,
            version: msg.query_param("lwm2m"),
            binding: msg.query_param("b"),
            queue_mode: msg.uri_query().iter().any(|q| q == "Q"),
        })
    }
}

/// Uri-Query option helper for tests building expected messages.
#[must_use]
pub fn query_option(query: &str) -> CoapOption {
    CoapOption::string(OptionNumber::URI_QUERY, query)
}
