//! CoAP message structure, header fields and typed option accessors.

use std::fmt;

use super::{
    options::{encode_uint, parse_options, write_options},
    BlockOption, CoapError, CoapOption, ContentFormat, OptionNumber, COAP_VERSION, HEADER_SIZE,
    MAX_TOKEN_LENGTH, PAYLOAD_MARKER,
};

/// Message type carried in the T header field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Confirmable = 0,
    NonConfirmable = 1,
    Acknowledgement = 2,
    Reset = 3,
}

impl MessageType {
    #[must_use]
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => MessageType::Confirmable,
            1 => MessageType::NonConfirmable,
            2 => MessageType::Acknowledgement,
            _ => MessageType::Reset,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MessageType::Confirmable => "CON",
            MessageType::NonConfirmable => "NON",
            MessageType::Acknowledgement => "ACK",
            MessageType::Reset => "RST",
        })
    }
}

/// Request method or response code, `class.detail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Code {
    pub class: u8,
    pub detail: u8,
}

impl Code {
    pub const EMPTY: Self = Self::new(0, 0);

    pub const GET: Self = Self::new(0, 1);
    pub const POST: Self = Self::new(0, 2);
    pub const PUT: Self = Self::new(0, 3);
    pub const DELETE: Self = Self::new(0, 4);
    pub const FETCH: Self = Self::new(0, 5);
    pub const PATCH: Self = Self::new(0, 6);
    pub const IPATCH: Self = Self::new(0, 7);

    pub const CREATED: Self = Self::new(2, 1);
    pub const DELETED: Self = Self::new(2, 2);
    pub const VALID: Self = Self::new(2, 3);
    pub const CHANGED: Self = Self::new(2, 4);
    pub const CONTENT: Self = Self::new(2, 5);
    pub const CONTINUE: Self = Self::new(2, 31);

    pub const BAD_REQUEST: Self = Self::new(4, 0);
    pub const UNAUTHORIZED: Self = Self::new(4, 1);
    pub const BAD_OPTION: Self = Self::new(4, 2);
    pub const FORBIDDEN: Self = Self::new(4, 3);
    pub const NOT_FOUND: Self = Self::new(4, 4);
    pub const METHOD_NOT_ALLOWED: Self = Self::new(4, 5);
    pub const NOT_ACCEPTABLE: Self = Self::new(4, 6);
    pub const REQUEST_ENTITY_INCOMPLETE: Self = Self::new(4, 8);
    pub const PRECONDITION_FAILED: Self = Self::new(4, 12);
    pub const REQUEST_ENTITY_TOO_LARGE: Self = Self::new(4, 13);
    pub const UNSUPPORTED_CONTENT_FORMAT: Self = Self::new(4, 15);

    pub const INTERNAL_SERVER_ERROR: Self = Self::new(5, 0);
    pub const NOT_IMPLEMENTED: Self = Self::new(5, 1);
    pub const SERVICE_UNAVAILABLE: Self = Self::new(5, 3);

    #[must_use]
    pub const fn new(class: u8, detail: u8) -> Self {
        Self { class, detail }
    }

    #[must_use]
    pub fn from_byte(byte: u8) -> Self {
        Self::new(byte >> 5, byte & 0x1F)
    }

    #[must_use]
    pub fn to_byte(self) -> u8 {
        (self.class << 5) | (self.detail & 0x1F)
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self == Self::EMPTY
    }

    #[must_use]
    pub fn is_request(self) -> bool {
        self.class == 0 && self.detail != 0
    }

    #[must_use]
    pub fn is_response(self) -> bool {
        self.class >= 2
    }

    #[must_use]
    pub fn is_success(self) -> bool {
        self.class == 2
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        self.class == 4 || self.class == 5
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Code::EMPTY => return f.write_str("EMPTY"),
            Code::GET => return f.write_str("GET"),
            Code::POST => return f.write_str("POST"),
            Code::PUT => return f.write_str("PUT"),
            Code::DELETE => return f.write_str("DELETE"),
            Code::FETCH => return f.write_str("FETCH"),
            Code::PATCH => return f.write_str("PATCH"),
            Code::IPATCH => return f.write_str("iPATCH"),
            Code::CREATED => "Created",
            Code::DELETED => "Deleted",
            Code::VALID => "Valid",
            Code::CHANGED => "Changed",
            Code::CONTENT => "Content",
            Code::CONTINUE => "Continue",
            Code::BAD_REQUEST => "Bad Request",
            Code::UNAUTHORIZED => "Unauthorized",
            Code::BAD_OPTION => "Bad Option",
            Code::FORBIDDEN => "Forbidden",
            Code::NOT_FOUND => "Not Found",
            Code::METHOD_NOT_ALLOWED => "Method Not Allowed",
            Code::NOT_ACCEPTABLE => "Not Acceptable",
            Code::REQUEST_ENTITY_INCOMPLETE => "Request Entity Incomplete",
            Code::PRECONDITION_FAILED => "Precondition Failed",
            Code::REQUEST_ENTITY_TOO_LARGE => "Request Entity Too Large",
            Code::UNSUPPORTED_CONTENT_FORMAT => "Unsupported Content-Format",
            Code::INTERNAL_SERVER_ERROR => "Internal Server Error",
            Code::NOT_IMPLEMENTED => "Not Implemented",
            Code::SERVICE_UNAVAILABLE => "Service Unavailable",
            _ => return write!(f, "{}.{:02}", self.class, self.detail),
        };
        write!(f, "{}.{:02} {}", self.class, self.detail, name)
    }
}

/// Message token, 0 to 8 opaque bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Token(Vec<u8>);

impl Token {
    /// # Errors
    /// Returns `CoapError::TokenTooLong` for more than 8 bytes.
    pub fn new(bytes: Vec<u8>) -> Result<Self, CoapError> {
        if bytes.len() > MAX_TOKEN_LENGTH {
            return Err(CoapError::TokenTooLong(bytes.len()));
        }
        Ok(Self(bytes))
    }

    #[must_use]
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("-")
        } else {
            f.write_str(&hex::encode(&self.0))
        }
    }
}

/// A CoAP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: MessageType,
    pub code: Code,
    pub message_id: u16,
    pub token: Token,
    pub options: Vec<CoapOption>,
    pub payload: Vec<u8>,
}

impl Message {
    #[must_use]
    pub fn new(msg_type: MessageType, code: Code, message_id: u16, token: Token) -> Self {
        Self {
            msg_type,
            code,
            message_id,
            token,
            options: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// Empty ACK for `message_id`.
    #[must_use]
    pub fn empty_ack(message_id: u16) -> Self {
        Self::new(
            MessageType::Acknowledgement,
            Code::EMPTY,
            message_id,
            Token::empty(),
        )
    }

    /// Reset for `message_id`.
    #[must_use]
    pub fn reset(message_id: u16) -> Self {
        Self::new(MessageType::Reset, Code::EMPTY, message_id, Token::empty())
    }

    /// Serializes the message to wire format.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.wire_size_hint());
        self.write_to(&mut buf);
        buf
    }

    /// Appends the wire format to `buf`.
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        let tkl = self.token.as_bytes().len() as u8;
        buf.push((COAP_VERSION << 6) | ((self.msg_type as u8) << 4) | tkl);
        buf.push(self.code.to_byte());
        buf.extend_from_slice(&self.message_id.to_be_bytes());
        buf.extend_from_slice(self.token.as_bytes());
        write_options(&self.options, buf);
        if !self.payload.is_empty() {
            buf.push(PAYLOAD_MARKER);
            buf.extend_from_slice(&self.payload);
        }
    }

    fn wire_size_hint(&self) -> usize {
        HEADER_SIZE
            + self.token.as_bytes().len()
            + self
                .options
                .iter()
                .map(|o| o.value.len() + 5)
                .sum::<usize>()
            + self.payload.len()
            + 1
    }

    /// Parses a datagram into a message.
    ///
    /// # Errors
    /// Returns `CoapError::MalformedMessage` when the header, token or options are
    /// invalid, or when a payload marker is followed by no payload.
    pub fn decode(buf: &[u8]) -> Result<Self, CoapError> {
        if buf.len() < HEADER_SIZE {
            return Err(CoapError::malformed(format!(
                "datagram of {} bytes is shorter than the {HEADER_SIZE}-byte header",
                buf.len()
            )));
        }

        let version = buf[0] >> 6;
        if version != COAP_VERSION {
            return Err(CoapError::malformed(format!("unsupported version {version}")));
        }
        let msg_type = MessageType::from_bits(buf[0] >> 4);
        let tkl = usize::from(buf[0] & 0x0F);
        if tkl > MAX_TOKEN_LENGTH {
            return Err(CoapError::malformed(format!("token length {tkl} > 8")));
        }
        let code = Code::from_byte(buf[1]);
        let message_id = u16::from_be_bytes([buf[2], buf[3]]);

        let token_end = HEADER_SIZE + tkl;
        if buf.len() < token_end {
            return Err(CoapError::malformed("truncated token"));
        }
        let token = Token(buf[HEADER_SIZE..token_end].to_vec());

        let (options, consumed) = parse_options(&buf[token_end..])?;
        let mut pos = token_end + consumed;

        let payload = if pos < buf.len() {
            // parse_options stops only at the marker
            pos += 1;
            if pos == buf.len() {
                return Err(CoapError::malformed("payload marker without payload"));
            }
            buf[pos..].to_vec()
        } else {
            Vec::new()
        };

        if code.is_empty() && (tkl != 0 || !options.is_empty() || !payload.is_empty()) {
            return Err(CoapError::malformed(
                "empty message with token, options or payload",
            ));
        }

        Ok(Self {
            msg_type,
            code,
            message_id,
            token,
            options,
            payload,
        })
    }

    /// Like [`Message::decode`], but also rejects unknown critical options.
    ///
    /// # Errors
    /// Returns `CoapError::UnsupportedOption` for the first unknown critical option.
    pub fn decode_strict(buf: &[u8]) -> Result<Self, CoapError> {
        let msg = Self::decode(buf)?;
        if let Some(opt) = msg
            .options
            .iter()
            .find(|o| o.number.is_critical() && !o.number.is_known())
        {
            return Err(CoapError::UnsupportedOption(opt.number.0));
        }
        Ok(msg)
    }

    /// Inserts an option after every option with a number not greater than
    /// its own, so `options` stays in wire order and repeated options keep
    /// their insertion order.
    pub fn add_option(&mut self, option: CoapOption) {
        let at = self.options.partition_point(|o| o.number <= option.number);
        self.options.insert(at, option);
    }

    /// Replaces all instances of the option with a single value.
    pub fn set_option(&mut self, option: CoapOption) {
        self.remove_option(option.number);
        self.add_option(option);
    }

    pub fn remove_option(&mut self, number: OptionNumber) {
        self.options.retain(|o| o.number != number);
    }

    /// All instances of `number` in order.
    pub fn options_of(&self, number: OptionNumber) -> impl Iterator<Item = &CoapOption> {
        self.options.iter().filter(move |o| o.number == number)
    }

    #[must_use]
    pub fn option(&self, number: OptionNumber) -> Option<&CoapOption> {
        self.options_of(number).next()
    }

    fn joined(&self, number: OptionNumber) -> String {
        let segments: Vec<String> = self.options_of(number).map(CoapOption::as_string).collect();
        format!("/{}", segments.join("/"))
    }

    /// Uri-Path segments joined with `/`, with a leading `/`.
    #[must_use]
    pub fn uri_path(&self) -> String {
        self.joined(OptionNumber::URI_PATH)
    }

    #[must_use]
    pub fn uri_path_segments(&self) -> Vec<String> {
        self.options_of(OptionNumber::URI_PATH)
            .map(CoapOption::as_string)
            .collect()
    }

    #[must_use]
    pub fn uri_query(&self) -> Vec<String> {
        self.options_of(OptionNumber::URI_QUERY)
            .map(CoapOption::as_string)
            .collect()
    }

    /// Value of a `key=value` query parameter.
    #[must_use]
    pub fn query_param(&self, key: &str) -> Option<String> {
        self.uri_query().into_iter().find_map(|q| {
            let (k, v) = q.split_once('=').unwrap_or((q.as_str(), ""));
            (k == key).then(|| v.to_string())
        })
    }

    /// Location-Path segments joined with `/`, with a leading `/`.
    #[must_use]
    pub fn location_path(&self) -> String {
        self.joined(OptionNumber::LOCATION_PATH)
    }

    fn uint_option(&self, number: OptionNumber) -> Result<Option<u32>, CoapError> {
        self.option(number).map(CoapOption::as_uint).transpose()
    }

    /// # Errors
    /// Returns an error when the option value is longer than 4 bytes.
    pub fn content_format(&self) -> Result<Option<ContentFormat>, CoapError> {
        Ok(self
            .uint_option(OptionNumber::CONTENT_FORMAT)?
            .map(|v| ContentFormat(v as u16)))
    }

    /// # Errors
    /// Returns an error when the option value is longer than 4 bytes.
    pub fn accept(&self) -> Result<Option<ContentFormat>, CoapError> {
        Ok(self
            .uint_option(OptionNumber::ACCEPT)?
            .map(|v| ContentFormat(v as u16)))
    }

    /// # Errors
    /// Returns an error when the option value is longer than 4 bytes.
    pub fn observe(&self) -> Result<Option<u32>, CoapError> {
        self.uint_option(OptionNumber::OBSERVE)
    }

    #[must_use]
    pub fn etag(&self) -> Option<&[u8]> {
        self.option(OptionNumber::ETAG).map(|o| o.value.as_slice())
    }

    #[must_use]
    pub fn if_none_match(&self) -> bool {
        self.option(OptionNumber::IF_NONE_MATCH).is_some()
    }

    fn block(&self, number: OptionNumber) -> Result<Option<BlockOption>, CoapError> {
        self.uint_option(number)?
            .map(BlockOption::from_value)
            .transpose()
    }

    /// # Errors
    /// Returns an error for malformed Block1 values.
    pub fn block1(&self) -> Result<Option<BlockOption>, CoapError> {
        self.block(OptionNumber::BLOCK1)
    }

    /// # Errors
    /// Returns an error for malformed Block2 values.
    pub fn block2(&self) -> Result<Option<BlockOption>, CoapError> {
        self.block(OptionNumber::BLOCK2)
    }

    // builder helpers

    #[must_use]
    pub fn with_uri_path(mut self, path: &str) -> Self {
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            self.add_option(CoapOption::string(OptionNumber::URI_PATH, segment));
        }
        self
    }

    #[must_use]
    pub fn with_uri_query(mut self, query: &str) -> Self {
        self.add_option(CoapOption::string(OptionNumber::URI_QUERY, query));
        self
    }

    #[must_use]
    pub fn with_location_path(mut self, path: &str) -> Self {
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            self.add_option(CoapOption::string(OptionNumber::LOCATION_PATH, segment));
        }
        self
    }

    #[must_use]
    pub fn with_content_format(mut self, format: ContentFormat) -> Self {
        self.set_option(CoapOption::uint(
            OptionNumber::CONTENT_FORMAT,
            u32::from(format.0),
        ));
        self
    }

    #[must_use]
    pub fn with_accept(mut self, format: ContentFormat) -> Self {
        self.set_option(CoapOption::uint(OptionNumber::ACCEPT, u32::from(format.0)));
        self
    }

    #[must_use]
    pub fn with_observe(mut self, value: u32) -> Self {
        self.set_option(CoapOption::new(OptionNumber::OBSERVE, encode_uint(value)));
        self
    }

    #[must_use]
    pub fn with_etag(mut self, etag: &[u8]) -> Self {
        self.set_option(CoapOption::new(OptionNumber::ETAG, etag.to_vec()));
        self
    }

    #[must_use]
    pub fn with_block1(mut self, block: BlockOption) -> Self {
        self.set_option(CoapOption::uint(OptionNumber::BLOCK1, block.to_value()));
        self
    }

    #[must_use]
    pub fn with_block2(mut self, block: BlockOption) -> Self {
        self.set_option(CoapOption::uint(OptionNumber::BLOCK2, block.to_value()));
        self
    }

    #[must_use]
    pub fn with_option(mut self, option: CoapOption) -> Self {
        self.add_option(option);
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}, id={}, token={}",
            self.msg_type, self.code, self.message_id, self.token
        )?;
        if !self.options.is_empty() {
            let opts: Vec<String> = self.options.iter().map(ToString::to_string).collect();
            write!(f, ", options=[{}]", opts.join(", "))?;
        }
        if !self.payload.is_empty() {
            write!(f, ", payload={} bytes", self.payload.len())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register_request() -> Message {
        Message::new(
            MessageType::Confirmable,
            Code::POST,
            0x1234,
            Token::new(vec![1, 2, 3, 4]).unwrap(),
        )
        .with_uri_path("/rd")
        .with_uri_query("lwm2m=1.0")
        .with_uri_query("ep=urn:dev:os:0023C7-000001")
        .with_uri_query("lt=86400")
        .with_content_format(ContentFormat::LINK_FORMAT)
        .with_payload(b"</1/1>,</3/0>".to_vec())
    }

    #[test]
    fn test_encode_header_layout() {
        let encoded = register_request().encode();
        assert_eq!(encoded[0], 0x44); // ver 1, CON, TKL 4
        assert_eq!(encoded[1], 0x02);
        assert_eq!(&encoded[2..4], &[0x12, 0x34]);
        assert_eq!(&encoded[4..8], &[1, 2, 3, 4]);
        assert_eq!(encoded[8], 0xB2); // Uri-Path "rd"
        assert!(encoded.contains(&PAYLOAD_MARKER));
    }

    #[test]
    fn test_decode_restores_fields() {
        let original = register_request();
        let decoded = Message::decode(&original.encode()).unwrap();
        assert_eq!(decoded.uri_path(), "/rd");
        assert_eq!(decoded.query_param("ep").as_deref(), Some("urn:dev:os:0023C7-000001"));
        assert_eq!(decoded.query_param("lt").as_deref(), Some("86400"));
        assert_eq!(
            decoded.content_format().unwrap(),
            Some(ContentFormat::LINK_FORMAT)
        );
        assert_eq!(decoded.payload, b"</1/1>,</3/0>");
    }

    #[test]
    fn test_decode_of_encode_is_identity() {
        let original = register_request();
        assert_eq!(Message::decode(&original.encode()).unwrap(), original);

        let notify = Message::new(MessageType::NonConfirmable, Code::CONTENT, 9, Token::new(vec![7]).unwrap())
            .with_content_format(ContentFormat::SENML_JSON)
            .with_observe(3)
            .with_etag(&[0xAB, 0xCD])
            .with_block2(BlockOption::new(1, true, 64).unwrap())
            .with_payload(b"[]".to_vec());
        assert_eq!(Message::decode(&notify.encode()).unwrap(), notify);

        let ping = Message::new(MessageType::Confirmable, Code::EMPTY, 3, Token::empty());
        assert_eq!(Message::decode(&ping.encode()).unwrap(), ping);
    }

    #[test]
    fn test_options_kept_in_wire_order() {
        let msg = Message::new(MessageType::Confirmable, Code::POST, 1, Token::empty())
            .with_uri_query("ep=x")
            .with_content_format(ContentFormat::LINK_FORMAT)
            .with_uri_path("/rd/5a3f");
        let numbers: Vec<u16> = msg.options.iter().map(|o| o.number.0).collect();
        assert_eq!(numbers, vec![11, 11, 12, 15]);
        assert_eq!(msg.uri_path(), "/rd/5a3f");
    }

    #[test]
    fn test_empty_ack_is_four_bytes() {
        let ack = Message::empty_ack(7).encode();
        assert_eq!(ack, vec![0x60, 0x00, 0x00, 0x07]);
        let decoded = Message::decode(&ack).unwrap();
        assert_eq!(decoded.msg_type, MessageType::Acknowledgement);
        assert!(decoded.code.is_empty());
    }

    #[test]
    fn test_decode_rejects_bad_headers() {
        assert!(Message::decode(&[0x40, 0x01, 0x00]).is_err());
        // version 2
        assert!(Message::decode(&[0x80, 0x01, 0x00, 0x01]).is_err());
        // TKL 9
        assert!(Message::decode(&[0x49, 0x01, 0x00, 0x01]).is_err());
        // token truncated
        assert!(Message::decode(&[0x44, 0x01, 0x00, 0x01, 0xAA]).is_err());
        // marker without payload
        assert!(Message::decode(&[0x40, 0x01, 0x00, 0x01, 0xFF]).is_err());
        // empty code carrying a token
        assert!(Message::decode(&[0x61, 0x00, 0x00, 0x01, 0xAA]).is_err());
    }

    #[test]
    fn test_strict_decode_rejects_unknown_critical() {
        let msg = Message::new(MessageType::Confirmable, Code::GET, 1, Token::empty())
            .with_option(CoapOption::new(OptionNumber(65001), vec![1]));
        let encoded = msg.encode();
        assert!(Message::decode(&encoded).is_ok());
        assert_eq!(
            Message::decode_strict(&encoded),
            Err(CoapError::UnsupportedOption(65001))
        );

        // elective unknown options are tolerated
        let elective = Message::new(MessageType::Confirmable, Code::GET, 1, Token::empty())
            .with_option(CoapOption::new(OptionNumber(65000), vec![1]));
        assert!(Message::decode_strict(&elective.encode()).is_ok());
    }

    #[test]
    fn test_block_accessors() {
        let msg = Message::new(MessageType::Confirmable, Code::GET, 1, Token::empty())
            .with_block2(BlockOption::new(5, false, 256).unwrap());
        let decoded = Message::decode(&msg.encode()).unwrap();
        let block = decoded.block2().unwrap().unwrap();
        assert_eq!(block.seq_num, 5);
        assert_eq!(block.size, 256);
        assert_eq!(decoded.block1().unwrap(), None);
    }

    #[test]
    fn test_code_display() {
        assert_eq!(Code::CONTENT.to_string(), "2.05 Content");
        assert_eq!(Code::NOT_FOUND.to_string(), "4.04 Not Found");
        assert_eq!(Code::new(2, 7).to_string(), "2.07");
        assert_eq!(Code::GET.to_string(), "GET");
        assert_eq!(Code::from_byte(0x45), Code::CONTENT);
    }

    #[test]
    fn test_message_display_summary() {
        let text = register_request().to_string();
        assert!(text.starts_with("CON POST, id=4660, token=01020304"));
        assert!(text.contains("Uri-Path: rd"));
        assert!(text.contains("payload=13 bytes"));
    }
}
