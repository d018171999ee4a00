//! Device-management and bootstrap operations issued by a mock server.
//!
//! Every operation is a free function taking the server first. By default the
//! response must be a 2.xx; with [`DmOptions::expecting`] the response code
//! must equal the given one instead. Successful payloads are decoded according
//! to their Content-Format.

use std::{fmt, time::Duration};

use crate::{
    coap::{BlockOption, Code, CoapOption, ContentFormat, Token},
    error::{HarnessError, Result},
    link_format::{parse_links, Link},
    messages::{Lwm2mMessage, MessageKind},
    path::{Lwm2mPath, PathLevel},
    senml::{self, SenmlRecord},
    server::MockServer,
    time::Deadline,
    tlv::{self, Tlv},
};

/// Time allowed for one operation unless overridden.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-call options shared by all operations.
#[derive(Debug, Clone, Default)]
pub struct DmOptions {
    /// Content-Format of the request payload.
    pub format: Option<ContentFormat>,
    /// Accept option of the request.
    pub accept: Option<ContentFormat>,
    /// Required response code; any 2.xx when unset.
    pub expect_error_code: Option<Code>,
    /// Write with POST (partial update) instead of PUT.
    pub partial: bool,
    pub deadline: Option<Deadline>,
    pub extra_options: Vec<CoapOption>,
}

impl DmOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_format(mut self, format: ContentFormat) -> Self {
        self.format = Some(format);
        self
    }

    #[must_use]
    pub fn with_accept(mut self, accept: ContentFormat) -> Self {
        self.accept = Some(accept);
        self
    }

    #[must_use]
    pub fn expecting(mut self, code: Code) -> Self {
        self.expect_error_code = Some(code);
        self
    }

    #[must_use]
    pub fn partial(mut self) -> Self {
        self.partial = true;
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[must_use]
    pub fn with_option(mut self, option: CoapOption) -> Self {
        self.extra_options.push(option);
        self
    }

    fn deadline(&self) -> Deadline {
        self.deadline
            .unwrap_or_else(|| Deadline::after(DEFAULT_TIMEOUT))
    }
}

/// Decoded response payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Empty,
    Text(String),
    Opaque(Vec<u8>),
    Tlv(Vec<Tlv>),
    Senml(Vec<SenmlRecord>),
    Links(Vec<Link>),
    /// A format this harness does not decode.
    Raw { format: ContentFormat, data: Vec<u8> },
}

impl Payload {
    /// Decodes `data` according to `format`; no format means plain text.
    ///
    /// # Errors
    /// Returns an assertion failure carrying the raw bytes when the payload
    /// does not match its format.
    pub fn decode(format: Option<ContentFormat>, data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Ok(Self::Empty);
        }
        let format = format.unwrap_or(ContentFormat::TEXT);
        let decoded = match format {
            ContentFormat::TEXT => String::from_utf8(data.to_vec())
                .map(Self::Text)
                .map_err(|e| e.to_string()),
            ContentFormat::OPAQUE => Ok(Self::Opaque(data.to_vec())),
            ContentFormat::LINK_FORMAT => parse_links(data).map(Self::Links).map_err(|e| e.to_string()),
            f if f.is_tlv() => tlv::parse_all(data).map(Self::Tlv).map_err(|e| e.to_string()),
            f if f.is_senml() => senml::decode(data, f)
                .map(Self::Senml)
                .map_err(|e| e.to_string()),
            _ => Ok(Self::Raw {
                format,
                data: data.to_vec(),
            }),
        };
        decoded.map_err(|e| {
            HarnessError::assertion(format!(
                "cannot decode {format} payload {}: {e}",
                hex::encode(data)
            ))
        })
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_tlv(&self) -> Option<&[Tlv]> {
        match self {
            Self::Tlv(nodes) => Some(nodes),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_senml(&self) -> Option<&[SenmlRecord]> {
        match self {
            Self::Senml(records) => Some(records),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_links(&self) -> Option<&[Link]> {
        match self {
            Self::Links(links) => Some(links),
            _ => None,
        }
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("<empty>"),
            Self::Text(text) => write!(f, "{text:?}"),
            Self::Opaque(data) | Self::Raw { data, .. } => f.write_str(&hex::encode(data)),
            Self::Tlv(nodes) => nodes.iter().try_for_each(|n| write!(f, "{n}")),
            Self::Senml(records) => write!(f, "{records:?}"),
            Self::Links(links) => f.write_str(&crate::link_format::format_links(links)),
        }
    }
}

/// A response together with its decoded payload.
#[derive(Debug, Clone)]
pub struct DmResponse {
    pub message: Lwm2mMessage,
    pub payload: Payload,
}

impl DmResponse {
    #[must_use]
    pub fn code(&self) -> Code {
        self.message.code
    }

    /// Token of the exchange, which identifies an observation.
    #[must_use]
    pub fn token(&self) -> &Token {
        &self.message.token
    }
}

/// Checks the response code against the expectation.
///
/// # Errors
/// `UnexpectedMessage` for a Reset or an empty message, `UnexpectedCode`
/// otherwise.
pub fn check_response(response: &Lwm2mMessage, expected: Option<Code>) -> Result<()> {
    if matches!(response.kind(), MessageKind::Reset | MessageKind::Empty) {
        return Err(HarnessError::UnexpectedMessage {
            expected: "response".into(),
            actual: response.to_string(),
        });
    }
    match expected {
        Some(code) if response.code != code => Err(HarnessError::UnexpectedCode {
            expected: code,
            actual: response.code,
        }),
        None if !response.code.is_success() => Err(HarnessError::assertion(format!(
            "expected a 2.xx response, got {response}"
        ))),
        _ => Ok(()),
    }
}

async fn exchange(server: &mut MockServer, mut request: Lwm2mMessage, opts: &DmOptions) -> Result<Lwm2mMessage> {
    for option in &opts.extra_options {
        request.message_mut().add_option(option.clone());
    }
    let response = server.request(request, opts.deadline()).await?;
    check_response(&response, opts.expect_error_code)?;
    Ok(response)
}

/// Decodes a response payload. SenML records must name paths within
/// `scope` unless it is empty.
fn decode_payload(response: &Lwm2mMessage, data: &[u8], scope: &[Lwm2mPath]) -> Result<Payload> {
    if !response.code.is_success() {
        return Ok(Payload::Empty);
    }
    let payload = Payload::decode(response.content_format()?, data)?;
    if let (Payload::Senml(records), false) = (&payload, scope.is_empty()) {
        senml::validate_scope(&senml::resolve(records), scope).map_err(|e| {
            HarnessError::assertion(format!("{e} in payload {}", hex::encode(data)))
        })?;
    }
    Ok(payload)
}

async fn perform_scoped(
    server: &mut MockServer,
    request: Lwm2mMessage,
    scope: &[Lwm2mPath],
    opts: &DmOptions,
) -> Result<DmResponse> {
    let response = exchange(server, request, opts).await?;
    let payload = decode_payload(&response, &response.payload, scope)?;
    Ok(DmResponse {
        message: response,
        payload,
    })
}

async fn perform(server: &mut MockServer, request: Lwm2mMessage, opts: &DmOptions) -> Result<DmResponse> {
    perform_scoped(server, request, &[], opts).await
}

fn default_write_format(path: &Lwm2mPath) -> ContentFormat {
    match path.level() {
        PathLevel::Resource | PathLevel::ResourceInstance => ContentFormat::TEXT,
        _ => ContentFormat::LWM2M_TLV,
    }
}

fn composite_format(opts: &DmOptions) -> Result<ContentFormat> {
    let format = opts.format.unwrap_or(ContentFormat::SENML_JSON);
    if format.is_senml() {
        Ok(format)
    } else {
        Err(senml::SenmlError::UnsupportedFormat(format).into())
    }
}

/// Read, with Accept from the options or the server's preferred format.
pub async fn read(server: &mut MockServer, path: &Lwm2mPath, opts: DmOptions) -> Result<DmResponse> {
    let accept = opts.accept.or(server.preferred_format());
    let scope = [path.clone()];
    perform_scoped(server, Lwm2mMessage::read(path, accept), &scope, &opts).await
}

/// Write; TLV for objects and instances, plain text for resources, unless
/// a format is given.
pub async fn write(
    server: &mut MockServer,
    path: &Lwm2mPath,
    payload: impl Into<Vec<u8>>,
    opts: DmOptions,
) -> Result<DmResponse> {
    let format = opts.format.unwrap_or_else(|| default_write_format(path));
    let request = Lwm2mMessage::write(path, format, payload.into(), opts.partial);
    perform(server, request, &opts).await
}

/// Write of a TLV tree.
pub async fn write_tlv(server: &mut MockServer, path: &Lwm2mPath, nodes: &[Tlv], opts: DmOptions) -> Result<DmResponse> {
    let payload = tlv::encode_all(nodes)?;
    write(server, path, payload, opts.with_format(ContentFormat::LWM2M_TLV)).await
}

pub async fn write_attributes(
    server: &mut MockServer,
    path: &Lwm2mPath,
    attributes: &[(&str, &str)],
    opts: DmOptions,
) -> Result<DmResponse> {
    perform(server, Lwm2mMessage::write_attributes(path, attributes), &opts).await
}

pub async fn execute(
    server: &mut MockServer,
    path: &Lwm2mPath,
    arguments: Option<&str>,
    opts: DmOptions,
) -> Result<DmResponse> {
    perform(server, Lwm2mMessage::execute(path, arguments), &opts).await
}

pub async fn delete(server: &mut MockServer, path: &Lwm2mPath, opts: DmOptions) -> Result<DmResponse> {
    perform(server, Lwm2mMessage::delete(path), &opts).await
}

pub async fn discover(
    server: &mut MockServer,
    path: &Lwm2mPath,
    depth: Option<u8>,
    opts: DmOptions,
) -> Result<DmResponse> {
    perform(server, Lwm2mMessage::discover(path, depth), &opts).await
}

/// Create in object `path`; the payload is a TLV unless a format is given.
pub async fn create(
    server: &mut MockServer,
    path: &Lwm2mPath,
    payload: impl Into<Vec<u8>>,
    opts: DmOptions,
) -> Result<DmResponse> {
    let format = opts.format.unwrap_or(ContentFormat::LWM2M_TLV);
    perform(server, Lwm2mMessage::create(path, format, payload.into()), &opts).await
}

/// Observe; the observation is identified by the returned token.
pub async fn observe(server: &mut MockServer, path: &Lwm2mPath, opts: DmOptions) -> Result<DmResponse> {
    let accept = opts.accept.or(server.preferred_format());
    let scope = [path.clone()];
    perform_scoped(server, Lwm2mMessage::observe(path, accept), &scope, &opts).await
}

pub async fn cancel_observe(
    server: &mut MockServer,
    path: &Lwm2mPath,
    token: Token,
    opts: DmOptions,
) -> Result<DmResponse> {
    perform(server, Lwm2mMessage::cancel_observe(path, token), &opts).await
}

fn composite_request_payload(paths: &[Lwm2mPath], format: ContentFormat) -> Result<Vec<u8>> {
    let records: Vec<SenmlRecord> = paths
        .iter()
        .map(|p| SenmlRecord::name_only(&p.to_string()))
        .collect();
    Ok(senml::encode(&records, format)?)
}

pub async fn read_composite(server: &mut MockServer, paths: &[Lwm2mPath], opts: DmOptions) -> Result<DmResponse> {
    let format = composite_format(&opts)?;
    let accept = opts.accept.unwrap_or(format);
    let payload = composite_request_payload(paths, format)?;
    perform_scoped(server, Lwm2mMessage::read_composite(format, accept, payload), paths, &opts).await
}

pub async fn observe_composite(server: &mut MockServer, paths: &[Lwm2mPath], opts: DmOptions) -> Result<DmResponse> {
    let format = composite_format(&opts)?;
    let accept = opts.accept.unwrap_or(format);
    let payload = composite_request_payload(paths, format)?;
    perform_scoped(server, Lwm2mMessage::observe_composite(format, accept, payload), paths, &opts).await
}

/// Write-Composite; only SenML JSON and SenML CBOR are accepted.
pub async fn write_composite(server: &mut MockServer, records: &[SenmlRecord], opts: DmOptions) -> Result<DmResponse> {
    let format = composite_format(&opts)?;
    let payload = senml::encode(records, format)?;
    perform(server, Lwm2mMessage::write_composite(format, payload), &opts).await
}

/// Bootstrap-Write, always a replacing PUT.
pub async fn bootstrap_write(
    server: &mut MockServer,
    path: &Lwm2mPath,
    payload: impl Into<Vec<u8>>,
    opts: DmOptions,
) -> Result<DmResponse> {
    let format = opts.format.unwrap_or_else(|| default_write_format(path));
    perform(server, Lwm2mMessage::write(path, format, payload.into(), false), &opts).await
}

/// Bootstrap-Delete; the root path deletes everything deletable.
pub async fn bootstrap_delete(server: &mut MockServer, path: &Lwm2mPath, opts: DmOptions) -> Result<DmResponse> {
    perform(server, Lwm2mMessage::delete(path), &opts).await
}

pub async fn bootstrap_discover(server: &mut MockServer, path: &Lwm2mPath, opts: DmOptions) -> Result<DmResponse> {
    perform(server, Lwm2mMessage::discover(path, None), &opts).await
}

/// Bootstrap-Finish, expecting 2.04 Changed unless told otherwise.
pub async fn bootstrap_finish(server: &mut MockServer, opts: DmOptions) -> Result<DmResponse> {
    let opts = DmOptions {
        expect_error_code: opts.expect_error_code.or(Some(Code::CHANGED)),
        ..opts
    };
    perform(server, Lwm2mMessage::bootstrap_finish(), &opts).await
}

/// Reads `path` block by block with Block2 of `block_size`, sequentially
/// from block 0, and decodes the reassembled payload.
///
/// # Errors
/// Fails when a block arrives out of sequence or with another size.
pub async fn read_blockwise(
    server: &mut MockServer,
    path: &Lwm2mPath,
    block_size: usize,
    opts: DmOptions,
) -> Result<DmResponse> {
    let accept = opts.accept.or(server.preferred_format());
    let scope = [path.clone()];
    let mut data = Vec::new();
    let mut seq = 0;
    loop {
        let block = BlockOption::new(seq, false, block_size)?;
        let request = Lwm2mMessage::from_coap(
            Lwm2mMessage::read(path, accept)
                .into_message()
                .with_block2(block),
        );
        let response = exchange(server, request, &opts).await?;
        let Some(received) = response.block2()? else {
            // the client answered without block-wise transfer
            let payload = decode_payload(&response, &response.payload, &scope)?;
            return Ok(DmResponse {
                message: response,
                payload,
            });
        };
        if received.seq_num != seq || usize::from(received.size) != block_size {
            return Err(HarnessError::assertion(format!(
                "expected block {seq} of size {block_size}, got {received}"
            )));
        }
        data.extend_from_slice(&response.payload);
        if !received.more {
            log::debug!("Read {} bytes of {path} in {} blocks", data.len(), seq + 1);
            let payload = decode_payload(&response, &data, &scope)?;
            return Ok(DmResponse {
                message: response,
                payload,
            });
        }
        seq += 1;
    }
}
