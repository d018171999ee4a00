//! CoAP message codec per RFC 7252, with Observe (RFC 7641) and block-wise
//! transfer (RFC 7959) option support.
//!
//! # Message Wire Format (RFC 7252 Section 3)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Ver| T |  TKL  |      Code     |          Message ID           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Token (if any, TKL bytes) ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Options (if any) ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |1 1 1 1 1 1 1 1|    Payload (if any) ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

pub mod content_format;
pub mod ids;
pub mod message;
pub mod options;

use thiserror::Error;

pub use content_format::ContentFormat;
pub use ids::{MessageIdGenerator, TokenGenerator};
pub use message::{Code, Message, MessageType, Token};
pub use options::{BlockOption, CoapOption, OptionNumber};

/// CoAP protocol version carried in every header.
pub const COAP_VERSION: u8 = 1;

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 4;

/// Maximum token length.
pub const MAX_TOKEN_LENGTH: usize = 8;

/// Marker separating options from the payload.
pub const PAYLOAD_MARKER: u8 = 0xFF;

/// Errors raised while encoding or decoding CoAP messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoapError {
    /// The datagram does not form a valid CoAP message.
    #[error("Malformed CoAP message: {0}")]
    MalformedMessage(String),

    /// A critical option the strict decoder does not know.
    #[error("Unsupported critical option {0}")]
    UnsupportedOption(u16),

    /// Block size not in {16, 32, ..., 1024}.
    #[error("Invalid block size {0}")]
    InvalidBlockSize(usize),

    /// Block sequence number does not fit in 20 bits.
    #[error("Block number {0} exceeds 20 bits")]
    InvalidBlockNumber(u32),

    /// Token longer than 8 bytes.
    #[error("Token length {0} exceeds {MAX_TOKEN_LENGTH} bytes")]
    TokenTooLong(usize),

    /// Option value has an unexpected encoding.
    #[error("Invalid value for option {number}: {reason}")]
    InvalidOptionValue { number: u16, reason: String },
}

impl CoapError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        CoapError::MalformedMessage(reason.into())
    }
}
