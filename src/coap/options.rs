//! CoAP option registry, option values and the delta/length encoding.
//!
//! # Option Format (RFC 7252 Section 3.1)
//!
//! ```text
//!   0   1   2   3   4   5   6   7
//! +---------------+---------------+
//! |  Option Delta | Option Length |   1 byte
//! +---------------+---------------+
//! /         Option Delta          /   0-2 bytes
//! \          (extended)           \
//! +-------------------------------+
//! /         Option Length         /   0-2 bytes
//! \          (extended)           \
//! +-------------------------------+
//! /         Option Value          /   0 or more bytes
//! +-------------------------------+
//! ```
//!
//! Nibble values 13 and 14 announce an 8-bit (value - 13) or 16-bit
//! (value - 269) extension; 15 is reserved for the payload marker.

use std::fmt;

use super::CoapError;

/// CoAP option number with the registered values as associated constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OptionNumber(pub u16);

impl OptionNumber {
    pub const IF_MATCH: Self = Self(1);
    pub const URI_HOST: Self = Self(3);
    pub const ETAG: Self = Self(4);
    pub const IF_NONE_MATCH: Self = Self(5);
    pub const OBSERVE: Self = Self(6);
    pub const URI_PORT: Self = Self(7);
    pub const LOCATION_PATH: Self = Self(8);
    pub const OSCORE: Self = Self(9);
    pub const URI_PATH: Self = Self(11);
    pub const CONTENT_FORMAT: Self = Self(12);
    pub const MAX_AGE: Self = Self(14);
    pub const URI_QUERY: Self = Self(15);
    pub const ACCEPT: Self = Self(17);
    pub const LOCATION_QUERY: Self = Self(20);
    pub const BLOCK2: Self = Self(23);
    pub const BLOCK1: Self = Self(27);
    pub const SIZE2: Self = Self(28);
    pub const PROXY_URI: Self = Self(35);
    pub const PROXY_SCHEME: Self = Self(39);
    pub const SIZE1: Self = Self(60);
    pub const NO_RESPONSE: Self = Self(258);

    /// Critical options have an odd number (RFC 7252 Section 5.4.6).
    #[must_use]
    pub fn is_critical(self) -> bool {
        self.0 & 1 == 1
    }

    /// Returns the registered name, if the number is known.
    #[must_use]
    pub fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::IF_MATCH => "If-Match",
            Self::URI_HOST => "Uri-Host",
            Self::ETAG => "ETag",
            Self::IF_NONE_MATCH => "If-None-Match",
            Self::OBSERVE => "Observe",
            Self::URI_PORT => "Uri-Port",
            Self::LOCATION_PATH => "Location-Path",
            Self::OSCORE => "OSCORE",
            Self::URI_PATH => "Uri-Path",
            Self::CONTENT_FORMAT => "Content-Format",
            Self::MAX_AGE => "Max-Age",
            Self::URI_QUERY => "Uri-Query",
            Self::ACCEPT => "Accept",
            Self::LOCATION_QUERY => "Location-Query",
            Self::BLOCK2 => "Block2",
            Self::BLOCK1 => "Block1",
            Self::SIZE2 => "Size2",
            Self::PROXY_URI => "Proxy-Uri",
            Self::PROXY_SCHEME => "Proxy-Scheme",
            Self::SIZE1 => "Size1",
            Self::NO_RESPONSE => "No-Response",
            _ => return None,
        })
    }

    #[must_use]
    pub fn is_known(self) -> bool {
        self.name().is_some()
    }

    fn is_string(self) -> bool {
        matches!(
            self,
            Self::URI_HOST
                | Self::LOCATION_PATH
                | Self::URI_PATH
                | Self::URI_QUERY
                | Self::LOCATION_QUERY
                | Self::PROXY_URI
                | Self::PROXY_SCHEME
        )
    }

    fn is_uint(self) -> bool {
        matches!(
            self,
            Self::OBSERVE
                | Self::URI_PORT
                | Self::CONTENT_FORMAT
                | Self::MAX_AGE
                | Self::ACCEPT
                | Self::BLOCK2
                | Self::BLOCK1
                | Self::SIZE2
                | Self::SIZE1
                | Self::NO_RESPONSE
        )
    }
}

impl fmt::Display for OptionNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "Option({})", self.0),
        }
    }
}

/// A single option instance as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CoapOption {
    pub number: OptionNumber,
    pub value: Vec<u8>,
}

impl CoapOption {
    #[must_use]
    pub fn new(number: OptionNumber, value: Vec<u8>) -> Self {
        Self { number, value }
    }

    /// Builds an option carrying a UTF-8 string value.
    #[must_use]
    pub fn string(number: OptionNumber, value: &str) -> Self {
        Self::new(number, value.as_bytes().to_vec())
    }

    /// Builds an option carrying a minimal-length unsigned integer.
    #[must_use]
    pub fn uint(number: OptionNumber, value: u32) -> Self {
        Self::new(number, encode_uint(value))
    }

    /// Interprets the value as an unsigned integer (up to 4 bytes).
    ///
    /// # Errors
    /// Returns `CoapError::InvalidOptionValue` when the value is longer than 4 bytes.
    pub fn as_uint(&self) -> Result<u32, CoapError> {
        decode_uint(&self.value).ok_or_else(|| CoapError::InvalidOptionValue {
            number: self.number.0,
            reason: format!("{} bytes is too long for uint", self.value.len()),
        })
    }

    /// Interprets the value as UTF-8, replacing invalid sequences.
    #[must_use]
    pub fn as_string(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }
}

impl fmt::Display for CoapOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: ", self.number)?;
        if self.number == OptionNumber::BLOCK1 || self.number == OptionNumber::BLOCK2 {
            return match self.as_uint().ok().and_then(|v| BlockOption::from_value(v).ok()) {
                Some(block) => write!(f, "{block}"),
                None => write!(f, "0x{}", hex::encode(&self.value)),
            };
        }
        if self.number.is_string() {
            write!(f, "{}", self.as_string())
        } else if self.number.is_uint() {
            match self.as_uint() {
                Ok(v) => write!(f, "{v}"),
                Err(_) => write!(f, "0x{}", hex::encode(&self.value)),
            }
        } else {
            write!(f, "0x{}", hex::encode(&self.value))
        }
    }
}

/// Encodes an unsigned integer using the fewest bytes (zero encodes as empty).
#[must_use]
pub fn encode_uint(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count();
    bytes[skip..].to_vec()
}

/// Decodes a big-endian unsigned integer of at most 4 bytes.
#[must_use]
pub fn decode_uint(bytes: &[u8]) -> Option<u32> {
    if bytes.len() > 4 {
        return None;
    }
    Some(bytes.iter().fold(0u32, |acc, &b| (acc << 8) | u32::from(b)))
}

/// Block1/Block2 option value (RFC 7959 Section 2.2).
///
/// ```text
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                 NUM                   |M| SZX |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockOption {
    pub seq_num: u32,
    pub more: bool,
    pub size: u16,
}

/// Largest block number representable in the 20-bit NUM field.
pub const MAX_BLOCK_NUMBER: u32 = (1 << 20) - 1;

impl BlockOption {
    /// Creates a block descriptor, validating the size and sequence number.
    ///
    /// # Errors
    /// Returns `CoapError::InvalidBlockSize` for sizes outside `16..=1024` or not
    /// a power of two, and `CoapError::InvalidBlockNumber` above 20 bits.
    pub fn new(seq_num: u32, more: bool, size: usize) -> Result<Self, CoapError> {
        size_exponent(size)?;
        if seq_num > MAX_BLOCK_NUMBER {
            return Err(CoapError::InvalidBlockNumber(seq_num));
        }
        Ok(Self {
            seq_num,
            more,
            size: size as u16,
        })
    }

    /// Decodes the integer option value.
    ///
    /// # Errors
    /// Returns `CoapError::InvalidBlockSize` when SZX is 7 (reserved for BERT).
    pub fn from_value(value: u32) -> Result<Self, CoapError> {
        let szx = value & 0x07;
        if szx == 7 {
            return Err(CoapError::InvalidBlockSize(0));
        }
        Ok(Self {
            seq_num: value >> 4,
            more: value & 0x08 != 0,
            size: 1 << (szx + 4),
        })
    }

    /// Encodes to the integer option value.
    #[must_use]
    pub fn to_value(&self) -> u32 {
        // size was validated on construction
        let szx = u32::from(self.size).trailing_zeros().saturating_sub(4);
        (self.seq_num << 4) | (u32::from(self.more) << 3) | szx
    }

    /// Byte offset of this block within the whole body.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.seq_num as usize * usize::from(self.size)
    }
}

impl fmt::Display for BlockOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.seq_num,
            if self.more { 1 } else { 0 },
            self.size
        )
    }
}

fn size_exponent(size: usize) -> Result<u32, CoapError> {
    if !(16..=1024).contains(&size) || !size.is_power_of_two() {
        return Err(CoapError::InvalidBlockSize(size));
    }
    Ok(size.trailing_zeros() - 4)
}

/// Writes options sorted by number into `buf`.
///
/// The sort is stable so repeated options (Uri-Path, Uri-Query) keep order.
pub fn write_options(options: &[CoapOption], buf: &mut Vec<u8>) {
    let mut sorted: Vec<&CoapOption> = options.iter().collect();
    sorted.sort_by_key(|opt| opt.number);

    let mut previous = 0u16;
    for opt in sorted {
        let delta = opt.number.0 - previous;
        previous = opt.number.0;

        let (delta_nibble, delta_ext) = split_nibble(usize::from(delta));
        let (len_nibble, len_ext) = split_nibble(opt.value.len());
        buf.push((delta_nibble << 4) | len_nibble);
        buf.extend_from_slice(&delta_ext);
        buf.extend_from_slice(&len_ext);
        buf.extend_from_slice(&opt.value);
    }
}

fn split_nibble(value: usize) -> (u8, Vec<u8>) {
    if value < 13 {
        (value as u8, Vec::new())
    } else if value < 269 {
        (13, vec![(value - 13) as u8])
    } else {
        (14, ((value - 269) as u16).to_be_bytes().to_vec())
    }
}

/// Parses options starting at `buf[0]`.
///
/// Returns the options and the number of bytes consumed, stopping at the
/// payload marker (which is not consumed) or at the end of the buffer.
///
/// # Errors
/// Returns `CoapError::MalformedMessage` on truncation or reserved nibbles.
pub fn parse_options(buf: &[u8]) -> Result<(Vec<CoapOption>, usize), CoapError> {
    let mut options = Vec::new();
    let mut pos = 0usize;
    let mut number = 0u32;

    while pos < buf.len() && buf[pos] != super::PAYLOAD_MARKER {
        let header = buf[pos];
        pos += 1;

        let delta = read_extended(header >> 4, buf, &mut pos, "delta")?;
        let length = read_extended(header & 0x0F, buf, &mut pos, "length")?;

        number += delta as u32;
        if number > u32::from(u16::MAX) {
            return Err(CoapError::malformed(format!(
                "option number {number} out of range"
            )));
        }
        if buf.len() - pos < length {
            return Err(CoapError::malformed(format!(
                "option {number} value truncated: need {length} bytes, {} left",
                buf.len() - pos
            )));
        }
        options.push(CoapOption::new(
            OptionNumber(number as u16),
            buf[pos..pos + length].to_vec(),
        ));
        pos += length;
    }

    Ok((options, pos))
}

fn read_extended(
    nibble: u8,
    buf: &[u8],
    pos: &mut usize,
    what: &str,
) -> Result<usize, CoapError> {
    match nibble {
        0..=12 => Ok(usize::from(nibble)),
        13 => {
            let b = *buf
                .get(*pos)
                .ok_or_else(|| CoapError::malformed(format!("truncated option {what}")))?;
            *pos += 1;
            Ok(usize::from(b) + 13)
        }
        14 => {
            let bytes = buf
                .get(*pos..*pos + 2)
                .ok_or_else(|| CoapError::malformed(format!("truncated option {what}")))?;
            *pos += 2;
            Ok(usize::from(u16::from_be_bytes([bytes[0], bytes[1]])) + 269)
        }
        _ => Err(CoapError::malformed(format!(
            "reserved value 15 in option {what}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uint_minimal_encoding() {
        assert_eq!(encode_uint(0), Vec::<u8>::new());
        assert_eq!(encode_uint(60), vec![60]);
        assert_eq!(encode_uint(11542), vec![0x2D, 0x16]);
        assert_eq!(encode_uint(0x0100_0000), vec![1, 0, 0, 0]);
        assert_eq!(decode_uint(&[0x2D, 0x16]), Some(11542));
        assert_eq!(decode_uint(&[1, 2, 3, 4, 5]), None);
    }

    #[test]
    fn test_block_value_layout() {
        let block = BlockOption::new(3, true, 1024).unwrap();
        assert_eq!(block.to_value(), (3 << 4) | 0x08 | 6);
        assert_eq!(BlockOption::from_value(block.to_value()).unwrap(), block);

        let small = BlockOption::from_value(0x00).unwrap();
        assert_eq!(small.size, 16);
        assert!(!small.more);
        assert_eq!(small.offset(), 0);
    }

    #[test]
    fn test_block_rejects_invalid() {
        assert_eq!(
            BlockOption::new(0, false, 2048),
            Err(CoapError::InvalidBlockSize(2048))
        );
        assert_eq!(
            BlockOption::new(0, false, 100),
            Err(CoapError::InvalidBlockSize(100))
        );
        assert!(BlockOption::from_value(0x07).is_err());
        assert_eq!(
            BlockOption::new(1 << 20, false, 16),
            Err(CoapError::InvalidBlockNumber(1 << 20))
        );
    }

    #[test]
    fn test_options_extended_delta_and_length() {
        let long_value = vec![b'x'; 300];
        let options = vec![
            CoapOption::new(OptionNumber::NO_RESPONSE, vec![]),
            CoapOption::string(OptionNumber::URI_PATH, "rd"),
            CoapOption::new(OptionNumber::PROXY_URI, long_value.clone()),
        ];
        let mut buf = Vec::new();
        write_options(&options, &mut buf);

        // Uri-Path: delta 11, length 2
        assert_eq!(buf[0], 0xB2);
        let (parsed, consumed) = parse_options(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(parsed[0].number, OptionNumber::URI_PATH);
        assert_eq!(parsed[1].number, OptionNumber::PROXY_URI);
        assert_eq!(parsed[1].value, long_value);
        assert_eq!(parsed[2].number, OptionNumber::NO_RESPONSE);
    }

    #[test]
    fn test_options_stable_sort_keeps_repeated_order() {
        let options = vec![
            CoapOption::string(OptionNumber::URI_QUERY, "lwm2m=1.1"),
            CoapOption::string(OptionNumber::URI_PATH, "rd"),
            CoapOption::string(OptionNumber::URI_QUERY, "ep=demo"),
        ];
        let mut buf = Vec::new();
        write_options(&options, &mut buf);
        let (parsed, _) = parse_options(&buf).unwrap();
        let queries: Vec<String> = parsed
            .iter()
            .filter(|o| o.number == OptionNumber::URI_QUERY)
            .map(CoapOption::as_string)
            .collect();
        assert_eq!(queries, vec!["lwm2m=1.1", "ep=demo"]);
    }

    #[test]
    fn test_options_reject_reserved_nibble() {
        assert!(matches!(
            parse_options(&[0xF1, 0x00]),
            Err(CoapError::MalformedMessage(_))
        ));
        assert!(matches!(
            parse_options(&[0x1F]),
            Err(CoapError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_options_reject_truncated_value() {
        assert!(matches!(
            parse_options(&[0xB4, b'r', b'd']),
            Err(CoapError::MalformedMessage(_))
        ));
        assert!(matches!(
            parse_options(&[0xD0]),
            Err(CoapError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_option_display() {
        let block = CoapOption::uint(OptionNumber::BLOCK2, (2 << 4) | 0x08 | 2);
        assert_eq!(block.to_string(), "Block2: 2:1:64");
        assert_eq!(
            CoapOption::string(OptionNumber::URI_PATH, "rd").to_string(),
            "Uri-Path: rd"
        );
        assert_eq!(
            CoapOption::new(OptionNumber::ETAG, vec![0xde, 0xad]).to_string(),
            "ETag: 0xdead"
        );
    }
}
