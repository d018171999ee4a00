//! OMA LwM2M TLV codec (content format 11542).
//!
//! # TLV Wire Format (LwM2M TS Core Section 7.4.3)
//!
//! ```text
//! +---------------+-----------------+-----------------+--------------+
//! |  Type (8 bit) | Identifier      | Length          | Value        |
//! |               | (8 or 16 bit)   | (0-24 bit)      |              |
//! +---------------+-----------------+-----------------+--------------+
//!
//!  Type byte:
//!   7 6   5   4 3   2 1 0
//! +-----+---+-----+-------+
//! | IT  |IL | LT  |  LEN  |
//! +-----+---+-----+-------+
//! ```
//!
//! - **IT**: 00 Object Instance, 01 Resource Instance, 10 Multiple Resource,
//!   11 Resource with value
//! - **IL**: identifier length, 0 = 8 bit, 1 = 16 bit
//! - **LT**: 00 = length in LEN, 01/10/11 = 8/16/24-bit length field follows
//!   the identifier

use std::{collections::HashSet, fmt};

use thiserror::Error;

/// Largest value length expressible with a 24-bit length field.
pub const MAX_TLV_LENGTH: usize = 0x00FF_FFFF;

/// Errors that can occur during TLV parsing or serialization.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TlvError {
    /// Buffer is too small to contain the announced header.
    #[error("Buffer too small for TLV header: need {needed} bytes, got {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// TLV length exceeds available buffer space.
    #[error("TLV length {length} exceeds remaining buffer size {available}")]
    LengthExceedsBuffer { length: usize, available: usize },

    /// A value is too large for the 24-bit length field.
    #[error("TLV value of {0} bytes exceeds the 24-bit length field")]
    ValueTooLarge(usize),

    /// A container holds a child kind it may not hold.
    #[error("{parent} may not contain {child}")]
    InvalidNesting { parent: TlvKind, child: TlvKind },

    /// Two siblings share an identifier.
    #[error("Duplicate identifier {0} within one parent")]
    DuplicateId(u16),

    /// A typed accessor was applied to a value of the wrong size or shape.
    #[error("Cannot interpret {len}-byte value as {wanted}")]
    InvalidValue { wanted: &'static str, len: usize },
}

/// Identifier type encoded in the two top bits of the type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TlvKind {
    ObjectInstance,
    ResourceInstance,
    MultipleResource,
    Resource,
}

impl TlvKind {
    #[must_use]
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => TlvKind::ObjectInstance,
            1 => TlvKind::ResourceInstance,
            2 => TlvKind::MultipleResource,
            _ => TlvKind::Resource,
        }
    }

    #[must_use]
    pub fn to_bits(self) -> u8 {
        match self {
            TlvKind::ObjectInstance => 0,
            TlvKind::ResourceInstance => 1,
            TlvKind::MultipleResource => 2,
            TlvKind::Resource => 3,
        }
    }

    /// Containers carry nested TLVs instead of a value.
    #[must_use]
    pub fn is_container(self) -> bool {
        matches!(self, TlvKind::ObjectInstance | TlvKind::MultipleResource)
    }

    fn allows_child(self, child: TlvKind) -> bool {
        match self {
            TlvKind::ObjectInstance => {
                matches!(child, TlvKind::Resource | TlvKind::MultipleResource)
            }
            TlvKind::MultipleResource => child == TlvKind::ResourceInstance,
            _ => false,
        }
    }
}

impl fmt::Display for TlvKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TlvKind::ObjectInstance => "Object Instance",
            TlvKind::ResourceInstance => "Resource Instance",
            TlvKind::MultipleResource => "Multiple Resource",
            TlvKind::Resource => "Resource",
        })
    }
}

/// Value or children of a TLV entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlvContent {
    Value(Vec<u8>),
    Children(Vec<Tlv>),
}

/// One node of a TLV tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    pub kind: TlvKind,
    pub id: u16,
    pub content: TlvContent,
}

impl Tlv {
    #[must_use]
    pub fn resource(id: u16, value: Vec<u8>) -> Self {
        Self {
            kind: TlvKind::Resource,
            id,
            content: TlvContent::Value(value),
        }
    }

    #[must_use]
    pub fn resource_instance(id: u16, value: Vec<u8>) -> Self {
        Self {
            kind: TlvKind::ResourceInstance,
            id,
            content: TlvContent::Value(value),
        }
    }

    #[must_use]
    pub fn multiple_resource(id: u16, instances: Vec<Tlv>) -> Self {
        Self {
            kind: TlvKind::MultipleResource,
            id,
            content: TlvContent::Children(instances),
        }
    }

    #[must_use]
    pub fn object_instance(id: u16, resources: Vec<Tlv>) -> Self {
        Self {
            kind: TlvKind::ObjectInstance,
            id,
            content: TlvContent::Children(resources),
        }
    }

    #[must_use]
    pub fn resource_int(id: u16, value: i64) -> Self {
        Self::resource(id, encode_int(value))
    }

    #[must_use]
    pub fn resource_str(id: u16, value: &str) -> Self {
        Self::resource(id, value.as_bytes().to_vec())
    }

    #[must_use]
    pub fn resource_bool(id: u16, value: bool) -> Self {
        Self::resource(id, vec![u8::from(value)])
    }

    #[must_use]
    pub fn resource_float(id: u16, value: f64) -> Self {
        Self::resource(id, value.to_be_bytes().to_vec())
    }

    #[must_use]
    pub fn resource_objlnk(id: u16, oid: u16, iid: u16) -> Self {
        let mut value = oid.to_be_bytes().to_vec();
        value.extend_from_slice(&iid.to_be_bytes());
        Self::resource(id, value)
    }

    #[must_use]
    pub fn value(&self) -> Option<&[u8]> {
        match &self.content {
            TlvContent::Value(v) => Some(v),
            TlvContent::Children(_) => None,
        }
    }

    #[must_use]
    pub fn children(&self) -> &[Tlv] {
        match &self.content {
            TlvContent::Children(c) => c,
            TlvContent::Value(_) => &[],
        }
    }

    /// Looks up a direct child by identifier.
    #[must_use]
    pub fn child(&self, id: u16) -> Option<&Tlv> {
        self.children().iter().find(|c| c.id == id)
    }

    fn raw_value(&self, wanted: &'static str) -> Result<&[u8], TlvError> {
        self.value()
            .ok_or(TlvError::InvalidValue { wanted, len: 0 })
    }

    /// Decodes a 1/2/4/8-byte big-endian signed integer.
    ///
    /// # Errors
    /// Returns `TlvError::InvalidValue` for other lengths or container nodes.
    pub fn as_int(&self) -> Result<i64, TlvError> {
        let v = self.raw_value("integer")?;
        Ok(match v.len() {
            1 => i64::from(v[0] as i8),
            2 => i64::from(i16::from_be_bytes([v[0], v[1]])),
            4 => i64::from(i32::from_be_bytes([v[0], v[1], v[2], v[3]])),
            8 => i64::from_be_bytes([v[0], v[1], v[2], v[3], v[4], v[5], v[6], v[7]]),
            len => return Err(TlvError::InvalidValue { wanted: "integer", len }),
        })
    }

    /// Decodes a 4 or 8-byte IEEE 754 float.
    ///
    /// # Errors
    /// Returns `TlvError::InvalidValue` for other lengths.
    pub fn as_float(&self) -> Result<f64, TlvError> {
        let v = self.raw_value("float")?;
        Ok(match v.len() {
            4 => f64::from(f32::from_be_bytes([v[0], v[1], v[2], v[3]])),
            8 => f64::from_be_bytes([v[0], v[1], v[2], v[3], v[4], v[5], v[6], v[7]]),
            len => return Err(TlvError::InvalidValue { wanted: "float", len }),
        })
    }

    /// # Errors
    /// Returns `TlvError::InvalidValue` unless the value is a single 0 or 1 byte.
    pub fn as_bool(&self) -> Result<bool, TlvError> {
        match self.raw_value("boolean")? {
            [0] => Ok(false),
            [1] => Ok(true),
            v => Err(TlvError::InvalidValue {
                wanted: "boolean",
                len: v.len(),
            }),
        }
    }

    /// # Errors
    /// Returns `TlvError::InvalidValue` when the value is not UTF-8.
    pub fn as_string(&self) -> Result<String, TlvError> {
        let v = self.raw_value("string")?;
        String::from_utf8(v.to_vec()).map_err(|_| TlvError::InvalidValue {
            wanted: "string",
            len: v.len(),
        })
    }

    /// # Errors
    /// Returns `TlvError::InvalidValue` unless the value is exactly 4 bytes.
    pub fn as_objlnk(&self) -> Result<(u16, u16), TlvError> {
        match self.raw_value("objlnk")? {
            [a, b, c, d] => Ok((u16::from_be_bytes([*a, *b]), u16::from_be_bytes([*c, *d]))),
            v => Err(TlvError::InvalidValue {
                wanted: "objlnk",
                len: v.len(),
            }),
        }
    }

    /// Parses a single TLV (recursively for containers).
    ///
    /// # Returns
    /// The parsed node and the number of bytes consumed.
    ///
    /// # Errors
    /// Returns an error on truncation, invalid nesting or duplicate child ids.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), TlvError> {
        let type_byte = *buf.first().ok_or(TlvError::BufferTooSmall {
            needed: 1,
            available: 0,
        })?;

        let kind = TlvKind::from_bits(type_byte >> 6);
        let id_len = if type_byte & 0x20 != 0 { 2 } else { 1 };
        let length_type = (type_byte >> 3) & 0x03;
        let len_len = usize::from(length_type);

        let header_len = 1 + id_len + len_len;
        if buf.len() < header_len {
            return Err(TlvError::BufferTooSmall {
                needed: header_len,
                available: buf.len(),
            });
        }

        let id = if id_len == 2 {
            u16::from_be_bytes([buf[1], buf[2]])
        } else {
            u16::from(buf[1])
        };

        let length = if length_type == 0 {
            usize::from(type_byte & 0x07)
        } else {
            buf[1 + id_len..header_len]
                .iter()
                .fold(0usize, |acc, &b| (acc << 8) | usize::from(b))
        };

        let available = buf.len() - header_len;
        if length > available {
            return Err(TlvError::LengthExceedsBuffer { length, available });
        }
        let value = &buf[header_len..header_len + length];

        let content = if kind.is_container() {
            let children = parse_all(value)?;
            validate_children(kind, &children)?;
            TlvContent::Children(children)
        } else {
            TlvContent::Value(value.to_vec())
        };

        Ok((Self { kind, id, content }, header_len + length))
    }

    /// Serializes the node and its subtree.
    ///
    /// # Errors
    /// Returns an error when the tree violates nesting rules or a value is too large.
    pub fn to_bytes(&self) -> Result<Vec<u8>, TlvError> {
        let mut buf = Vec::new();
        self.write_to(&mut buf)?;
        Ok(buf)
    }

    /// Writes the node to `buf` depth-first.
    ///
    /// # Errors
    /// See [`Tlv::to_bytes`].
    pub fn write_to(&self, buf: &mut Vec<u8>) -> Result<(), TlvError> {
        let body = match &self.content {
            TlvContent::Value(v) => {
                if self.kind.is_container() {
                    return Err(TlvError::InvalidValue {
                        wanted: "container",
                        len: v.len(),
                    });
                }
                v.clone()
            }
            TlvContent::Children(children) => {
                validate_children(self.kind, children)?;
                let mut nested = Vec::new();
                for child in children {
                    child.write_to(&mut nested)?;
                }
                nested
            }
        };

        if body.len() > MAX_TLV_LENGTH {
            return Err(TlvError::ValueTooLarge(body.len()));
        }

        let mut type_byte = self.kind.to_bits() << 6;
        if self.id > 0xFF {
            type_byte |= 0x20;
        }
        let len_bytes: Vec<u8> = if body.len() < 8 {
            type_byte |= body.len() as u8;
            Vec::new()
        } else if body.len() <= 0xFF {
            type_byte |= 0x08;
            vec![body.len() as u8]
        } else if body.len() <= 0xFFFF {
            type_byte |= 0x10;
            (body.len() as u16).to_be_bytes().to_vec()
        } else {
            type_byte |= 0x18;
            (body.len() as u32).to_be_bytes()[1..].to_vec()
        };

        buf.push(type_byte);
        if self.id > 0xFF {
            buf.extend_from_slice(&self.id.to_be_bytes());
        } else {
            buf.push(self.id as u8);
        }
        buf.extend_from_slice(&len_bytes);
        buf.extend_from_slice(&body);
        Ok(())
    }

    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let indent = "  ".repeat(depth);
        match &self.content {
            TlvContent::Value(v) => {
                write!(f, "{indent}{} {}: ", self.kind, self.id)?;
                match std::str::from_utf8(v) {
                    Ok(s) if !s.is_empty() && s.chars().all(|c| !c.is_control()) => {
                        writeln!(f, "{s:?} (0x{})", hex::encode(v))
                    }
                    _ => writeln!(f, "0x{}", hex::encode(v)),
                }
            }
            TlvContent::Children(children) => {
                writeln!(f, "{indent}{} {}", self.kind, self.id)?;
                for child in children {
                    child.fmt_indented(f, depth + 1)?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for Tlv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indented(f, 0)
    }
}

/// Parses a sequence of sibling TLVs filling the whole buffer.
///
/// # Errors
/// Returns an error on truncation or invalid nesting within any node.
pub fn parse_all(buf: &[u8]) -> Result<Vec<Tlv>, TlvError> {
    let mut nodes = Vec::new();
    let mut offset = 0;
    while offset < buf.len() {
        let (node, consumed) = Tlv::parse(&buf[offset..])?;
        nodes.push(node);
        offset += consumed;
    }
    Ok(nodes)
}

/// Serializes a sequence of sibling TLVs.
///
/// # Errors
/// Returns an error on duplicate sibling ids or invalid nesting.
pub fn encode_all(nodes: &[Tlv]) -> Result<Vec<u8>, TlvError> {
    ensure_unique_ids(nodes)?;
    let mut buf = Vec::new();
    for node in nodes {
        node.write_to(&mut buf)?;
    }
    Ok(buf)
}

fn validate_children(parent: TlvKind, children: &[Tlv]) -> Result<(), TlvError> {
    if let Some(bad) = children.iter().find(|c| !parent.allows_child(c.kind)) {
        return Err(TlvError::InvalidNesting {
            parent,
            child: bad.kind,
        });
    }
    ensure_unique_ids(children)
}

fn ensure_unique_ids(nodes: &[Tlv]) -> Result<(), TlvError> {
    let mut seen = HashSet::new();
    for node in nodes {
        if !seen.insert(node.id) {
            return Err(TlvError::DuplicateId(node.id));
        }
    }
    Ok(())
}

/// Encodes an integer in the shortest of 1, 2, 4 or 8 bytes.
#[must_use]
pub fn encode_int(value: i64) -> Vec<u8> {
    if let Ok(v) = i8::try_from(value) {
        v.to_be_bytes().to_vec()
    } else if let Ok(v) = i16::try_from(value) {
        v.to_be_bytes().to_vec()
    } else if let Ok(v) = i32::try_from(value) {
        v.to_be_bytes().to_vec()
    } else {
        value.to_be_bytes().to_vec()
    }
}
