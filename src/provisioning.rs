//! Factory-provisioning payloads and firmware package headers.
//!
//! The client reads a SenML-CBOR pack at first boot; the builder here turns
//! an ordered list of resource values (or a JSON data-model description)
//! into that pack. Firmware tests wrap their images with [`FirmwareHeader`]
//! and bundle several images with [`MultiPackage`].

use std::collections::BTreeMap;

use crc::{Crc, CRC_32_ISO_HDLC};
use serde::Deserialize;
use thiserror::Error;

use crate::{
    path::{Lwm2mPath, PathLevel},
    senml::{self, SenmlError, SenmlRecord, SenmlValue},
};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub const MAGIC_LENGTH: usize = 8;
pub const LINKED_SLOTS_LENGTH: usize = 8;

/// Magic of application firmware consumed by Firmware Update (object 5).
pub const MAGIC_FIRMWARE: [u8; MAGIC_LENGTH] = *b"ANJAY_FW";
/// Magics of the software-management and advanced-firmware slots.
pub const MAGIC_APPLICATION: [u8; MAGIC_LENGTH] = *b"AJAY_APP";
pub const MAGIC_TEE: [u8; MAGIC_LENGTH] = *b"AJAY_TEE";
pub const MAGIC_BOOTLOADER: [u8; MAGIC_LENGTH] = *b"AJAY_BOO";
pub const MAGIC_MULTIPACKAGE: [u8; MAGIC_LENGTH] = *b"MULTIPKG";

/// Header without linked slots.
pub const HEADER_VERSION_BASIC: u16 = 2;
/// Header followed by the linked-slot bitmap.
pub const HEADER_VERSION_LINKED: u16 = 3;

pub const MULTIPACKAGE_VERSION: u16 = 1;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningError {
    #[error("Invalid data model description: {0}")]
    Json(String),

    #[error("Invalid path {0:?} in data model description")]
    InvalidPath(String),

    #[error("Invalid value for {path}: {reason}")]
    InvalidValue { path: String, reason: String },

    #[error(transparent)]
    Senml(#[from] SenmlError),

    #[error("Package truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Unsupported header version {0}")]
    UnsupportedHeaderVersion(u16),

    #[error("Unexpected magic {0:?}")]
    UnexpectedMagic(String),

    #[error("CRC mismatch: header says {expected:#010x}, payload has {actual:#010x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("Version string too long ({0} bytes)")]
    VersionTooLong(usize),

    #[error("Too many packages ({0})")]
    TooManyPackages(usize),
}

/// Failure path the client's simulated update engine is told to take.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct ForcedError(pub u16);

impl ForcedError {
    pub const NONE: Self = Self(0);
    pub const OUT_OF_MEMORY: Self = Self(1);
    pub const FAILED_UPDATE: Self = Self(2);
    pub const DELAYED_SUCCESS: Self = Self(3);
    pub const DELAYED_FAILED_UPDATE: Self = Self(4);
    pub const SET_SUCCESS_IN_PERFORM_UPGRADE: Self = Self(5);
    pub const SET_FAILURE_IN_PERFORM_UPGRADE: Self = Self(6);
    pub const DO_NOTHING: Self = Self(7);
    pub const DEFER: Self = Self(8);
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ProvisioningError> {
        let end = self.pos + len;
        if end > self.data.len() {
            return Err(ProvisioningError::Truncated {
                needed: end,
                available: self.data.len(),
            });
        }
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ProvisioningError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, ProvisioningError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ProvisioningError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, ProvisioningError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }
}

/// Header prepended to a firmware image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareHeader {
    pub magic: [u8; MAGIC_LENGTH],
    pub forced_error: ForcedError,
    pub linked_slots: Option<[u8; LINKED_SLOTS_LENGTH]>,
    pub version: String,
}

impl FirmwareHeader {
    #[must_use]
    pub fn new(magic: [u8; MAGIC_LENGTH], version: &str) -> Self {
        Self {
            magic,
            forced_error: ForcedError::NONE,
            linked_slots: None,
            version: version.to_string(),
        }
    }

    #[must_use]
    pub fn with_forced_error(mut self, forced_error: ForcedError) -> Self {
        self.forced_error = forced_error;
        self
    }

    #[must_use]
    pub fn with_linked_slots(mut self, linked_slots: [u8; LINKED_SLOTS_LENGTH]) -> Self {
        self.linked_slots = Some(linked_slots);
        self
    }

    #[must_use]
    pub fn header_version(&self) -> u16 {
        if self.linked_slots.is_some() {
            HEADER_VERSION_LINKED
        } else {
            HEADER_VERSION_BASIC
        }
    }

    /// Prepends the header to `payload`, with the CRC-32 of `payload`.
    ///
    /// # Errors
    /// Returns `VersionTooLong` when the version does not fit a length byte.
    pub fn wrap(&self, payload: &[u8]) -> Result<Vec<u8>, ProvisioningError> {
        let version_length =
            u8::try_from(self.version.len()).map_err(|_| ProvisioningError::VersionTooLong(self.version.len()))?;
        let mut out = Vec::with_capacity(MAGIC_LENGTH + 17 + self.version.len() + payload.len());
        out.extend_from_slice(&self.magic);
        out.extend_from_slice(&self.header_version().to_be_bytes());
        out.extend_from_slice(&self.forced_error.0.to_be_bytes());
        out.extend_from_slice(&CRC32.checksum(payload).to_be_bytes());
        if let Some(slots) = &self.linked_slots {
            out.extend_from_slice(slots);
        }
        out.push(version_length);
        out.extend_from_slice(self.version.as_bytes());
        out.extend_from_slice(payload);
        Ok(out)
    }

    /// Splits a wrapped image into its header and payload, verifying the CRC.
    ///
    /// # Errors
    /// Returns an error for truncated data, an unknown header version or a
    /// CRC mismatch.
    pub fn unwrap(data: &[u8]) -> Result<(Self, &[u8]), ProvisioningError> {
        let mut reader = Reader::new(data);
        let magic = reader.array::<MAGIC_LENGTH>()?;
        let header_version = reader.u16()?;
        let forced_error = ForcedError(reader.u16()?);
        let crc = reader.u32()?;
        let linked_slots = match header_version {
            HEADER_VERSION_BASIC => None,
            HEADER_VERSION_LINKED => Some(reader.array::<LINKED_SLOTS_LENGTH>()?),
            other => return Err(ProvisioningError::UnsupportedHeaderVersion(other)),
        };
        let version_length = usize::from(reader.u8()?);
        let version = String::from_utf8_lossy(reader.take(version_length)?).into_owned();
        let payload = reader.rest();

        let actual = CRC32.checksum(payload);
        if actual != crc {
            return Err(ProvisioningError::CrcMismatch { expected: crc, actual });
        }
        Ok((
            Self {
                magic,
                forced_error,
                linked_slots,
                version,
            },
            payload,
        ))
    }
}

/// Several wrapped images delivered in one download.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MultiPackage {
    pub packages: Vec<Vec<u8>>,
}

impl MultiPackage {
    #[must_use]
    pub fn new(packages: Vec<Vec<u8>>) -> Self {
        Self { packages }
    }

    /// # Errors
    /// Returns `TooManyPackages` past 65535 packages and `Truncated` for a
    /// package larger than 4 GiB.
    pub fn encode(&self) -> Result<Vec<u8>, ProvisioningError> {
        let count =
            u16::try_from(self.packages.len()).map_err(|_| ProvisioningError::TooManyPackages(self.packages.len()))?;
        let total: usize = self.packages.iter().map(Vec::len).sum();
        let mut out = Vec::with_capacity(MAGIC_LENGTH + 4 + 4 * self.packages.len() + total);
        out.extend_from_slice(&MAGIC_MULTIPACKAGE);
        out.extend_from_slice(&MULTIPACKAGE_VERSION.to_be_bytes());
        out.extend_from_slice(&count.to_be_bytes());
        for package in &self.packages {
            let size = u32::try_from(package.len()).map_err(|_| ProvisioningError::Truncated {
                needed: package.len(),
                available: u32::MAX as usize,
            })?;
            out.extend_from_slice(&size.to_be_bytes());
        }
        for package in &self.packages {
            out.extend_from_slice(package);
        }
        Ok(out)
    }

    /// # Errors
    /// Returns an error for a foreign magic or truncated data.
    pub fn decode(data: &[u8]) -> Result<Self, ProvisioningError> {
        let mut reader = Reader::new(data);
        let magic = reader.array::<MAGIC_LENGTH>()?;
        if magic != MAGIC_MULTIPACKAGE {
            return Err(ProvisioningError::UnexpectedMagic(String::from_utf8_lossy(&magic).into_owned()));
        }
        let version = reader.u16()?;
        if version != MULTIPACKAGE_VERSION {
            return Err(ProvisioningError::UnsupportedHeaderVersion(version));
        }
        let count = reader.u16()?;
        let sizes = (0..count)
            .map(|_| reader.u32().map(|size| size as usize))
            .collect::<Result<Vec<_>, _>>()?;
        let packages = sizes
            .into_iter()
            .map(|size| reader.take(size).map(<[u8]>::to_vec))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { packages })
    }
}

/// A resource value in a JSON data-model description.
///
/// Plain JSON scalars map to integer, float, string and boolean values;
/// `{"opaque": "<hex>"}` and `{"objlnk": "oid:iid"}` select the other types
/// and an object keyed by instance IDs describes a multiple resource.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ResourceValue {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Opaque(OpaqueValue),
    ObjectLink(ObjectLinkValue),
    Multiple(BTreeMap<String, ResourceValue>),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpaqueValue {
    pub opaque: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObjectLinkValue {
    pub objlnk: String,
}

/// JSON data-model description: object ID → instance ID → resource ID → value.
///
/// ```json
/// { "1": { "0": { "0": 1, "1": 86400, "7": "U" } } }
/// ```
pub type DataModel = BTreeMap<String, BTreeMap<String, BTreeMap<String, ResourceValue>>>;

/// Parses a JSON data-model description.
///
/// # Errors
/// Returns `Json` for malformed input.
pub fn parse_data_model(json: &[u8]) -> Result<DataModel, ProvisioningError> {
    serde_json::from_slice(json).map_err(|e| ProvisioningError::Json(e.to_string()))
}

/// Entries of `map` keyed by numeric ID, in ascending ID order.
fn sorted_ids<'a, V>(
    parent: &str,
    map: &'a BTreeMap<String, V>,
) -> Result<Vec<(u16, &'a V)>, ProvisioningError> {
    let mut entries = map
        .iter()
        .map(|(id, value)| {
            id.parse::<u16>()
                .map(|id| (id, value))
                .map_err(|_| ProvisioningError::InvalidPath(format!("{parent}/{id}")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|(id, _)| *id);
    Ok(entries)
}

/// Ordered list of resource values serialised as one SenML-CBOR pack.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProvisioningBuilder {
    records: Vec<SenmlRecord>,
}

impl ProvisioningBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a value for a resource or resource-instance path.
    ///
    /// # Errors
    /// Returns `InvalidValue` when `path` does not name a resource.
    pub fn add(&mut self, path: &Lwm2mPath, value: SenmlValue) -> Result<&mut Self, ProvisioningError> {
        if !matches!(path.level(), PathLevel::Resource | PathLevel::ResourceInstance) {
            return Err(ProvisioningError::InvalidValue {
                path: path.to_string(),
                reason: "only resources carry values".into(),
            });
        }
        self.records.push(SenmlRecord::new(&path.to_string(), value));
        Ok(self)
    }

    /// Appends every value of a data-model description, in ID order.
    ///
    /// # Errors
    /// Returns an error for non-numeric IDs or undecodable values.
    pub fn add_data_model(&mut self, model: &DataModel) -> Result<&mut Self, ProvisioningError> {
        for (oid, instances) in sorted_ids("", model)? {
            for (iid, resources) in sorted_ids(&format!("/{oid}"), instances)? {
                for (rid, value) in sorted_ids(&format!("/{oid}/{iid}"), resources)? {
                    let path = Lwm2mPath::resource(oid, iid, rid);
                    self.add_value(&path, value)?;
                }
            }
        }
        Ok(self)
    }

    fn add_value(&mut self, path: &Lwm2mPath, value: &ResourceValue) -> Result<(), ProvisioningError> {
        let scalar = match value {
            ResourceValue::Boolean(b) => SenmlValue::Boolean(*b),
            ResourceValue::Integer(i) => SenmlValue::Integer(*i),
            ResourceValue::Float(f) => SenmlValue::Float(*f),
            ResourceValue::String(s) => SenmlValue::String(s.clone()),
            ResourceValue::Opaque(OpaqueValue { opaque }) => {
                let data = hex::decode(opaque).map_err(|e| ProvisioningError::InvalidValue {
                    path: path.to_string(),
                    reason: e.to_string(),
                })?;
                SenmlValue::Opaque(data)
            }
            ResourceValue::ObjectLink(ObjectLinkValue { objlnk }) => {
                if !is_object_link(objlnk) {
                    return Err(ProvisioningError::InvalidValue {
                        path: path.to_string(),
                        reason: format!("{objlnk:?} is not an oid:iid link"),
                    });
                }
                SenmlValue::ObjectLink(objlnk.clone())
            }
            ResourceValue::Multiple(instances) => {
                if path.level() == PathLevel::ResourceInstance {
                    return Err(ProvisioningError::InvalidValue {
                        path: path.to_string(),
                        reason: "nested multiple resource".into(),
                    });
                }
                for (riid, value) in sorted_ids(&path.to_string(), instances)? {
                    let instance_path = path
                        .child(riid)
                        .map_err(|_| ProvisioningError::InvalidPath(format!("{path}/{riid}")))?;
                    self.add_value(&instance_path, value)?;
                }
                return Ok(());
            }
        };
        self.add(path, scalar)?;
        Ok(())
    }

    #[must_use]
    pub fn records(&self) -> &[SenmlRecord] {
        &self.records
    }

    /// Serialises the records as SenML CBOR.
    ///
    /// # Errors
    /// Propagates the encoder error.
    pub fn build(&self) -> Result<Vec<u8>, ProvisioningError> {
        Ok(senml::encode_cbor(&self.records)?)
    }
}

fn is_object_link(link: &str) -> bool {
    link.split_once(':')
        .is_some_and(|(oid, iid)| oid.parse::<u16>().is_ok() && iid.parse::<u16>().is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_firmware_header_layout() {
        let header = FirmwareHeader::new(MAGIC_FIRMWARE, "1.2").with_forced_error(ForcedError::FAILED_UPDATE);
        let wrapped = header.wrap(b"image").unwrap();

        assert_eq!(&wrapped[..8], b"ANJAY_FW");
        assert_eq!(&wrapped[8..10], &[0, 2]);
        assert_eq!(&wrapped[10..12], &[0, 2]);
        assert_eq!(&wrapped[12..16], &CRC32.checksum(b"image").to_be_bytes());
        assert_eq!(wrapped[16], 3);
        assert_eq!(&wrapped[17..20], b"1.2");
        assert_eq!(&wrapped[20..], b"image");

        let (parsed, payload) = FirmwareHeader::unwrap(&wrapped).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(payload, b"image");
    }

    #[test]
    fn test_linked_slots_and_crc_check() {
        let header = FirmwareHeader::new(MAGIC_APPLICATION, "").with_linked_slots([1, 0, 0, 0, 0, 0, 0, 0]);
        let mut wrapped = header.wrap(&[0xAA; 10]).unwrap();
        assert_eq!(&wrapped[8..10], &HEADER_VERSION_LINKED.to_be_bytes());
        assert_eq!(&wrapped[16..24], &[1, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(FirmwareHeader::unwrap(&wrapped).unwrap().0.linked_slots, header.linked_slots);

        let last = wrapped.len() - 1;
        wrapped[last] ^= 0xFF;
        assert!(matches!(
            FirmwareHeader::unwrap(&wrapped),
            Err(ProvisioningError::CrcMismatch { .. })
        ));
        assert!(matches!(
            FirmwareHeader::unwrap(&wrapped[..10]),
            Err(ProvisioningError::Truncated { .. })
        ));
    }

    #[test]
    fn test_multipackage() {
        let packages = vec![b"first".to_vec(), Vec::new(), vec![7; 300]];
        let encoded = MultiPackage::new(packages.clone()).encode().unwrap();
        assert_eq!(&encoded[..8], b"MULTIPKG");
        assert_eq!(&encoded[8..12], &[0, 1, 0, 3]);
        assert_eq!(&encoded[12..16], &5u32.to_be_bytes());
        assert_eq!(&encoded[20..24], &300u32.to_be_bytes());
        assert_eq!(MultiPackage::decode(&encoded).unwrap().packages, packages);

        assert!(matches!(
            MultiPackage::decode(&encoded[..encoded.len() - 1]),
            Err(ProvisioningError::Truncated { .. })
        ));
        assert!(matches!(
            MultiPackage::decode(b"ANJAY_FW\0\x01\0\0"),
            Err(ProvisioningError::UnexpectedMagic(_))
        ));
    }

    #[test]
    fn test_data_model_to_senml() {
        let model = parse_data_model(
            br#"{
                "1": { "0": { "0": 1, "1": 86400, "7": "U" } },
                "0": { "0": { "0": "coap://127.0.0.1:5683", "1": false, "3": {"opaque": "0a0b"} } },
                "3": { "0": { "11": { "0": 0, "1": 2 } } },
                "16": { "0": { "2": {"objlnk": "1:0"} } }
            }"#,
        )
        .unwrap();
        let mut builder = ProvisioningBuilder::new();
        builder.add_data_model(&model).unwrap();

        let names: Vec<_> = builder
            .records()
            .iter()
            .map(|r| r.name.clone().unwrap())
            .collect();
        assert_eq!(
            names,
            ["/0/0/0", "/0/0/1", "/0/0/3", "/1/0/0", "/1/0/1", "/1/0/7", "/3/0/11/0", "/3/0/11/1", "/16/0/2"]
        );
        assert_eq!(builder.records()[2].value, Some(SenmlValue::Opaque(vec![0x0A, 0x0B])));
        assert_eq!(builder.records()[8].value, Some(SenmlValue::ObjectLink("1:0".into())));

        let cbor = builder.build().unwrap();
        assert_eq!(senml::decode_cbor(&cbor).unwrap(), builder.records());
    }

    #[test]
    fn test_invalid_data_model() {
        let model = parse_data_model(br#"{"x": {}}"#).unwrap();
        assert_eq!(
            ProvisioningBuilder::new().add_data_model(&model).unwrap_err(),
            ProvisioningError::InvalidPath("/x".into())
        );
        let model = parse_data_model(br#"{"1": {"0": {"0": {"objlnk": "nope"}}}}"#).unwrap();
        assert!(matches!(
            ProvisioningBuilder::new().add_data_model(&model),
            Err(ProvisioningError::InvalidValue { .. })
        ));
        assert!(matches!(parse_data_model(b"[1]"), Err(ProvisioningError::Json(_))));
        assert!(ProvisioningBuilder::new()
            .add(&Lwm2mPath::object(3), SenmlValue::Integer(1))
            .is_err());
    }
}
