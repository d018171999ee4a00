//! SenML (RFC 8428) records in JSON and CBOR form, as used by LwM2M 1.1
//! content formats 110 and 112.
//!
//! # Labels
//!
//! | Label | JSON  | CBOR |
//! |-------|-------|------|
//! | Base Name | `bn` | -2 |
//! | Base Time | `bt` | -3 |
//! | Name | `n` | 0 |
//! | Value | `v` | 2 |
//! | String Value | `vs` | 3 |
//! | Boolean Value | `vb` | 4 |
//! | Time | `t` | 6 |
//! | Data Value | `vd` (base64url) | 8 |
//! | Object Link | `vlo` | `"vlo"` |

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ciborium::value::Value as CborValue;
use serde_json::{Map, Number, Value as JsonValue};
use thiserror::Error;

use crate::{coap::ContentFormat, path::Lwm2mPath};

const CBOR_BASE_NAME: i64 = -2;
const CBOR_BASE_TIME: i64 = -3;
const CBOR_NAME: i64 = 0;
const CBOR_VALUE: i64 = 2;
const CBOR_STRING_VALUE: i64 = 3;
const CBOR_BOOL_VALUE: i64 = 4;
const CBOR_TIME: i64 = 6;
const CBOR_DATA_VALUE: i64 = 8;
const OBJLNK_LABEL: &str = "vlo";

/// Errors raised by the SenML codecs and the scope validator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SenmlError {
    #[error("Invalid SenML JSON: {0}")]
    Json(String),

    #[error("Invalid SenML CBOR: {0}")]
    Cbor(String),

    /// Top level is not an array of maps.
    #[error("SenML pack must be an array of records")]
    NotAPack,

    /// A label carries a value of the wrong type.
    #[error("Label {label} has an invalid value")]
    InvalidLabel { label: String },

    /// Content format is not SenML.
    #[error("{0} is not a SenML content format")]
    UnsupportedFormat(ContentFormat),

    /// Resolved name is not a path inside the request scope.
    #[error("Record {name:?} is outside the scope {scope}")]
    OutOfScope { name: String, scope: String },
}

/// Value carried by a record.
#[derive(Debug, Clone, PartialEq)]
pub enum SenmlValue {
    Integer(i64),
    Float(f64),
    String(String),
    Boolean(bool),
    Opaque(Vec<u8>),
    /// Object link rendered `oid:iid`.
    ObjectLink(String),
}

/// A single SenML record, before base-field resolution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SenmlRecord {
    pub base_name: Option<String>,
    pub base_time: Option<f64>,
    pub name: Option<String>,
    pub value: Option<SenmlValue>,
    pub time: Option<f64>,
}

impl SenmlRecord {
    #[must_use]
    pub fn new(name: &str, value: SenmlValue) -> Self {
        Self {
            name: Some(name.to_string()),
            value: Some(value),
            ..Default::default()
        }
    }

    /// A record carrying only a name, as in Read-Composite requests.
    #[must_use]
    pub fn name_only(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_base_name(mut self, base_name: &str) -> Self {
        self.base_name = Some(base_name.to_string());
        self
    }

    #[must_use]
    pub fn with_time(mut self, time: f64) -> Self {
        self.time = Some(time);
        self
    }
}

/// A record with its effective name and time.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRecord {
    pub name: String,
    pub value: Option<SenmlValue>,
    pub time: Option<f64>,
}

impl ResolvedRecord {
    /// Parses the effective name as a data model path.
    #[must_use]
    pub fn path(&self) -> Option<Lwm2mPath> {
        self.name.parse().ok()
    }
}

/// Applies base name and base time to every record in order.
///
/// `bn` and `bt` persist until a later record replaces them.
#[must_use]
pub fn resolve(records: &[SenmlRecord]) -> Vec<ResolvedRecord> {
    let mut base_name = String::new();
    let mut base_time: Option<f64> = None;
    records
        .iter()
        .map(|record| {
            if let Some(bn) = &record.base_name {
                base_name = bn.clone();
            }
            if record.base_time.is_some() {
                base_time = record.base_time;
            }
            let time = match (base_time, record.time) {
                (Some(bt), t) => Some(bt + t.unwrap_or(0.0)),
                (None, t) => t,
            };
            ResolvedRecord {
                name: format!("{base_name}{}", record.name.as_deref().unwrap_or("")),
                value: record.value.clone(),
                time,
            }
        })
        .collect()
}

/// Rejects records whose effective name is not a path within one of the
/// requested `scopes`.
///
/// # Errors
/// Returns `SenmlError::OutOfScope` for the first offending record.
pub fn validate_scope(records: &[ResolvedRecord], scopes: &[Lwm2mPath]) -> Result<(), SenmlError> {
    for record in records {
        match record.path() {
            Some(path) if scopes.iter().any(|scope| scope.is_prefix_of(&path)) => {}
            _ => {
                let scope: Vec<String> = scopes.iter().map(ToString::to_string).collect();
                return Err(SenmlError::OutOfScope {
                    name: record.name.clone(),
                    scope: scope.join(","),
                });
            }
        }
    }
    Ok(())
}

/// Encodes records in the given SenML content format.
///
/// # Errors
/// Returns `SenmlError::UnsupportedFormat` for non-SenML formats.
pub fn encode(records: &[SenmlRecord], format: ContentFormat) -> Result<Vec<u8>, SenmlError> {
    match format {
        ContentFormat::SENML_JSON | ContentFormat::SENML_ETCH_JSON => encode_json(records),
        ContentFormat::SENML_CBOR | ContentFormat::SENML_ETCH_CBOR => encode_cbor(records),
        other => Err(SenmlError::UnsupportedFormat(other)),
    }
}

/// Decodes a SenML payload of the given content format.
///
/// # Errors
/// Returns an error for malformed payloads or non-SenML formats.
pub fn decode(payload: &[u8], format: ContentFormat) -> Result<Vec<SenmlRecord>, SenmlError> {
    match format {
        ContentFormat::SENML_JSON | ContentFormat::SENML_ETCH_JSON => decode_json(payload),
        ContentFormat::SENML_CBOR | ContentFormat::SENML_ETCH_CBOR => decode_cbor(payload),
        other => Err(SenmlError::UnsupportedFormat(other)),
    }
}

/// # Errors
/// Returns `SenmlError::Json` if a float value is not finite.
pub fn encode_json(records: &[SenmlRecord]) -> Result<Vec<u8>, SenmlError> {
    let mut pack = Vec::with_capacity(records.len());
    for record in records {
        let mut map = Map::new();
        if let Some(bn) = &record.base_name {
            map.insert("bn".into(), JsonValue::String(bn.clone()));
        }
        if let Some(bt) = record.base_time {
            map.insert("bt".into(), json_float(bt)?);
        }
        if let Some(n) = &record.name {
            map.insert("n".into(), JsonValue::String(n.clone()));
        }
        if let Some(t) = record.time {
            map.insert("t".into(), json_float(t)?);
        }
        match &record.value {
            Some(SenmlValue::Integer(i)) => {
                map.insert("v".into(), JsonValue::Number((*i).into()));
            }
            Some(SenmlValue::Float(f)) => {
                map.insert("v".into(), json_float(*f)?);
            }
            Some(SenmlValue::String(s)) => {
                map.insert("vs".into(), JsonValue::String(s.clone()));
            }
            Some(SenmlValue::Boolean(b)) => {
                map.insert("vb".into(), JsonValue::Bool(*b));
            }
            Some(SenmlValue::Opaque(data)) => {
                map.insert("vd".into(), JsonValue::String(URL_SAFE_NO_PAD.encode(data)));
            }
            Some(SenmlValue::ObjectLink(link)) => {
                map.insert(OBJLNK_LABEL.into(), JsonValue::String(link.clone()));
            }
            None => {}
        }
        pack.push(JsonValue::Object(map));
    }
    serde_json::to_vec(&JsonValue::Array(pack)).map_err(|e| SenmlError::Json(e.to_string()))
}

fn json_float(value: f64) -> Result<JsonValue, SenmlError> {
    Number::from_f64(value)
        .map(JsonValue::Number)
        .ok_or_else(|| SenmlError::Json(format!("non-finite number {value}")))
}

/// # Errors
/// Returns an error when the payload is not a JSON array of SenML records.
pub fn decode_json(payload: &[u8]) -> Result<Vec<SenmlRecord>, SenmlError> {
    let parsed: JsonValue =
        serde_json::from_slice(payload).map_err(|e| SenmlError::Json(e.to_string()))?;
    let JsonValue::Array(items) = parsed else {
        return Err(SenmlError::NotAPack);
    };

    items
        .into_iter()
        .map(|item| {
            let JsonValue::Object(map) = item else {
                return Err(SenmlError::NotAPack);
            };
            let mut record = SenmlRecord::default();
            for (label, value) in map {
                let invalid = || SenmlError::InvalidLabel {
                    label: label.clone(),
                };
                match label.as_str() {
                    "bn" => record.base_name = Some(value.as_str().ok_or_else(invalid)?.into()),
                    "bt" => record.base_time = Some(value.as_f64().ok_or_else(invalid)?),
                    "n" => record.name = Some(value.as_str().ok_or_else(invalid)?.into()),
                    "t" => record.time = Some(value.as_f64().ok_or_else(invalid)?),
                    "v" => {
                        record.value = Some(match value.as_i64() {
                            Some(i) => SenmlValue::Integer(i),
                            None => SenmlValue::Float(value.as_f64().ok_or_else(invalid)?),
                        })
                    }
                    "vs" => {
                        record.value =
                            Some(SenmlValue::String(value.as_str().ok_or_else(invalid)?.into()))
                    }
                    "vb" => {
                        record.value = Some(SenmlValue::Boolean(value.as_bool().ok_or_else(invalid)?))
                    }
                    "vd" => {
                        let text = value.as_str().ok_or_else(invalid)?;
                        let data = URL_SAFE_NO_PAD
                            .decode(text.trim_end_matches('='))
                            .map_err(|_| invalid())?;
                        record.value = Some(SenmlValue::Opaque(data));
                    }
                    OBJLNK_LABEL => {
                        record.value = Some(SenmlValue::ObjectLink(
                            value.as_str().ok_or_else(invalid)?.into(),
                        ))
                    }
                    _ => log::debug!("ignoring unknown SenML label {label}"),
                }
            }
            Ok(record)
        })
        .collect()
}

/// # Errors
/// Returns `SenmlError::Cbor` if serialization fails.
pub fn encode_cbor(records: &[SenmlRecord]) -> Result<Vec<u8>, SenmlError> {
    let int_key = |k: i64| CborValue::Integer(k.into());
    let pack: Vec<CborValue> = records
        .iter()
        .map(|record| {
            let mut map = Vec::new();
            if let Some(bn) = &record.base_name {
                map.push((int_key(CBOR_BASE_NAME), CborValue::Text(bn.clone())));
            }
            if let Some(bt) = record.base_time {
                map.push((int_key(CBOR_BASE_TIME), CborValue::Float(bt)));
            }
            if let Some(n) = &record.name {
                map.push((int_key(CBOR_NAME), CborValue::Text(n.clone())));
            }
            if let Some(t) = record.time {
                map.push((int_key(CBOR_TIME), CborValue::Float(t)));
            }
            match &record.value {
                Some(SenmlValue::Integer(i)) => {
                    map.push((int_key(CBOR_VALUE), CborValue::Integer((*i).into())))
                }
                Some(SenmlValue::Float(f)) => map.push((int_key(CBOR_VALUE), CborValue::Float(*f))),
                Some(SenmlValue::String(s)) => {
                    map.push((int_key(CBOR_STRING_VALUE), CborValue::Text(s.clone())))
                }
                Some(SenmlValue::Boolean(b)) => {
                    map.push((int_key(CBOR_BOOL_VALUE), CborValue::Bool(*b)))
                }
                Some(SenmlValue::Opaque(data)) => {
                    map.push((int_key(CBOR_DATA_VALUE), CborValue::Bytes(data.clone())))
                }
                Some(SenmlValue::ObjectLink(link)) => map.push((
                    CborValue::Text(OBJLNK_LABEL.into()),
                    CborValue::Text(link.clone()),
                )),
                None => {}
            }
            CborValue::Map(map)
        })
        .collect();

    let mut buf = Vec::new();
    ciborium::into_writer(&CborValue::Array(pack), &mut buf)
        .map_err(|e| SenmlError::Cbor(e.to_string()))?;
    Ok(buf)
}

/// # Errors
/// Returns an error when the payload is not a CBOR array of SenML maps.
pub fn decode_cbor(payload: &[u8]) -> Result<Vec<SenmlRecord>, SenmlError> {
    let parsed: CborValue =
        ciborium::from_reader(payload).map_err(|e| SenmlError::Cbor(e.to_string()))?;
    let CborValue::Array(items) = parsed else {
        return Err(SenmlError::NotAPack);
    };

    items
        .into_iter()
        .map(|item| {
            let CborValue::Map(entries) = item else {
                return Err(SenmlError::NotAPack);
            };
            let mut record = SenmlRecord::default();
            for (key, value) in entries {
                let label = match &key {
                    CborValue::Integer(i) => cbor_label_name(i128::from(*i)),
                    CborValue::Text(t) => t.clone(),
                    _ => return Err(SenmlError::NotAPack),
                };
                let invalid = || SenmlError::InvalidLabel {
                    label: label.clone(),
                };
                match label.as_str() {
                    "bn" => record.base_name = Some(cbor_text(value).ok_or_else(invalid)?),
                    "bt" => record.base_time = Some(cbor_number(&value).ok_or_else(invalid)?),
                    "n" => record.name = Some(cbor_text(value).ok_or_else(invalid)?),
                    "t" => record.time = Some(cbor_number(&value).ok_or_else(invalid)?),
                    "v" => {
                        record.value = Some(match value {
                            CborValue::Integer(i) => i64::try_from(i128::from(i))
                                .map(SenmlValue::Integer)
                                .unwrap_or(SenmlValue::Float(i128::from(i) as f64)),
                            CborValue::Float(f) => SenmlValue::Float(f),
                            _ => return Err(invalid()),
                        })
                    }
                    "vs" => {
                        record.value = Some(SenmlValue::String(cbor_text(value).ok_or_else(invalid)?))
                    }
                    "vb" => {
                        record.value = Some(match value {
                            CborValue::Bool(b) => SenmlValue::Boolean(b),
                            _ => return Err(invalid()),
                        })
                    }
                    "vd" => {
                        record.value = Some(match value {
                            CborValue::Bytes(b) => SenmlValue::Opaque(b),
                            _ => return Err(invalid()),
                        })
                    }
                    OBJLNK_LABEL => {
                        record.value =
                            Some(SenmlValue::ObjectLink(cbor_text(value).ok_or_else(invalid)?))
                    }
                    _ => log::debug!("ignoring unknown SenML label {label}"),
                }
            }
            Ok(record)
        })
        .collect()
}

fn cbor_label_name(label: i128) -> String {
    match label as i64 {
        CBOR_BASE_NAME => "bn".into(),
        CBOR_BASE_TIME => "bt".into(),
        CBOR_NAME => "n".into(),
        CBOR_VALUE => "v".into(),
        CBOR_STRING_VALUE => "vs".into(),
        CBOR_BOOL_VALUE => "vb".into(),
        CBOR_TIME => "t".into(),
        CBOR_DATA_VALUE => "vd".into(),
        other => other.to_string(),
    }
}

fn cbor_text(value: CborValue) -> Option<String> {
    match value {
        CborValue::Text(t) => Some(t),
        _ => None,
    }
}

fn cbor_number(value: &CborValue) -> Option<f64> {
    match value {
        CborValue::Integer(i) => Some(i128::from(*i) as f64),
        CborValue::Float(f) => Some(*f),
        _ => None,
    }
}
