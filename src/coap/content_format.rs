//! Content-Format identifiers used by LwM2M.

use std::fmt;

/// CoAP Content-Format number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentFormat(pub u16);

impl ContentFormat {
    pub const TEXT: Self = Self(0);
    pub const LINK_FORMAT: Self = Self(40);
    pub const OPAQUE: Self = Self(42);
    pub const CBOR: Self = Self(60);
    pub const SENML_JSON: Self = Self(110);
    pub const SENML_CBOR: Self = Self(112);
    pub const SENML_ETCH_JSON: Self = Self(320);
    pub const SENML_ETCH_CBOR: Self = Self(322);
    pub const LWM2M_TLV_LEGACY: Self = Self(1542);
    pub const LWM2M_JSON_LEGACY: Self = Self(1543);
    pub const LWM2M_TLV: Self = Self(11542);
    pub const LWM2M_JSON: Self = Self(11543);
    pub const LWM2M_CBOR: Self = Self(11544);

    #[must_use]
    pub fn is_senml(self) -> bool {
        matches!(
            self,
            Self::SENML_JSON | Self::SENML_CBOR | Self::SENML_ETCH_JSON | Self::SENML_ETCH_CBOR
        )
    }

    #[must_use]
    pub fn is_tlv(self) -> bool {
        self == Self::LWM2M_TLV || self == Self::LWM2M_TLV_LEGACY
    }
}

impl fmt::Display for ContentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::TEXT => "text/plain",
            Self::LINK_FORMAT => "application/link-format",
            Self::OPAQUE => "application/octet-stream",
            Self::CBOR => "application/cbor",
            Self::SENML_JSON => "application/senml+json",
            Self::SENML_CBOR => "application/senml+cbor",
            Self::SENML_ETCH_JSON => "application/senml-etch+json",
            Self::SENML_ETCH_CBOR => "application/senml-etch+cbor",
            Self::LWM2M_TLV | Self::LWM2M_TLV_LEGACY => "application/vnd.oma.lwm2m+tlv",
            Self::LWM2M_JSON | Self::LWM2M_JSON_LEGACY => "application/vnd.oma.lwm2m+json",
            Self::LWM2M_CBOR => "application/vnd.oma.lwm2m+cbor",
            _ => return write!(f, "content-format {}", self.0),
        };
        write!(f, "{name} ({})", self.0)
    }
}
