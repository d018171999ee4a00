//! Crate-level error aggregating the codec, transport and harness failures.

use thiserror::Error;

use crate::{
    coap::{Code, CoapError, OptionNumber},
    crypto::PskError,
    link_format::LinkFormatError,
    path::PathError,
    provisioning::ProvisioningError,
    senml::SenmlError,
    tlv::TlvError,
    transport::{dtls::DtlsError, TransportError},
};

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("CoAP error: {0}")]
    Coap(#[from] CoapError),

    #[error("TLV error: {0}")]
    Tlv(#[from] TlvError),

    #[error("SenML error: {0}")]
    Senml(#[from] SenmlError),

    #[error("Path error: {0}")]
    Path(#[from] PathError),

    #[error("Link format error: {0}")]
    LinkFormat(#[from] LinkFormatError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("PSK error: {0}")]
    Psk(#[from] PskError),

    #[error("Provisioning error: {0}")]
    Provisioning(#[from] ProvisioningError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unexpected message: expected {expected}, got {actual}")]
    UnexpectedMessage { expected: String, actual: String },

    #[error("Unexpected response code: expected {expected}, got {actual}")]
    UnexpectedCode { expected: Code, actual: Code },

    #[error("Missing option {0}")]
    MissingOption(OptionNumber),

    #[error("Failed to spawn client: {0}")]
    ClientSpawnFailed(String),

    #[error("Client crashed ({status})\n--- output tail ---\n{tail}{}", memcheck_suffix(.memcheck_log))]
    ClientCrashed {
        status: String,
        tail: String,
        memcheck_log: Option<String>,
    },

    #[error("Assertion failed: {0}")]
    Assertion(String),

    #[error("Setup failed: {0}")]
    Setup(String),
}

impl From<DtlsError> for HarnessError {
    fn from(e: DtlsError) -> Self {
        Self::Transport(e.into())
    }
}

impl HarnessError {
    /// True for transport timeouts, which tests frequently expect.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Transport(TransportError::Timeout))
    }

    /// Builds an assertion failure.
    pub fn assertion(message: impl Into<String>) -> Self {
        Self::Assertion(message.into())
    }
}

fn memcheck_suffix(log: &Option<String>) -> String {
    log.as_deref()
        .map(|l| format!("\n--- memory checker log ---\n{l}"))
        .unwrap_or_default()
}

/// Result alias used across the harness.
pub type Result<T, E = HarnessError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_detection() {
        assert!(HarnessError::from(TransportError::Timeout).is_timeout());
        assert!(!HarnessError::assertion("nope").is_timeout());
    }

    #[test]
    fn test_crash_message_includes_memcheck_log() {
        let err = HarnessError::ClientCrashed {
            status: "signal 11".into(),
            tail: "last line\n".into(),
            memcheck_log: Some("Invalid read of size 4".into()),
        };
        let text = err.to_string();
        assert!(text.contains("signal 11"));
        assert!(text.contains("last line"));
        assert!(text.contains("Invalid read of size 4"));
    }

    #[test]
    fn test_dtls_errors_become_transport_errors() {
        let err = HarnessError::from(DtlsError::MalformedHandshake("short".into()));
        assert!(matches!(
            err,
            HarnessError::Transport(TransportError::MalformedHandshake(_))
        ));
    }
}
