//! Connection admission.
//!
//! Runs after the TLS handshake and before any request byte is read. The negotiated
//! protocol id is checked first; the client certificate outcome is only inspected for
//! connections that speak the right protocol.

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Protocol id offered and expected during TLS negotiation (ALPN).
pub const GEMINI_PROTOCOL_ID: &str = "gemini";

/// Reasons a handshaken connection is refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    /// The negotiated protocol id was rejected by the verifier.
    #[error("Negotiated protocol {0:?} is not accepted")]
    ProtocolMismatch(Option<String>),

    /// The client certificate failed validation for a reason that is not tolerated.
    #[error("Untrusted client certificate: {0}")]
    UntrustedCertificate(String),
}

/// Outcome of validating the client's certificate chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateStatus {
    /// The client did not present a certificate.
    NotPresented,
    /// The chain verified against the configured client CA roots.
    Trusted,
    /// The chain ends in a self-signed root that is not trusted.
    SelfSignedInChain,
    /// The client presented a single self-signed certificate.
    DepthZeroSelfSigned,
    /// The issuer of a certificate in the chain could not be found.
    UnableToGetIssuer,
    /// Any other validation failure.
    Invalid(String),
}

impl CertificateStatus {
    /// Self-issued identities are first-class in Gemini, so only `Invalid` is refused.
    pub fn is_tolerated(&self) -> bool {
        !matches!(self, CertificateStatus::Invalid(_))
    }
}

impl fmt::Display for CertificateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertificateStatus::NotPresented => f.write_str("no certificate presented"),
            CertificateStatus::Trusted => f.write_str("trusted"),
            CertificateStatus::SelfSignedInChain => f.write_str("self-signed certificate in chain"),
            CertificateStatus::DepthZeroSelfSigned => f.write_str("self-signed certificate"),
            CertificateStatus::UnableToGetIssuer => f.write_str("unable to get issuer certificate"),
            CertificateStatus::Invalid(reason) => f.write_str(reason),
        }
    }
}

/// What the TLS layer reports about an established connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportInfo {
    /// Protocol id agreed during the handshake, if any.
    pub protocol_id: Option<String>,
    /// Fingerprint of the presented client certificate, if any.
    pub client_fingerprint: Option<String>,
    /// Validation outcome for the presented chain.
    pub certificate_status: CertificateStatus,
}

impl TransportInfo {
    /// A connection that negotiated the Gemini protocol without a client certificate.
    pub fn anonymous() -> Self {
        Self {
            protocol_id: Some(GEMINI_PROTOCOL_ID.to_owned()),
            client_fingerprint: None,
            certificate_status: CertificateStatus::NotPresented,
        }
    }
}

/// Result of a successful admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    /// Fingerprint retained for the eventual request.
    pub client_fingerprint: Option<String>,
}

/// Predicate deciding whether a negotiated protocol id is acceptable.
pub type ProtocolIdVerifier = Arc<dyn Fn(Option<&str>) -> bool + Send + Sync>;

/// Decides, per connection, whether to admit it.
#[derive(Clone)]
pub struct Gatekeeper {
    verify_protocol_id: ProtocolIdVerifier,
}

impl Gatekeeper {
    pub fn new<F>(verify_protocol_id: F) -> Self
    where
        F: Fn(Option<&str>) -> bool + Send + Sync + 'static,
    {
        Self {
            verify_protocol_id: Arc::new(verify_protocol_id),
        }
    }

    pub fn admit(&self, transport: &TransportInfo) -> Result<Admission, AdmissionError> {
        if !(self.verify_protocol_id)(transport.protocol_id.as_deref()) {
            return Err(AdmissionError::ProtocolMismatch(transport.protocol_id.clone()));
        }

        if let CertificateStatus::Invalid(reason) = &transport.certificate_status {
            return Err(AdmissionError::UntrustedCertificate(reason.clone()));
        }

        Ok(Admission {
            client_fingerprint: transport.client_fingerprint.clone(),
        })
    }
}

impl Default for Gatekeeper {
    fn default() -> Self {
        Gatekeeper::new(|protocol_id| protocol_id == Some(GEMINI_PROTOCOL_ID))
    }
}

impl fmt::Debug for Gatekeeper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gatekeeper").finish_non_exhaustive()
    }
}
