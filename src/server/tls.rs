//! TLS-side inputs to admission: the handshake verifier and post-handshake chain checks.

use std::io;
use std::sync::Arc;
use std::time::SystemTime;

use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::rustls::server::{
    Acceptor, AllowAnyAuthenticatedClient, ClientCertVerified, ClientCertVerifier,
};
use tokio_rustls::rustls::{
    Certificate, CertificateError, DistinguishedName, Error as TlsError, RootCertStore,
    ServerConfig, ServerConnection,
};
use tokio_rustls::{server::TlsStream, LazyConfigAcceptor};

use crate::server::gatekeeper::{CertificateStatus, TransportInfo, GEMINI_PROTOCOL_ID};

/// Accepts TLS connections, agreeing on the `gemini` protocol id when the client offers it.
///
/// A client offering only other ids still completes the handshake, with no protocol agreed,
/// so the gatekeeper rather than the TLS layer decides whether to keep the connection.
#[derive(Clone, Debug)]
pub struct GeminiAcceptor {
    negotiating: Arc<ServerConfig>,
    plain: Arc<ServerConfig>,
}

impl GeminiAcceptor {
    pub fn new(config: ServerConfig) -> Self {
        let mut negotiating = config.clone();
        negotiating.alpn_protocols = vec![GEMINI_PROTOCOL_ID.as_bytes().to_vec()];
        let mut plain = config;
        plain.alpn_protocols.clear();

        Self {
            negotiating: Arc::new(negotiating),
            plain: Arc::new(plain),
        }
    }

    /// Runs the server side of the handshake.
    ///
    /// # Errors
    /// Returns the I/O or TLS failure that ended the handshake.
    pub async fn accept<IO>(&self, stream: IO) -> io::Result<TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let start = LazyConfigAcceptor::new(Acceptor::default(), stream).await?;
        let config = if offers_gemini(start.client_hello().alpn()) {
            Arc::clone(&self.negotiating)
        } else {
            Arc::clone(&self.plain)
        };
        start.into_stream(config).await
    }
}

fn offers_gemini<'a>(offered: Option<impl Iterator<Item = &'a [u8]>>) -> bool {
    offered.map_or(false, |mut ids| ids.any(|id| id == GEMINI_PROTOCOL_ID.as_bytes()))
}

/// Requests a client certificate without requiring one, and never fails the handshake
/// over chain validation. Proof of key possession is still checked by rustls.
pub struct AcceptAnyClientCertificate;

impl ClientCertVerifier for AcceptAnyClientCertificate {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn client_auth_root_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _now: SystemTime,
    ) -> Result<ClientCertVerified, TlsError> {
        Ok(ClientCertVerified::assertion())
    }
}

/// Validates presented client chains against the configured client CA roots.
#[derive(Clone)]
pub struct PeerValidator {
    trusted: Arc<AllowAnyAuthenticatedClient>,
}

impl PeerValidator {
    pub fn new(roots: RootCertStore) -> Self {
        Self {
            trusted: Arc::new(AllowAnyAuthenticatedClient::new(roots)),
        }
    }

    /// Classifies a chain (end entity first) the way the gatekeeper expects.
    pub fn classify(&self, chain: &[Certificate]) -> CertificateStatus {
        let Some((end_entity, intermediates)) = chain.split_first() else {
            return CertificateStatus::NotPresented;
        };
        let now = SystemTime::now();

        match self.trusted.verify_client_cert(end_entity, intermediates, now) {
            Ok(_) => CertificateStatus::Trusted,
            Err(TlsError::InvalidCertificate(CertificateError::UnknownIssuer)) => {
                classify_unknown_issuer(chain, now)
            }
            Err(e) => CertificateStatus::Invalid(describe(&e)),
        }
    }

    /// Collects what the gatekeeper needs from an established connection.
    pub fn inspect(&self, connection: &ServerConnection) -> TransportInfo {
        let protocol_id = connection
            .alpn_protocol()
            .map(|id| String::from_utf8_lossy(id).into_owned());
        let chain = connection.peer_certificates().unwrap_or_default();

        TransportInfo {
            protocol_id,
            client_fingerprint: chain.first().map(fingerprint),
            certificate_status: self.classify(chain),
        }
    }
}

impl Default for PeerValidator {
    fn default() -> Self {
        Self::new(RootCertStore::empty())
    }
}

/// Distinguishes self-issued chains, which are tolerated, from chains missing an issuer.
fn classify_unknown_issuer(chain: &[Certificate], now: SystemTime) -> CertificateStatus {
    match chain {
        [single] => {
            if anchored_by(single, single, &[], now) {
                CertificateStatus::DepthZeroSelfSigned
            } else {
                CertificateStatus::Invalid("unable to get local issuer certificate".into())
            }
        }
        [end_entity, intermediates @ .., root] => {
            if anchored_by(root, end_entity, intermediates, now) {
                CertificateStatus::SelfSignedInChain
            } else {
                CertificateStatus::UnableToGetIssuer
            }
        }
        [] => CertificateStatus::NotPresented,
    }
}

/// Whether `end_entity` verifies when `anchor` is the only trusted root.
fn anchored_by(
    anchor: &Certificate,
    end_entity: &Certificate,
    intermediates: &[Certificate],
    now: SystemTime,
) -> bool {
    let mut roots = RootCertStore::empty();
    let (added, _) = roots.add_parsable_certificates(&[anchor.0.as_slice()]);
    if added == 0 {
        return false;
    }
    AllowAnyAuthenticatedClient::new(roots)
        .verify_client_cert(end_entity, intermediates, now)
        .is_ok()
}

fn describe(error: &TlsError) -> String {
    match error {
        TlsError::InvalidCertificate(CertificateError::Expired) => "certificate has expired".into(),
        TlsError::InvalidCertificate(CertificateError::NotValidYet) => {
            "certificate is not yet valid".into()
        }
        TlsError::InvalidCertificate(CertificateError::BadSignature) => {
            "certificate signature failure".into()
        }
        TlsError::InvalidCertificate(CertificateError::Revoked) => "certificate revoked".into(),
        other => other.to_string(),
    }
}

/// SHA-1 fingerprint of a DER certificate as colon-separated upper-case hex.
pub fn fingerprint(certificate: &Certificate) -> String {
    Sha1::digest(&certificate.0)
        .iter()
        .map(|byte| format!("{byte:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SELF_SIGNED: &str = include_str!("../../tests/fixtures/client-self-signed.crt");
    const CA_SIGNED: &str = include_str!("../../tests/fixtures/client-ca-signed.crt");
    const EXPIRED: &str = include_str!("../../tests/fixtures/client-expired.crt");
    const CA: &str = include_str!("../../tests/fixtures/ca.crt");

    fn pem(contents: &str) -> Certificate {
        let mut certs = rustls_pemfile::certs(&mut contents.as_bytes()).unwrap();
        Certificate(certs.remove(0))
    }

    fn with_ca() -> PeerValidator {
        let mut roots = RootCertStore::empty();
        roots.add(&pem(CA)).unwrap();
        PeerValidator::new(roots)
    }

    #[test]
    fn no_chain_means_no_certificate() {
        assert_eq!(PeerValidator::default().classify(&[]), CertificateStatus::NotPresented);
    }

    #[test]
    fn single_self_signed_certificate_is_depth_zero() {
        let status = PeerValidator::default().classify(&[pem(SELF_SIGNED)]);
        assert_eq!(status, CertificateStatus::DepthZeroSelfSigned);
        assert!(status.is_tolerated());
    }

    #[test]
    fn chain_to_configured_root_is_trusted() {
        assert_eq!(with_ca().classify(&[pem(CA_SIGNED)]), CertificateStatus::Trusted);
    }

    #[test]
    fn chain_ending_in_untrusted_root_is_self_signed_in_chain() {
        let status = PeerValidator::default().classify(&[pem(CA_SIGNED), pem(CA)]);
        assert_eq!(status, CertificateStatus::SelfSignedInChain);
    }

    #[test]
    fn lone_certificate_from_unknown_issuer_is_invalid() {
        let status = PeerValidator::default().classify(&[pem(CA_SIGNED)]);
        assert_eq!(
            status,
            CertificateStatus::Invalid("unable to get local issuer certificate".into())
        );
    }

    #[test]
    fn expired_certificate_is_invalid() {
        let status = PeerValidator::default().classify(&[pem(EXPIRED)]);
        assert_eq!(status, CertificateStatus::Invalid("certificate has expired".into()));
        assert!(!status.is_tolerated());
    }

    #[test]
    fn garbage_is_invalid() {
        let status = PeerValidator::default().classify(&[Certificate(vec![0x30, 0x03, 0x01])]);
        assert!(matches!(status, CertificateStatus::Invalid(_)));
    }

    #[test]
    fn empty_chain_with_unknown_issuer_is_not_presented() {
        assert_eq!(
            classify_unknown_issuer(&[], SystemTime::now()),
            CertificateStatus::NotPresented
        );
    }

    #[test]
    fn gemini_is_agreed_only_when_offered() {
        let offered: [&[u8]; 2] = [b"http/1.1", b"gemini"];
        assert!(offers_gemini(Some(offered.iter().copied())));
        assert!(!offers_gemini(Some(offered[..1].iter().copied())));
        assert!(!offers_gemini(None::<std::iter::Empty<&[u8]>>));
    }

    #[test]
    fn fingerprint_matches_openssl_format() {
        assert_eq!(
            fingerprint(&pem(SELF_SIGNED)),
            "79:18:0F:7D:83:C5:8E:CD:80:0D:26:66:8D:02:16:3D:10:48:01:96"
        );
    }

    #[test]
    fn verifier_requests_but_does_not_require_certificates() {
        let verifier = AcceptAnyClientCertificate;
        assert!(verifier.offer_client_auth());
        assert!(!verifier.client_auth_mandatory());
        assert!(verifier
            .verify_client_cert(&pem(EXPIRED), &[], SystemTime::now())
            .is_ok());
    }
}
