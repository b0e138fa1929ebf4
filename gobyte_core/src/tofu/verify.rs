//! Trust-on-first-use certificate verification, plugged into rustls on both
//! sides of the handshake.
//!
//! The peer's certificate is identified by its common name. A known identity
//! must present the pinned public-key fingerprint; an unknown identity is
//! referred to the `OnNewPeer` callback and pinned on approval. Certificate
//! chains and expiry are deliberately not checked; the fingerprint decision
//! is authoritative.

use std::fmt;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{CertificateError, DigitallySignedStruct, DistinguishedName, SignatureScheme};
use x509_parser::prelude::*;

use super::trust::{fingerprint, TrustStore};
use super::{NewPeerCallback, PeerIdentity, TofuError};

/// Extract the identity (subject common name) and public-key fingerprint
/// from a DER-encoded certificate.
pub(super) fn peer_identity_from_der(der: &[u8]) -> Result<PeerIdentity, TofuError> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|err| TofuError::BadCertificate(err.to_string()))?;

    let identity = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .ok_or(TofuError::MissingIdentity)?
        .to_string();

    // The fingerprint covers the DER SubjectPublicKeyInfo, so it survives
    // certificate renewal as long as the key does not change.
    let fingerprint = fingerprint(cert.tbs_certificate.subject_pki.raw);

    Ok(PeerIdentity {
        identity,
        fingerprint,
    })
}

pub(super) struct TofuVerifier {
    trust: TrustStore,
    on_new_peer: NewPeerCallback,
    provider: Arc<CryptoProvider>,
}

impl fmt::Debug for TofuVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TofuVerifier")
            .field("trust", &self.trust)
            .finish_non_exhaustive()
    }
}

impl TofuVerifier {
    pub(super) fn new(trust: TrustStore, on_new_peer: NewPeerCallback) -> Self {
        Self {
            trust,
            on_new_peer,
            provider: Arc::new(rustls::crypto::aws_lc_rs::default_provider()),
        }
    }

    fn verify_peer(&self, end_entity: &CertificateDer<'_>) -> Result<(), rustls::Error> {
        let peer = peer_identity_from_der(end_entity.as_ref()).map_err(|err| match err {
            TofuError::BadCertificate(_) | TofuError::MissingIdentity => {
                rustls::Error::InvalidCertificate(CertificateError::BadEncoding)
            }
            _ => rustls::Error::General(err.to_string()),
        })?;

        let stored = self
            .trust
            .check(&peer.identity)
            .map_err(|err| rustls::Error::General(format!("trust store read failed: {err}")))?;

        match stored {
            Some(pinned) if pinned == peer.fingerprint => Ok(()),
            Some(_) => {
                tracing::warn!(
                    "fingerprint mismatch for '{}', refusing connection",
                    peer.identity
                );
                Err(rustls::Error::General(
                    TofuError::FingerprintMismatch(peer.identity).to_string(),
                ))
            }
            None => {
                if !(self.on_new_peer)(&peer.identity, &peer.fingerprint) {
                    tracing::info!("new peer '{}' rejected", peer.identity);
                    return Err(rustls::Error::General(
                        TofuError::ConnectionDenied.to_string(),
                    ));
                }
                self.trust
                    .store(&peer.identity, &peer.fingerprint)
                    .map_err(|err| {
                        rustls::Error::General(format!("trust store write failed: {err}"))
                    })?;
                tracing::info!("pinned new peer '{}'", peer.identity);
                Ok(())
            }
        }
    }
}

impl ServerCertVerifier for TofuVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        // Hostname checks are skipped on purpose; peers are addressed by IP
        // and identified by the certificate itself.
        self.verify_peer(end_entity)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

impl ClientCertVerifier for TofuVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        self.verify_peer(end_entity)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
