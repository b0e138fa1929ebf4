//! Trust-on-first-use TLS transport.
//!
//! Peers authenticate with self-signed certificates in both directions. The
//! first time an identity is seen its public-key fingerprint is offered to a
//! host-provided callback and pinned on approval; from then on only that
//! fingerprint is accepted for the identity. See [`verify`] for the exact
//! handshake rules.

mod cert;
mod trust;
mod verify;

pub use trust::{fingerprint, TrustStore};

use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use verify::TofuVerifier;

/// Decision hook for unknown peers: `(identity, fingerprint) -> accept`.
/// The default used by hosts that do not install one rejects everything.
pub type NewPeerCallback = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// A callback that rejects every unknown peer, the safe default.
pub fn reject_new_peers() -> NewPeerCallback {
    Arc::new(|_, _| false)
}

#[derive(Debug, Error)]
pub enum TofuError {
    #[error("no certificate provided")]
    NoCertificateProvided,
    #[error("fingerprint mismatch for peer '{0}'")]
    FingerprintMismatch(String),
    #[error("connection denied")]
    ConnectionDenied,
    #[error("peer certificate has no common name")]
    MissingIdentity,
    #[error("bad peer certificate: {0}")]
    BadCertificate(String),
}

/// Identity facts established by a completed handshake.
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    /// The peer certificate's common name.
    pub identity: String,
    /// `sha256:<hex>` of the peer's DER public key, as pinned in the trust
    /// store.
    pub fingerprint: String,
}

/// An authenticated duplex byte stream, either side of the connection.
pub type TofuStream = tokio_rustls::TlsStream<TcpStream>;

/// TOFU-authenticated TLS endpoint. Holds the local identity certificate and
/// the client/server configurations that run the pinning verifier.
pub struct Tofu {
    identity: String,
    client_config: Arc<rustls::ClientConfig>,
    server_config: Arc<rustls::ServerConfig>,
}

impl Tofu {
    /// Set up the endpoint: create the cert and trust directories, load or
    /// generate the identity certificate, and build TLS configurations that
    /// require and verify a certificate in both directions (TLS 1.2+).
    pub fn new(
        identity: &str,
        cert_dir: &Path,
        trust_dir: &Path,
        on_new_peer: NewPeerCallback,
    ) -> Result<Self> {
        fs::create_dir_all(cert_dir)
            .with_context(|| format!("failed to create {}", cert_dir.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(cert_dir, fs::Permissions::from_mode(0o700))?;
        }

        let (cert_chain, key) = cert::load_or_generate(cert_dir, identity)?;
        let trust = TrustStore::open(trust_dir)
            .with_context(|| format!("failed to open trust store {}", trust_dir.display()))?;
        let verifier = Arc::new(TofuVerifier::new(trust, on_new_peer));

        let versions = &[&rustls::version::TLS12, &rustls::version::TLS13][..];

        let client_config = rustls::ClientConfig::builder_with_protocol_versions(versions)
            .dangerous()
            .with_custom_certificate_verifier(verifier.clone())
            .with_client_auth_cert(cert_chain.clone(), key.clone_key())
            .context("failed to build TLS client config")?;

        let server_config = rustls::ServerConfig::builder_with_protocol_versions(versions)
            .with_client_cert_verifier(verifier)
            .with_single_cert(cert_chain, key)
            .context("failed to build TLS server config")?;

        Ok(Self {
            identity: identity.to_string(),
            client_config: Arc::new(client_config),
            server_config: Arc::new(server_config),
        })
    }

    /// The local identity string (this instance's certificate common name).
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Bind a TCP listener whose accepted connections complete the TOFU TLS
    /// handshake before they are handed out.
    pub async fn listen(&self, addr: SocketAddr) -> Result<TofuListener> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        Ok(TofuListener {
            listener,
            acceptor: TlsAcceptor::from(self.server_config.clone()),
        })
    }

    /// Connect to a peer and complete the TOFU TLS handshake.
    pub async fn dial(&self, addr: SocketAddr) -> Result<(TofuStream, PeerIdentity)> {
        let tcp = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {addr}"))?;

        let server_name = ServerName::from(addr.ip());
        let stream = TlsConnector::from(self.client_config.clone())
            .connect(server_name, tcp)
            .await
            .with_context(|| format!("TLS handshake with {addr} failed"))?;

        let peer = handshake_peer(stream.get_ref().1.peer_certificates())?;
        Ok((stream.into(), peer))
    }
}

/// Acceptor side of the transport.
pub struct TofuListener {
    listener: TcpListener,
    acceptor: TlsAcceptor,
}

impl TofuListener {
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept one connection and run the handshake. A handshake failure
    /// (unknown peer rejected, fingerprint mismatch) is an error for this
    /// connection only; callers keep accepting.
    pub async fn accept(&self) -> Result<(TofuStream, PeerIdentity, SocketAddr)> {
        let (tcp, remote_addr) = self.listener.accept().await?;
        let stream = self
            .acceptor
            .accept(tcp)
            .await
            .with_context(|| format!("TLS handshake with {remote_addr} failed"))?;

        let peer = handshake_peer(stream.get_ref().1.peer_certificates())?;
        Ok((stream.into(), peer, remote_addr))
    }
}

fn handshake_peer(
    certs: Option<&[rustls::pki_types::CertificateDer<'_>]>,
) -> Result<PeerIdentity, TofuError> {
    let cert = certs
        .and_then(|certs| certs.first())
        .ok_or(TofuError::NoCertificateProvided)?;
    verify::peer_identity_from_der(cert.as_ref())
}
