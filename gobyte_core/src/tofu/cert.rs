//! Local identity certificate: load the persisted pair if present, otherwise
//! generate a self-signed one and keep it for subsequent runs so the
//! identity stays stable.

use std::fs;
use std::io::BufReader;
use std::path::Path;

use anyhow::{bail, Context, Result};
use rand::RngCore;
use rcgen::{CertificateParams, DnType, ExtendedKeyUsagePurpose, KeyPair, KeyUsagePurpose, SerialNumber};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

/// Certificate lifetime: one year from generation.
const VALIDITY_DAYS: i64 = 365;

/// Load the `<identity>.crt` / `<identity>.key` pair from the cert
/// directory, generating and persisting a fresh one when missing or
/// unreadable.
pub fn load_or_generate(
    cert_dir: &Path,
    identity: &str,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert_path = cert_dir.join(format!("{identity}.crt"));
    let key_path = cert_dir.join(format!("{identity}.key"));

    if cert_path.exists() && key_path.exists() {
        match load_pair(&cert_path, &key_path) {
            Ok(pair) => {
                tracing::debug!("loaded identity certificate from {}", cert_path.display());
                return Ok(pair);
            }
            Err(err) => {
                tracing::warn!("stored certificate unusable ({err}), generating a new one");
            }
        }
    }

    generate_pair(identity, &cert_path, &key_path)
}

fn load_pair(
    cert_path: &Path,
    key_path: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut reader = BufReader::new(fs::File::open(cert_path)?);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("failed to parse certificate PEM")?;
    if certs.is_empty() {
        bail!("no certificate in {}", cert_path.display());
    }

    let mut reader = BufReader::new(fs::File::open(key_path)?);
    let key = rustls_pemfile::private_key(&mut reader)
        .context("failed to parse private key PEM")?
        .with_context(|| format!("no private key in {}", key_path.display()))?;

    Ok((certs, key))
}

fn generate_pair(
    identity: &str,
    cert_path: &Path,
    key_path: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .context("failed to generate ECDSA-P256 key")?;

    let mut serial = [0u8; 16];
    rand::rng().fill_bytes(&mut serial);

    let mut params = CertificateParams::new(Vec::<String>::new())
        .context("failed to build certificate params")?;
    params.distinguished_name.push(DnType::CommonName, identity);
    params.serial_number = Some(SerialNumber::from_slice(&serial));
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(VALIDITY_DAYS);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];

    let cert = params
        .self_signed(&key_pair)
        .context("failed to self-sign certificate")?;

    write_secret(cert_path, cert.pem().as_bytes())
        .with_context(|| format!("failed to write {}", cert_path.display()))?;
    write_secret(key_path, key_pair.serialize_pem().as_bytes())
        .with_context(|| format!("failed to write {}", key_path.display()))?;

    tracing::info!("generated identity certificate for '{identity}'");

    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    Ok((vec![cert.der().clone()], key))
}

/// Write a file readable by the owner only.
fn write_secret(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    fs::write(path, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}
