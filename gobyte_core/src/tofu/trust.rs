//! File-backed fingerprint store, one pinned identity per file.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// Format a public key fingerprint as `sha256:<hex>` over the DER-encoded
/// SubjectPublicKeyInfo bytes.
pub fn fingerprint(spki_der: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(spki_der)))
}

/// Directory of pinned peer fingerprints. The file name is the peer identity
/// and the contents are the `sha256:<hex>` string; a stored fingerprint is
/// never replaced by a different one.
#[derive(Debug, Clone)]
pub struct TrustStore {
    dir: PathBuf,
}

impl TrustStore {
    pub fn open(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
        }
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Look up the pinned fingerprint for an identity, if any.
    pub fn check(&self, identity: &str) -> io::Result<Option<String>> {
        match fs::read_to_string(self.dir.join(identity)) {
            Ok(stored) => Ok(Some(stored)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Pin a fingerprint for an identity. Written via a temporary file and
    /// rename so a concurrent reader never observes a partial record.
    pub fn store(&self, identity: &str, fingerprint: &str) -> io::Result<()> {
        let path = self.dir.join(identity);
        let tmp = self.dir.join(format!("{identity}.tmp"));
        fs::write(&tmp, fingerprint)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}
