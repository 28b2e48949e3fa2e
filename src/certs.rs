//! Certificate locator.
//!
//! The bridge only consumes already-issued PEM files from a fixed directory. This
//! module names those files and reports which of them cannot be used; it never
//! creates, rewrites or rotates anything.

use std::fs::File;
use std::path::{Path, PathBuf};

pub const CA_CERT_FILE: &str = "ca-cert.pem";
pub const CLIENT_CERT_FILE: &str = "client-cert.pem";
pub const CLIENT_KEY_FILE: &str = "client-key.pem";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CertificateKind {
    ClientKey,
    ClientCert,
    CaCert,
}

impl CertificateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientKey => "client_key",
            Self::ClientCert => "client_cert",
            Self::CaCert => "ca_cert",
        }
    }
}

impl std::fmt::Display for CertificateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Paths of the three PEM artifacts used for mutual TLS.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateBundle {
    pub ca_cert: PathBuf,
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
}

impl CertificateBundle {
    /// Bundle with the fixed file names inside `dir`.
    pub fn from_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            ca_cert: dir.join(CA_CERT_FILE),
            client_cert: dir.join(CLIENT_CERT_FILE),
            client_key: dir.join(CLIENT_KEY_FILE),
        }
    }

    pub fn entries(&self) -> [(CertificateKind, &Path); 3] {
        [
            (CertificateKind::ClientKey, self.client_key.as_path()),
            (CertificateKind::ClientCert, self.client_cert.as_path()),
            (CertificateKind::CaCert, self.ca_cert.as_path()),
        ]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MissingReason {
    Absent,
    Unreadable,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MissingCertificate {
    pub kind: CertificateKind,
    pub path: PathBuf,
    pub reason: MissingReason,
}

impl std::fmt::Display for MissingCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at {}", self.kind, self.path.display())?;
        if self.reason == MissingReason::Unreadable {
            write!(f, " (not readable)")?;
        }
        Ok(())
    }
}

/// Report every artifact in `bundle` that is absent or cannot be read.
///
/// Returns an empty list when all three files are usable.
pub fn check(bundle: &CertificateBundle) -> Vec<MissingCertificate> {
    bundle
        .entries()
        .into_iter()
        .filter_map(|(kind, path)| {
            inspect(path).map(|reason| MissingCertificate {
                kind,
                path: path.to_path_buf(),
                reason,
            })
        })
        .collect()
}

fn inspect(path: &Path) -> Option<MissingReason> {
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Some(MissingReason::Absent)
        }
        Err(_) => return Some(MissingReason::Unreadable),
    };
    if !metadata.is_file() {
        return Some(MissingReason::Unreadable);
    }
    match File::open(path) {
        Ok(_) => None,
        Err(_) => Some(MissingReason::Unreadable),
    }
}
