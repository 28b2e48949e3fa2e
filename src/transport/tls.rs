//! Mutual-TLS transport for the broker session.
//!
//! Server verification is always on: the configured CA is the only trust root and
//! there is no insecure mode. rustls never negotiates below TLS 1.2, so the
//! protocol floor needs no extra configuration.
//!
//! # Example
//!
//! ```ignore
//! let materials = TlsMaterials::load(&bundle)?;
//! options.set_transport(materials.build_transport());
//! ```

use anyhow::{anyhow, Context, Result};
use rumqttc::Transport;
use std::path::Path;

use crate::certs::CertificateBundle;

/// PEM bytes for the CA certificate and the client certificate/key pair.
#[derive(Clone)]
pub struct TlsMaterials {
    pub ca: Vec<u8>,
    pub client_cert: Vec<u8>,
    pub client_key: Vec<u8>,
}

impl std::fmt::Debug for TlsMaterials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterials")
            .field("ca", &format_args!("{} bytes", self.ca.len()))
            .field("client_cert", &format_args!("{} bytes", self.client_cert.len()))
            .field("client_key", &"<redacted>")
            .finish()
    }
}

impl TlsMaterials {
    /// Read and validate all three PEM files of `bundle`.
    ///
    /// Fails loudly on unreadable files, on files without a certificate, and on a key
    /// file without a private key, so a broken bundle never reaches the handshake.
    pub fn load(bundle: &CertificateBundle) -> Result<Self> {
        let ca = read_pem(&bundle.ca_cert, "CA certificate")?;
        let client_cert = read_pem(&bundle.client_cert, "client certificate")?;
        let client_key = read_pem(&bundle.client_key, "client key")?;

        let materials = Self {
            ca,
            client_cert,
            client_key,
        };
        materials.validate()?;
        Ok(materials)
    }

    fn validate(&self) -> Result<()> {
        let ca_count = count_certs(&self.ca).context("failed to parse CA certificate PEM")?;
        if ca_count == 0 {
            return Err(anyhow!("no certificate found in CA certificate PEM"));
        }
        let client_count =
            count_certs(&self.client_cert).context("failed to parse client certificate PEM")?;
        if client_count == 0 {
            return Err(anyhow!("no certificate found in client certificate PEM"));
        }
        rustls_pemfile::private_key(&mut self.client_key.as_slice())
            .map_err(|e| anyhow!("failed to parse client key PEM: {}", e))?
            .ok_or_else(|| anyhow!("no private key found in client key PEM"))?;
        Ok(())
    }

    /// Build the rumqttc transport: CA for server verification, client cert+key
    /// for mutual authentication.
    pub fn build_transport(&self) -> Transport {
        Transport::tls(
            self.ca.clone(),
            Some((self.client_cert.clone(), self.client_key.clone())),
            None,
        )
    }
}

fn read_pem(path: &Path, what: &str) -> Result<Vec<u8>> {
    std::fs::read(path)
        .with_context(|| format!("failed to read MQTT TLS {} '{}'", what, path.display()))
}

fn count_certs(pem: &[u8]) -> Result<usize> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow!("{}", e))?;
    Ok(certs.len())
}
