//! TLS material and rustls configuration for both roles.
//!
//! Both ends use the same certificate/key/CA triple. The server requests
//! (but never requires) a client certificate; see [`gate`] for the
//! authentication decision.

pub mod gate;

pub use gate::{AuthGate, PeerVerdict};

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::RootCertStore;

use crate::error::{Error, Result};

/// Maximum time allowed for a TLS handshake, either role.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// ALPN protocol the server advertises, so it looks like a plain web server.
pub const ALPN_HTTP11: &[u8] = b"http/1.1";

static PROTOCOL_VERSIONS: &[&rustls::SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];

pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Own certificate chain, private key and trusted roots.
#[derive(Debug)]
pub struct TlsMaterial {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    roots: RootCertStore,
}

impl TlsMaterial {
    /// Fails when either the chain or the root set is empty.
    pub fn new(
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        roots: RootCertStore,
    ) -> Result<Self> {
        if chain.is_empty() {
            return Err(Error::config("certificate chain is empty"));
        }
        if roots.is_empty() {
            return Err(Error::config("no trusted CA certificates"));
        }
        Ok(Self { chain, key, roots })
    }

    /// Load PEM files: own chain, private key and the CA bundle.
    pub fn load(cert: &Path, key: &Path, ca: &Path) -> Result<Self> {
        let chain = load_certs(cert)?;
        let key = load_key(key)?;

        let mut roots = RootCertStore::empty();
        for der in load_certs(ca)? {
            roots
                .add(der)
                .map_err(|e| Error::config(format!("failed to append CA certificate: {}", e)))?;
        }

        Self::new(chain, key, roots)
    }

    /// Trusted roots.
    pub fn roots(&self) -> &RootCertStore {
        &self.roots
    }

    /// Gate trusting this material's roots.
    pub fn auth_gate(&self) -> Result<AuthGate> {
        AuthGate::new(self.roots.clone())
    }

    /// Server configuration. Client certificates are requested and their
    /// handshake signatures checked, but trust is decided by `gate` later.
    pub fn server_config(&self, gate: &AuthGate) -> Result<Arc<rustls::ServerConfig>> {
        let mut config = rustls::ServerConfig::builder_with_provider(crypto_provider())
            .with_protocol_versions(PROTOCOL_VERSIONS)
            .map_err(|e| Error::config(format!("unsupported TLS versions: {}", e)))?
            .with_client_cert_verifier(gate.handshake_verifier())
            .with_single_cert(self.chain.clone(), self.key.clone_key())
            .map_err(|e| Error::config(format!("invalid certificate or key: {}", e)))?;

        config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];
        Ok(Arc::new(config))
    }

    /// Client configuration: verify the server against the roots and
    /// present our own chain.
    pub fn client_config(&self) -> Result<Arc<rustls::ClientConfig>> {
        let config = rustls::ClientConfig::builder_with_provider(crypto_provider())
            .with_protocol_versions(PROTOCOL_VERSIONS)
            .map_err(|e| Error::config(format!("unsupported TLS versions: {}", e)))?
            .with_root_certificates(self.roots.clone())
            .with_client_auth_cert(self.chain.clone(), self.key.clone_key())
            .map_err(|e| Error::config(format!("invalid certificate or key: {}", e)))?;

        Ok(Arc::new(config))
    }
}

fn open_pem(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path)
        .map_err(|e| Error::config(format!("failed to open {}: {}", path.display(), e)))?;
    Ok(BufReader::new(file))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = open_pem(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::config(format!("failed to parse {}: {}", path.display(), e)))?;

    if certs.is_empty() {
        return Err(Error::config(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = open_pem(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::config(format!("failed to parse {}: {}", path.display(), e)))?
        .ok_or_else(|| Error::config(format!("no private key found in {}", path.display())))
}


#[cfg(test)]
mod tests {
    use super::testing::TestPki;
    use super::*;
    use std::io::Write;

    #[test]
    fn test_configs_build() {
        let pki = TestPki::new();
        let server = pki.server_material();
        let gate = server.auth_gate().unwrap();

        let config = server.server_config(&gate).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);

        assert!(pki.client_material().client_config().is_ok());
    }

    #[test]
    fn test_empty_chain_rejected() {
        let pki = TestPki::new();
        let (_, key) = pki.client();
        assert!(TlsMaterial::new(Vec::new(), key, pki.roots()).is_err());
    }

    #[test]
    fn test_load_missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.pem");
        let err = TlsMaterial::load(&missing, &missing, &missing).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_load_ca_without_certificates() {
        let pki = TestPki::new();
        let dir = tempfile::tempdir().unwrap();
        let ca = dir.path().join("ca.crt");
        std::fs::File::create(&ca)
            .unwrap()
            .write_all(b"not a certificate\n")
            .unwrap();
        let cert = dir.path().join("cert.crt");
        std::fs::write(&cert, pki.ca_pem()).unwrap();

        let err = TlsMaterial::load(&cert, &cert, &ca).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
