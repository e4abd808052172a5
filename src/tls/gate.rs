//! Authentication gate.
//!
//! The server handshake only *requests* a client certificate and accepts
//! whatever is presented. The trust decision happens afterwards, here, so a
//! peer with a missing or bad certificate still completes the handshake and
//! can be served the decoy instead of getting a TLS alert.

use std::sync::Arc;

use rustls::client::danger::HandshakeSignatureValid;
use rustls::pki_types::{CertificateDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{DigitallySignedStruct, DistinguishedName, RootCertStore, SignatureScheme};

use crate::error::{Error, Result};

/// Outcome of the authentication gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerVerdict {
    /// Chain validates against the trusted roots for client-auth usage
    Authenticated,
    /// No chain, or any verification failure
    Unauthenticated,
}

impl PeerVerdict {
    /// Whether the peer is a tunnel partner.
    pub fn is_authenticated(&self) -> bool {
        matches!(self, PeerVerdict::Authenticated)
    }
}

/// Verifies peer certificate chains against the trusted root set.
#[derive(Debug, Clone)]
pub struct AuthGate {
    verifier: Arc<dyn ClientCertVerifier>,
}

impl AuthGate {
    /// Build a gate trusting `roots`.
    pub fn new(roots: RootCertStore) -> Result<Self> {
        let verifier = WebPkiClientVerifier::builder_with_provider(
            Arc::new(roots),
            super::crypto_provider(),
        )
        .build()
        .map_err(|e| Error::config(format!("failed to build client verifier: {}", e)))?;

        Ok(Self { verifier })
    }

    /// Decide on the chain the peer presented during the handshake.
    pub fn evaluate(&self, chain: Option<&[CertificateDer<'_>]>) -> PeerVerdict {
        self.evaluate_at(chain, UnixTime::now())
    }

    /// Same as [`evaluate`](Self::evaluate) with an explicit clock.
    pub fn evaluate_at(&self, chain: Option<&[CertificateDer<'_>]>, now: UnixTime) -> PeerVerdict {
        let Some((leaf, intermediates)) = chain.and_then(|c| c.split_first()) else {
            return PeerVerdict::Unauthenticated;
        };

        match self.verifier.verify_client_cert(leaf, intermediates, now) {
            Ok(_) => PeerVerdict::Authenticated,
            Err(e) => {
                tracing::debug!(error = %e, "peer certificate rejected");
                PeerVerdict::Unauthenticated
            }
        }
    }

    /// Verifier for the server handshake: asks for a certificate, checks the
    /// handshake signatures, but leaves the chain decision to [`evaluate`](Self::evaluate).
    pub fn handshake_verifier(&self) -> Arc<dyn ClientCertVerifier> {
        Arc::new(DeferredClientAuth {
            inner: Arc::clone(&self.verifier),
        })
    }
}

#[derive(Debug)]
struct DeferredClientAuth {
    inner: Arc<dyn ClientCertVerifier>,
}

impl ClientCertVerifier for DeferredClientAuth {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::testing::TestPki;

    #[test]
    fn test_valid_client_chain_is_authenticated() {
        let pki = TestPki::new();
        let gate = AuthGate::new(pki.roots()).unwrap();
        let (chain, _key) = pki.client();

        assert_eq!(gate.evaluate(Some(&chain)), PeerVerdict::Authenticated);
        // Same answer on repeated evaluation
        assert_eq!(gate.evaluate(Some(&chain)), PeerVerdict::Authenticated);
    }

    #[test]
    fn test_missing_chain_is_unauthenticated() {
        let pki = TestPki::new();
        let gate = AuthGate::new(pki.roots()).unwrap();

        assert_eq!(gate.evaluate(None), PeerVerdict::Unauthenticated);
        assert_eq!(gate.evaluate(Some(&[])), PeerVerdict::Unauthenticated);
    }

    #[test]
    fn test_expired_chain_is_unauthenticated() {
        let pki = TestPki::new();
        let gate = AuthGate::new(pki.roots()).unwrap();
        let (chain, _key) = pki.expired_client();

        assert_eq!(gate.evaluate(Some(&chain)), PeerVerdict::Unauthenticated);
    }

    #[test]
    fn test_untrusted_root_is_unauthenticated() {
        let trusted = TestPki::new();
        let rogue = TestPki::new();
        let gate = AuthGate::new(trusted.roots()).unwrap();
        let (chain, _key) = rogue.client();

        assert_eq!(gate.evaluate(Some(&chain)), PeerVerdict::Unauthenticated);
    }

    #[test]
    fn test_server_only_certificate_is_unauthenticated() {
        let pki = TestPki::new();
        let gate = AuthGate::new(pki.roots()).unwrap();
        let (chain, _key) = pki.server();

        assert_eq!(gate.evaluate(Some(&chain)), PeerVerdict::Unauthenticated);
    }

    #[test]
    fn test_verdict_independent_of_order() {
        let pki = TestPki::new();
        let rogue = TestPki::new();
        let gate = AuthGate::new(pki.roots()).unwrap();
        let (good, _) = pki.client();
        let (bad, _) = rogue.client();

        assert_eq!(gate.evaluate(Some(&bad)), PeerVerdict::Unauthenticated);
        assert_eq!(gate.evaluate(Some(&good)), PeerVerdict::Authenticated);
        assert_eq!(gate.evaluate(Some(&bad)), PeerVerdict::Unauthenticated);
    }

    #[test]
    fn test_empty_roots_rejected() {
        assert!(AuthGate::new(RootCertStore::empty()).is_err());
    }
}
