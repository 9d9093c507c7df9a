//! Trust decisions and hostname checks consulted during the TLS handshake.
//!
//! [`CertificateRecorder`] is the trust manager the connection factory falls
//! back to: it performs no validation and keeps every certificate it is
//! shown, so the downloader can read the server's chain after the handshake.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::{debug, info};

use crate::certificate::{Certificate, KeyType};

/// Raised by a trust manager that refuses a chain.
#[derive(Debug, Error)]
#[error("certificate chain rejected: {0}")]
pub struct TrustRejection(pub String);

pub trait TrustManager: fmt::Debug + Send + Sync {
    /// Decide on a chain presented by a client, leaf first.
    fn check_client_trusted(
        &self,
        chain: &[Certificate],
        auth_type: KeyType,
    ) -> Result<(), TrustRejection>;

    /// Decide on a chain presented by a server, leaf first.
    fn check_server_trusted(
        &self,
        chain: &[Certificate],
        auth_type: KeyType,
    ) -> Result<(), TrustRejection>;

    fn accepted_issuers(&self) -> Vec<Certificate>;
}

/// Accepts every chain and remembers each certificate in the order it was
/// presented. Nothing is ever deduplicated; the list keeps growing across
/// handshakes until [`CertificateRecorder::clear`] is called.
#[derive(Debug, Default)]
pub struct CertificateRecorder {
    accepted: Mutex<Vec<Certificate>>,
}

impl CertificateRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Certificate>> {
        self.accepted.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, side: &str, chain: &[Certificate]) {
        let mut accepted = self.lock();
        for cert in chain {
            info!("Accepting {} certificate: {}", side, cert.subject_dn());
            accepted.push(cert.clone());
        }
    }
}

impl TrustManager for CertificateRecorder {
    fn check_client_trusted(
        &self,
        chain: &[Certificate],
        auth_type: KeyType,
    ) -> Result<(), TrustRejection> {
        debug!("Client chain of {} certificates ({})", chain.len(), auth_type);
        self.record("client", chain);
        Ok(())
    }

    fn check_server_trusted(
        &self,
        chain: &[Certificate],
        auth_type: KeyType,
    ) -> Result<(), TrustRejection> {
        debug!("Server chain of {} certificates ({})", chain.len(), auth_type);
        self.record("server", chain);
        Ok(())
    }

    fn accepted_issuers(&self) -> Vec<Certificate> {
        self.lock().clone()
    }
}

/// What the hostname verifier gets to see of the connection being made.
#[derive(Debug, Clone)]
pub struct PeerSession {
    pub peer_host: String,
    pub peer_certificates: Vec<Certificate>,
}

pub trait HostnameVerifier: fmt::Debug + Send + Sync {
    fn verify(&self, hostname: &str, session: &PeerSession) -> bool;
}

/// Skips hostname checking entirely.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllHostnameVerifier;

impl HostnameVerifier for AcceptAllHostnameVerifier {
    fn verify(&self, hostname: &str, session: &PeerSession) -> bool {
        info!(
            "Not verifying hostname '{}' (peer {})",
            hostname, session.peer_host
        );
        true
    }
}
