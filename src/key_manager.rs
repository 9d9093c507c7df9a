//! Key managers supply the local identity presented for TLS client
//! authentication.

use std::fmt;

use openssl::pkey::{PKey, Private};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tracing::{debug, info};

use crate::certificate::Certificate;
use crate::error::{Error, Result};
use crate::key_store::KeyStore;

/// A private key with the certificate chain that goes with it, leaf first.
#[derive(Clone)]
pub struct ClientIdentity {
    pub alias: String,
    pub key: PKey<Private>,
    pub chain: Vec<Certificate>,
}

impl ClientIdentity {
    pub fn leaf(&self) -> Option<&Certificate> {
        self.chain.first()
    }

    pub(crate) fn certificate_chain_der(&self) -> Vec<CertificateDer<'static>> {
        self.chain
            .iter()
            .map(|cert| CertificateDer::from(cert.der().to_vec()))
            .collect()
    }

    pub(crate) fn private_key_der(&self) -> Result<PrivateKeyDer<'static>> {
        let pkcs8 = self.key.private_key_to_pkcs8().map_err(|e| {
            Error::KeyManagement(format!(
                "could not encode private key '{}': {}",
                self.alias, e
            ))
        })?;
        Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(pkcs8)))
    }
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("alias", &self.alias)
            .field("key", &"<redacted>")
            .field("chain", &self.chain)
            .finish()
    }
}

pub trait KeyManager: fmt::Debug + Send + Sync {
    /// Identity to present when the server asks for a client certificate.
    fn client_identity(&self) -> Option<ClientIdentity>;
}

/// Key manager backed by the private-key entries of a [`KeyStore`].
///
/// A store without private-key entries still yields a manager; it simply
/// has no identity to offer.
#[derive(Debug)]
pub struct KeyStoreKeyManager {
    identities: Vec<ClientIdentity>,
}

impl KeyStoreKeyManager {
    /// Fails when a private key does not belong to the leaf certificate it is
    /// stored with.
    pub fn from_key_store(store: &KeyStore) -> Result<Self> {
        let identities = store.identities();
        for identity in &identities {
            let leaf = identity.leaf().ok_or_else(|| {
                Error::KeyManagement(format!(
                    "private key entry '{}' has no certificate chain",
                    identity.alias
                ))
            })?;
            let public_key = leaf.x509().public_key().map_err(|e| {
                Error::KeyManagement(format!(
                    "certificate for '{}' has no usable public key: {}",
                    identity.alias, e
                ))
            })?;
            if !public_key.public_eq(&identity.key) {
                return Err(Error::KeyManagement(format!(
                    "private key '{}' does not match its certificate {}",
                    identity.alias,
                    leaf.subject_dn()
                )));
            }
            debug!("Key manager identity '{}': {}", identity.alias, leaf.subject_dn());
        }
        info!(
            "Loading KeyStoreKeyManager with {} client identit{}",
            identities.len(),
            if identities.len() == 1 { "y" } else { "ies" }
        );
        Ok(Self { identities })
    }

    pub fn identities(&self) -> &[ClientIdentity] {
        &self.identities
    }
}

impl KeyManager for KeyStoreKeyManager {
    fn client_identity(&self) -> Option<ClientIdentity> {
        self.identities.first().cloned()
    }
}
