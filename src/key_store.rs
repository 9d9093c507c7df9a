//! Alias-keyed certificate store with password-sealed persistence.
//!
//! A [`KeyStore`] maps aliases to either a trusted certificate or a private
//! key entry (the key plus its certificate chain). File-based stores are
//! loaded eagerly and fail hard on a missing file or a wrong password; the
//! in-memory store starts empty under a fixed sentinel password. Stores are
//! written back with [`KeyStore::save`], which replaces the target file
//! atomically.
//!
//! ```no_run
//! use cert_downloader::key_store::KeyStore;
//! use secrecy::SecretString;
//!
//! let password = SecretString::new("secret".to_string());
//! let store = KeyStore::open_file("/tmp/out.ks", &password)?;
//! println!("{} entries", store.certificate_count());
//! # Ok::<(), cert_downloader::error::Error>(())
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};
use openssl::pkey::{PKey, Private};
use secrecy::zeroize::Zeroize;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::certificate::Certificate;
use crate::encryption::SealedStore;
use crate::error::{Error, Result};
use crate::key_manager::ClientIdentity;
use crate::pfx_key;

/// Password of every in-memory store.
pub const IN_MEMORY_PASSWORD: &str = "\0";

const STORE_DOCUMENT_VERSION: u32 = 1;

/// A key store shared between the connection factory and the downloader.
pub type SharedKeyStore = Arc<Mutex<KeyStore>>;

/// Where [`KeyStore::open`] loads a store from.
#[derive(Debug, Clone)]
pub enum KeyStoreSource {
    File(PathBuf),
    InMemory,
}

#[derive(Clone)]
pub enum KeyStoreEntry {
    TrustedCertificate(Certificate),
    PrivateKey {
        key: PKey<Private>,
        chain: Vec<Certificate>,
    },
}

impl KeyStoreEntry {
    /// The certificate an alias resolves to: the certificate itself, or the
    /// leaf of a private key entry's chain.
    pub fn certificate(&self) -> Option<&Certificate> {
        match self {
            KeyStoreEntry::TrustedCertificate(cert) => Some(cert),
            KeyStoreEntry::PrivateKey { chain, .. } => chain.first(),
        }
    }
}

impl fmt::Debug for KeyStoreEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyStoreEntry::TrustedCertificate(cert) => {
                f.debug_tuple("TrustedCertificate").field(cert).finish()
            }
            KeyStoreEntry::PrivateKey { chain, .. } => f
                .debug_struct("PrivateKey")
                .field("key", &"<redacted>")
                .field("chain", chain)
                .finish(),
        }
    }
}

pub struct KeyStore {
    entries: BTreeMap<String, KeyStoreEntry>,
    password: SecretString,
    path: Option<PathBuf>,
}

impl KeyStore {
    pub fn open(source: KeyStoreSource, password: &SecretString) -> Result<Self> {
        match source {
            KeyStoreSource::File(path) => Self::open_file(path, password),
            KeyStoreSource::InMemory => {
                let mut store = Self::in_memory();
                store.password = SecretString::new(password.expose_secret().clone());
                Ok(store)
            }
        }
    }

    /// Load an existing store file. PKCS#12 files (`.p12`, `.pfx`) are
    /// imported; anything else must be a sealed store.
    pub fn open_file(path: impl AsRef<Path>, password: &SecretString) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::store_open(
                path.display().to_string(),
                "key store file must actually exist",
            ));
        }

        let store = if is_pkcs12_path(path) {
            pfx_key::load_pfx(path, password)?
        } else {
            Self::load_sealed(path, password).map_err(|e| {
                warn!("Could not open/read from KeyStore {}: {:#}", path.display(), e);
                Error::store_open(path.display().to_string(), format!("{:#}", e))
            })?
        };
        info!("Loaded KeyStore {} successfully.", path.display());
        Ok(store)
    }

    pub fn in_memory() -> Self {
        debug!("Loaded in-memory keystore successfully.");
        Self::empty(SecretString::new(IN_MEMORY_PASSWORD.to_string()), None)
    }

    pub(crate) fn empty(password: SecretString, path: Option<PathBuf>) -> Self {
        Self {
            entries: BTreeMap::new(),
            password,
            path,
        }
    }

    fn load_sealed(path: &Path, password: &SecretString) -> anyhow::Result<Self> {
        let bytes = fs::read(path).context("Failed to read key store file")?;
        let sealed = SealedStore::deserialize(&bytes)?;
        let mut plaintext = sealed.open(password.expose_secret().as_bytes())?;
        let document: std::result::Result<StoreDocument, _> = serde_json::from_slice(&plaintext);
        plaintext.zeroize();
        let document = document.context("Failed to parse key store contents")?;
        if document.version != STORE_DOCUMENT_VERSION {
            return Err(anyhow!(
                "Unsupported key store document version {}",
                document.version
            ));
        }

        let mut store = Self::empty(
            SecretString::new(password.expose_secret().clone()),
            Some(path.to_path_buf()),
        );
        for stored in document.entries {
            let (alias, entry) = stored.decode()?;
            store.entries.insert(alias, entry);
        }
        Ok(store)
    }

    /// Backing file of a file-based store.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn password(&self) -> &SecretString {
        &self.password
    }

    pub fn certificate_count(&self) -> usize {
        self.entries.len()
    }

    pub fn aliases(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn alias_of(&self, cert: &Certificate) -> Option<String> {
        self.entries
            .iter()
            .find(|(_, entry)| entry.certificate() == Some(cert))
            .map(|(alias, _)| alias.clone())
    }

    pub fn entry(&self, alias: &str) -> Option<&KeyStoreEntry> {
        self.entries.get(alias)
    }

    pub fn contains_certificate(&self, cert: &Certificate) -> bool {
        self.entries
            .values()
            .any(|entry| entry.certificate() == Some(cert))
    }

    /// Loose subject match; see [`normalize_subject`].
    pub fn contains_subject(&self, subject_dn: &str) -> bool {
        let wanted = normalize_subject(subject_dn);
        let found = self
            .entries
            .values()
            .filter_map(KeyStoreEntry::certificate)
            .find(|cert| normalize_subject(&cert.subject_dn()) == wanted);
        if let Some(cert) = found {
            debug!("Found certificate for subject '{}': {}", wanted, cert.subject_dn());
            return true;
        }
        false
    }

    pub fn certificate(&self, alias: &str) -> Option<Certificate> {
        self.entries
            .get(alias)
            .and_then(KeyStoreEntry::certificate)
            .cloned()
    }

    pub fn certificates(&self) -> Vec<Certificate> {
        self.entries
            .values()
            .filter_map(KeyStoreEntry::certificate)
            .cloned()
            .collect()
    }

    pub fn certificates_by_subject(&self, subject_dn: &str) -> Vec<Certificate> {
        let wanted = normalize_subject(subject_dn);
        self.entries
            .values()
            .filter_map(KeyStoreEntry::certificate)
            .filter(|cert| normalize_subject(&cert.subject_dn()) == wanted)
            .cloned()
            .collect()
    }

    /// Store `cert` as a trusted certificate under `alias`, replacing any
    /// trusted certificate already stored there. Returns `false` when the
    /// entry cannot be written.
    pub fn add(&mut self, cert: &Certificate, alias: &str) -> bool {
        if alias.is_empty() {
            warn!(
                "Could not add certificate '{}' to KeyStore: alias must not be empty",
                cert.subject_dn()
            );
            return false;
        }
        if let Some(KeyStoreEntry::PrivateKey { .. }) = self.entries.get(alias) {
            warn!(
                "Could not add certificate '{}' to KeyStore: alias '{}' holds a private key",
                cert.subject_dn(),
                alias
            );
            return false;
        }
        self.entries.insert(
            alias.to_string(),
            KeyStoreEntry::TrustedCertificate(cert.clone()),
        );
        debug!("Added certificate '{}' to KeyStore successfully.", cert.subject_dn());
        true
    }

    /// Store a private key with its certificate chain (leaf first).
    pub fn add_identity(&mut self, alias: &str, key: PKey<Private>, chain: Vec<Certificate>) -> bool {
        if alias.is_empty() || chain.is_empty() {
            warn!("Could not add private key entry '{}': alias and certificate chain are required", alias);
            return false;
        }
        self.entries
            .insert(alias.to_string(), KeyStoreEntry::PrivateKey { key, chain });
        debug!("Added private key entry '{}' to KeyStore.", alias);
        true
    }

    pub fn identities(&self) -> Vec<ClientIdentity> {
        self.entries
            .iter()
            .filter_map(|(alias, entry)| match entry {
                KeyStoreEntry::PrivateKey { key, chain } => Some(ClientIdentity {
                    alias: alias.clone(),
                    key: key.clone(),
                    chain: chain.clone(),
                }),
                KeyStoreEntry::TrustedCertificate(_) => None,
            })
            .collect()
    }

    pub fn private_key(&self, alias: &str) -> Option<PKey<Private>> {
        match self.entries.get(alias) {
            Some(KeyStoreEntry::PrivateKey { key, .. }) => Some(key.clone()),
            _ => None,
        }
    }

    /// Removal is not supported; always returns `false` and leaves the store
    /// untouched.
    pub fn remove(&mut self, cert: &Certificate) -> bool {
        debug!(
            "Ignoring request to remove '{}': KeyStore entries cannot be removed",
            cert.subject_dn()
        );
        false
    }

    /// Seal the whole store under `password` and write it to `path`.
    ///
    /// The data goes to a temporary file next to `path` that is renamed over
    /// the target, so a failed save never leaves a partial store behind.
    /// Failures are logged as well as returned.
    pub fn save(&self, path: impl AsRef<Path>, password: &SecretString) -> Result<()> {
        let path = path.as_ref();
        match self.write_sealed(path, password) {
            Ok(()) => {
                info!("Successfully saved KeyStore to disk: {}", path.display());
                Ok(())
            }
            Err(e) => {
                warn!("Could not save KeyStore to {}: {:#}", path.display(), e);
                Err(Error::StoreSave {
                    path: path.to_path_buf(),
                    reason: format!("{:#}", e),
                })
            }
        }
    }

    fn write_sealed(&self, path: &Path, password: &SecretString) -> anyhow::Result<()> {
        let document = self.to_document()?;
        let mut plaintext =
            serde_json::to_vec(&document).context("Failed to serialize key store")?;
        let sealed = SealedStore::seal(&plaintext, password.expose_secret().as_bytes());
        plaintext.zeroize();
        let sealed = sealed?;

        let dir = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir)
            .with_context(|| format!("Failed to create temporary file in {}", dir.display()))?;
        tmp.write_all(&sealed.serialize())
            .context("Failed to write key store")?;
        tmp.as_file()
            .sync_all()
            .context("Failed to flush key store")?;
        tmp.persist(path)
            .map_err(|e| e.error)
            .with_context(|| format!("Failed to move key store into place at {}", path.display()))?;
        Ok(())
    }

    fn to_document(&self) -> anyhow::Result<StoreDocument> {
        let mut entries = Vec::with_capacity(self.entries.len());
        for (alias, entry) in &self.entries {
            entries.push(StoredEntry::encode(alias, entry)?);
        }
        Ok(StoreDocument {
            version: STORE_DOCUMENT_VERSION,
            entries,
        })
    }
}

impl fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyStore")
            .field("path", &self.path)
            .field("entries", &self.entries)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Trim leading and trailing control characters and spaces, then drop every
/// remaining space. Tabs inside the name and letter case are kept.
pub fn normalize_subject(subject_dn: &str) -> String {
    subject_dn
        .trim_matches(|c: char| c <= ' ')
        .chars()
        .filter(|c| *c != ' ')
        .collect()
}

fn is_pkcs12_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("p12") || ext.eq_ignore_ascii_case("pfx"))
        .unwrap_or(false)
}

#[derive(Serialize, Deserialize)]
struct StoreDocument {
    version: u32,
    entries: Vec<StoredEntry>,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type")]
enum StoredEntry {
    TrustedCertificate {
        alias: String,
        certificate: String,
    },
    PrivateKey {
        alias: String,
        private_key: String,
        certificate_chain: Vec<String>,
    },
}

impl StoredEntry {
    fn encode(alias: &str, entry: &KeyStoreEntry) -> anyhow::Result<Self> {
        Ok(match entry {
            KeyStoreEntry::TrustedCertificate(cert) => StoredEntry::TrustedCertificate {
                alias: alias.to_string(),
                certificate: pem_string(cert)?,
            },
            KeyStoreEntry::PrivateKey { key, chain } => {
                let key_pem = key
                    .private_key_to_pem_pkcs8()
                    .with_context(|| format!("Failed to encode private key '{}'", alias))?;
                StoredEntry::PrivateKey {
                    alias: alias.to_string(),
                    private_key: String::from_utf8(key_pem)?,
                    certificate_chain: chain
                        .iter()
                        .map(pem_string)
                        .collect::<anyhow::Result<Vec<_>>>()?,
                }
            }
        })
    }

    fn decode(self) -> anyhow::Result<(String, KeyStoreEntry)> {
        match self {
            StoredEntry::TrustedCertificate { alias, certificate } => {
                let cert = Certificate::from_pem(certificate.as_bytes())
                    .with_context(|| format!("Invalid certificate under alias '{}'", alias))?;
                Ok((alias, KeyStoreEntry::TrustedCertificate(cert)))
            }
            StoredEntry::PrivateKey {
                alias,
                private_key,
                certificate_chain,
            } => {
                let key = PKey::private_key_from_pem(private_key.as_bytes())
                    .with_context(|| format!("Invalid private key under alias '{}'", alias))?;
                let chain = certificate_chain
                    .iter()
                    .map(|pem| Certificate::from_pem(pem.as_bytes()))
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .with_context(|| format!("Invalid certificate chain under alias '{}'", alias))?;
                Ok((alias, KeyStoreEntry::PrivateKey { key, chain }))
            }
        }
    }
}

fn pem_string(cert: &Certificate) -> anyhow::Result<String> {
    let pem = cert.to_pem().context("Failed to encode certificate")?;
    Ok(String::from_utf8(pem)?)
}
