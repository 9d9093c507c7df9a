use std::fs;
use std::path::Path;

use openssl::pkcs12::Pkcs12;
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use crate::certificate::Certificate;
use crate::error::{Error, Result};
use crate::key_store::KeyStore;

/// Alias of the key entry imported from a PKCS#12 bundle.
pub const PFX_IDENTITY_ALIAS: &str = "identity";

/// Load a PKCS#12 (PFX) file into a [`KeyStore`].
///
/// The private key and its certificate become the `identity` entry, with any
/// bundled CA certificates appended to its chain. Each CA certificate is also
/// stored as a trusted certificate under `ca-1`, `ca-2`, ...
pub fn load_pfx<P: AsRef<Path>>(path: P, password: &SecretString) -> Result<KeyStore> {
    let path = path.as_ref();
    let source_name = path.display().to_string();

    let der = fs::read(path).map_err(|e| Error::store_open(source_name.as_str(), e))?;
    let parsed = Pkcs12::from_der(&der)
        .and_then(|pfx| pfx.parse2(password.expose_secret()))
        .map_err(|e| Error::store_open(source_name.as_str(), format!("invalid PKCS#12 data or password: {}", e)))?;

    let ca_certs = match parsed.ca {
        Some(stack) => stack
            .into_iter()
            .map(Certificate::from_x509)
            .collect::<std::result::Result<Vec<_>, _>>()?,
        None => Vec::new(),
    };

    let mut store = KeyStore::empty(
        SecretString::new(password.expose_secret().clone()),
        Some(path.to_path_buf()),
    );
    match (parsed.pkey, parsed.cert) {
        (Some(key), Some(cert)) => {
            let mut chain = vec![Certificate::from_x509(cert)?];
            chain.extend(ca_certs.iter().cloned());
            store.add_identity(PFX_IDENTITY_ALIAS, key, chain);
        }
        (None, Some(cert)) => {
            store.add(&Certificate::from_x509(cert)?, PFX_IDENTITY_ALIAS);
        }
        (Some(_), None) => {
            return Err(Error::store_open(
                source_name,
                "PKCS#12 private key has no matching certificate",
            ));
        }
        (None, None) => {}
    }
    for (index, ca) in ca_certs.iter().enumerate() {
        store.add(ca, &format!("ca-{}", index + 1));
    }

    debug!("Imported {} entries from PKCS#12 file {}", store.certificate_count(), source_name);
    Ok(store)
}
