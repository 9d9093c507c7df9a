//! Captured X.509 certificates.
//!
//! A [`Certificate`] is immutable once captured. It keeps the parsed openssl
//! handle next to the exact DER bytes the peer sent, so equality, file export
//! and key store persistence all work on the original encoding.

use std::fmt;
use std::hash::{Hash, Hasher};

use openssl::error::ErrorStack;
use openssl::nid::Nid;
use openssl::pkey::Id;
use openssl::x509::{X509NameRef, X509Ref, X509};

/// Public key algorithm of a certificate, reported to trust managers as the
/// handshake "auth type".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Rsa,
    Dsa,
    Ec,
    Ed25519,
    Ed448,
    Unknown,
}

impl KeyType {
    pub fn of(cert: &X509Ref) -> Self {
        match cert.public_key() {
            Ok(key) => match key.id() {
                Id::RSA => KeyType::Rsa,
                Id::DSA => KeyType::Dsa,
                Id::EC => KeyType::Ec,
                Id::ED25519 => KeyType::Ed25519,
                Id::ED448 => KeyType::Ed448,
                _ => KeyType::Unknown,
            },
            Err(_) => KeyType::Unknown,
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeyType::Rsa => "RSA",
            KeyType::Dsa => "DSA",
            KeyType::Ec => "EC",
            KeyType::Ed25519 => "Ed25519",
            KeyType::Ed448 => "Ed448",
            KeyType::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// An X.509 certificate as received from a peer during a handshake.
#[derive(Clone)]
pub struct Certificate {
    x509: X509,
    der: Vec<u8>,
}

impl Certificate {
    /// Parse a DER encoded certificate, keeping the input bytes verbatim.
    pub fn from_der(der: &[u8]) -> Result<Self, ErrorStack> {
        let x509 = X509::from_der(der)?;
        Ok(Self {
            x509,
            der: der.to_vec(),
        })
    }

    pub fn from_pem(pem: &[u8]) -> Result<Self, ErrorStack> {
        Self::from_x509(X509::from_pem(pem)?)
    }

    pub fn from_x509(x509: X509) -> Result<Self, ErrorStack> {
        let der = x509.to_der()?;
        Ok(Self { x509, der })
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn to_pem(&self) -> Result<Vec<u8>, ErrorStack> {
        self.x509.to_pem()
    }

    pub fn x509(&self) -> &X509 {
        &self.x509
    }

    /// Subject distinguished name, most specific attribute first
    /// (`CN=leaf, O=Org, C=US`).
    pub fn subject_dn(&self) -> String {
        format_name(self.x509.subject_name())
    }

    pub fn issuer_dn(&self) -> String {
        format_name(self.x509.issuer_name())
    }

    pub fn key_type(&self) -> KeyType {
        KeyType::of(&self.x509)
    }

    pub fn serial_hex(&self) -> String {
        self.x509
            .serial_number()
            .to_bn()
            .and_then(|bn| bn.to_hex_str().map(|hex| hex.to_string()))
            .unwrap_or_default()
    }
}

impl PartialEq for Certificate {
    fn eq(&self, other: &Self) -> bool {
        self.der == other.der
    }
}

impl Eq for Certificate {}

impl Hash for Certificate {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.der.hash(state);
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("subject", &self.subject_dn())
            .field("issuer", &self.issuer_dn())
            .field("serial", &self.serial_hex())
            .finish()
    }
}

/// Keywords whose conventional DN spelling differs from the openssl short
/// name.
fn attribute_keyword(nid: Nid) -> Option<&'static str> {
    match nid {
        Nid::PKCS9_EMAILADDRESS => Some("EMAILADDRESS"),
        Nid::SERIALNUMBER => Some("SERIALNUMBER"),
        Nid::SURNAME => Some("SURNAME"),
        Nid::GIVENNAME => Some("GIVENNAME"),
        Nid::TITLE => Some("T"),
        Nid::STREETADDRESS => Some("STREET"),
        _ => None,
    }
}

/// Render a name as `KEYWORD=value` pairs in reverse ASN.1 order. Each
/// attribute is its own entry, including the members of a multi-valued RDN.
pub(crate) fn format_name(name: &X509NameRef) -> String {
    let mut parts: Vec<String> = name
        .entries()
        .map(|entry| {
            let nid = entry.object().nid();
            let key = attribute_keyword(nid)
                .map(str::to_string)
                .or_else(|| nid.short_name().ok().map(str::to_string))
                .unwrap_or_else(|| entry.object().to_string());
            let value = entry
                .data()
                .as_utf8()
                .map(|s| s.to_string())
                .unwrap_or_else(|_| String::from_utf8_lossy(entry.data().as_slice()).into_owned());
            format!("{}={}", key, value)
        })
        .collect();
    parts.reverse();
    parts.join(", ")
}
