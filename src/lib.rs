//! Cert Downloader - capture the certificate chain a TLS server presents
//!
//! Connects to a server, completes a TLS handshake that accepts any chain,
//! and keeps every certificate the server sent. The captured certificates
//! can be written out as DER files and/or added to a password-sealed key
//! store.
//!
//! ```text
//! CertificateDownloader
//!   └── TlsConnectionFactory ── frozen rustls ClientConfig
//!         ├── TrustManager(s)       (CertificateRecorder by default)
//!         ├── KeyManager(s)         (client identity from a KeyStore)
//!         └── HostnameVerifier      (AcceptAllHostnameVerifier by default)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use cert_downloader::downloader::{CertificateDownloader, DownloadRequest};
//! use cert_downloader::socket_factory::TlsConnectionFactory;
//! use secrecy::SecretString;
//!
//! let factory = Arc::new(TlsConnectionFactory::default());
//! let request = DownloadRequest::new("example.com", 443)
//!     .key_store_output("example.ks", SecretString::new("changeit".to_string()));
//!
//! let report = CertificateDownloader::new(factory).run(&request);
//! for cert in &report.certificates {
//!     println!("{}", cert.subject_dn());
//! }
//! ```
//!
//! # Security Considerations
//!
//! Nothing about the peer is verified: not the chain, not the validity
//! period, not the hostname. Use this to inspect what a server presents,
//! never to establish a trusted connection.

pub mod certificate;
pub mod configs;
pub mod downloader;
pub mod encryption;
pub mod error;
pub mod key_manager;
pub mod key_store;
pub mod pfx_key;
pub mod socket_factory;
pub mod trust;

#[cfg(test)]
mod test_support;
