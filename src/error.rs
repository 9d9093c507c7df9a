//! Error taxonomy for certificate download runs.
//!
//! Store construction errors are returned straight to the caller. Everything
//! that can go wrong during a download run is caught by the downloader and
//! recorded in its report instead of being raised.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Bad path, bad password or unreadable container.
    #[error("could not open key store {source_name}: {reason}")]
    StoreOpen { source_name: String, reason: String },

    #[error("no supported TLS/SSL protocol among {0:?}")]
    NoProtocolAvailable(Vec<String>),

    /// DNS, TCP or handshake failure.
    #[error("connection to {host}:{port} failed: {source}")]
    Connection {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("key management failure: {0}")]
    KeyManagement(String),

    #[error("could not write certificate to {}: {source}", path.display())]
    CertificateIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not parse certificate: {0}")]
    CertificateParse(String),

    #[error("could not save key store to {}: {reason}", path.display())]
    StoreSave { path: PathBuf, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn store_open(source_name: impl Into<String>, reason: impl ToString) -> Self {
        Error::StoreOpen {
            source_name: source_name.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn connection(host: &str, port: u16, source: io::Error) -> Self {
        Error::Connection {
            host: host.to_string(),
            port,
            source,
        }
    }
}

impl From<openssl::error::ErrorStack> for Error {
    fn from(err: openssl::error::ErrorStack) -> Self {
        Error::CertificateParse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_mentions_target() {
        let err = Error::connection(
            "example.test",
            8443,
            io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        );
        let message = err.to_string();
        assert!(message.contains("example.test:8443"));
        assert!(message.contains("refused"));
    }

    #[test]
    fn test_store_save_error_mentions_path() {
        let err = Error::StoreSave {
            path: PathBuf::from("/tmp/out.ks"),
            reason: "disk full".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "could not save key store to /tmp/out.ks: disk full"
        );
    }
}
