//! One download run: connect, handshake, harvest what the recorder saw,
//! then export it.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError};

use secrecy::SecretString;
use tracing::{info, warn};
use uuid::Uuid;

use crate::certificate::Certificate;
use crate::configs::ExportConfig;
use crate::error::{Error, Result};
use crate::socket_factory::TlsConnectionFactory;

/// Where to save the key store holding the captured certificates.
#[derive(Debug)]
pub struct KeyStoreOutput {
    pub path: PathBuf,
    pub password: SecretString,
}

#[derive(Debug)]
pub struct DownloadRequest {
    pub host: String,
    pub port: u16,
    /// Write every certificate to `<export_directory>/<subject DN>.<extension>`.
    pub store_each_certificate: bool,
    pub export_directory: PathBuf,
    pub certificate_extension: String,
    pub key_store_output: Option<KeyStoreOutput>,
}

impl DownloadRequest {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self::with_export_config(host, port, &ExportConfig::default())
    }

    pub fn with_export_config(host: impl Into<String>, port: u16, export: &ExportConfig) -> Self {
        Self {
            host: host.into(),
            port,
            store_each_certificate: export.store_each_certificate,
            export_directory: export.directory.clone(),
            certificate_extension: export.extension.clone(),
            key_store_output: None,
        }
    }

    pub fn key_store_output(mut self, path: impl Into<PathBuf>, password: SecretString) -> Self {
        self.key_store_output = Some(KeyStoreOutput {
            path: path.into(),
            password,
        });
        self
    }

    pub fn certificate_path(&self, cert: &Certificate) -> PathBuf {
        self.export_directory.join(format!(
            "{}.{}",
            cert.subject_dn(),
            self.certificate_extension
        ))
    }
}

/// Outcome of [`CertificateDownloader::run`].
#[derive(Debug, Default)]
pub struct DownloadReport {
    pub host: String,
    pub port: u16,
    /// Everything the trust manager has accepted, in presentation order.
    pub certificates: Vec<Certificate>,
    pub written_files: Vec<PathBuf>,
    pub failed_files: Vec<PathBuf>,
    pub key_store_path: Option<PathBuf>,
    /// The failure that stopped the run early, if any.
    pub error: Option<String>,
}

impl DownloadReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.failed_files.is_empty()
    }
}

pub struct CertificateDownloader {
    factory: Arc<TlsConnectionFactory>,
}

impl CertificateDownloader {
    pub fn new(factory: Arc<TlsConnectionFactory>) -> Self {
        Self { factory }
    }

    pub fn factory(&self) -> &Arc<TlsConnectionFactory> {
        &self.factory
    }

    /// Never fails: every error is logged and reported.
    pub fn run(&self, request: &DownloadRequest) -> DownloadReport {
        let mut report = DownloadReport {
            host: request.host.clone(),
            port: request.port,
            ..Default::default()
        };
        if let Err(e) = self.download(request, &mut report) {
            warn!(
                "Certificate download from {}:{} failed: {}",
                request.host, request.port, e
            );
            report.error = Some(e.to_string());
        }
        report
    }

    fn download(&self, request: &DownloadRequest, report: &mut DownloadReport) -> Result<()> {
        info!("Downloading certificates from {}:{}", request.host, request.port);
        {
            let mut socket = self.factory.connect(&request.host, request.port)?;
            socket.start_handshake()?;
        }

        report.certificates = self.factory.captured_certificates();
        info!("Captured {} certificates", report.certificates.len());

        if request.store_each_certificate {
            for cert in &report.certificates {
                let path = request.certificate_path(cert);
                match write_certificate(&path, cert) {
                    Ok(()) => report.written_files.push(path),
                    Err(e) => {
                        warn!("{}", e);
                        report.failed_files.push(path);
                    }
                }
            }
        }

        if let Some(output) = &request.key_store_output {
            self.save_key_store(output, &report.certificates)?;
            report.key_store_path = Some(output.path.clone());
        }
        Ok(())
    }

    fn save_key_store(&self, output: &KeyStoreOutput, certificates: &[Certificate]) -> Result<()> {
        let store = self.factory.key_store().ok_or_else(|| {
            Error::KeyManagement("connection factory has no key store".to_string())
        })?;
        let mut store = store.lock().unwrap_or_else(PoisonError::into_inner);
        for cert in certificates {
            let alias = Uuid::new_v4().to_string();
            if !store.add(cert, &alias) {
                warn!("Skipping certificate {}", cert.subject_dn());
            }
        }
        store.save(&output.path, &output.password)
    }
}

fn write_certificate(path: &Path, cert: &Certificate) -> Result<()> {
    fs::write(path, cert.der()).map_err(|source| Error::CertificateIo {
        path: path.to_path_buf(),
        source,
    })?;
    info!("Wrote {}", path.display());
    Ok(())
}
