//! cert-downloader - save the certificate chain a TLS server presents
//!
//! ```bash
//! cert-downloader example.com:443
//! cert-downloader -k -p server.ks -P changeit example.com:443
//! ```
//!
//! Every certificate the server sends is written to `<subject DN>.cer` in the
//! working directory; with `-k` they are also added to a password-protected
//! key store. Nothing the server sends is validated.

use anyhow::{anyhow, Context, Result};
use cert_downloader::configs::AppConfig;
use cert_downloader::downloader::{CertificateDownloader, DownloadRequest};
use cert_downloader::key_store::KeyStore;
use cert_downloader::socket_factory::TlsConnectionFactory;
use clap::Parser;
use secrecy::SecretString;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "\
Usage: cert-downloader [-k -p <path> -P <password>] [-i <path> -I <password>]
                       [-t <millis>] [-c <config>] [-v] <host:port>

  -k              add the downloaded certificates to a key store
  -p <path>       key store file to write (required with -k)
  -P <password>   key store password (required with -k)
  -i <path>       key store or PKCS#12 file holding a client identity
  -I <password>   password of the client identity store
  -t <millis>     connect and read timeout
  -c <config>     configuration file (default: config.toml if present)
  -v              debug logging
  -h              print this help";

#[derive(Parser, Debug)]
#[command(name = "cert-downloader", disable_help_flag = true, disable_version_flag = true)]
struct Cli {
    #[arg(short = 'k')]
    key_store: bool,

    #[arg(short = 'p', value_name = "PATH")]
    key_store_path: Option<PathBuf>,

    #[arg(short = 'P', value_name = "PASSWORD")]
    key_store_password: Option<String>,

    #[arg(short = 'i', value_name = "PATH")]
    identity_path: Option<PathBuf>,

    #[arg(short = 'I', value_name = "PASSWORD")]
    identity_password: Option<String>,

    #[arg(short = 't', value_name = "MILLIS")]
    timeout_ms: Option<u64>,

    #[arg(short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(short = 'v')]
    verbose: bool,

    #[arg(short = 'h')]
    help: bool,

    target: Option<String>,
}

#[derive(Debug, Error)]
enum UsageError {
    #[error("help requested")]
    Help,
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug)]
struct StoreArgs {
    path: PathBuf,
    password: SecretString,
}

#[derive(Debug)]
struct Invocation {
    host: String,
    port: u16,
    key_store: Option<StoreArgs>,
    identity: Option<StoreArgs>,
    timeout_ms: Option<u64>,
    config: Option<PathBuf>,
    verbose: bool,
}

fn parse_args<I, T>(args: I) -> std::result::Result<Invocation, UsageError>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::try_parse_from(args).map_err(|e| UsageError::Invalid(e.to_string()))?;
    if cli.help {
        return Err(UsageError::Help);
    }

    let key_store = if cli.key_store {
        match (cli.key_store_path, cli.key_store_password) {
            (Some(path), Some(password)) => Some(StoreArgs {
                path,
                password: SecretString::new(password),
            }),
            _ => {
                return Err(UsageError::Invalid(
                    "-k requires both -p <path> and -P <password>".to_string(),
                ))
            }
        }
    } else {
        None
    };

    let identity = match (cli.identity_path, cli.identity_password) {
        (Some(path), Some(password)) => Some(StoreArgs {
            path,
            password: SecretString::new(password),
        }),
        (None, None) => None,
        _ => {
            return Err(UsageError::Invalid(
                "-i and -I must be given together".to_string(),
            ))
        }
    };

    let target = cli
        .target
        .ok_or_else(|| UsageError::Invalid("missing <host:port>".to_string()))?;
    let (host, port) = parse_target(&target)?;

    Ok(Invocation {
        host,
        port,
        key_store,
        identity,
        timeout_ms: cli.timeout_ms,
        config: cli.config,
        verbose: cli.verbose,
    })
}

/// Split `host:port` at the last colon; brackets around an IPv6 host are
/// dropped.
fn parse_target(target: &str) -> std::result::Result<(String, u16), UsageError> {
    let invalid = || UsageError::Invalid(format!("invalid target '{}', expected <host:port>", target));
    let (host, port) = target.rsplit_once(':').ok_or_else(invalid)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(invalid());
    }
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    Ok((host.to_string(), port))
}

fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("cert_downloader={}", level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> Result<()> {
    let invocation = match parse_args(std::env::args_os()) {
        Ok(invocation) => invocation,
        Err(e) => {
            if let UsageError::Invalid(reason) = &e {
                println!("{}\n", reason.trim_end());
            }
            println!("{}", USAGE);
            std::process::exit(1);
        }
    };
    init_tracing(invocation.verbose);

    let config = AppConfig::load_or_default(invocation.config.as_deref())
        .context("Failed to load configuration")?;
    let mut connection = config.connection.clone();
    if let Some(timeout_ms) = invocation.timeout_ms {
        connection.timeout_ms = timeout_ms;
    }

    let factory = Arc::new(TlsConnectionFactory::new(&connection));
    if let Some(identity) = &invocation.identity {
        let store = KeyStore::open_file(&identity.path, &identity.password)
            .context("Failed to open client identity store")?;
        factory.set_key_store(store);
    }

    let mut request =
        DownloadRequest::with_export_config(invocation.host, invocation.port, &config.export);
    if let Some(output) = invocation.key_store {
        request = request.key_store_output(output.path, output.password);
    }

    let downloader = CertificateDownloader::new(factory);
    let handle = thread::Builder::new()
        .name("cert-downloader".to_string())
        .spawn(move || downloader.run(&request))
        .context("Failed to start downloader thread")?;
    let report = handle
        .join()
        .map_err(|_| anyhow!("Downloader thread panicked"))?;

    println!(
        "\n{}:{} presented {} certificate(s)",
        report.host,
        report.port,
        report.certificates.len()
    );
    for path in &report.written_files {
        println!("✓ {}", path.display());
    }
    for path in &report.failed_files {
        println!("✗ {}", path.display());
    }
    if let Some(path) = &report.key_store_path {
        println!("✓ Key store saved to {}", path.display());
    }
    if let Some(error) = &report.error {
        println!("✗ {}", error);
    }

    Ok(())
}
