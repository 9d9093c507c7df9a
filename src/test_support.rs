//! Certificate chains and a one-shot TLS server for tests.

use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::BasicConstraints;
use openssl::x509::{X509Name, X509};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ServerConfig, ServerConnection, StreamOwned};

use crate::certificate::Certificate;

const X509_VERSION_3: i32 = 2;

/// Subject and validity of a generated test certificate.
pub(crate) struct TestName {
    common_name: String,
    organization: Option<String>,
    country: Option<String>,
    expired: bool,
}

impl TestName {
    pub(crate) fn new(common_name: &str) -> Self {
        Self {
            common_name: common_name.to_string(),
            organization: None,
            country: None,
            expired: false,
        }
    }

    pub(crate) fn organization(mut self, organization: &str) -> Self {
        self.organization = Some(organization.to_string());
        self
    }

    pub(crate) fn country(mut self, country: &str) -> Self {
        self.country = Some(country.to_string());
        self
    }

    pub(crate) fn expired(mut self) -> Self {
        self.expired = true;
        self
    }

    fn to_x509_name(&self) -> X509Name {
        let mut builder = X509Name::builder().unwrap();
        if let Some(country) = &self.country {
            builder.append_entry_by_nid(Nid::COUNTRYNAME, country).unwrap();
        }
        if let Some(organization) = &self.organization {
            builder
                .append_entry_by_nid(Nid::ORGANIZATIONNAME, organization)
                .unwrap();
        }
        builder
            .append_entry_by_nid(Nid::COMMONNAME, &self.common_name)
            .unwrap();
        builder.build()
    }
}

pub(crate) fn generate_key() -> PKey<Private> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap()
}

fn build_certificate(
    name: &TestName,
    key: &PKey<Private>,
    issuer: Option<(&PKey<Private>, &Certificate)>,
    ca: bool,
) -> Certificate {
    let mut builder = X509::builder().unwrap();
    builder.set_version(X509_VERSION_3).unwrap();

    let mut serial = BigNum::new().unwrap();
    serial.rand(127, MsbOption::MAYBE_ZERO, false).unwrap();
    builder
        .set_serial_number(&serial.to_asn1_integer().unwrap())
        .unwrap();

    let subject = name.to_x509_name();
    builder.set_subject_name(&subject).unwrap();
    match issuer {
        Some((_, issuer_cert)) => builder
            .set_issuer_name(issuer_cert.x509().subject_name())
            .unwrap(),
        None => builder.set_issuer_name(&subject).unwrap(),
    }

    let (not_before, not_after) = if name.expired {
        (
            Asn1Time::from_unix(1_000_000_000).unwrap(),
            Asn1Time::from_unix(1_100_000_000).unwrap(),
        )
    } else {
        (
            Asn1Time::days_from_now(0).unwrap(),
            Asn1Time::days_from_now(30).unwrap(),
        )
    };
    builder.set_not_before(&not_before).unwrap();
    builder.set_not_after(&not_after).unwrap();
    builder.set_pubkey(key).unwrap();

    if ca {
        let mut bc = BasicConstraints::new();
        bc.critical().ca();
        builder.append_extension(bc.build().unwrap()).unwrap();
    }

    let signing_key = issuer.map(|(issuer_key, _)| issuer_key).unwrap_or(key);
    builder.sign(signing_key, MessageDigest::sha256()).unwrap();
    Certificate::from_x509(builder.build()).unwrap()
}

pub(crate) fn self_signed(name: &TestName) -> (PKey<Private>, Certificate) {
    let key = generate_key();
    let cert = build_certificate(name, &key, None, true);
    (key, cert)
}

pub(crate) fn signed_by(
    name: &TestName,
    issuer_key: &PKey<Private>,
    issuer_cert: &Certificate,
) -> (PKey<Private>, Certificate) {
    let key = generate_key();
    let cert = build_certificate(name, &key, Some((issuer_key, issuer_cert)), false);
    (key, cert)
}

/// Leaf certificate issued by an intermediate that nobody trusts.
pub(crate) struct TestChain {
    pub(crate) leaf_key: PKey<Private>,
    pub(crate) leaf: Certificate,
    pub(crate) intermediate: Certificate,
}

impl TestChain {
    pub(crate) fn generate() -> Self {
        let (intermediate_key, intermediate) = self_signed(
            &TestName::new("Untrusted Intermediate CA").organization("Cert Downloader Tests"),
        );
        let (leaf_key, leaf) = signed_by(
            &TestName::new("leaf.localhost").organization("Cert Downloader Tests"),
            &intermediate_key,
            &intermediate,
        );
        Self {
            leaf_key,
            leaf,
            intermediate,
        }
    }

    /// Certificates in the order the server sends them.
    pub(crate) fn presented(&self) -> Vec<Certificate> {
        vec![self.leaf.clone(), self.intermediate.clone()]
    }
}

/// Accepts a single connection, completes the handshake and waits for the
/// client to hang up.
pub(crate) struct TlsTestServer {
    addr: SocketAddr,
    handle: Option<JoinHandle<()>>,
}

impl TlsTestServer {
    pub(crate) fn start(chain: &[Certificate], key: &PKey<Private>) -> Self {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let certs: Vec<CertificateDer<'static>> = chain
            .iter()
            .map(|cert| CertificateDer::from(cert.der().to_vec()))
            .collect();
        let key_der =
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.private_key_to_pkcs8().unwrap()));
        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(certs, key_der)
            .unwrap();
        let config = Arc::new(config);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        listener.set_nonblocking(true).unwrap();
        let handle = thread::spawn(move || {
            let Some(stream) = accept_within(&listener, Duration::from_secs(10)) else {
                return;
            };
            let _ = stream.set_nonblocking(false);
            let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
            let conn = ServerConnection::new(config).unwrap();
            let mut tls = StreamOwned::new(conn, stream);
            while tls.conn.is_handshaking() {
                if tls.conn.complete_io(&mut tls.sock).is_err() {
                    return;
                }
            }
            let mut buf = [0u8; 64];
            let _ = tls.read(&mut buf);
        });

        Self {
            addr,
            handle: Some(handle),
        }
    }

    pub(crate) fn port(&self) -> u16 {
        self.addr.port()
    }
}

impl Drop for TlsTestServer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn accept_within(listener: &TcpListener, limit: Duration) -> Option<TcpStream> {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        match listener.accept() {
            Ok((stream, _)) => return Some(stream),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(10));
            }
            Err(_) => return None,
        }
    }
    None
}

/// A port nothing is listening on.
pub(crate) fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}
