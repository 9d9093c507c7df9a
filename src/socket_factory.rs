//! TLS client connections that hand every certificate decision to the
//! registered [`TrustManager`]s instead of a trust store.
//!
//! The factory picks its protocol once, at construction. Key managers, trust
//! managers and the hostname verifier can be registered until the first
//! connection is made; at that point the client context is built from
//! whatever is registered (falling back to an in-memory key store and a
//! single [`CertificateRecorder`]) and frozen for the life of the factory.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{
    version, CertificateError, ClientConfig, ClientConnection, DigitallySignedStruct,
    SignatureScheme, StreamOwned, SupportedProtocolVersion,
};
use tracing::{debug, info, warn};

use crate::certificate::{Certificate, KeyType};
use crate::configs::ConnectionConfig;
use crate::error::{Error, Result};
use crate::key_manager::{KeyManager, KeyStoreKeyManager};
use crate::key_store::{KeyStore, SharedKeyStore};
use crate::trust::{
    AcceptAllHostnameVerifier, CertificateRecorder, HostnameVerifier, PeerSession, TrustManager,
};

static ANY_TLS: &[&SupportedProtocolVersion] = &[&version::TLS13, &version::TLS12];
static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&version::TLS13];
static TLS12_ONLY: &[&SupportedProtocolVersion] = &[&version::TLS12];

/// Protocol versions behind a protocol identifier. `TLSv1`, `TLSv1.1` and
/// the SSL family have no rustls implementation.
fn protocol_versions(protocol: &str) -> Option<&'static [&'static SupportedProtocolVersion]> {
    match protocol {
        "TLS" => Some(ANY_TLS),
        "TLSv1.3" => Some(TLS13_ONLY),
        "TLSv1.2" => Some(TLS12_ONLY),
        _ => None,
    }
}

#[derive(Debug)]
struct SelectedProtocol {
    name: String,
    versions: &'static [&'static SupportedProtocolVersion],
}

#[derive(Debug)]
struct FactoryState {
    key_managers: Vec<Arc<dyn KeyManager>>,
    trust_managers: Vec<Arc<dyn TrustManager>>,
    hostname_verifier: Arc<dyn HostnameVerifier>,
    key_store: Option<SharedKeyStore>,
    context: Option<Arc<ClientConfig>>,
}

impl FactoryState {
    fn register_key_store(&mut self, store: KeyStore) {
        match KeyStoreKeyManager::from_key_store(&store) {
            Ok(manager) => self.key_managers.push(Arc::new(manager)),
            Err(e) => warn!("Could not initialize key management from key store: {}", e),
        }
        self.key_store = Some(Arc::new(Mutex::new(store)));
    }
}

#[derive(Debug)]
pub struct TlsConnectionFactory {
    requested_protocols: Vec<String>,
    selected: Option<SelectedProtocol>,
    timeout: Duration,
    provider: Arc<CryptoProvider>,
    state: Mutex<FactoryState>,
}

impl Default for TlsConnectionFactory {
    fn default() -> Self {
        Self::new(&ConnectionConfig::default())
    }
}

impl TlsConnectionFactory {
    pub fn new(config: &ConnectionConfig) -> Self {
        Self::with_protocols(&config.protocols, config.timeout())
    }

    /// Keep the first protocol in `protocols` the TLS engine supports.
    pub fn with_protocols<S: AsRef<str>>(protocols: &[S], timeout: Duration) -> Self {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let requested_protocols: Vec<String> =
            protocols.iter().map(|p| p.as_ref().to_string()).collect();

        let mut selected = None;
        for protocol in &requested_protocols {
            let supported = protocol_versions(protocol).filter(|versions| {
                ClientConfig::builder_with_provider(provider.clone())
                    .with_protocol_versions(versions)
                    .is_ok()
            });
            match supported {
                Some(versions) => {
                    debug!("Using protocol {}", protocol);
                    selected = Some(SelectedProtocol {
                        name: protocol.clone(),
                        versions,
                    });
                    break;
                }
                None => debug!("Protocol {} is not available", protocol),
            }
        }
        if selected.is_none() {
            warn!(
                "None of the protocols {:?} is available; connections will fail",
                requested_protocols
            );
        }

        Self {
            requested_protocols,
            selected,
            timeout,
            provider,
            state: Mutex::new(FactoryState {
                key_managers: Vec::new(),
                trust_managers: Vec::new(),
                hostname_verifier: Arc::new(AcceptAllHostnameVerifier),
                key_store: None,
                context: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FactoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Associate `store` with the factory and derive a key manager from it.
    /// A store whose keys do not match their certificates is still
    /// associated, but contributes no key manager.
    pub fn set_key_store(&self, store: KeyStore) {
        let mut state = self.lock();
        if state.context.is_some() {
            debug!("Key store registered after TLS context initialization");
        }
        state.register_key_store(store);
    }

    pub fn add_key_manager(&self, manager: Arc<dyn KeyManager>) {
        let mut state = self.lock();
        if state.context.is_some() {
            debug!("Key manager registered after TLS context initialization");
        }
        state.key_managers.push(manager);
    }

    pub fn add_trust_manager(&self, manager: Arc<dyn TrustManager>) {
        let mut state = self.lock();
        if state.context.is_some() {
            debug!("Trust manager registered after TLS context initialization");
        }
        state.trust_managers.push(manager);
    }

    pub fn set_hostname_verifier(&self, verifier: Arc<dyn HostnameVerifier>) {
        let mut state = self.lock();
        if state.context.is_some() {
            debug!("Hostname verifier replaced after TLS context initialization");
        }
        state.hostname_verifier = verifier;
    }

    pub fn trust_managers(&self) -> Vec<Arc<dyn TrustManager>> {
        self.lock().trust_managers.clone()
    }

    pub fn key_managers(&self) -> Vec<Arc<dyn KeyManager>> {
        self.lock().key_managers.clone()
    }

    pub fn key_store(&self) -> Option<SharedKeyStore> {
        self.lock().key_store.clone()
    }

    /// The protocol chosen at construction, if any was available.
    pub fn protocol(&self) -> Option<&str> {
        self.selected.as_ref().map(|selected| selected.name.as_str())
    }

    pub fn is_initialized(&self) -> bool {
        self.lock().context.is_some()
    }

    /// Certificates accepted so far by the first registered trust manager.
    pub fn captured_certificates(&self) -> Vec<Certificate> {
        let first = self.lock().trust_managers.first().cloned();
        first
            .map(|manager| manager.accepted_issuers())
            .unwrap_or_default()
    }

    pub fn connect(&self, host: &str, port: u16) -> Result<TlsSocket> {
        self.connect_with_timeout(host, port, self.timeout)
    }

    /// Open a TCP connection and wrap it in a TLS client whose handshake has
    /// not started yet. A zero `timeout` means no timeout.
    pub fn connect_with_timeout(&self, host: &str, port: u16, timeout: Duration) -> Result<TlsSocket> {
        let config = self.context()?;
        let server_name = ServerName::try_from(host.to_owned()).map_err(|e| {
            Error::connection(host, port, io::Error::new(io::ErrorKind::InvalidInput, e))
        })?;

        let timeout = (!timeout.is_zero()).then_some(timeout);
        let sock = open_stream(host, port, timeout).map_err(|e| Error::connection(host, port, e))?;
        let conn = ClientConnection::new(config, server_name)
            .map_err(|e| Error::connection(host, port, io::Error::new(io::ErrorKind::Other, e)))?;
        debug!("Connected to {}:{}", host, port);

        Ok(TlsSocket {
            host: host.to_string(),
            port,
            stream: StreamOwned::new(conn, sock),
        })
    }

    /// The frozen client context, built on first use.
    fn context(&self) -> Result<Arc<ClientConfig>> {
        let selected = self
            .selected
            .as_ref()
            .ok_or_else(|| Error::NoProtocolAvailable(self.requested_protocols.clone()))?;

        let mut state = self.lock();
        if let Some(context) = &state.context {
            return Ok(context.clone());
        }

        if state.key_managers.is_empty() {
            state.register_key_store(KeyStore::in_memory());
        }
        if state.trust_managers.is_empty() {
            info!("No specified trust management, defaulting to accepting all certificates");
            state.trust_managers.push(Arc::new(CertificateRecorder::new()));
        }

        let verifier = Arc::new(TrustManagerVerifier {
            trust_managers: state.trust_managers.clone(),
            hostname_verifier: state.hostname_verifier.clone(),
            supported_schemes: self
                .provider
                .signature_verification_algorithms
                .supported_schemes(),
        });
        let builder = ClientConfig::builder_with_provider(self.provider.clone())
            .with_protocol_versions(selected.versions)
            .map_err(|e| Error::KeyManagement(format!("could not initialize TLS context: {}", e)))?
            .dangerous()
            .with_custom_certificate_verifier(verifier);

        let identity = state
            .key_managers
            .iter()
            .find_map(|manager| manager.client_identity());
        let config = match identity {
            Some(identity) => {
                debug!("Presenting client identity '{}'", identity.alias);
                builder
                    .with_client_auth_cert(identity.certificate_chain_der(), identity.private_key_der()?)
                    .map_err(|e| {
                        Error::KeyManagement(format!(
                            "could not use client identity '{}': {}",
                            identity.alias, e
                        ))
                    })?
            }
            None => builder.with_no_client_auth(),
        };

        let config = Arc::new(config);
        state.context = Some(config.clone());
        info!("Initialized {} context", selected.name);
        Ok(config)
    }
}

fn open_stream(host: &str, port: u16, timeout: Option<Duration>) -> io::Result<TcpStream> {
    let mut last_error = None;
    for addr in (host, port).to_socket_addrs()? {
        let attempt = match timeout {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
            None => TcpStream::connect(addr),
        };
        match attempt {
            Ok(sock) => {
                sock.set_read_timeout(timeout)?;
                sock.set_write_timeout(timeout)?;
                return Ok(sock);
            }
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses")
    }))
}

/// Routes rustls' certificate decision through the registered trust
/// managers and hostname verifier. Handshake signatures are not checked.
#[derive(Debug)]
struct TrustManagerVerifier {
    trust_managers: Vec<Arc<dyn TrustManager>>,
    hostname_verifier: Arc<dyn HostnameVerifier>,
    supported_schemes: Vec<SignatureScheme>,
}

impl ServerCertVerifier for TrustManagerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let chain = std::iter::once(end_entity)
            .chain(intermediates)
            .map(|der| Certificate::from_der(der.as_ref()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| {
                warn!("Server sent an unparsable certificate: {}", e);
                rustls::Error::InvalidCertificate(CertificateError::BadEncoding)
            })?;
        let auth_type = chain
            .first()
            .map(Certificate::key_type)
            .unwrap_or(KeyType::Unknown);

        for manager in &self.trust_managers {
            manager
                .check_server_trusted(&chain, auth_type)
                .map_err(|e| {
                    warn!("{}", e);
                    rustls::Error::InvalidCertificate(CertificateError::ApplicationVerificationFailure)
                })?;
        }

        let hostname = server_name_str(server_name);
        let session = PeerSession {
            peer_host: hostname.clone(),
            peer_certificates: chain,
        };
        if !self.hostname_verifier.verify(&hostname, &session) {
            return Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForName,
            ));
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.supported_schemes.clone()
    }
}

fn server_name_str(server_name: &ServerName<'_>) -> String {
    match server_name {
        ServerName::DnsName(name) => name.as_ref().to_string(),
        ServerName::IpAddress(ip) => std::net::IpAddr::from(*ip).to_string(),
        _ => String::new(),
    }
}

/// A TLS client connection. The handshake runs on
/// [`TlsSocket::start_handshake`] or on the first read or write.
#[derive(Debug)]
pub struct TlsSocket {
    host: String,
    port: u16,
    stream: StreamOwned<ClientConnection, TcpStream>,
}

impl TlsSocket {
    pub fn start_handshake(&mut self) -> Result<()> {
        let stream = &mut self.stream;
        while stream.conn.is_handshaking() {
            stream
                .conn
                .complete_io(&mut stream.sock)
                .map_err(|e| Error::connection(&self.host, self.port, e))?;
        }
        // complete_io can return with our last handshake flight still queued
        while stream.conn.wants_write() {
            stream
                .conn
                .write_tls(&mut stream.sock)
                .map_err(|e| Error::connection(&self.host, self.port, e))?;
        }
        debug!(
            "Handshake with {}:{} complete ({})",
            self.host,
            self.port,
            self.protocol_version().unwrap_or_default()
        );
        Ok(())
    }

    /// Chain presented by the server, leaf first. Empty before the handshake.
    pub fn peer_certificates(&self) -> Vec<Certificate> {
        self.stream
            .conn
            .peer_certificates()
            .map(|chain| {
                chain
                    .iter()
                    .filter_map(|der| Certificate::from_der(der.as_ref()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn protocol_version(&self) -> Option<String> {
        self.stream
            .conn
            .protocol_version()
            .map(|version| format!("{:?}", version))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Read for TlsSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for TlsSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Drop for TlsSocket {
    fn drop(&mut self) {
        let stream = &mut self.stream;
        if !stream.conn.is_handshaking() {
            stream.conn.send_close_notify();
            while stream.conn.wants_write() {
                match stream.conn.write_tls(&mut stream.sock) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        }
        let _ = stream.sock.shutdown(Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{closed_port, self_signed, TestChain, TestName, TlsTestServer};
    use crate::trust::TrustRejection;

    #[derive(Debug)]
    struct RejectEverything;

    impl TrustManager for RejectEverything {
        fn check_client_trusted(&self, _: &[Certificate], _: KeyType) -> std::result::Result<(), TrustRejection> {
            Err(TrustRejection("client".to_string()))
        }

        fn check_server_trusted(&self, _: &[Certificate], _: KeyType) -> std::result::Result<(), TrustRejection> {
            Err(TrustRejection("server".to_string()))
        }

        fn accepted_issuers(&self) -> Vec<Certificate> {
            Vec::new()
        }
    }

    #[derive(Debug)]
    struct RejectHostnames;

    impl HostnameVerifier for RejectHostnames {
        fn verify(&self, _: &str, _: &PeerSession) -> bool {
            false
        }
    }

    fn factory() -> TlsConnectionFactory {
        TlsConnectionFactory::default()
    }

    #[test]
    fn test_default_protocol_selection() {
        assert_eq!(factory().protocol(), Some("TLS"));
    }

    #[test]
    fn test_first_available_protocol_wins() {
        let factory =
            TlsConnectionFactory::with_protocols(&["SSLv3", "TLSv1.2", "TLS"], Duration::from_secs(5));
        assert_eq!(factory.protocol(), Some("TLSv1.2"));
    }

    #[test]
    fn test_no_protocol_available() {
        let factory = TlsConnectionFactory::with_protocols(&["SSLv2", "TLSv1", "bogus"], Duration::from_secs(5));
        assert_eq!(factory.protocol(), None);

        let err = factory.connect("127.0.0.1", closed_port()).unwrap_err();
        match err {
            Error::NoProtocolAvailable(requested) => assert_eq!(requested.len(), 3),
            other => panic!("unexpected error: {}", other),
        }
        assert!(!factory.is_initialized());
    }

    #[test]
    fn test_first_connect_registers_defaults_once() {
        let chain = TestChain::generate();
        let server = TlsTestServer::start(&chain.presented(), &chain.leaf_key);
        let factory = factory();
        assert!(!factory.is_initialized());

        let mut socket = factory.connect("127.0.0.1", server.port()).unwrap();
        socket.start_handshake().unwrap();

        assert!(factory.is_initialized());
        assert_eq!(factory.trust_managers().len(), 1);
        assert_eq!(factory.key_managers().len(), 1);
        let store = factory.key_store().unwrap();
        assert_eq!(store.lock().unwrap().certificate_count(), 0);
        assert_eq!(socket.peer_certificates(), chain.presented());
        assert_eq!(factory.captured_certificates(), chain.presented());
    }

    #[test]
    fn test_untrusted_and_expired_chains_are_accepted() {
        let (key, expired) = self_signed(&TestName::new("expired.localhost").expired());
        let server = TlsTestServer::start(&[expired.clone()], &key);
        let factory = factory();

        let mut socket = factory.connect("127.0.0.1", server.port()).unwrap();
        socket.start_handshake().unwrap();
        assert_eq!(factory.captured_certificates(), vec![expired]);
    }

    #[test]
    fn test_registrations_after_first_connect_are_ignored() {
        let chain = TestChain::generate();
        let factory = factory();
        {
            let server = TlsTestServer::start(&chain.presented(), &chain.leaf_key);
            let mut socket = factory.connect("127.0.0.1", server.port()).unwrap();
            socket.start_handshake().unwrap();
        }

        factory.add_trust_manager(Arc::new(RejectEverything));
        factory.set_hostname_verifier(Arc::new(RejectHostnames));
        assert_eq!(factory.trust_managers().len(), 2);

        let server = TlsTestServer::start(&chain.presented(), &chain.leaf_key);
        let mut socket = factory.connect("127.0.0.1", server.port()).unwrap();
        socket.start_handshake().unwrap();
        assert_eq!(factory.captured_certificates().len(), 4);
    }

    #[test]
    fn test_registered_trust_manager_can_reject() {
        let chain = TestChain::generate();
        let server = TlsTestServer::start(&chain.presented(), &chain.leaf_key);
        let factory = factory();
        factory.add_trust_manager(Arc::new(RejectEverything));

        let mut socket = factory.connect("127.0.0.1", server.port()).unwrap();
        let err = socket.start_handshake().unwrap_err();
        assert!(matches!(err, Error::Connection { .. }));
        assert_eq!(factory.trust_managers().len(), 1);
        assert!(factory.captured_certificates().is_empty());
    }

    #[test]
    fn test_hostname_verifier_is_consulted() {
        let chain = TestChain::generate();
        let server = TlsTestServer::start(&chain.presented(), &chain.leaf_key);
        let factory = factory();
        factory.set_hostname_verifier(Arc::new(RejectHostnames));

        let mut socket = factory.connect("127.0.0.1", server.port()).unwrap();
        assert!(socket.start_handshake().is_err());
    }

    #[test]
    fn test_pinned_protocol_version_is_negotiated() {
        let chain = TestChain::generate();
        let server = TlsTestServer::start(&chain.presented(), &chain.leaf_key);
        let factory = TlsConnectionFactory::with_protocols(&["TLSv1.2"], Duration::from_secs(5));

        let mut socket = factory.connect("127.0.0.1", server.port()).unwrap();
        socket.start_handshake().unwrap();
        assert_eq!(socket.protocol_version().as_deref(), Some("TLSv1_2"));
        assert_eq!(socket.host(), "127.0.0.1");
        assert_eq!(socket.port(), server.port());
    }

    #[test]
    fn test_client_identity_from_key_store() {
        let chain = TestChain::generate();
        let server = TlsTestServer::start(&chain.presented(), &chain.leaf_key);
        let (client_key, client_cert) = self_signed(&TestName::new("client.localhost"));
        let mut store = KeyStore::in_memory();
        store.add_identity("client", client_key, vec![client_cert]);

        let factory = factory();
        factory.set_key_store(store);
        assert_eq!(factory.key_managers().len(), 1);

        let mut socket = factory.connect("127.0.0.1", server.port()).unwrap();
        socket.start_handshake().unwrap();
        assert_eq!(factory.key_managers().len(), 1);
    }

    #[test]
    fn test_mismatched_identity_contributes_no_key_manager() {
        let (_, client_cert) = self_signed(&TestName::new("client.localhost"));
        let (other_key, _) = self_signed(&TestName::new("other.localhost"));
        let mut store = KeyStore::in_memory();
        store.add_identity("client", other_key, vec![client_cert]);

        let factory = factory();
        factory.set_key_store(store);
        assert!(factory.key_managers().is_empty());
        assert!(factory.key_store().is_some());
    }

    #[test]
    fn test_connection_refused() {
        let factory = factory();
        let err = factory.connect("127.0.0.1", closed_port()).unwrap_err();
        match err {
            Error::Connection { host, .. } => assert_eq!(host, "127.0.0.1"),
            other => panic!("unexpected error: {}", other),
        }
        assert!(factory.is_initialized());
    }

    #[test]
    fn test_invalid_server_name() {
        let factory = factory();
        let err = factory.connect("not a host name", 443).unwrap_err();
        assert!(matches!(err, Error::Connection { .. }));
    }

    #[test]
    fn test_shared_factory_across_threads() {
        const CONNECTIONS: usize = 4;
        let chain = TestChain::generate();
        let servers: Vec<TlsTestServer> = (0..CONNECTIONS)
            .map(|_| TlsTestServer::start(&chain.presented(), &chain.leaf_key))
            .collect();
        let factory = Arc::new(factory());

        let handles: Vec<_> = servers
            .iter()
            .map(|server| {
                let factory = Arc::clone(&factory);
                let port = server.port();
                std::thread::spawn(move || {
                    let mut socket = factory.connect("127.0.0.1", port).unwrap();
                    socket.start_handshake().unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(factory.is_initialized());
        assert_eq!(factory.trust_managers().len(), 1);
        assert_eq!(factory.key_managers().len(), 1);
        assert_eq!(factory.captured_certificates().len(), 2 * CONNECTIONS);
        drop(servers);
    }
}
