//! TLS Certificate Management Module
//!
//! Every host in a group runs with the same self-signed certificate/key pair,
//! copied between machines out of band. This module handles:
//! - Generating that pair on first run and reusing it afterwards
//! - Loading certificates and private keys from PEM files
//! - Building server and client configurations
//! - Opening and accepting TLS streams with bounded waits
//!
//! ## Trust modes
//!
//! Peers are addressed by IP, so hostname verification never applies. The
//! client either accepts any certificate ([`TrustMode::EncryptedOnly`]: the
//! traffic is encrypted but the server is not authenticated), or only the
//! shared certificate itself ([`TrustMode::Pinned`]). Handshake signatures are
//! checked in both modes.

use std::fs::File;
use std::io::{self, BufReader};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rcgen::{CertificateParams, DnType, KeyPair, SanType};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use rustls_pemfile::{certs, private_key};
use sha2::{Digest, Sha256};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn};

use crate::protocol::ProtocolError;

pub const CERT_FILE: &str = "cert.pem";
pub const KEY_FILE: &str = "key.pem";

/// How the client decides whether to trust a server certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustMode {
    /// Encrypt, but accept whatever certificate the server presents
    EncryptedOnly,
    /// Accept only the pre-shared certificate
    Pinned,
}

/// TLS configuration for the server
#[derive(Clone)]
pub struct ServerTlsConfig {
    pub config: Arc<ServerConfig>,
}

/// TLS configuration for the client
#[derive(Clone)]
pub struct ClientTlsConfig {
    pub config: Arc<ClientConfig>,
    pub mode: TrustMode,
}

/// Generated certificate and key pair
pub struct GeneratedCert {
    pub cert_pem: String,
    pub key_pem: String,
}

/// The shared identity as found on disk
pub struct Identity {
    pub cert_pem: String,
    pub key_pem: String,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl ServerTlsConfig {
    /// Create a new server TLS configuration from certificate and key files
    pub fn from_files(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let certs = load_certs(cert_path)?;
        info!("Loaded {} certificate(s) from {:?}", certs.len(), cert_path);

        let key = load_private_key(key_path)?;
        info!("Loaded private key from {:?}", key_path);

        Self::build(certs, key)
    }

    /// Create server config from PEM strings
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let certs = load_certs_from_pem(cert_pem)?;
        let key = load_private_key_from_pem(key_pem)?;
        Self::build(certs, key)
    }

    fn build(certs: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Result<Self> {
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .context("Failed to build server TLS config")?;

        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Run the server side of the handshake on an accepted socket
    pub async fn accept(
        &self,
        tcp_stream: TcpStream,
        limit: Duration,
    ) -> Result<server::TlsStream<TcpStream>, ProtocolError> {
        let acceptor = TlsAcceptor::from(self.config.clone());
        match timeout(limit, acceptor.accept(tcp_stream)).await {
            Err(_) => Err(ProtocolError::Timeout(limit)),
            Ok(Err(e)) => Err(ProtocolError::HandshakeFailed(e)),
            Ok(Ok(stream)) => Ok(stream),
        }
    }
}

impl ClientTlsConfig {
    /// Client that encrypts but does not authenticate the server
    pub fn encrypted_only() -> Self {
        Self::with_verifier(PeerCertVerifier::new(None), TrustMode::EncryptedOnly)
    }

    /// Client that only trusts the given certificate
    pub fn pinned(cert_pem: &str) -> Result<Self> {
        let pinned = load_certs_from_pem(cert_pem)?
            .into_iter()
            .next()
            .context("No certificate to pin")?;
        Ok(Self::with_verifier(
            PeerCertVerifier::new(Some(pinned)),
            TrustMode::Pinned,
        ))
    }

    /// Pick the client flavor for a trust flag
    pub fn for_identity(identity: &Identity, verify_peer_certificate: bool) -> Result<Self> {
        if verify_peer_certificate {
            Self::pinned(&identity.cert_pem)
        } else {
            warn!("Peer certificates are not verified: transport is encrypted, not authenticated");
            Ok(Self::encrypted_only())
        }
    }

    fn with_verifier(verifier: PeerCertVerifier, mode: TrustMode) -> Self {
        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();

        Self {
            config: Arc::new(config),
            mode,
        }
    }

    /// Open a TCP connection and run the client handshake on it
    pub async fn connect(
        &self,
        addr: SocketAddr,
        limit: Duration,
    ) -> Result<client::TlsStream<TcpStream>, ProtocolError> {
        let tcp_stream = match timeout(limit, TcpStream::connect(addr)).await {
            Err(_) => {
                return Err(ProtocolError::ConnectFailed {
                    addr,
                    source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                })
            }
            Ok(Err(source)) => return Err(ProtocolError::ConnectFailed { addr, source }),
            Ok(Ok(stream)) => stream,
        };
        debug!("TCP connection to {} established", addr);

        let connector = TlsConnector::from(self.config.clone());
        let server_name = ServerName::from(addr.ip());

        match timeout(limit, connector.connect(server_name, tcp_stream)).await {
            Err(_) => Err(ProtocolError::HandshakeFailed(io::Error::new(
                io::ErrorKind::TimedOut,
                "handshake timed out",
            ))),
            Ok(Err(e)) => Err(ProtocolError::HandshakeFailed(e)),
            Ok(Ok(stream)) => Ok(stream),
        }
    }
}

/// Server certificate check for LAN peers.
///
/// With no pinned certificate any end-entity certificate is accepted. With
/// one, the presented certificate must be byte-identical to it.
#[derive(Debug)]
struct PeerCertVerifier {
    pinned: Option<CertificateDer<'static>>,
    provider: Arc<CryptoProvider>,
}

impl PeerCertVerifier {
    fn new(pinned: Option<CertificateDer<'static>>) -> Self {
        let provider = CryptoProvider::get_default()
            .cloned()
            .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()));
        Self { pinned, provider }
    }
}

impl ServerCertVerifier for PeerCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match &self.pinned {
            Some(pinned) if pinned.as_ref() != end_entity.as_ref() => {
                Err(rustls::Error::General(
                    "server certificate does not match the shared certificate".to_string(),
                ))
            }
            _ => Ok(ServerCertVerified::assertion()),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Generate a self-signed certificate
pub fn generate_self_signed_cert(
    common_name: &str,
    san_dns_names: &[&str],
    san_ips: &[std::net::IpAddr],
) -> Result<GeneratedCert> {
    info!("Generating self-signed certificate for: {}", common_name);

    let key_pair = KeyPair::generate().context("Failed to generate key pair")?;

    let mut params = CertificateParams::default();
    params.distinguished_name.push(DnType::CommonName, common_name);
    params.distinguished_name.push(DnType::OrganizationName, "lanlink");

    let mut sans = Vec::new();
    for dns_name in san_dns_names {
        sans.push(SanType::DnsName((*dns_name).try_into()?));
    }
    for ip in san_ips {
        sans.push(SanType::IpAddress(*ip));
    }
    params.subject_alt_names = sans;

    let cert = params
        .self_signed(&key_pair)
        .context("Failed to generate self-signed certificate")?;

    Ok(GeneratedCert {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}

/// Load the shared identity from `dir`, generating it on first run
pub fn load_or_generate_identity(dir: &Path) -> Result<Identity> {
    let cert_path = dir.join(CERT_FILE);
    let key_path = dir.join(KEY_FILE);

    if !cert_path.exists() || !key_path.exists() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create identity directory: {:?}", dir))?;
        let generated = generate_self_signed_cert("lanlink", &["lanlink", "localhost"], &[])?;
        save_cert_and_key(&generated.cert_pem, &generated.key_pem, &cert_path, &key_path)?;
    }

    let cert_pem = std::fs::read_to_string(&cert_path)
        .with_context(|| format!("Failed to read certificate: {:?}", cert_path))?;
    let key_pem = std::fs::read_to_string(&key_path)
        .with_context(|| format!("Failed to read private key: {:?}", key_path))?;

    Ok(Identity {
        cert_pem,
        key_pem,
        cert_path,
        key_path,
    })
}

/// SHA-256 fingerprint of the first certificate in `cert_pem`, colon separated
pub fn fingerprint(cert_pem: &str) -> Result<String> {
    let cert = load_certs_from_pem(cert_pem)?
        .into_iter()
        .next()
        .context("No certificate found")?;
    let digest = Sha256::digest(cert.as_ref());
    let pairs: Vec<String> = digest.iter().map(|b| hex::encode_upper([*b])).collect();
    Ok(pairs.join(":"))
}

/// Load certificates from a PEM file
fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open certificate file: {:?}", path))?;
    let mut reader = BufReader::new(file);

    let certs: Vec<CertificateDer<'static>> = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse certificates")?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {:?}", path);
    }

    Ok(certs)
}

fn load_certs_from_pem(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(pem.as_bytes());

    let certs: Vec<CertificateDer<'static>> = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse certificates from PEM")?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in PEM data");
    }

    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open private key file: {:?}", path))?;
    let mut reader = BufReader::new(file);

    private_key(&mut reader)
        .context("Failed to read private key")?
        .ok_or_else(|| anyhow::anyhow!("No private key found in {:?}", path))
}

fn load_private_key_from_pem(pem: &str) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(pem.as_bytes());

    private_key(&mut reader)
        .context("Failed to read private key from PEM")?
        .ok_or_else(|| anyhow::anyhow!("No private key found in PEM data"))
}

/// Save certificate and key to files
pub fn save_cert_and_key(
    cert_pem: &str,
    key_pem: &str,
    cert_path: &Path,
    key_path: &Path,
) -> Result<()> {
    use std::fs;

    fs::write(cert_path, cert_pem)
        .with_context(|| format!("Failed to write certificate to {:?}", cert_path))?;
    info!("Saved certificate to {:?}", cert_path);

    fs::write(key_path, key_pem)
        .with_context(|| format!("Failed to write private key to {:?}", key_path))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut permissions = fs::metadata(key_path)?.permissions();
        permissions.set_mode(0o600);
        fs::set_permissions(key_path, permissions)?;
    }

    info!("Saved private key to {:?}", key_path);

    Ok(())
}
