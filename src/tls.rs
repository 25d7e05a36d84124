//! TLS tunnel adapter and outbound TLS configuration
//!
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls;
use tokio_rustls::rustls::server::Acceptor;
use tokio_rustls::rustls::{
  client::danger::HandshakeSignatureValid, client::danger::ServerCertVerified,
  client::danger::ServerCertVerifier, ClientConfig, DigitallySignedStruct, Error as TLSError,
  ServerConfig, SignatureScheme, SupportedProtocolVersion,
};
use tokio_rustls::{LazyConfigAcceptor, TlsAcceptor};

use crate::errors::{Error, Result};
use crate::proxy::TlsVersion;
use crate::socket::Socket;

/// Provides the certificate presented to clients for an intercepted host.
#[async_trait::async_trait]
pub trait CertificateSource: Send + Sync {
  /// Certificate chain and private key for `hostname`.
  ///
  /// Return [`Error::MissingRootCertificate`] when no signing material is
  /// available.
  async fn server_certificate(
    &self,
    hostname: &str,
  ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>;
}

/// One certificate served for every hostname.
#[derive(Debug)]
pub struct StaticCertificate {
  chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
}

impl StaticCertificate {
  /// Load a PEM encoded certificate chain and private key
  pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
    let chain = rustls_pemfile::certs(&mut BufReader::new(cert_pem))
      .collect::<std::result::Result<Vec<_>, _>>()?;
    if chain.is_empty() {
      return Err(Error::MissingRootCertificate);
    }
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_pem))?
      .ok_or(Error::MissingRootCertificate)?;
    Ok(Self { chain, key })
  }

  /// Load a PEM encoded certificate chain and private key from files
  pub fn from_files(cert: impl AsRef<Path>, key: impl AsRef<Path>) -> Result<Self> {
    let cert_pem = std::fs::read(cert)?;
    let key_pem = std::fs::read(key)?;
    Self::from_pem(&cert_pem, &key_pem)
  }
}

#[async_trait::async_trait]
impl CertificateSource for StaticCertificate {
  async fn server_certificate(
    &self,
    _hostname: &str,
  ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    Ok((self.chain.clone(), self.key.clone_key()))
  }
}

/// Terminates TLS on a client socket after a CONNECT.
#[derive(Clone, Default)]
pub struct TlsTunnel {
  source: Option<Arc<dyn CertificateSource>>,
}

impl std::fmt::Debug for TlsTunnel {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TlsTunnel")
      .field("has_source", &self.source.is_some())
      .finish()
  }
}

impl TlsTunnel {
  /// Create an adapter signing with `source`
  pub fn new(source: Option<Arc<dyn CertificateSource>>) -> Self {
    Self { source }
  }

  /// Whether a certificate source is configured
  pub fn has_source(&self) -> bool {
    self.source.is_some()
  }

  /// Server configuration presenting a certificate for `hostname`.
  pub async fn server_config(&self, hostname: &str) -> Result<Arc<ServerConfig>> {
    let source = self.source.as_ref().ok_or(Error::MissingRootCertificate)?;
    let (chain, key) = source.server_certificate(hostname).await?;
    let config = ServerConfig::builder()
      .with_no_client_auth()
      .with_single_cert(chain, key)?;
    Ok(Arc::new(config))
  }

  /// Runs the server side of a TLS handshake on `socket` with a prepared
  /// configuration.
  pub async fn accept(&self, socket: Socket, config: Arc<ServerConfig>) -> Result<Socket> {
    let stream = TlsAcceptor::from(config).accept(socket).await?;
    Ok(Socket::from_tls(stream))
  }

  /// Runs the server side of a TLS handshake on `socket`.
  ///
  /// The certificate is chosen for `hostname` when it is known, otherwise
  /// for the SNI name the client sent. The returned socket reads and writes
  /// plaintext and keeps the addresses and timeouts of `socket`.
  pub async fn wrap(&self, socket: Socket, hostname: Option<&str>) -> Result<Socket> {
    if let Some(hostname) = hostname {
      let config = self.server_config(hostname).await?;
      let socket = self.accept(socket, config).await?;
      tracing::debug!("[TUNNEL] TLS established for {}", hostname);
      return Ok(socket);
    }
    if !self.has_source() {
      return Err(Error::MissingRootCertificate);
    }
    let fallback = socket.local_addr().ip().to_string();
    let start = LazyConfigAcceptor::new(Acceptor::default(), socket).await?;
    let name = start
      .client_hello()
      .server_name()
      .map(|s| s.to_string())
      .unwrap_or(fallback);
    let config = self.server_config(&name).await?;
    let stream = start.into_stream(config).await?;
    tracing::debug!("[TUNNEL] TLS established for {}", name);
    Ok(Socket::from_tls(stream))
  }
}

/// Client configuration for upstream connections restricted to `versions`.
///
/// Upstream certificates are not verified.
pub fn client_config(versions: &[TlsVersion]) -> ClientConfig {
  let mut protocols: Vec<&'static SupportedProtocolVersion> = versions
    .iter()
    .map(|v| match v {
      TlsVersion::Tls12 => &rustls::version::TLS12,
      TlsVersion::Tls13 => &rustls::version::TLS13,
    })
    .collect();
  if protocols.is_empty() {
    protocols = rustls::ALL_VERSIONS.to_vec();
  }
  ClientConfig::builder_with_protocol_versions(&protocols)
    .dangerous()
    .with_custom_certificate_verifier(Arc::new(NoVerifier))
    .with_no_client_auth()
}

#[derive(Debug)]
pub(crate) struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, TLSError> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    vec![
      SignatureScheme::RSA_PKCS1_SHA1,
      SignatureScheme::ECDSA_SHA1_Legacy,
      SignatureScheme::RSA_PKCS1_SHA256,
      SignatureScheme::ECDSA_NISTP256_SHA256,
      SignatureScheme::RSA_PKCS1_SHA384,
      SignatureScheme::ECDSA_NISTP384_SHA384,
      SignatureScheme::RSA_PKCS1_SHA512,
      SignatureScheme::ECDSA_NISTP521_SHA512,
      SignatureScheme::RSA_PSS_SHA256,
      SignatureScheme::RSA_PSS_SHA384,
      SignatureScheme::RSA_PSS_SHA512,
      SignatureScheme::ED25519,
      SignatureScheme::ED448,
    ]
  }
}
