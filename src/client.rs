use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls_pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;

use crate::errors::{new_io_error, Error, Result};
use crate::exchange::{now_millis, HttpExchange};
use crate::proxy::{ProxyConfig, TlsVersion};
use crate::registry::ListenerList;
use crate::response::{ResponseBuilder, ResponseConfig};
use crate::sender::{HttpSender, SenderListener};
use crate::tls::client_config;
use crate::{Request, Response};

/// Default outbound sender.
///
/// Opens one connection per request, over TLS for `https` targets. Upstream
/// certificates are accepted without verification.
pub struct Client {
  timeout: Option<Duration>,
  max_body: Option<u64>,
  tls_config: Arc<ClientConfig>,
  listeners: ListenerList<dyn SenderListener>,
}

impl std::fmt::Debug for Client {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Client")
      .field("timeout", &self.timeout)
      .field("max_body", &self.max_body)
      .field("listeners", &self.listeners)
      .finish()
  }
}

impl Default for Client {
  fn default() -> Self {
    Self::new(
      Some(Duration::from_secs(60)),
      &[TlsVersion::Tls12, TlsVersion::Tls13],
    )
  }
}

impl Client {
  /// Create a client with a round trip timeout and the allowed TLS versions
  pub fn new(timeout: Option<Duration>, tls_versions: &[TlsVersion]) -> Self {
    Self {
      timeout,
      max_body: None,
      tls_config: Arc::new(client_config(tls_versions)),
      listeners: ListenerList::new(),
    }
  }

  /// Create a client using the upstream settings of a proxy configuration
  pub fn from_config(config: &ProxyConfig) -> Self {
    Self::new(config.upstream_timeout, &config.tls_versions)
      .max_body(Some(config.max_body_size))
  }

  /// Fail responses whose body is larger than `max_body` bytes
  pub fn max_body(mut self, max_body: Option<u64>) -> Self {
    self.max_body = max_body;
    self
  }

  /// Transport level listeners, only notified in notify mode
  pub fn listeners(&self) -> &ListenerList<dyn SenderListener> {
    &self.listeners
  }

  async fn round_trip(&self, request: &Request) -> Result<Response> {
    let (host, port) = request
      .host_port()
      .ok_or_else(|| Error::invalid_request(format!("No target host in {}", request.uri())))?;
    let tcp = match self.timeout {
      None => TcpStream::connect((host.as_str(), port)).await?,
      Some(t) => tokio::time::timeout(t, TcpStream::connect((host.as_str(), port))).await??,
    };
    tcp.set_nodelay(true)?;
    let wire = wire_request(request);
    if request.uri().scheme() == Some(&http::uri::Scheme::HTTPS) {
      let server_name = ServerName::try_from(host.clone())
        .map_err(|_| Error::invalid_request(format!("Invalid server name: {}", host)))?;
      let connector = TlsConnector::from(self.tls_config.clone());
      let stream = match self.timeout {
        None => connector.connect(server_name, tcp).await?,
        Some(t) => tokio::time::timeout(t, connector.connect(server_name, tcp)).await??,
      };
      self.exchange_over(stream, &wire).await
    } else {
      self.exchange_over(tcp, &wire).await
    }
  }

  async fn exchange_over<S>(&self, mut stream: S, request: &Request) -> Result<Response>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let raw = request.to_raw();
    match self.timeout {
      None => stream.write_all(&raw).await?,
      Some(t) => tokio::time::timeout(t, stream.write_all(&raw)).await??,
    }
    stream.flush().await?;
    let config = ResponseConfig::new(request, self.timeout).max_body(self.max_body);
    ResponseBuilder::new(BufReader::new(stream), config)
      .build()
      .await
  }
}

/// The request as it goes on the wire: one connection per request, no
/// hop-by-hop proxy headers.
fn wire_request(request: &Request) -> Request {
  let mut wire = request.clone();
  let headers = wire.headers_mut();
  headers.remove("proxy-connection");
  headers.remove(http::header::PROXY_AUTHORIZATION);
  headers.insert(
    http::header::CONNECTION,
    http::HeaderValue::from_static("close"),
  );
  wire
}

#[async_trait::async_trait]
impl HttpSender for Client {
  async fn send_and_receive(&self, exchange: &mut HttpExchange, notify: bool) -> Result<()> {
    let listeners = self.listeners.snapshot();
    if notify {
      for listener in listeners.iter() {
        listener.on_http_request_send(exchange).await;
      }
    }
    exchange.time_sent_millis = now_millis();
    let started = Instant::now();
    let response = self.round_trip(&exchange.request).await;
    exchange.time_elapsed_millis = started.elapsed().as_millis() as u64;
    let response = response.map_err(|e| match e {
      Error::IO(io) if io.kind() == std::io::ErrorKind::WouldBlock => {
        new_io_error(std::io::ErrorKind::TimedOut, &io.to_string())
      }
      other => other,
    })?;
    exchange.response = Some(response);
    exchange.response_from_target_host = true;
    if notify {
      for listener in listeners.iter() {
        listener.on_http_response_receive(exchange).await;
      }
    }
    Ok(())
  }
}
