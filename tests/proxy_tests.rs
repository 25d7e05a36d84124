//! Integration tests for slinger-proxy

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustls_pki_types::ServerName;
use slinger_proxy::tls::client_config;
use slinger_proxy::{
  Arrangeable, CacheEntry, ConnectRequestListener, Error, HttpExchange, HttpSender,
  InternalRequestHandler, OverrideListener, PersistentConnectionListener, ProxyConfig,
  ProxyListener, ProxyServer, Request, Response, Result, Socket, StaticCertificate, StatusCode,
  TlsVersion, CONNECT_ESTABLISHED,
};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

#[derive(Clone, Copy)]
enum Upstream {
  Ok,
  Refused,
  Slow,
}

struct StubSender {
  mode: Upstream,
  delay: Duration,
  calls: AtomicUsize,
  in_flight: AtomicUsize,
  overlapped: AtomicBool,
  notify: Mutex<Vec<bool>>,
  requests: Mutex<Vec<Request>>,
}

impl StubSender {
  fn new(mode: Upstream) -> Arc<Self> {
    Self::with_delay(mode, Duration::ZERO)
  }

  fn with_delay(mode: Upstream, delay: Duration) -> Arc<Self> {
    Arc::new(Self {
      mode,
      delay,
      calls: AtomicUsize::new(0),
      in_flight: AtomicUsize::new(0),
      overlapped: AtomicBool::new(false),
      notify: Mutex::new(Vec::new()),
      requests: Mutex::new(Vec::new()),
    })
  }

  fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

#[async_trait::async_trait]
impl HttpSender for StubSender {
  async fn send_and_receive(&self, exchange: &mut HttpExchange, notify: bool) -> Result<()> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
      self.overlapped.store(true, Ordering::SeqCst);
    }
    if !self.delay.is_zero() {
      tokio::time::sleep(self.delay).await;
    }
    self.in_flight.fetch_sub(1, Ordering::SeqCst);
    self.notify.lock().unwrap().push(notify);
    self.requests.lock().unwrap().push(exchange.request().clone());
    match self.mode {
      Upstream::Ok => {
        exchange.response = Some(Response::plain_text(StatusCode::OK, "upstream body"));
        exchange.response_from_target_host = true;
        Ok(())
      }
      Upstream::Refused => Err(Error::IO(std::io::Error::new(
        std::io::ErrorKind::ConnectionRefused,
        "connection refused by target",
      ))),
      Upstream::Slow => Err(Error::IO(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        "target too slow",
      ))),
    }
  }
}

#[derive(Default)]
struct CountingListener {
  order: i32,
  allow_request: bool,
  allow_response: bool,
  requests: AtomicUsize,
  responses: AtomicUsize,
}

impl CountingListener {
  fn allowing(allow_request: bool, allow_response: bool) -> Arc<Self> {
    Arc::new(Self {
      allow_request,
      allow_response,
      ..Default::default()
    })
  }
}

impl Arrangeable for CountingListener {
  fn arrangeable_order(&self) -> i32 {
    self.order
  }
}

#[async_trait::async_trait]
impl ProxyListener for CountingListener {
  async fn on_http_request_send(&self, _exchange: &mut HttpExchange) -> Result<bool> {
    self.requests.fetch_add(1, Ordering::SeqCst);
    Ok(self.allow_request)
  }
  async fn on_http_response_receive(&self, _exchange: &mut HttpExchange) -> Result<bool> {
    self.responses.fetch_add(1, Ordering::SeqCst);
    Ok(self.allow_response)
  }
}

struct ServeFromMemory;

impl Arrangeable for ServeFromMemory {
  fn arrangeable_order(&self) -> i32 {
    0
  }
}

#[async_trait::async_trait]
impl OverrideListener for ServeFromMemory {
  async fn on_request_override(&self, exchange: &mut HttpExchange) -> Result<bool> {
    exchange.response = Some(Response::plain_text(StatusCode::OK, "overridden"));
    Ok(true)
  }
}

struct RewriteResponse;

impl Arrangeable for RewriteResponse {
  fn arrangeable_order(&self) -> i32 {
    0
  }
}

#[async_trait::async_trait]
impl OverrideListener for RewriteResponse {
  async fn on_response_override(&self, exchange: &mut HttpExchange) -> Result<bool> {
    exchange.response = Some(Response::plain_text(StatusCode::OK, "rewritten"));
    Ok(true)
  }
}

#[derive(Default)]
struct ConnectRecorder {
  seen: Mutex<Vec<(String, String)>>,
}

impl Arrangeable for ConnectRecorder {
  fn arrangeable_order(&self) -> i32 {
    0
  }
}

#[async_trait::async_trait]
impl ConnectRequestListener for ConnectRecorder {
  async fn on_connect_request(&self, exchange: &HttpExchange) -> Result<()> {
    let request = exchange.request();
    let host = request.uri().host().unwrap_or_default().to_string();
    self
      .seen
      .lock()
      .unwrap()
      .push((request.method().to_string(), host));
    Ok(())
  }
}

struct Takeover;

impl Arrangeable for Takeover {
  fn arrangeable_order(&self) -> i32 {
    0
  }
}

#[async_trait::async_trait]
impl PersistentConnectionListener for Takeover {
  async fn on_handshake_response(
    &self,
    _exchange: &mut HttpExchange,
    socket: &mut Option<Socket>,
  ) -> Result<bool> {
    if let Some(mut socket) = socket.take() {
      socket.write_all(b"taken over").await?;
      socket.flush().await?;
    }
    Ok(true)
  }
}

struct Api;

#[async_trait::async_trait]
impl InternalRequestHandler for Api {
  async fn handle(&self, exchange: &mut HttpExchange, _socket: &mut Socket) -> Result<bool> {
    exchange.response = Some(Response::plain_text(StatusCode::OK, "internal"));
    Ok(true)
  }
}

fn server_with(config: ProxyConfig, sender: &Arc<StubSender>) -> ProxyServer {
  ProxyServer::builder()
    .config(config)
    .sender(sender.clone())
    .build()
}

async fn start(server: &ProxyServer) -> SocketAddr {
  let port = server.start_on("127.0.0.1", 0, false).await.unwrap();
  SocketAddr::from(([127, 0, 0, 1], port))
}

async fn connect(addr: SocketAddr) -> BufReader<TcpStream> {
  BufReader::new(TcpStream::connect(addr).await.unwrap())
}

async fn send<S: AsyncRead + AsyncWrite + Unpin>(client: &mut BufReader<S>, raw: &str) {
  client.get_mut().write_all(raw.as_bytes()).await.unwrap();
  client.get_mut().flush().await.unwrap();
}

/// Reads one response, or `None` when the proxy closed the connection first.
async fn read_response<S: AsyncRead + AsyncWrite + Unpin>(
  client: &mut BufReader<S>,
) -> Option<(String, Vec<u8>)> {
  let read = async {
    let mut head = String::new();
    loop {
      let mut line = String::new();
      if client.read_line(&mut line).await.unwrap() == 0 {
        return None;
      }
      head.push_str(&line);
      if line == "\r\n" {
        break;
      }
    }
    let length = head
      .lines()
      .filter_map(|l| l.split_once(':'))
      .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
      .and_then(|(_, v)| v.trim().parse::<usize>().ok())
      .unwrap_or(0);
    let mut body = vec![0; length];
    client.read_exact(&mut body).await.unwrap();
    Some((head, body))
  };
  tokio::time::timeout(Duration::from_secs(5), read)
    .await
    .expect("proxy did not answer in time")
}

#[tokio::test]
async fn scenario_a_forwards_once_and_keeps_connection_open() {
  let sender = StubSender::new(Upstream::Ok);
  let server = server_with(ProxyConfig::default(), &sender);
  let listener = CountingListener::allowing(true, true);
  server.add_proxy_listener(listener.clone());
  let addr = start(&server).await;

  let mut client = connect(addr).await;
  send(&mut client, "GET http://example.com/x HTTP/1.1\r\nHost: example.com\r\n\r\n").await;
  let (head, body) = read_response(&mut client).await.unwrap();
  assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
  assert_eq!(body, b"upstream body");
  assert_eq!(sender.calls(), 1);

  send(&mut client, "GET /y HTTP/1.1\r\nHost: example.com\r\n\r\n").await;
  let (head, _) = read_response(&mut client).await.unwrap();
  assert!(head.starts_with("HTTP/1.1 200"));
  assert_eq!(sender.calls(), 2);
  assert_eq!(listener.requests.load(Ordering::SeqCst), 2);
  assert_eq!(listener.responses.load(Ordering::SeqCst), 2);
  let requests = sender.requests.lock().unwrap();
  assert_eq!(requests[1].uri().to_string(), "http://example.com/y");
}

#[tokio::test]
async fn scenario_b_connect_is_acknowledged_and_notified() {
  let sender = StubSender::new(Upstream::Ok);
  let server = server_with(ProxyConfig::default(), &sender);
  let recorder = Arc::new(ConnectRecorder::default());
  server.add_connect_listener(recorder.clone());
  let addr = start(&server).await;

  let mut client = connect(addr).await;
  send(&mut client, "CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n").await;
  let mut ack = vec![0u8; CONNECT_ESTABLISHED.len()];
  client.read_exact(&mut ack).await.unwrap();
  assert_eq!(ack, b"HTTP/1.1 200 Connection established\r\n\r\n");

  // no certificate source: the tunnel cannot be intercepted
  let (head, body) = read_response(&mut client).await.unwrap();
  assert!(head.starts_with("HTTP/1.1 502"));
  assert!(String::from_utf8_lossy(&body).contains("example.com"));

  let seen = recorder.seen.lock().unwrap();
  assert_eq!(*seen, vec![("CONNECT".to_string(), "example.com".to_string())]);
  assert_eq!(sender.calls(), 0);
}

fn self_signed(host: &str) -> StaticCertificate {
  let key = rcgen::KeyPair::generate().unwrap();
  let cert = rcgen::CertificateParams::new(vec![host.to_string()])
    .unwrap()
    .self_signed(&key)
    .unwrap();
  StaticCertificate::from_pem(cert.pem().as_bytes(), key.serialize_pem().as_bytes()).unwrap()
}

#[tokio::test]
async fn connect_tunnel_is_intercepted_and_kept_alive() {
  let sender = StubSender::new(Upstream::Ok);
  let server = ProxyServer::builder()
    .sender(sender.clone())
    .certificate_source(Arc::new(self_signed("example.com")))
    .build();
  let addr = start(&server).await;

  let mut tcp = TcpStream::connect(addr).await.unwrap();
  tcp
    .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
    .await
    .unwrap();
  let mut ack = vec![0u8; CONNECT_ESTABLISHED.len()];
  tcp.read_exact(&mut ack).await.unwrap();
  assert_eq!(ack, CONNECT_ESTABLISHED);

  let config = client_config(&[TlsVersion::Tls12, TlsVersion::Tls13]);
  let connector = TlsConnector::from(Arc::new(config));
  let name = ServerName::try_from("example.com").unwrap();
  let tls = connector.connect(name, tcp).await.unwrap();
  let mut client = BufReader::new(tls);

  send(&mut client, "GET /inside HTTP/1.1\r\nHost: example.com\r\n\r\n").await;
  let (head, body) = read_response(&mut client).await.unwrap();
  assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
  assert_eq!(body, b"upstream body");

  send(&mut client, "GET /again?q=1 HTTP/1.1\r\n\r\n").await;
  let (head, _) = read_response(&mut client).await.unwrap();
  assert!(head.starts_with("HTTP/1.1 200"));

  let requests = sender.requests.lock().unwrap();
  assert_eq!(requests.len(), 2);
  assert_eq!(requests[0].uri().to_string(), "https://example.com/inside");
  assert_eq!(requests[1].uri().to_string(), "https://example.com/again?q=1");
}

#[tokio::test]
async fn scenario_c_serialize_never_overlaps_sends() {
  let sender = StubSender::with_delay(Upstream::Ok, Duration::from_millis(200));
  let config = ProxyConfig {
    serialize: true,
    ..Default::default()
  };
  let server = server_with(config, &sender);
  let addr = start(&server).await;

  let one = tokio::spawn(async move {
    let mut client = connect(addr).await;
    send(&mut client, "GET http://example.com/1 HTTP/1.1\r\n\r\n").await;
    read_response(&mut client).await
  });
  let two = tokio::spawn(async move {
    let mut client = connect(addr).await;
    send(&mut client, "GET http://example.com/2 HTTP/1.1\r\n\r\n").await;
    read_response(&mut client).await
  });
  assert!(one.await.unwrap().is_some());
  assert!(two.await.unwrap().is_some());
  assert_eq!(sender.calls(), 2);
  assert!(!sender.overlapped.load(Ordering::SeqCst));
}

#[tokio::test]
async fn scenario_d_io_failure_becomes_502_with_error_kind() {
  let sender = StubSender::new(Upstream::Refused);
  let server = server_with(ProxyConfig::default(), &sender);
  let listener = CountingListener::allowing(true, true);
  server.add_proxy_listener(listener.clone());
  let addr = start(&server).await;

  let mut client = connect(addr).await;
  send(&mut client, "GET http://example.com/x HTTP/1.1\r\n\r\n").await;
  let (head, body) = read_response(&mut client).await.unwrap();
  assert!(head.starts_with("HTTP/1.1 502"));
  let body = String::from_utf8_lossy(&body);
  assert!(body.contains("ConnectionRefused"));
  assert!(body.contains("connection refused by target"));
  assert_eq!(listener.responses.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn upstream_timeout_becomes_504() {
  let sender = StubSender::new(Upstream::Slow);
  let server = server_with(ProxyConfig::default(), &sender);
  let addr = start(&server).await;

  let mut client = connect(addr).await;
  send(&mut client, "GET http://example.com/slow HTTP/1.1\r\n\r\n").await;
  let (head, body) = read_response(&mut client).await.unwrap();
  assert!(head.starts_with("HTTP/1.1 504"));
  assert!(String::from_utf8_lossy(&body).contains("http://example.com/slow"));
}

#[tokio::test]
async fn scenario_e_accept_encoding_is_whittled() {
  let sender = StubSender::new(Upstream::Ok);
  let server = server_with(ProxyConfig::default(), &sender);
  let addr = start(&server).await;

  let mut client = connect(addr).await;
  send(
    &mut client,
    "GET http://example.com/a HTTP/1.1\r\nAccept-Encoding: gzip, br\r\n\r\n",
  )
  .await;
  read_response(&mut client).await.unwrap();
  send(
    &mut client,
    "GET http://example.com/b HTTP/1.1\r\nAccept-Encoding: br\r\n\r\n",
  )
  .await;
  read_response(&mut client).await.unwrap();

  let requests = sender.requests.lock().unwrap();
  assert_eq!(requests[0].headers()["accept-encoding"], "gzip");
  assert!(requests[1].headers().get("accept-encoding").is_none());
}

#[tokio::test]
async fn scenario_f_internal_domain_never_reaches_the_sender() {
  let sender = StubSender::new(Upstream::Ok);
  let server = ProxyServer::builder()
    .sender(sender.clone())
    .internal_handler(Arc::new(Api))
    .build();
  let addr = start(&server).await;

  let mut client = connect(addr).await;
  let raw = format!("GET http://slinger:{}/status HTTP/1.1\r\n\r\n", addr.port());
  send(&mut client, &raw).await;
  let (head, body) = read_response(&mut client).await.unwrap();
  assert!(head.starts_with("HTTP/1.1 200"));
  assert_eq!(body, b"internal");
  assert_eq!(sender.calls(), 0);
}

#[tokio::test]
async fn self_request_without_handler_is_not_found() {
  let sender = StubSender::new(Upstream::Ok);
  let server = server_with(ProxyConfig::default(), &sender);
  let addr = start(&server).await;

  let mut client = connect(addr).await;
  let raw = format!("GET http://127.0.0.1:{}/ HTTP/1.1\r\n\r\n", addr.port());
  send(&mut client, &raw).await;
  let (head, _) = read_response(&mut client).await.unwrap();
  assert!(head.starts_with("HTTP/1.1 404"));
  assert_eq!(sender.calls(), 0);
}

#[tokio::test]
async fn request_veto_drops_the_exchange() {
  let sender = StubSender::new(Upstream::Ok);
  let server = server_with(ProxyConfig::default(), &sender);
  let listener = CountingListener::allowing(false, true);
  server.add_proxy_listener(listener.clone());
  let addr = start(&server).await;

  let mut client = connect(addr).await;
  send(&mut client, "GET http://example.com/x HTTP/1.1\r\n\r\n").await;
  assert!(read_response(&mut client).await.is_none());
  assert_eq!(sender.calls(), 0);
  assert_eq!(listener.responses.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn response_veto_writes_nothing() {
  let sender = StubSender::new(Upstream::Ok);
  let server = server_with(ProxyConfig::default(), &sender);
  server.add_proxy_listener(CountingListener::allowing(true, false));
  let addr = start(&server).await;

  let mut client = connect(addr).await;
  send(&mut client, "GET http://example.com/x HTTP/1.1\r\n\r\n").await;
  assert!(read_response(&mut client).await.is_none());
  assert_eq!(sender.calls(), 1);
}

#[tokio::test]
async fn request_override_skips_network_and_listeners() {
  let sender = StubSender::new(Upstream::Ok);
  let server = server_with(ProxyConfig::default(), &sender);
  let listener = CountingListener::allowing(true, true);
  server.add_proxy_listener(listener.clone());
  server.add_override_listener(Arc::new(ServeFromMemory));
  let addr = start(&server).await;

  let mut client = connect(addr).await;
  send(&mut client, "GET http://example.com/x HTTP/1.1\r\n\r\n").await;
  let (_, body) = read_response(&mut client).await.unwrap();
  assert_eq!(body, b"overridden");
  assert_eq!(sender.calls(), 0);
  assert_eq!(listener.requests.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn response_override_wins_over_response_listeners() {
  let sender = StubSender::new(Upstream::Ok);
  let server = server_with(ProxyConfig::default(), &sender);
  let listener = CountingListener::allowing(true, true);
  server.add_proxy_listener(listener.clone());
  server.add_override_listener(Arc::new(RewriteResponse));
  let addr = start(&server).await;

  let mut client = connect(addr).await;
  send(&mut client, "GET http://example.com/x HTTP/1.1\r\n\r\n").await;
  let (_, body) = read_response(&mut client).await.unwrap();
  assert_eq!(body, b"rewritten");
  assert_eq!(sender.calls(), 1);
  assert_eq!(listener.requests.load(Ordering::SeqCst), 1);
  assert_eq!(listener.responses.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn oversized_request_body_is_refused_and_proxy_keeps_serving() {
  let sender = StubSender::new(Upstream::Ok);
  let server = server_with(ProxyConfig::default(), &sender);
  let addr = start(&server).await;

  let mut client = connect(addr).await;
  send(
    &mut client,
    "POST http://example.com/ HTTP/1.1\r\nContent-Length: 1125899906842624\r\n\r\n",
  )
  .await;
  let (head, _) = read_response(&mut client).await.unwrap();
  assert!(head.starts_with("HTTP/1.1 413"));
  assert!(read_response(&mut client).await.is_none());
  assert_eq!(sender.calls(), 0);

  let mut other = connect(addr).await;
  send(&mut other, "GET http://example.com/x HTTP/1.1\r\n\r\n").await;
  let (head, _) = read_response(&mut other).await.unwrap();
  assert!(head.starts_with("HTTP/1.1 200"));
}

#[tokio::test]
async fn excluded_requests_bypass_listeners_but_are_sent() {
  let sender = StubSender::new(Upstream::Ok);
  let server = server_with(ProxyConfig::default(), &sender);
  let listener = CountingListener::allowing(false, false);
  server.add_proxy_listener(listener.clone());
  server.add_override_listener(Arc::new(ServeFromMemory));
  server
    .set_exclude_list(&["http://example\\.com/static/.*".to_string()])
    .unwrap();
  let addr = start(&server).await;

  let mut client = connect(addr).await;
  send(&mut client, "GET http://EXAMPLE.com/static/app.js HTTP/1.1\r\n\r\n").await;
  let (_, body) = read_response(&mut client).await.unwrap();
  assert_eq!(body, b"upstream body");
  assert_eq!(sender.calls(), 1);
  assert_eq!(*sender.notify.lock().unwrap(), vec![false]);
  assert_eq!(listener.requests.load(Ordering::SeqCst), 0);
  assert_eq!(listener.responses.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cache_hit_reproduces_cached_bytes() {
  let sender = StubSender::new(Upstream::Ok);
  let config = ProxyConfig {
    cache_processing_enabled: true,
    ..Default::default()
  };
  let server = server_with(config, &sender);
  let mut cached = HttpExchange::new(
    Request::parse(b"GET http://example.com/cached HTTP/1.1\r\n\r\n", None).unwrap(),
  );
  let mut response = Response::plain_text(StatusCode::OK, "from the cache");
  response
    .headers_mut()
    .insert("x-cached", "yes".parse().unwrap());
  let expected = response.to_raw();
  cached.set_response(response);
  server.set_cache_list(vec![CacheEntry::new(cached, 1)]);
  let addr = start(&server).await;

  let mut client = connect(addr).await;
  send(&mut client, "GET http://example.com/cached HTTP/1.1\r\n\r\n").await;
  let (head, body) = read_response(&mut client).await.unwrap();
  let mut received = head.into_bytes();
  received.extend_from_slice(&body);
  assert_eq!(received, expected.to_vec());
  assert_eq!(sender.calls(), 0);
}

#[tokio::test]
async fn persistent_listener_takes_over_the_socket() {
  let sender = StubSender::new(Upstream::Ok);
  let server = server_with(ProxyConfig::default(), &sender);
  server.add_persistent_connection_listener(Arc::new(Takeover));
  let addr = start(&server).await;

  let mut client = connect(addr).await;
  send(&mut client, "GET http://example.com/ws HTTP/1.1\r\n\r\n").await;
  let (head, _) = read_response(&mut client).await.unwrap();
  assert!(head.starts_with("HTTP/1.1 200"));
  let mut rest = Vec::new();
  client.read_to_end(&mut rest).await.unwrap();
  assert_eq!(rest, b"taken over");
}

#[tokio::test]
async fn connection_close_is_honoured() {
  let sender = StubSender::new(Upstream::Ok);
  let server = server_with(ProxyConfig::default(), &sender);
  let addr = start(&server).await;

  let mut client = connect(addr).await;
  send(
    &mut client,
    "GET http://example.com/x HTTP/1.1\r\nConnection: close\r\n\r\n",
  )
  .await;
  assert!(read_response(&mut client).await.is_some());
  assert!(read_response(&mut client).await.is_none());
}

#[tokio::test]
async fn stop_and_wait_drains_workers() {
  let sender = StubSender::new(Upstream::Ok);
  let config = ProxyConfig {
    keep_alive_read_timeout: Duration::from_millis(100),
    ..Default::default()
  };
  let server = server_with(config, &sender);
  let addr = start(&server).await;

  let mut client = connect(addr).await;
  send(&mut client, "GET http://example.com/x HTTP/1.1\r\n\r\n").await;
  read_response(&mut client).await.unwrap();
  assert!(server.is_any_worker_running());
  assert!(server.stop_and_wait(Duration::from_secs(2)).await);
  assert!(!server.is_any_worker_running());
  assert!(!server.is_running().await);
  assert!(TcpStream::connect(addr).await.is_err());
}
