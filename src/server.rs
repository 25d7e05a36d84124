//! Listening socket, accept loop and runtime configuration
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use regex::{Regex, RegexBuilder};
use socket2::{Domain, Protocol, Socket as RawSocket, Type};
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::cache::{CacheEntry, HistoryStore};
use crate::client::Client;
use crate::errors::{Error, Result};
use crate::internal::InternalRequestHandler;
use crate::listener::{
  ConnectRequestListener, OverrideListener, PersistentConnectionListener, ProxyListener,
};
use crate::proxy::ProxyConfig;
use crate::registry::ListenerRegistry;
use crate::sender::HttpSender;
use crate::tls::{CertificateSource, TlsTunnel};
use crate::worker::ConnectionWorker;

/// State shared by the accept loop and every connection worker.
pub(crate) struct ProxyState {
  pub(crate) config: ProxyConfig,
  pub(crate) registry: ListenerRegistry,
  pub(crate) sender: Arc<dyn HttpSender>,
  pub(crate) tunnel: TlsTunnel,
  pub(crate) store: Option<Arc<dyn HistoryStore>>,
  pub(crate) internal: Option<Arc<dyn InternalRequestHandler>>,
  cache_list: ArcSwap<Vec<CacheEntry>>,
  excludes: ArcSwap<Vec<Regex>>,
  serialize: AtomicBool,
  global_lock: Arc<Mutex<()>>,
  active_workers: AtomicUsize,
}

impl ProxyState {
  pub(crate) fn exclude_url(&self, uri: &str) -> bool {
    self.excludes.load().iter().any(|r| r.is_match(uri))
  }

  pub(crate) fn cache_list(&self) -> Arc<Vec<CacheEntry>> {
    self.cache_list.load_full()
  }

  /// The lock a new worker serializes its exchanges with
  fn worker_lock(&self) -> Arc<Mutex<()>> {
    if self.serialize.load(Ordering::SeqCst) {
      self.global_lock.clone()
    } else {
      Arc::new(Mutex::new(()))
    }
  }
}

/// Counts a worker as running for as long as it is alive.
pub(crate) struct WorkerGuard {
  state: Arc<ProxyState>,
}

impl WorkerGuard {
  fn new(state: Arc<ProxyState>) -> Self {
    state.active_workers.fetch_add(1, Ordering::SeqCst);
    Self { state }
  }
}

impl Drop for WorkerGuard {
  fn drop(&mut self) {
    self.state.active_workers.fetch_sub(1, Ordering::SeqCst);
  }
}

struct Running {
  shutdown: watch::Sender<bool>,
  handle: JoinHandle<()>,
  local_addr: SocketAddr,
}

/// Intercepting proxy server
pub struct ProxyServer {
  state: Arc<ProxyState>,
  running: Mutex<Option<Running>>,
}

/// Builder for `ProxyServer`.
///
/// Every collaborator is optional: without a sender the default [`Client`]
/// is used, without a certificate source CONNECT requests are answered with
/// a `502 Bad Gateway`, without a history store nothing is recorded, and
/// without an internal handler requests to the proxy itself get a
/// `404 Not Found`.
#[derive(Default)]
pub struct ProxyServerBuilder {
  config: Option<ProxyConfig>,
  sender: Option<Arc<dyn HttpSender>>,
  certificates: Option<Arc<dyn CertificateSource>>,
  store: Option<Arc<dyn HistoryStore>>,
  internal: Option<Arc<dyn InternalRequestHandler>>,
}

impl ProxyServerBuilder {
  /// Set the `ProxyConfig` to use.
  pub fn config(mut self, config: ProxyConfig) -> Self {
    self.config = Some(config);
    self
  }

  /// Set the outbound sender.
  pub fn sender(mut self, sender: Arc<dyn HttpSender>) -> Self {
    self.sender = Some(sender);
    self
  }

  /// Set the source of certificates for intercepted HTTPS hosts.
  pub fn certificate_source(mut self, source: Arc<dyn CertificateSource>) -> Self {
    self.certificates = Some(source);
    self
  }

  /// Set the history store used for recording and cache lookups.
  pub fn history_store(mut self, store: Arc<dyn HistoryStore>) -> Self {
    self.store = Some(store);
    self
  }

  /// Set the handler for requests addressed to the proxy itself.
  pub fn internal_handler(mut self, handler: Arc<dyn InternalRequestHandler>) -> Self {
    self.internal = Some(handler);
    self
  }

  /// Build the `ProxyServer`.
  pub fn build(self) -> ProxyServer {
    let config = self.config.unwrap_or_default();
    let sender = self
      .sender
      .unwrap_or_else(|| Arc::new(Client::from_config(&config)));
    let serialize = config.serialize;
    ProxyServer {
      state: Arc::new(ProxyState {
        config,
        registry: ListenerRegistry::new(),
        sender,
        tunnel: TlsTunnel::new(self.certificates),
        store: self.store,
        internal: self.internal,
        cache_list: ArcSwap::from_pointee(Vec::new()),
        excludes: ArcSwap::from_pointee(Vec::new()),
        serialize: AtomicBool::new(serialize),
        global_lock: Arc::new(Mutex::new(())),
        active_workers: AtomicUsize::new(0),
      }),
      running: Mutex::new(None),
    }
  }
}

impl ProxyServer {
  /// Create a server with the default collaborators
  pub fn new(config: ProxyConfig) -> Self {
    Self::builder().config(config).build()
  }

  /// Start building a server
  pub fn builder() -> ProxyServerBuilder {
    ProxyServerBuilder::default()
  }

  /// The configuration the server was built with
  pub fn config(&self) -> &ProxyConfig {
    &self.state.config
  }

  /// Start listening on the configured address and port.
  ///
  /// Returns the port actually bound. Starting a running server returns its
  /// current port.
  pub async fn start(&self) -> Result<u16> {
    let config = &self.state.config;
    self
      .start_on(&config.bind_address, config.port, config.dynamic_port)
      .await
  }

  /// Start listening on `bind_address:port`.
  ///
  /// An empty address listens on every interface. With `dynamic_port` a busy
  /// port is skipped in favour of the next one, up to 65535.
  pub async fn start_on(&self, bind_address: &str, port: u16, dynamic_port: bool) -> Result<u16> {
    let mut running = self.running.lock().await;
    if let Some(r) = running.as_ref() {
      return Ok(r.local_addr.port());
    }
    let ip = resolve_bind_address(bind_address).await?;
    let listener = bind_with_fallback(ip, port, dynamic_port, self.state.config.backlog)?;
    let local_addr = listener.local_addr()?;
    let (shutdown, receiver) = watch::channel(false);
    let handle = tokio::spawn(accept_loop(listener, self.state.clone(), receiver));
    tracing::info!("[PROXY] Listening on {}", local_addr);
    *running = Some(Running {
      shutdown,
      handle,
      local_addr,
    });
    Ok(local_addr.port())
  }

  /// Like [`ProxyServer::start_on`], returning the bound port or `-1` after
  /// logging why the server could not start.
  pub async fn start_server(&self, bind_address: &str, port: u16, dynamic_port: bool) -> i32 {
    match self.start_on(bind_address, port, dynamic_port).await {
      Ok(port) => i32::from(port),
      Err(e) => {
        tracing::error!("[PROXY] Cannot start proxy server: {}", e);
        -1
      }
    }
  }

  /// Stop accepting connections and wait for the accept loop to exit.
  ///
  /// Connections already being served drain on their own. Returns `false`
  /// when the server was not running.
  pub async fn stop(&self) -> bool {
    let running = match self.running.lock().await.take() {
      Some(r) => r,
      None => return false,
    };
    let _ = running.shutdown.send(true);
    if let Err(e) = running.handle.await {
      tracing::warn!("[PROXY] Accept loop ended abnormally: {}", e);
    }
    tracing::info!("[PROXY] Stopped listening on {}", running.local_addr);
    true
  }

  /// Stop, then wait up to `grace` for running workers to finish.
  ///
  /// Returns `false` when the server was not running or workers were still
  /// busy when the grace period ran out.
  pub async fn stop_and_wait(&self, grace: Duration) -> bool {
    if !self.stop().await {
      return false;
    }
    let drained = tokio::time::timeout(grace, async {
      while self.is_any_worker_running() {
        tokio::time::sleep(Duration::from_millis(10)).await;
      }
    })
    .await;
    drained.is_ok()
  }

  /// Whether the accept loop is running
  pub async fn is_running(&self) -> bool {
    self.running.lock().await.is_some()
  }

  /// Address the server is listening on
  pub async fn local_addr(&self) -> Option<SocketAddr> {
    self.running.lock().await.as_ref().map(|r| r.local_addr)
  }

  /// Whether any connection is still being served
  pub fn is_any_worker_running(&self) -> bool {
    self.state.active_workers.load(Ordering::SeqCst) > 0
  }

  /// Whether `uri` matches one of the exclusion patterns
  pub fn exclude_url(&self, uri: &str) -> bool {
    self.state.exclude_url(uri)
  }

  /// Replace the exclusion patterns.
  ///
  /// Patterns are case-insensitive and must match the whole URI. When one
  /// fails to compile the current list is kept.
  pub fn set_exclude_list(&self, patterns: &[String]) -> Result<()> {
    let compiled = patterns
      .iter()
      .map(|p| {
        RegexBuilder::new(&format!("^(?:{})$", p))
          .case_insensitive(true)
          .build()
      })
      .collect::<std::result::Result<Vec<_>, _>>()?;
    self.state.excludes.store(Arc::new(compiled));
    Ok(())
  }

  /// The cache list consulted before requests are sent
  pub fn cache_list(&self) -> Arc<Vec<CacheEntry>> {
    self.state.cache_list()
  }

  /// Replace the cache list
  pub fn set_cache_list(&self, entries: Vec<CacheEntry>) {
    self.state.cache_list.store(Arc::new(entries));
  }

  /// Whether exchanges are processed one at a time across connections
  pub fn is_serialize(&self) -> bool {
    self.state.serialize.load(Ordering::SeqCst)
  }

  /// Set the serialize flag. Applies to connections accepted afterwards.
  pub fn set_serialize(&self, serialize: bool) {
    self.state.serialize.store(serialize, Ordering::SeqCst);
  }

  /// The listener registry
  pub fn listeners(&self) -> &ListenerRegistry {
    &self.state.registry
  }

  /// Add a request/response listener
  pub fn add_proxy_listener(&self, listener: Arc<dyn ProxyListener>) {
    self.state.registry.proxy_listeners().add(listener);
  }

  /// Remove a request/response listener
  pub fn remove_proxy_listener(&self, listener: &Arc<dyn ProxyListener>) -> bool {
    self.state.registry.proxy_listeners().remove(listener)
  }

  /// Add an override listener
  pub fn add_override_listener(&self, listener: Arc<dyn OverrideListener>) {
    self.state.registry.override_listeners().add(listener);
  }

  /// Remove an override listener
  pub fn remove_override_listener(&self, listener: &Arc<dyn OverrideListener>) -> bool {
    self.state.registry.override_listeners().remove(listener)
  }

  /// Add a CONNECT listener
  pub fn add_connect_listener(&self, listener: Arc<dyn ConnectRequestListener>) {
    self.state.registry.connect_listeners().add(listener);
  }

  /// Remove a CONNECT listener
  pub fn remove_connect_listener(&self, listener: &Arc<dyn ConnectRequestListener>) -> bool {
    self.state.registry.connect_listeners().remove(listener)
  }

  /// Add a persistent connection listener
  pub fn add_persistent_connection_listener(&self, listener: Arc<dyn PersistentConnectionListener>) {
    self.state.registry.persistent_listeners().add(listener);
  }

  /// Remove a persistent connection listener
  pub fn remove_persistent_connection_listener(
    &self,
    listener: &Arc<dyn PersistentConnectionListener>,
  ) -> bool {
    self.state.registry.persistent_listeners().remove(listener)
  }
}

async fn resolve_bind_address(bind_address: &str) -> Result<IpAddr> {
  let host = bind_address.trim();
  if host.is_empty() {
    return Ok(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
  }
  let literal = host.trim_start_matches('[').trim_end_matches(']');
  if let Ok(ip) = literal.parse::<IpAddr>() {
    return Ok(ip);
  }
  tokio::net::lookup_host((host, 0))
    .await
    .ok()
    .and_then(|mut addrs| addrs.next())
    .map(|addr| addr.ip())
    .ok_or_else(|| Error::UnknownHost(host.to_string()))
}

fn bind_with_fallback(ip: IpAddr, port: u16, dynamic_port: bool, backlog: i32) -> Result<TcpListener> {
  let mut port = port;
  loop {
    let addr = SocketAddr::new(ip, port);
    match bind_listener(addr, backlog) {
      Ok(listener) => return Ok(listener),
      Err(e) => match e.kind() {
        ErrorKind::AddrNotAvailable => return Err(Error::AddressUnassignable(ip.to_string())),
        ErrorKind::AddrInUse | ErrorKind::PermissionDenied => {
          if dynamic_port && port != 0 && port < u16::MAX {
            tracing::debug!("[PROXY] Port {} unavailable, trying {}", port, port + 1);
            port += 1;
            continue;
          }
          return Err(Error::PortInUse(addr.to_string()));
        }
        _ => return Err(Error::IO(e)),
      },
    }
  }
}

fn bind_listener(addr: SocketAddr, backlog: i32) -> std::io::Result<TcpListener> {
  let socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
  #[cfg(not(windows))]
  socket.set_reuse_address(true)?;
  socket.set_nonblocking(true)?;
  socket.bind(&addr.into())?;
  socket.listen(backlog)?;
  TcpListener::from_std(socket.into())
}

async fn accept_loop(
  listener: TcpListener,
  state: Arc<ProxyState>,
  mut shutdown: watch::Receiver<bool>,
) {
  let bound = match listener.local_addr() {
    Ok(addr) => addr,
    Err(e) => {
      tracing::error!("[PROXY] Listening socket has no address: {}", e);
      return;
    }
  };
  loop {
    tokio::select! {
      _ = shutdown.changed() => break,
      accepted = listener.accept() => match accepted {
        Ok((stream, peer_addr)) => {
          tracing::debug!("[PROXY] Accepted connection from {}", peer_addr);
          let guard = WorkerGuard::new(state.clone());
          let worker = ConnectionWorker::new(state.clone(), state.worker_lock(), bound);
          tokio::spawn(async move {
            worker.run(stream).await;
            drop(guard);
          });
        }
        Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {}
        Err(e) => {
          tracing::error!("[PROXY] Failed to accept connection: {}", e);
          tokio::time::sleep(Duration::from_millis(100)).await;
        }
      }
    }
  }
}
