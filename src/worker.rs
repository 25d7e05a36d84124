//! Per-connection protocol handling
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use http::uri::Authority;
use http::{Method, StatusCode};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::cache::CacheShortCircuit;
use crate::encoding::{decode_body, remove_unsupported_encodings};
use crate::errors::{Error, Result};
use crate::exchange::HttpExchange;
use crate::internal::{is_internal_domain, is_local_address, is_recursive};
use crate::server::ProxyState;
use crate::socket::Socket;
use crate::{Request, Response};

/// Acknowledgement written for a CONNECT request.
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

const MAX_HEADER_SIZE: usize = 64 * 1024;

/// What happens to the connection after an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
  Continue,
  Close,
  TakenOver,
}

/// Serves one client connection until it is closed or taken over.
pub(crate) struct ConnectionWorker {
  state: Arc<ProxyState>,
  lock: Arc<Mutex<()>>,
  bound: SocketAddr,
}

impl ConnectionWorker {
  pub(crate) fn new(state: Arc<ProxyState>, lock: Arc<Mutex<()>>, bound: SocketAddr) -> Self {
    Self { state, lock, bound }
  }

  pub(crate) async fn run(self, stream: TcpStream) {
    let socket = match Socket::from_tcp(stream) {
      Ok(socket) => socket,
      Err(e) => {
        tracing::debug!("[PROXY] Connection lost before it was served: {}", e);
        return;
      }
    };
    let peer_addr = socket.peer_addr();
    if let Err(e) = self.serve(socket).await {
      match &e {
        Error::IO(io) if is_disconnect(io.kind()) => {
          tracing::debug!("[PROXY] Connection from {} ended: {}", peer_addr, e);
        }
        _ => tracing::warn!("[PROXY] Connection from {} failed: {}", peer_addr, e),
      }
    }
  }

  async fn serve(&self, mut socket: Socket) -> Result<()> {
    let config = &self.state.config;
    if let Err(e) = socket.set_nodelay(true) {
      tracing::debug!("[PROXY] Cannot disable Nagle's algorithm: {}", e);
    }
    socket.set_read_timeout(config.initial_read_timeout);
    let head = match socket.read_header(MAX_HEADER_SIZE).await? {
      Some(head) => head,
      None => return Ok(()),
    };
    let mut request = Request::parse(&head, None)?;
    let mut tunnel: Option<Authority> = None;
    if request.method() == Method::CONNECT {
      let (tunneled, authority) = match self.open_tunnel(socket, request).await? {
        Some(opened) => opened,
        None => return Ok(()),
      };
      socket = tunneled;
      let head = match socket.read_header(MAX_HEADER_SIZE).await? {
        Some(head) => head,
        None => return Ok(()),
      };
      request = Request::parse(&head, Some(&authority))?;
      if request.method() == Method::CONNECT {
        return Err(Error::invalid_request("CONNECT inside an intercepted tunnel"));
      }
      tunnel = Some(authority);
    }
    socket.set_read_timeout(Some(config.keep_alive_read_timeout));

    let mut socket = Some(socket);
    let mut next = Some(request);
    loop {
      let request = match next.take() {
        Some(request) => request,
        None => {
          let sock = match socket.as_mut() {
            Some(sock) => sock,
            None => return Ok(()),
          };
          let head = match sock.read_header(MAX_HEADER_SIZE).await {
            Ok(Some(head)) => head,
            Ok(None) => break,
            Err(e) if e.kind() == ErrorKind::TimedOut => {
              tracing::debug!("[PROXY] Read timeout on {}, closing", sock.peer_addr());
              break;
            }
            Err(e) => return Err(e.into()),
          };
          Request::parse(&head, tunnel.as_ref())?
        }
      };
      match self.process_exchange(request, &mut socket).await? {
        Flow::Continue => {}
        Flow::Close => break,
        Flow::TakenOver => return Ok(()),
      }
    }
    if let Some(mut sock) = socket.take() {
      let _ = sock.shutdown().await;
    }
    Ok(())
  }

  /// Acknowledges a CONNECT and terminates TLS on the client socket.
  ///
  /// Returns `None` when the tunnel could not be opened and the connection
  /// was answered with an error.
  async fn open_tunnel(
    &self,
    mut socket: Socket,
    request: Request,
  ) -> Result<Option<(Socket, Authority)>> {
    socket.write_all(CONNECT_ESTABLISHED).await?;
    socket.flush().await?;
    let connect = HttpExchange::new(request);
    self.state.registry.notify_connect(&connect).await;
    let authority = connect
      .request()
      .uri()
      .authority()
      .cloned()
      .ok_or_else(|| Error::invalid_request("CONNECT without a target authority"))?;
    let tunnel = &self.state.tunnel;
    let config = match tunnel.server_config(authority.host()).await {
      Ok(config) => config,
      Err(Error::MissingRootCertificate) => {
        tracing::warn!(
          "[TUNNEL] Cannot intercept {}: no root certificate configured",
          authority
        );
        let response = Response::plain_text(
          StatusCode::BAD_GATEWAY,
          format!(
            "The proxy has no root certificate to intercept HTTPS traffic to {}.\r\n\
             Configure a certificate source and trust its root certificate.",
            authority
          ),
        );
        socket.write_all(&response.to_raw()).await?;
        socket.flush().await?;
        let _ = socket.shutdown().await;
        return Ok(None);
      }
      Err(e) => return Err(e),
    };
    let socket = tunnel.accept(socket, config).await?;
    tracing::debug!("[TUNNEL] Intercepting {}", authority);
    Ok(Some((socket, authority)))
  }

  async fn process_exchange(
    &self,
    request: Request,
    socket: &mut Option<Socket>,
  ) -> Result<Flow> {
    let state = &self.state;
    let config = &state.config;
    let mut exchange = HttpExchange::new(request);
    let sock = match socket.as_mut() {
      Some(sock) => sock,
      None => return Ok(Flow::TakenOver),
    };

    if let Some(len) = exchange.request().content_length() {
      if len > config.max_body_size {
        tracing::warn!(
          "[PROXY] Request body of {} bytes for {} exceeds the {} byte limit",
          len,
          exchange.request().uri(),
          config.max_body_size
        );
        exchange.response = Some(Response::plain_text(
          StatusCode::PAYLOAD_TOO_LARGE,
          format!(
            "Request body of {} bytes exceeds the limit of {} bytes",
            len, config.max_body_size
          ),
        ));
        write_response(&exchange, sock).await;
        return Ok(Flow::Close);
      }
      if len > 0 {
        let body = sock.read_body(len).await?;
        exchange.request_mut().set_body(body);
      }
    }

    if self.is_internal_request(exchange.request()).await {
      self.serve_internal(&mut exchange, sock).await?;
      return Ok(self.finish(&mut exchange, socket, false).await);
    }

    if config.remove_unsupported_encodings {
      remove_unsupported_encodings(exchange.request_mut().headers_mut());
    }

    if config.cache_processing_enabled {
      let entries = state.cache_list();
      let store = state.store.as_deref();
      if CacheShortCircuit.process(&entries, &mut exchange, store).await {
        if !write_response(&exchange, sock).await {
          return Ok(Flow::Close);
        }
        return Ok(self.finish(&mut exchange, socket, false).await);
      }
    }

    let uri = exchange.request().uri().to_string();
    exchange.excluded = state.exclude_url(&uri);

    let lock = self.lock.clone();
    let guard = lock.lock().await;
    let forwarded = self.forward(&mut exchange).await;
    let written = forwarded && write_response(&exchange, sock).await;
    drop(guard);
    if !forwarded {
      tracing::debug!("[PROXY] Exchange for {} dropped by a listener", uri);
      return Ok(Flow::Close);
    }
    if !written {
      return Ok(Flow::Close);
    }
    Ok(self.finish(&mut exchange, socket, true).await)
  }

  /// Runs the listeners and the outbound sender. Returns `false` when a
  /// listener vetoed the request or the response.
  async fn forward(&self, exchange: &mut HttpExchange) -> bool {
    let state = &self.state;
    let registry = &state.registry;
    let excluded = exchange.excluded;
    if !excluded {
      if registry.notify_override_request(exchange).await {
        return true;
      }
      if !registry.notify_request(exchange).await {
        return false;
      }
    }
    match state.sender.send_and_receive(exchange, !excluded).await {
      Ok(()) => {
        if exchange.response.is_none() {
          exchange.response = Some(bad_gateway(
            exchange.request(),
            &Error::other("the sender returned no response"),
          ));
        } else if state.config.always_decode_gzip {
          if let Some(response) = exchange.response.as_mut() {
            if let Err(e) = decode_body(response) {
              tracing::debug!("[PROXY] Cannot decode response body: {}", e);
            }
          }
        }
      }
      Err(e) if e.is_timeout() => {
        tracing::debug!("[PROXY] Timeout sending {}: {}", exchange.request().uri(), e);
        exchange.response = Some(gateway_timeout(
          exchange.request(),
          state.config.upstream_timeout,
        ));
        exchange.response_from_target_host = false;
      }
      Err(e) => {
        tracing::debug!("[PROXY] Failed to send {}: {}", exchange.request().uri(), e);
        exchange.response = Some(bad_gateway(exchange.request(), &e));
        exchange.response_from_target_host = false;
      }
    }
    if excluded {
      return true;
    }
    if registry.notify_override_response(exchange).await {
      return true;
    }
    registry.notify_response(exchange).await
  }

  async fn serve_internal(&self, exchange: &mut HttpExchange, sock: &mut Socket) -> Result<()> {
    let handler = match &self.state.internal {
      Some(handler) => handler,
      None => {
        exchange.response = Some(Response::plain_text(
          StatusCode::NOT_FOUND,
          format!("No handler for {}", exchange.request().uri()),
        ));
        write_response(exchange, sock).await;
        return Ok(());
      }
    };
    match handler.handle(exchange, sock).await {
      Ok(true) => {
        write_response(exchange, sock).await;
      }
      Ok(false) => {}
      Err(e) => {
        tracing::warn!(
          "[PROXY] Internal request {} failed: {}",
          exchange.request().uri(),
          e
        );
        exchange.response = Some(Response::plain_text(
          StatusCode::INTERNAL_SERVER_ERROR,
          e.describe(),
        ));
        write_response(exchange, sock).await;
      }
    }
    Ok(())
  }

  /// Records the exchange, offers the socket to persistent connection
  /// listeners and decides whether the connection stays open.
  async fn finish(
    &self,
    exchange: &mut HttpExchange,
    socket: &mut Option<Socket>,
    record: bool,
  ) -> Flow {
    if record && exchange.response.is_some() {
      if let Some(store) = &self.state.store {
        match store.record_exchange(exchange).await {
          Ok(id) => exchange.history_id = Some(id),
          Err(e) => tracing::warn!(
            "[PROXY] Cannot record {}: {}",
            exchange.request().uri(),
            e
          ),
        }
      }
    }
    if self.state.registry.notify_persistent(exchange, socket).await {
      return Flow::TakenOver;
    }
    if exchange.is_connection_close() {
      Flow::Close
    } else {
      Flow::Continue
    }
  }

  /// Whether the request targets this proxy's own listening address.
  async fn is_internal_request(&self, request: &Request) -> bool {
    let (host, port) = match request.host_port() {
      Some(host_port) => host_port,
      None => return false,
    };
    if port != self.bound.port() {
      return false;
    }
    if is_internal_domain(&host) {
      return true;
    }
    let targets: Vec<SocketAddr> = match host.parse::<IpAddr>() {
      Ok(ip) => vec![SocketAddr::new(ip, port)],
      Err(_) => match tokio::net::lookup_host((host.as_str(), port)).await {
        Ok(addrs) => addrs.collect(),
        Err(_) => return false,
      },
    };
    for target in targets {
      let local = self.bound.ip().is_unspecified() && is_local_address(&target.ip()).await;
      if is_recursive(self.bound, target, |_| local) {
        return true;
      }
    }
    false
  }
}

/// Writes the exchange's response. A failure is logged and reported as
/// `false`.
async fn write_response(exchange: &HttpExchange, sock: &mut Socket) -> bool {
  let response = match exchange.response() {
    Some(response) => response,
    None => return true,
  };
  let raw = response.to_raw();
  let written = match sock.write_all(&raw).await {
    Ok(()) => sock.flush().await,
    Err(e) => Err(e),
  };
  if let Err(e) = written {
    tracing::debug!(
      "[PROXY] Failed to write response for {} to {}: {}",
      exchange.request().uri(),
      sock.peer_addr(),
      e
    );
    return false;
  }
  true
}

fn gateway_timeout(request: &Request, timeout: Option<std::time::Duration>) -> Response {
  let limit = match timeout {
    Some(t) => format!("{} ms", t.as_millis()),
    None => "none".to_string(),
  };
  Response::plain_text(
    StatusCode::GATEWAY_TIMEOUT,
    format!(
      "Timed out while reading a response from {}\r\nConfigured upstream timeout: {}",
      request.uri(),
      limit
    ),
  )
}

fn bad_gateway(request: &Request, error: &Error) -> Response {
  Response::plain_text(
    StatusCode::BAD_GATEWAY,
    format!(
      "Failed to read {} from the target host\r\n\r\n{}",
      request.uri(),
      error.describe()
    ),
  )
}

fn is_disconnect(kind: ErrorKind) -> bool {
  matches!(
    kind,
    ErrorKind::TimedOut
      | ErrorKind::UnexpectedEof
      | ErrorKind::ConnectionReset
      | ErrorKind::ConnectionAborted
      | ErrorKind::BrokenPipe
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  fn request(raw: &[u8]) -> Request {
    Request::parse(raw, None).unwrap()
  }

  #[test]
  fn connect_ack_is_minimal() {
    assert_eq!(
      CONNECT_ESTABLISHED,
      b"HTTP/1.1 200 Connection established\r\n\r\n"
    );
  }

  #[test]
  fn bad_gateway_names_the_error_kind() {
    let e = Error::IO(std::io::Error::new(ErrorKind::ConnectionRefused, "refused"));
    let response = bad_gateway(&request(b"GET http://a/x HTTP/1.1\r\n\r\n"), &e);
    assert_eq!(response.status_code(), StatusCode::BAD_GATEWAY);
    let body = String::from_utf8_lossy(response.body().unwrap()).to_string();
    assert!(body.contains("http://a/x"));
    assert!(body.contains("ConnectionRefused"));
  }

  #[test]
  fn gateway_timeout_cites_the_limit() {
    let response = gateway_timeout(
      &request(b"GET http://a/slow HTTP/1.1\r\n\r\n"),
      Some(std::time::Duration::from_secs(5)),
    );
    assert_eq!(response.status_code(), StatusCode::GATEWAY_TIMEOUT);
    let body = String::from_utf8_lossy(response.body().unwrap()).to_string();
    assert!(body.contains("http://a/slow"));
    assert!(body.contains("5000 ms"));
  }
}
