//! Extension points notified while an exchange flows through the proxy
use crate::errors::Result;
use crate::exchange::HttpExchange;
use crate::socket::Socket;

/// Integer priority controlling the order listeners are notified in.
///
/// Lower values fire first. Listeners with equal order fire in the order they
/// were added.
pub trait Arrangeable {
  /// The priority of this listener
  fn arrangeable_order(&self) -> i32;
}

/// Inspects and rewrites requests before they are sent, and responses
/// before they are written back to the client.
///
/// Returning `Ok(false)` vetoes the phase: the request is not forwarded, or
/// the response is not written, and later listeners are not notified.
#[async_trait::async_trait]
pub trait ProxyListener: Arrangeable + Send + Sync {
  /// Called before the request is sent upstream
  async fn on_http_request_send(&self, exchange: &mut HttpExchange) -> Result<bool> {
    let _ = exchange;
    Ok(true)
  }
  /// Called before the response is written to the client
  async fn on_http_response_receive(&self, exchange: &mut HttpExchange) -> Result<bool> {
    let _ = exchange;
    Ok(true)
  }
}

/// Supplies a response in place of the network, or a final response in
/// place of the received one.
///
/// The first listener returning `Ok(true)` for a phase wins and no other
/// listener, override or regular, is consulted for that phase.
#[async_trait::async_trait]
pub trait OverrideListener: Arrangeable + Send + Sync {
  /// Return `true` once `exchange.response` holds the response to use
  async fn on_request_override(&self, exchange: &mut HttpExchange) -> Result<bool> {
    let _ = exchange;
    Ok(false)
  }
  /// Return `true` once `exchange.response` holds the final response
  async fn on_response_override(&self, exchange: &mut HttpExchange) -> Result<bool> {
    let _ = exchange;
    Ok(false)
  }
}

/// Read-only notification of a CONNECT request.
#[async_trait::async_trait]
pub trait ConnectRequestListener: Arrangeable + Send + Sync {
  /// Called after the tunnel was acknowledged, before the TLS handshake
  async fn on_connect_request(&self, exchange: &HttpExchange) -> Result<()>;
}

/// Offered the client socket once an exchange has been written.
///
/// A listener taking over the connection moves the socket out of `socket`
/// with [`Option::take`] and returns `Ok(true)`. The proxy then stops serving
/// the connection and never closes it.
#[async_trait::async_trait]
pub trait PersistentConnectionListener: Arrangeable + Send + Sync {
  /// Called once per exchange
  async fn on_handshake_response(
    &self,
    exchange: &mut HttpExchange,
    socket: &mut Option<Socket>,
  ) -> Result<bool>;
}

/// Logs every request, response and CONNECT passing through the proxy.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingListener;

impl Arrangeable for LoggingListener {
  fn arrangeable_order(&self) -> i32 {
    i32::MAX
  }
}

#[async_trait::async_trait]
impl ProxyListener for LoggingListener {
  async fn on_http_request_send(&self, exchange: &mut HttpExchange) -> Result<bool> {
    let request = exchange.request();
    tracing::info!("[PROXY] Request: {} {}", request.method(), request.uri());
    for (name, value) in request.headers() {
      tracing::debug!("  {}: {:?}", name, value);
    }
    Ok(true)
  }

  async fn on_http_response_receive(&self, exchange: &mut HttpExchange) -> Result<bool> {
    if let Some(response) = exchange.response() {
      tracing::info!(
        "[PROXY] Response: {} for {} ({} ms)",
        response.status_code(),
        exchange.request().uri(),
        exchange.time_elapsed_millis
      );
      for (name, value) in response.headers() {
        tracing::debug!("  {}: {:?}", name, value);
      }
    }
    Ok(true)
  }
}

#[async_trait::async_trait]
impl ConnectRequestListener for LoggingListener {
  async fn on_connect_request(&self, exchange: &HttpExchange) -> Result<()> {
    tracing::info!("[TUNNEL] CONNECT {}", exchange.request().uri());
    Ok(())
  }
}
