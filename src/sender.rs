//! Outbound sender contract
use crate::errors::Result;
use crate::exchange::HttpExchange;
use crate::listener::Arrangeable;

/// Sends a request to its target host and attaches the response.
#[async_trait::async_trait]
pub trait HttpSender: Send + Sync {
  /// Populate `exchange.response` from the target host.
  ///
  /// With `notify` unset the sender must not emit any listener callbacks,
  /// which keeps excluded requests invisible.
  async fn send_and_receive(&self, exchange: &mut HttpExchange, notify: bool) -> Result<()>;
}

/// Observes traffic at the transport layer of a sender.
#[async_trait::async_trait]
pub trait SenderListener: Arrangeable + Send + Sync {
  /// Called right before the request goes on the wire
  async fn on_http_request_send(&self, exchange: &mut HttpExchange);
  /// Called once the response has been read
  async fn on_http_response_receive(&self, exchange: &mut HttpExchange);
}
