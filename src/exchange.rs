//! One request/response pair flowing through the proxy
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::{Request, Response};

/// A request and, once answered, its response.
///
/// Listeners receive the exchange by mutable reference and may rewrite
/// either side in place.
#[derive(Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HttpExchange {
  /// The request as read from the client
  pub request: Request,
  /// The response, once one was supplied
  pub response: Option<Response>,
  /// Unix time in milliseconds when the request was sent upstream
  pub time_sent_millis: u64,
  /// Round trip time in milliseconds
  pub time_elapsed_millis: u64,
  /// Free text note
  pub note: String,
  /// The response came from the target host, not from a cache or an override
  pub response_from_target_host: bool,
  /// The request matched an exclusion pattern
  pub excluded: bool,
  /// Id assigned by the history store once recorded
  pub history_id: Option<i64>,
}

impl HttpExchange {
  /// Create an exchange for a request that has not been answered yet
  pub fn new(request: Request) -> Self {
    Self {
      request,
      ..Default::default()
    }
  }

  /// Get the request
  pub fn request(&self) -> &Request {
    &self.request
  }

  /// Get a mutable reference to the request
  pub fn request_mut(&mut self) -> &mut Request {
    &mut self.request
  }

  /// Get the response, if any
  pub fn response(&self) -> Option<&Response> {
    self.response.as_ref()
  }

  /// Get a mutable reference to the response, if any
  pub fn response_mut(&mut self) -> Option<&mut Response> {
    self.response.as_mut()
  }

  /// Attach a response
  pub fn set_response(&mut self, response: Response) {
    self.response = Some(response);
  }

  /// Same method, URI and body as the other exchange's request.
  pub fn matches_request(&self, other: &HttpExchange) -> bool {
    self.request.matches(&other.request)
  }

  /// Whether the client connection must be closed after this exchange.
  ///
  /// True when there is no response, when either side asked for the
  /// connection to be closed, or when the response carries a body without
  /// declaring its length.
  pub fn is_connection_close(&self) -> bool {
    let response = match &self.response {
      None => return true,
      Some(r) => r,
    };
    if self.request.is_connection_close() || response.is_connection_close() {
      return true;
    }
    let has_body = response.body().map(|b| !b.is_empty()).unwrap_or(false);
    response.content_length().is_none() && has_body
  }
}

impl fmt::Debug for HttpExchange {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("HttpExchange")
      .field("request", &self.request)
      .field("response", &self.response)
      .field("time_sent_millis", &self.time_sent_millis)
      .field("time_elapsed_millis", &self.time_elapsed_millis)
      .field("note", &self.note)
      .field("response_from_target_host", &self.response_from_target_host)
      .field("excluded", &self.excluded)
      .field("history_id", &self.history_id)
      .finish()
  }
}

pub(crate) fn now_millis() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_millis() as u64)
    .unwrap_or(0)
}
