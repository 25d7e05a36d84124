//! Serving requests from previously captured exchanges
use http::StatusCode;

use crate::errors::Result;
use crate::exchange::HttpExchange;
use crate::Response;

/// A captured exchange together with its history record id.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  /// The captured exchange
  pub exchange: HttpExchange,
  /// Id of the history record the exchange was stored under
  pub history_id: i64,
}

impl CacheEntry {
  /// Create a cache entry
  pub fn new(exchange: HttpExchange, history_id: i64) -> Self {
    Self {
      exchange,
      history_id,
    }
  }
}

/// Persistence collaborator for exchange history.
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
  /// Store an exchange, returning its record id
  async fn record_exchange(&self, exchange: &HttpExchange) -> Result<i64>;
  /// Find a response recorded near `reference` for the same method, URI and
  /// body as `request`, excluding `304 Not Modified` responses.
  async fn lookup_cached_response(
    &self,
    reference: i64,
    request: &HttpExchange,
  ) -> Result<Option<HttpExchange>>;
}

/// Answers a request from the cache list or the history store.
#[derive(Debug, Default, Clone, Copy)]
pub struct CacheShortCircuit;

impl CacheShortCircuit {
  /// Tries to answer `exchange` without contacting the target host.
  ///
  /// Only the first cache entry is considered. When it was captured for an
  /// identical request its response is used verbatim; otherwise the history
  /// store is asked for a nearby record. Returns `true` when
  /// `exchange.response` now holds the response to write. A failing lookup
  /// also counts as handled and yields a `502 Bad Gateway` describing the
  /// failure.
  pub async fn process(
    &self,
    entries: &[CacheEntry],
    exchange: &mut HttpExchange,
    store: Option<&dyn HistoryStore>,
  ) -> bool {
    let entry = match entries.first() {
      Some(entry) => entry,
      None => return false,
    };
    if entry.exchange.matches_request(exchange) {
      if let Some(response) = entry.exchange.response() {
        tracing::debug!("[CACHE] Hit for {}", exchange.request().uri());
        serve(exchange, response.clone());
        return true;
      }
    }
    let store = match store {
      Some(store) => store,
      None => return false,
    };
    match store.lookup_cached_response(entry.history_id, exchange).await {
      Ok(Some(found)) => match found.response {
        Some(response) if response.status_code() != StatusCode::NOT_MODIFIED => {
          tracing::debug!(
            "[CACHE] History hit for {} near record {}",
            exchange.request().uri(),
            entry.history_id
          );
          serve(exchange, response);
          true
        }
        _ => false,
      },
      Ok(None) => false,
      Err(e) => {
        tracing::warn!(
          "[CACHE] Lookup near record {} failed: {}",
          entry.history_id,
          e
        );
        exchange.response = Some(Response::plain_text(
          StatusCode::BAD_GATEWAY,
          format!(
            "Cached response lookup failed for {}\r\n\r\n{}",
            exchange.request().uri(),
            e.describe()
          ),
        ));
        exchange.response_from_target_host = false;
        true
      }
    }
  }
}

fn serve(exchange: &mut HttpExchange, response: Response) {
  exchange.response = Some(response);
  exchange.response_from_target_host = false;
  exchange.time_elapsed_millis = 0;
}
