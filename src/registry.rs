//! Ordered, copy-on-write listener collections
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::exchange::HttpExchange;
use crate::listener::{
  Arrangeable, ConnectRequestListener, OverrideListener, PersistentConnectionListener,
  ProxyListener,
};
use crate::socket::Socket;

/// A list of listeners kept sorted by [`Arrangeable::arrangeable_order`].
///
/// Readers take an immutable snapshot; writers swap in a new vector, so a
/// notification pass never observes a concurrent add or remove.
pub struct ListenerList<T: ?Sized> {
  inner: ArcSwap<Vec<Arc<T>>>,
}

impl<T: ?Sized + Arrangeable> ListenerList<T> {
  /// Create an empty list
  pub fn new() -> Self {
    Self {
      inner: ArcSwap::from_pointee(Vec::new()),
    }
  }

  /// Insert a listener, keeping ascending order. Ties keep insertion order.
  pub fn add(&self, listener: Arc<T>) {
    self.inner.rcu(|current| {
      let mut next: Vec<Arc<T>> = current.iter().cloned().collect();
      next.push(listener.clone());
      next.sort_by_key(|l| l.arrangeable_order());
      next
    });
  }

  /// Remove a listener by identity. Returns whether it was present.
  pub fn remove(&self, listener: &Arc<T>) -> bool {
    let target = Arc::as_ptr(listener).cast::<()>();
    let mut found = false;
    self.inner.rcu(|current| {
      found = false;
      let mut next = Vec::with_capacity(current.len());
      for l in current.iter() {
        if Arc::as_ptr(l).cast::<()>() == target {
          found = true;
        } else {
          next.push(l.clone());
        }
      }
      next
    });
    found
  }

  /// The ordered listeners at this instant
  pub fn snapshot(&self) -> Arc<Vec<Arc<T>>> {
    self.inner.load_full()
  }

  /// Number of registered listeners
  pub fn len(&self) -> usize {
    self.inner.load().len()
  }

  /// Whether no listener is registered
  pub fn is_empty(&self) -> bool {
    self.inner.load().is_empty()
  }
}

impl<T: ?Sized + Arrangeable> Default for ListenerList<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T: ?Sized> fmt::Debug for ListenerList<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ListenerList")
      .field("len", &self.inner.load().len())
      .finish()
  }
}

/// The four listener kinds the proxy notifies, with one dispatcher per phase.
///
/// A listener returning an error is logged and skipped; notification carries
/// on with the next one.
#[derive(Debug, Default)]
pub struct ListenerRegistry {
  proxy: ListenerList<dyn ProxyListener>,
  overrides: ListenerList<dyn OverrideListener>,
  connect: ListenerList<dyn ConnectRequestListener>,
  persistent: ListenerList<dyn PersistentConnectionListener>,
}

impl ListenerRegistry {
  /// Create a registry with no listeners
  pub fn new() -> Self {
    Self::default()
  }
  /// Request/response listeners
  pub fn proxy_listeners(&self) -> &ListenerList<dyn ProxyListener> {
    &self.proxy
  }
  /// Override listeners
  pub fn override_listeners(&self) -> &ListenerList<dyn OverrideListener> {
    &self.overrides
  }
  /// CONNECT listeners
  pub fn connect_listeners(&self) -> &ListenerList<dyn ConnectRequestListener> {
    &self.connect
  }
  /// Persistent connection listeners
  pub fn persistent_listeners(&self) -> &ListenerList<dyn PersistentConnectionListener> {
    &self.persistent
  }

  /// Request phase. `false` means a listener vetoed the request.
  pub async fn notify_request(&self, exchange: &mut HttpExchange) -> bool {
    for listener in self.proxy.snapshot().iter() {
      match listener.on_http_request_send(exchange).await {
        Ok(true) => {}
        Ok(false) => return false,
        Err(e) => {
          tracing::warn!("[PROXY] Request listener failed: {}", e);
        }
      }
    }
    true
  }

  /// Response phase. `false` means a listener vetoed the response.
  pub async fn notify_response(&self, exchange: &mut HttpExchange) -> bool {
    for listener in self.proxy.snapshot().iter() {
      match listener.on_http_response_receive(exchange).await {
        Ok(true) => {}
        Ok(false) => return false,
        Err(e) => {
          tracing::warn!("[PROXY] Response listener failed: {}", e);
        }
      }
    }
    true
  }

  /// `true` once an override listener supplied the response.
  pub async fn notify_override_request(&self, exchange: &mut HttpExchange) -> bool {
    for listener in self.overrides.snapshot().iter() {
      match listener.on_request_override(exchange).await {
        Ok(true) => return true,
        Ok(false) => {}
        Err(e) => {
          tracing::warn!("[PROXY] Request override listener failed: {}", e);
        }
      }
    }
    false
  }

  /// `true` once an override listener supplied the final response.
  pub async fn notify_override_response(&self, exchange: &mut HttpExchange) -> bool {
    for listener in self.overrides.snapshot().iter() {
      match listener.on_response_override(exchange).await {
        Ok(true) => return true,
        Ok(false) => {}
        Err(e) => {
          tracing::warn!("[PROXY] Response override listener failed: {}", e);
        }
      }
    }
    false
  }

  /// Tell every CONNECT listener about a tunnel request.
  pub async fn notify_connect(&self, exchange: &HttpExchange) {
    for listener in self.connect.snapshot().iter() {
      if let Err(e) = listener.on_connect_request(exchange).await {
        tracing::warn!("[TUNNEL] Connect listener failed: {}", e);
      }
    }
  }

  /// `true` once a listener took over the connection.
  pub async fn notify_persistent(
    &self,
    exchange: &mut HttpExchange,
    socket: &mut Option<Socket>,
  ) -> bool {
    for listener in self.persistent.snapshot().iter() {
      match listener.on_handshake_response(exchange, socket).await {
        Ok(true) => return true,
        Ok(false) => {}
        Err(e) => {
          tracing::warn!("[PROXY] Persistent connection listener failed: {}", e);
        }
      }
      if socket.is_none() {
        return true;
      }
    }
    false
  }
}
