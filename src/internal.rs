//! Requests addressed to the proxy itself
use std::net::{IpAddr, SocketAddr};

use tokio::net::UdpSocket;

use crate::errors::Result;
use crate::exchange::HttpExchange;
use crate::socket::Socket;

/// Reserved hostname for the proxy's own API
pub const INTERNAL_DOMAIN: &str = "slinger";

/// Serves requests that target the proxy itself.
#[async_trait::async_trait]
pub trait InternalRequestHandler: Send + Sync {
  /// Handle one request.
  ///
  /// Return `true` when `exchange.response` holds a response for the proxy
  /// to write, `false` when the handler already answered on `socket`.
  async fn handle(&self, exchange: &mut HttpExchange, socket: &mut Socket) -> Result<bool>;
}

/// Whether a request for `target` would loop back into the proxy bound at
/// `bound`.
///
/// Ports must match. For a wildcard bind any loopback, private, unspecified
/// or local interface address counts, otherwise only the bound address does.
pub fn is_recursive<F>(bound: SocketAddr, target: SocketAddr, is_local_interface: F) -> bool
where
  F: Fn(&IpAddr) -> bool,
{
  if bound.port() != target.port() {
    return false;
  }
  let ip = target.ip().to_canonical();
  if bound.ip().is_unspecified() {
    ip.is_loopback() || ip.is_unspecified() || is_site_local(&ip) || is_local_interface(&ip)
  } else {
    ip == bound.ip().to_canonical()
  }
}

fn is_site_local(ip: &IpAddr) -> bool {
  match ip {
    IpAddr::V4(v4) => v4.is_private() || v4.is_link_local(),
    // fc00::/7 unique local, fec0::/10 deprecated site local, fe80::/10 link local
    IpAddr::V6(v6) => {
      let first = v6.segments()[0];
      (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfec0 || (first & 0xffc0) == 0xfe80
    }
  }
}

/// Whether `ip` is assigned to an interface of this machine.
pub async fn is_local_address(ip: &IpAddr) -> bool {
  UdpSocket::bind(SocketAddr::new(*ip, 0)).await.is_ok()
}

/// Whether the host names the reserved internal domain.
pub fn is_internal_domain(host: &str) -> bool {
  host.eq_ignore_ascii_case(INTERNAL_DOMAIN)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
  }

  #[test]
  fn port_must_match() {
    assert!(!is_recursive(
      addr("127.0.0.1:8080"),
      addr("127.0.0.1:8081"),
      |_| true
    ));
  }

  #[test]
  fn specific_bind_matches_only_itself() {
    assert!(is_recursive(
      addr("127.0.0.1:8080"),
      addr("127.0.0.1:8080"),
      |_| false
    ));
    assert!(!is_recursive(
      addr("127.0.0.1:8080"),
      addr("10.0.0.1:8080"),
      |_| true
    ));
  }

  #[test]
  fn wildcard_bind_matches_local_addresses() {
    let any = addr("0.0.0.0:8080");
    assert!(is_recursive(any, addr("127.0.0.1:8080"), |_| false));
    assert!(is_recursive(any, addr("192.168.1.20:8080"), |_| false));
    assert!(is_recursive(any, addr("[::1]:8080"), |_| false));
    assert!(!is_recursive(any, addr("93.184.216.34:8080"), |_| false));
    assert!(is_recursive(any, addr("93.184.216.34:8080"), |_| true));
  }

  #[tokio::test]
  async fn loopback_is_a_local_address() {
    assert!(is_local_address(&"127.0.0.1".parse().unwrap()).await);
    assert!(!is_local_address(&"192.0.2.1".parse().unwrap()).await);
  }

  #[test]
  fn internal_domain_is_case_insensitive() {
    assert!(is_internal_domain("SLINGER"));
    assert!(!is_internal_domain("slinger.example.com"));
  }
}
