use std::time::Duration;

/// TLS protocol versions allowed for upstream connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TlsVersion {
  /// TLS 1.2
  Tls12,
  /// TLS 1.3
  Tls13,
}

/// Proxy configuration
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ProxyConfig {
  /// Address to listen on. Empty means every interface.
  pub bind_address: String,
  /// Port to listen on
  pub port: u16,
  /// Try the following ports when `port` is busy
  pub dynamic_port: bool,
  /// Process one exchange at a time across all connections
  pub serialize: bool,
  /// Serve matching requests from the cache list
  pub cache_processing_enabled: bool,
  /// Strip codings the proxy cannot decode from `Accept-Encoding`
  pub remove_unsupported_encodings: bool,
  /// Decode gzip and deflate response bodies before listeners see them
  pub always_decode_gzip: bool,
  /// Timeout for the first request header on a new connection
  pub initial_read_timeout: Option<Duration>,
  /// Timeout for every later read on the same connection
  pub keep_alive_read_timeout: Duration,
  /// Timeout for an upstream round trip
  pub upstream_timeout: Option<Duration>,
  /// TLS versions enabled for upstream connections
  pub tls_versions: Vec<TlsVersion>,
  /// Listen backlog
  pub backlog: i32,
  /// Largest request or response body accepted, in bytes
  pub max_body_size: u64,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      bind_address: "127.0.0.1".to_string(),
      port: 8080,
      dynamic_port: false,
      serialize: false,
      cache_processing_enabled: false,
      remove_unsupported_encodings: true,
      always_decode_gzip: false,
      initial_read_timeout: Some(Duration::from_secs(60)),
      keep_alive_read_timeout: Duration::from_millis(2500),
      upstream_timeout: Some(Duration::from_secs(60)),
      tls_versions: vec![TlsVersion::Tls12, TlsVersion::Tls13],
      backlog: 400,
      max_body_size: 64 * 1024 * 1024,
    }
  }
}

impl ProxyConfig {
  /// The address:port pair this configuration listens on
  pub fn listen_address(&self) -> String {
    let host = if self.bind_address.is_empty() {
      "0.0.0.0"
    } else {
      self.bind_address.as_str()
    };
    if host.contains(':') && !host.starts_with('[') {
      format!("[{}]:{}", host, self.port)
    } else {
      format!("{}:{}", host, self.port)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn empty_bind_address_means_any() {
    let config = ProxyConfig {
      bind_address: String::new(),
      port: 9000,
      ..Default::default()
    };
    assert_eq!(config.listen_address(), "0.0.0.0:9000");
    let config = ProxyConfig {
      bind_address: "::1".to_string(),
      ..Default::default()
    };
    assert_eq!(config.listen_address(), "[::1]:8080");
  }

  #[cfg(feature = "serde")]
  #[test]
  fn partial_config_fills_defaults() {
    let config: ProxyConfig = serde_json::from_str(r#"{"port": 8888, "serialize": true}"#).unwrap();
    assert_eq!(config.port, 8888);
    assert!(config.serialize);
    assert_eq!(config.backlog, 400);
    assert_eq!(config.max_body_size, 64 * 1024 * 1024);
  }
}
