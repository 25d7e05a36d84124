//! Simple intercepting proxy example
//!
//! This example starts a proxy with a logging listener.
//!
//! To run:
//! ```bash
//! RUST_LOG=debug cargo run --example simple_proxy -- [cert.pem key.pem]
//! ```
//!
//! Then configure your browser to use the proxy at 127.0.0.1:8080. HTTPS
//! traffic is intercepted only when a certificate and key are given.

use slinger_proxy::{LoggingListener, ProxyConfig, ProxyServer, StaticCertificate};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let config = ProxyConfig {
    dynamic_port: true,
    ..Default::default()
  };
  let mut builder = ProxyServer::builder().config(config);
  let args: Vec<String> = std::env::args().skip(1).collect();
  if let [cert, key] = args.as_slice() {
    builder = builder.certificate_source(Arc::new(StaticCertificate::from_files(cert, key)?));
  }
  let server = builder.build();

  let logging = Arc::new(LoggingListener);
  server.add_proxy_listener(logging.clone());
  server.add_connect_listener(logging);

  let port = server.start().await?;
  println!("Proxy listening on 127.0.0.1:{}", port);
  println!("Press Ctrl-C to stop");

  tokio::signal::ctrl_c().await?;
  if !server.stop_and_wait(Duration::from_secs(5)).await {
    println!("Some connections were still open");
  }
  Ok(())
}
