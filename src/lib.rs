#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # slinger-proxy
//!
//! The connection engine of an intercepting HTTP/HTTPS proxy.
//!
//! Clients connect to a [`ProxyServer`]; every accepted connection is served
//! by its own task which reads requests, terminates TLS after a `CONNECT`,
//! forwards requests through an [`HttpSender`] and writes the responses back.
//! Along the way four kinds of listeners can observe, veto, override or take
//! over the traffic:
//!
//! - [`ProxyListener`]: inspect and rewrite requests and responses, or veto them
//! - [`OverrideListener`]: answer a request without touching the network
//! - [`ConnectRequestListener`]: be told about `CONNECT` tunnels
//! - [`PersistentConnectionListener`]: take over the client socket
//!
//! Listeners fire in ascending [`Arrangeable::arrangeable_order`].
//!
//! ## Running a proxy
//!
//! ```no_run
//! use std::sync::Arc;
//! use slinger_proxy::{LoggingListener, ProxyConfig, ProxyServer};
//!
//! # async fn run() -> slinger_proxy::Result<()> {
//! let server = ProxyServer::new(ProxyConfig::default());
//! server.add_proxy_listener(Arc::new(LoggingListener));
//! let port = server.start().await?;
//! println!("listening on {}", port);
//! # Ok(())
//! # }
//! ```
//!
//! ## HTTPS
//!
//! HTTPS traffic is only intercepted when a [`CertificateSource`] is set on
//! the [`ProxyServerBuilder`]. Without one a `CONNECT` is acknowledged and
//! then answered with `502 Bad Gateway`.
//!
//! ## Optional Features
//!
//! - **serde**: Provides serialization and deserialization support for
//!   exchanges and configuration.
//!
mod body;
mod cache;
mod client;
mod encoding;
mod errors;
mod exchange;
mod internal;
mod listener;
mod proxy;
mod registry;
mod request;
mod response;
mod sender;
mod server;
mod socket;
/// TLS tunnel adapter and certificate sources
pub mod tls;
mod worker;

pub use body::Body;
pub use cache::{CacheEntry, CacheShortCircuit, HistoryStore};
pub use client::Client;
pub use encoding::{decode_body, remove_unsupported_encodings, SUPPORTED_ENCODINGS};
pub use errors::{Error, Result};
pub use exchange::HttpExchange;
pub use http::header;
pub use http::uri;
pub use http::Method;
pub use http::{StatusCode, Version};
pub use internal::{is_recursive, InternalRequestHandler, INTERNAL_DOMAIN};
pub use listener::{
  Arrangeable, ConnectRequestListener, LoggingListener, OverrideListener,
  PersistentConnectionListener, ProxyListener,
};
pub use proxy::{ProxyConfig, TlsVersion};
pub use registry::{ListenerList, ListenerRegistry};
pub use request::Request;
pub use response::{Response, ResponseBuilder, ResponseConfig};
pub use sender::{HttpSender, SenderListener};
pub use server::{ProxyServer, ProxyServerBuilder};
pub use socket::{Socket, Stream, StreamWrapper};
pub use tls::{CertificateSource, StaticCertificate, TlsTunnel};
pub use worker::CONNECT_ESTABLISHED;

pub(crate) const CR_LF: &[u8] = &[13, 10];
pub(crate) const SPACE: &[u8] = &[32];
pub(crate) const COLON_SPACE: &[u8] = &[58, 32];
