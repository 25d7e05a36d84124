//! engine error
use std::io::ErrorKind;
use thiserror::Error as ThisError;
/// A `Result` alias where the `Err` case is `slinger_proxy::Error`.
pub type Result<T> = std::result::Result<T, Error>;
/// The Errors that may occur while running the proxy.
#[derive(ThisError, Debug)]
pub enum Error {
  /// tls Error
  #[error(transparent)]
  Tls(#[from] tokio_rustls::rustls::Error),
  /// Error
  #[error(transparent)]
  IO(#[from] std::io::Error),
  /// http::Error
  #[error(transparent)]
  Http(http::Error),
  /// invalid exclusion pattern
  #[error(transparent)]
  Regex(#[from] regex::Error),
  /// The bind address could not be resolved.
  #[error("unknown host: {0}")]
  UnknownHost(String),
  /// The bind address does not belong to this machine.
  #[error("cannot assign requested address: {0}")]
  AddressUnassignable(String),
  /// The port is already in use, or binding to it is not permitted.
  #[error("cannot listen on {0}, the port is in use or not permitted")]
  PortInUse(String),
  /// The certificate source has no root certificate to sign with.
  #[error("no root certificate available to intercept HTTPS traffic")]
  MissingRootCertificate,
  /// Invalid request
  #[error("invalid request: {0}")]
  InvalidRequest(String),
  /// History store failure
  #[error("history store: {0}")]
  Store(String),
  /// Unknown Error
  #[error("{0}")]
  Other(String),
}

impl Error {
  /// Create an invalid request error and log it
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    let error = Error::InvalidRequest(msg.into());
    tracing::debug!("Invalid request: {}", error);
    error
  }

  /// Create a history store error and log it
  pub fn store(msg: impl Into<String>) -> Self {
    let error = Error::Store(msg.into());
    tracing::warn!("History store error: {}", error);
    error
  }

  /// Create an other error and log it
  pub fn other(msg: impl Into<String>) -> Self {
    let error = Error::Other(msg.into());
    tracing::warn!("Other error: {}", error);
    error
  }

  /// Whether this error means the peer did not answer in time.
  pub fn is_timeout(&self) -> bool {
    match self {
      Error::IO(e) => matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock),
      _ => false,
    }
  }

  /// A stable, type-like name for the error, used in diagnostic responses.
  pub fn kind_name(&self) -> String {
    match self {
      Error::Tls(_) => "TlsError".to_string(),
      Error::IO(e) => format!("{:?}", e.kind()),
      Error::Http(_) => "HttpError".to_string(),
      Error::Regex(_) => "RegexError".to_string(),
      Error::UnknownHost(_) => "UnknownHost".to_string(),
      Error::AddressUnassignable(_) => "AddressUnassignable".to_string(),
      Error::PortInUse(_) => "PortInUse".to_string(),
      Error::MissingRootCertificate => "MissingRootCertificate".to_string(),
      Error::InvalidRequest(_) => "InvalidRequest".to_string(),
      Error::Store(_) => "StoreError".to_string(),
      Error::Other(_) => "Other".to_string(),
    }
  }

  /// Renders `kind: message` followed by every `source()` in the chain,
  /// one `Caused by:` line each.
  pub fn describe(&self) -> String {
    let mut text = format!("{}: {}", self.kind_name(), self);
    let mut source = std::error::Error::source(self);
    while let Some(cause) = source {
      text.push_str("\r\nCaused by: ");
      text.push_str(&cause.to_string());
      source = cause.source();
    }
    text
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<tokio::time::error::Elapsed> for Error {
  fn from(value: tokio::time::error::Elapsed) -> Self {
    Error::IO(value.into())
  }
}

impl From<http::uri::InvalidUri> for Error {
  fn from(value: http::uri::InvalidUri) -> Self {
    Error::Http(http::Error::from(value))
  }
}

pub(crate) fn new_io_error(error_kind: ErrorKind, msg: &str) -> Error {
  Error::IO(std::io::Error::new(error_kind, msg))
}
