use std::fmt::{Debug, Formatter};

use bytes::Bytes;
use http::uri::{Authority, Scheme};
use http::Request as HttpRequest;
use http::{HeaderMap, HeaderValue, Method, Version};

use crate::body::Body;
use crate::errors::{Error, Result};
use crate::response::{is_connection_close, parser_headers};
use crate::{COLON_SPACE, CR_LF, SPACE};

/// A request read from a proxy client, or built by a listener.
#[derive(Default, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Request {
  #[cfg_attr(feature = "serde", serde(with = "http_serde::uri"))]
  uri: http::Uri,
  #[cfg_attr(feature = "serde", serde(with = "http_serde::version"))]
  version: Version,
  #[cfg_attr(feature = "serde", serde(with = "http_serde::method"))]
  method: Method,
  #[cfg_attr(feature = "serde", serde(with = "http_serde::header_map"))]
  headers: HeaderMap<HeaderValue>,
  body: Option<Body>,
}

impl Debug for Request {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Request")
      .field("uri", &self.uri)
      .field("version", &self.version)
      .field("method", &self.method)
      .field("headers", &self.headers)
      .field("body", &self.body)
      .finish()
  }
}

impl<T> From<HttpRequest<T>> for Request
where
  T: Into<Body>,
{
  fn from(value: HttpRequest<T>) -> Self {
    let (parts, body) = value.into_parts();
    let body = body.into();
    Self {
      uri: parts.uri,
      version: parts.version,
      method: parts.method,
      headers: parts.headers,
      body: if body.is_empty() { None } else { Some(body) },
    }
  }
}

impl Request {
  /// Creates a new builder-style object to manufacture a `Request`
  pub fn builder() -> http::request::Builder {
    http::request::Builder::new()
  }

  /// Parses a request header block (request line plus header lines).
  ///
  /// Origin-form targets are made absolute: inside a CONNECT tunnel the
  /// tunnel authority is used with the `https` scheme, otherwise the `Host`
  /// header with the `http` scheme.
  pub fn parse(head: &[u8], tunnel: Option<&Authority>) -> Result<Request> {
    let mut lines = head
      .split(|b| *b == b'\n')
      .map(|line| line.strip_suffix(b"\r").unwrap_or(line));
    let request_line = lines
      .next()
      .filter(|line| !line.is_empty())
      .ok_or_else(|| Error::invalid_request("Empty request line"))?;
    let mut parts = request_line
      .split(|b| *b == b' ')
      .filter(|part| !part.is_empty());
    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
      (Some(m), Some(t), Some(v)) => (m, t, v),
      _ => {
        return Err(Error::invalid_request(format!(
          "Invalid request line: {}",
          request_line.escape_ascii()
        )))
      }
    };
    let method = Method::from_bytes(method)
      .map_err(|_| Error::invalid_request(format!("Invalid method: {}", method.escape_ascii())))?;
    let version = match version {
      b"HTTP/1.0" => Version::HTTP_10,
      b"HTTP/1.1" => Version::HTTP_11,
      _ => {
        return Err(Error::invalid_request(format!(
          "Unsupported version: {}",
          version.escape_ascii()
        )))
      }
    };
    let mut headers = HeaderMap::new();
    for line in lines {
      if line.is_empty() {
        break;
      }
      if let Ok((Some(k), Some(v))) = parser_headers(line) {
        headers.append(k, v);
      }
    }
    let target = std::str::from_utf8(target)
      .map_err(|_| Error::invalid_request("Request target is not valid UTF-8"))?;
    let uri: http::Uri = if method == Method::CONNECT {
      target.parse()?
    } else if target.starts_with("http://") || target.starts_with("https://") {
      target.parse()?
    } else if let Some(authority) = tunnel {
      format!("https://{}{}", tunnel_authority(authority), target).parse()?
    } else if let Some(host) = headers
      .get(http::header::HOST)
      .and_then(|h| h.to_str().ok())
    {
      format!("http://{}{}", host, target).parse()?
    } else {
      return Err(Error::invalid_request(format!(
        "Missing Host header for {}",
        target
      )));
    };
    Ok(Request {
      uri,
      version,
      method,
      headers,
      body: None,
    })
  }

  /// Serializes the request in origin-form, as sent to the target host.
  pub fn to_raw(&self) -> Bytes {
    let mut http_requests = Vec::new();
    http_requests.extend(self.method.as_str().as_bytes());
    http_requests.extend(SPACE);
    if self.method == Method::CONNECT {
      http_requests.extend(self.uri.to_string().as_bytes());
    } else {
      http_requests.extend(self.uri.path().as_bytes());
      if let Some(q) = self.uri.query() {
        http_requests.extend([63]);
        http_requests.extend(q.as_bytes());
      }
    }
    http_requests.extend(SPACE);
    http_requests.extend(format!("{:?}", self.version).as_bytes());
    http_requests.extend(CR_LF);
    if self.headers.get(http::header::HOST).is_none() {
      http_requests.extend(http::header::HOST.as_str().as_bytes());
      http_requests.extend(COLON_SPACE);
      http_requests.extend(if let Some(s) = self.uri.authority() {
        s.as_str().as_bytes()
      } else {
        &[]
      });
      http_requests.extend(CR_LF);
    }
    let mut headers = self.headers.clone();
    if let Some(b) = self.body() {
      if !b.is_empty() {
        headers
          .entry(http::header::CONTENT_LENGTH)
          .or_insert(HeaderValue::from(b.len()));
      }
    }
    for (k, v) in headers.iter() {
      http_requests.extend(k.as_str().as_bytes());
      http_requests.extend(COLON_SPACE);
      http_requests.extend(v.as_bytes());
      http_requests.extend(CR_LF);
    }
    http_requests.extend(CR_LF);
    if let Some(b) = self.body() {
      if !b.is_empty() {
        http_requests.extend(b.as_ref());
      }
    }
    Bytes::from(http_requests)
  }

  /// Same method, URI and body. Headers are not compared.
  pub fn matches(&self, other: &Request) -> bool {
    let body = |r: &Request| r.body.as_ref().map(|b| b.to_vec()).unwrap_or_default();
    self.method == other.method && self.uri == other.uri && body(self) == body(other)
  }
}

impl Request {
  /// Get the HTTP Method for this request.
  #[inline]
  pub fn method(&self) -> &Method {
    &self.method
  }
  /// Returns a mutable reference to the method.
  #[inline]
  pub fn method_mut(&mut self) -> &mut Method {
    &mut self.method
  }
  /// Get the absolute URI for this request, or the authority of a CONNECT.
  #[inline]
  pub fn uri(&self) -> &http::Uri {
    &self.uri
  }
  /// Returns a mutable reference to the URI.
  #[inline]
  pub fn uri_mut(&mut self) -> &mut http::Uri {
    &mut self.uri
  }
  /// Get the headers of this request.
  #[inline]
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }
  /// Returns a mutable reference to the headers.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut HeaderMap {
    &mut self.headers
  }
  /// Get the body, if any was attached.
  #[inline]
  pub fn body(&self) -> Option<&Body> {
    self.body.as_ref()
  }
  /// Replace the body.
  #[inline]
  pub fn set_body<B: Into<Body>>(&mut self, body: B) {
    let body = body.into();
    self.body = if body.is_empty() { None } else { Some(body) };
  }
  /// Returns the associated version.
  #[inline]
  pub fn version(&self) -> Version {
    self.version
  }
  /// Returns a mutable reference to the associated version.
  #[inline]
  pub fn version_mut(&mut self) -> &mut Version {
    &mut self.version
  }
  /// The declared `Content-Length`, if present and valid.
  pub fn content_length(&self) -> Option<u64> {
    self
      .headers
      .get(http::header::CONTENT_LENGTH)
      .and_then(|x| x.to_str().ok()?.trim().parse().ok())
  }
  /// Whether the client asked for the connection to be closed after this exchange.
  pub fn is_connection_close(&self) -> bool {
    is_connection_close(self.version, &self.headers)
  }
  /// Host and port of the target, with the scheme's default port filled in.
  pub fn host_port(&self) -> Option<(String, u16)> {
    let host = self.uri.host()?;
    let host = host
      .strip_prefix('[')
      .and_then(|h| h.strip_suffix(']'))
      .unwrap_or(host)
      .to_string();
    let port = self
      .uri
      .port_u16()
      .unwrap_or(if self.uri.scheme() == Some(&Scheme::HTTPS) || self.method == Method::CONNECT {
        443
      } else {
        80
      });
    Some((host, port))
  }
}

fn tunnel_authority(authority: &Authority) -> String {
  match authority.port_u16() {
    Some(443) | None => authority.host().to_string(),
    Some(_) => authority.as_str().to_string(),
  }
}
