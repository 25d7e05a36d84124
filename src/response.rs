use std::fmt::Debug;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

use crate::body::Body;
use crate::errors::{new_io_error, Error, Result};
use crate::{Request, COLON_SPACE, CR_LF, SPACE};
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, Response as HttpResponse, StatusCode, Version};

/// A response, either read from the target host or supplied by a
/// listener, the cache or the proxy itself.
#[derive(Debug, Default, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Response {
  #[cfg_attr(feature = "serde", serde(with = "http_serde::version"))]
  version: http::Version,
  #[cfg_attr(feature = "serde", serde(with = "http_serde::status_code"))]
  status_code: http::StatusCode,
  #[cfg_attr(feature = "serde", serde(with = "http_serde::header_map"))]
  headers: http::HeaderMap<http::HeaderValue>,
  #[cfg_attr(feature = "serde", serde(default))]
  reason: Option<String>,
  body: Option<Body>,
}

impl PartialEq for Response {
  fn eq(&self, other: &Self) -> bool {
    self.version == other.version
      && self.status_code == other.status_code
      && self.reason == other.reason
      && self.headers == other.headers
      && self.body == other.body
  }
}

impl<T> From<HttpResponse<T>> for Response
where
  T: Into<Body>,
{
  fn from(value: HttpResponse<T>) -> Self {
    let (parts, body) = value.into_parts();
    let body = body.into();
    Self {
      version: parts.version,
      status_code: parts.status,
      headers: parts.headers,
      reason: None,
      body: if body.is_empty() { None } else { Some(body) },
    }
  }
}

impl Response {
  /// Serializes status line, headers and body exactly as written to the client.
  pub fn to_raw(&self) -> Bytes {
    let mut http_response = Vec::new();
    http_response.extend(format!("{:?}", self.version).as_bytes());
    http_response.extend(SPACE);
    http_response.extend(self.status_code.as_str().as_bytes());
    http_response.extend(SPACE);
    http_response.extend(self.reason().as_bytes());
    http_response.extend(CR_LF);
    for (k, v) in self.headers.iter() {
      http_response.extend(k.as_str().as_bytes());
      http_response.extend(COLON_SPACE);
      http_response.extend(v.as_bytes());
      http_response.extend(CR_LF);
    }
    http_response.extend(CR_LF);
    if let Some(b) = self.body() {
      if !b.is_empty() {
        http_response.extend(b.as_ref());
      }
    }
    Bytes::from(http_response)
  }
  /// An HTTP response builder
  pub fn builder() -> http::response::Builder {
    http::response::Builder::new()
  }
  /// A plain text response generated by the proxy itself.
  pub fn plain_text(status: StatusCode, text: impl Into<String>) -> Response {
    let text = text.into();
    let mut headers = HeaderMap::new();
    headers.insert(
      http::header::CONTENT_TYPE,
      HeaderValue::from_static("text/plain; charset=UTF-8"),
    );
    headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from(text.len()));
    Response {
      version: Version::HTTP_11,
      status_code: status,
      headers,
      reason: None,
      body: Some(Body::from(text)),
    }
  }
}

impl Response {
  /// Get the `StatusCode` of this `Response`.
  #[inline]
  pub fn status_code(&self) -> http::StatusCode {
    self.status_code
  }
  /// The reason phrase sent with the status code, the standard one unless
  /// the target host sent its own.
  pub fn reason(&self) -> &str {
    match &self.reason {
      Some(reason) => reason,
      None => self.status_code.canonical_reason().unwrap_or(""),
    }
  }
  /// Replace the reason phrase.
  pub fn set_reason(&mut self, reason: Option<String>) {
    self.reason = reason;
  }
  /// Returns a mutable reference to the status code.
  #[inline]
  pub fn status_code_mut(&mut self) -> &mut http::StatusCode {
    &mut self.status_code
  }
  /// Get the HTTP `Version` of this `Response`.
  #[inline]
  pub fn version(&self) -> http::Version {
    self.version
  }
  /// Get the `Headers` of this `Response`.
  #[inline]
  pub fn headers(&self) -> &http::HeaderMap {
    &self.headers
  }
  /// Get a mutable reference to the `Headers` of this `Response`.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut http::HeaderMap {
    &mut self.headers
  }
  /// Get the content-length of the response, if it is declared.
  pub fn content_length(&self) -> Option<u64> {
    self
      .headers
      .get(http::header::CONTENT_LENGTH)
      .and_then(|x| x.to_str().ok()?.trim().parse().ok())
  }
  /// Get the full response body.
  pub fn body(&self) -> Option<&Body> {
    self.body.as_ref()
  }
  /// Replace the body. Headers are left untouched.
  pub fn set_body<B: Into<Body>>(&mut self, body: B) {
    let body = body.into();
    self.body = if body.is_empty() { None } else { Some(body) };
  }
  /// Whether the server asked for the connection to be closed.
  pub fn is_connection_close(&self) -> bool {
    is_connection_close(self.version, &self.headers)
  }
}

/// Reads a response from the target host.
#[derive(Debug)]
pub struct ResponseBuilder<T: AsyncRead + AsyncReadExt> {
  builder: http::response::Builder,
  reader: BufReader<T>,
  config: ResponseConfig,
}

/// response config
#[derive(Debug, Default)]
pub struct ResponseConfig {
  method: Method,
  timeout: Option<Duration>,
  max_read: Option<u64>,
  max_body: Option<u64>,
}

impl ResponseConfig {
  /// new a response config
  pub fn new(request: &Request, timeout: Option<Duration>) -> Self {
    ResponseConfig {
      method: request.method().clone(),
      timeout,
      max_read: None,
      max_body: None,
    }
  }
  /// Caps how much of an unframed body is read.
  pub fn max_read(mut self, max_read: Option<u64>) -> Self {
    self.max_read = max_read;
    self
  }
  /// Rejects bodies larger than `max_body` bytes.
  pub fn max_body(mut self, max_body: Option<u64>) -> Self {
    self.max_body = max_body;
    self
  }
}

impl<T: AsyncRead + Unpin + Sized> ResponseBuilder<T> {
  /// Constructs a new response.
  pub fn new(reader: BufReader<T>, config: ResponseConfig) -> ResponseBuilder<T> {
    ResponseBuilder {
      builder: Default::default(),
      reader,
      config,
    }
  }
  async fn read_line(&mut self, line: &mut Vec<u8>) -> Result<usize> {
    let n = match self.config.timeout {
      None => self.reader.read_until(b'\n', line).await?,
      Some(t) => tokio::time::timeout(t, self.reader.read_until(b'\n', line)).await??,
    };
    Ok(n)
  }
  async fn parser_version(&mut self) -> Result<(http::Version, http::StatusCode, Option<String>)> {
    let mut line = Vec::new();
    if self.read_line(&mut line).await? == 0 {
      return Err(new_io_error(
        std::io::ErrorKind::UnexpectedEof,
        "connection closed before the status line",
      ));
    }
    let line = line.strip_suffix(b"\n").unwrap_or(&line);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let mut parts = line.splitn(3, |b| b == &b' ');
    let version = match parts.next() {
      Some(b"HTTP/0.9") => http::Version::HTTP_09,
      Some(b"HTTP/1.0") => http::Version::HTTP_10,
      Some(b"HTTP/1.1") => http::Version::HTTP_11,
      Some(b"HTTP/2.0") => http::Version::HTTP_2,
      _ => {
        return Err(new_io_error(
          std::io::ErrorKind::InvalidData,
          "invalid http version",
        ));
      }
    };
    let status = match parts.next() {
      Some(code) if !code.is_empty() => {
        http::StatusCode::from_bytes(code).map_err(|x| Error::Http(http::Error::from(x)))?
      }
      _ => {
        return Err(new_io_error(
          std::io::ErrorKind::InvalidData,
          "invalid http version and status_code data",
        ));
      }
    };
    let reason = parts
      .next()
      .map(|r| String::from_utf8_lossy(r).trim().to_string());
    Ok((version, status, reason))
  }
  async fn read_headers(&mut self) -> Result<http::HeaderMap> {
    let mut headers = http::HeaderMap::new();
    let mut header_line = Vec::new();
    loop {
      let length = self.read_line(&mut header_line).await?;
      if length == 0 || header_line == b"\r\n" || header_line == b"\n" {
        break;
      }
      if let Ok((Some(k), Some(v))) = parser_headers(&header_line) {
        headers.append(k, v);
      };
      header_line.clear();
    }
    Ok(headers)
  }
  async fn read_body(&mut self, status: StatusCode, header: &mut http::HeaderMap) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    if self.config.method == Method::HEAD
      || status.is_informational()
      || status == StatusCode::NO_CONTENT
      || status == StatusCode::NOT_MODIFIED
    {
      return Ok(body);
    }
    let chunked = header
      .get(http::header::TRANSFER_ENCODING)
      .and_then(|te| te.to_str().ok())
      .map(|te| te.to_ascii_lowercase().contains("chunked"))
      .unwrap_or(false);
    if chunked {
      body = self.read_chunked_body().await?;
      // the body is handed on de-chunked, so it is re-framed by length
      header.remove(http::header::TRANSFER_ENCODING);
      header.insert(http::header::CONTENT_LENGTH, HeaderValue::from(body.len()));
      return Ok(body);
    }
    let content_length: Option<u64> = header
      .get(http::header::CONTENT_LENGTH)
      .and_then(|x| x.to_str().ok()?.trim().parse().ok());
    match content_length {
      Some(0) => {}
      Some(length) => {
        self.check_body_size(length)?;
        self.read_framed(length, &mut body).await?;
      }
      None => {
        // unframed: the server marks the end of the body by closing
        let mut buffer = vec![0; 8192];
        loop {
          let size = match self.config.timeout {
            None => self.reader.read(&mut buffer).await?,
            Some(t) => tokio::time::timeout(t, self.reader.read(&mut buffer)).await??,
          };
          if size == 0 {
            break;
          }
          body.extend_from_slice(&buffer[..size]);
          if let Some(max) = self.config.max_read {
            if body.len() as u64 >= max {
              body.truncate(max as usize);
              break;
            }
          }
          self.check_body_size(body.len() as u64)?;
        }
      }
    }
    Ok(body)
  }

  async fn read_chunked_body(&mut self) -> Result<Vec<u8>> {
    let mut body: Vec<u8> = Vec::new();
    loop {
      let mut line = Vec::new();
      if self.read_line(&mut line).await? == 0 {
        return Err(new_io_error(
          std::io::ErrorKind::UnexpectedEof,
          "connection closed inside a chunked body",
        ));
      }
      let text = String::from_utf8_lossy(&line);
      let size = text.trim().split(';').next().unwrap_or_default().trim();
      if size.is_empty() {
        continue;
      }
      let size = u64::from_str_radix(size, 16).map_err(|_| {
        new_io_error(std::io::ErrorKind::InvalidData, "invalid chunk size")
      })?;
      if size == 0 {
        // trailers, up to the terminating blank line
        loop {
          line.clear();
          let n = self.read_line(&mut line).await?;
          if n == 0 || line == b"\r\n" || line == b"\n" {
            break;
          }
        }
        break;
      }
      self.check_body_size((body.len() as u64).saturating_add(size))?;
      self.read_framed(size, &mut body).await?;
    }
    Ok(body)
  }

  /// Appends exactly `length` bytes to `body`. The buffer grows with the data
  /// received and the timeout bounds each read.
  async fn read_framed(&mut self, length: u64, body: &mut Vec<u8>) -> Result<()> {
    let mut buffer = [0u8; 8192];
    let mut remaining = length;
    while remaining > 0 {
      let want = usize::try_from(remaining).map_or(buffer.len(), |r| r.min(buffer.len()));
      let size = match self.config.timeout {
        None => self.reader.read(&mut buffer[..want]).await?,
        Some(t) => tokio::time::timeout(t, self.reader.read(&mut buffer[..want])).await??,
      };
      if size == 0 {
        return Err(new_io_error(
          std::io::ErrorKind::UnexpectedEof,
          "connection closed in the middle of a body",
        ));
      }
      body.extend_from_slice(&buffer[..size]);
      remaining -= size as u64;
    }
    Ok(())
  }

  fn check_body_size(&self, length: u64) -> Result<()> {
    match self.config.max_body {
      Some(max) if length > max => Err(new_io_error(
        std::io::ErrorKind::InvalidData,
        &format!("response body of {} bytes exceeds the {} byte limit", length, max),
      )),
      _ => Ok(()),
    }
  }

  /// Reads status line, headers and body.
  pub async fn build(mut self) -> Result<Response> {
    let (v, c, reason) = self.parser_version().await?;
    self.builder = self.builder.version(v).status(c);
    let mut header = self.read_headers().await?;
    let body = self.read_body(c, &mut header).await?;
    if let Some(h) = self.builder.headers_mut() {
      *h = header;
    }
    let resp = self.builder.body(body)?;
    let mut resp: Response = resp.into();
    resp.reason = reason.filter(|r| Some(r.as_str()) != c.canonical_reason());
    Ok(resp)
  }
}

pub(crate) fn parser_headers(
  buffer: &[u8],
) -> Result<(Option<http::HeaderName>, Option<http::HeaderValue>)> {
  let mut k = None;
  let mut v = None;
  let buffer = buffer.strip_suffix(CR_LF).unwrap_or(buffer);
  for (index, h) in buffer.splitn(2, |s| s == &58).enumerate() {
    let h = h.trim_ascii();
    match index {
      0 => match http::HeaderName::from_bytes(h) {
        Ok(hk) => k = Some(hk),
        Err(err) => {
          return Err(Error::Http(http::Error::from(err)));
        }
      },
      1 => match http::HeaderValue::from_bytes(h) {
        Ok(hv) => v = Some(hv),
        Err(err) => {
          return Err(Error::Http(http::Error::from(err)));
        }
      },
      _ => {}
    }
  }
  Ok((k, v))
}

/// HTTP/1.0 closes unless `keep-alive` is asked for, HTTP/1.1 keeps the
/// connection unless `close` is asked for. `Proxy-Connection` counts too.
pub(crate) fn is_connection_close(version: Version, headers: &HeaderMap) -> bool {
  let has_token = |token: &str| {
    [http::header::CONNECTION.as_str(), "proxy-connection"]
      .iter()
      .filter_map(|name| headers.get(*name))
      .filter_map(|value| value.to_str().ok())
      .flat_map(|value| value.split(','))
      .any(|t| t.trim().eq_ignore_ascii_case(token))
  };
  if version == Version::HTTP_10 || version == Version::HTTP_09 {
    !has_token("keep-alive")
  } else {
    has_token("close")
  }
}
