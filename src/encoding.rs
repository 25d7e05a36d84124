//! Content-coding helpers
use std::io::Read;

use flate2::read::{DeflateDecoder, MultiGzDecoder, ZlibDecoder};
use http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH};
use http::{HeaderMap, HeaderValue};

use crate::errors::Result;
use crate::Response;

/// Content codings the proxy is able to decode.
pub const SUPPORTED_ENCODINGS: &[&str] = &["gzip", "deflate"];

fn coding_name(token: &str) -> String {
  token
    .split(';')
    .next()
    .unwrap_or_default()
    .trim()
    .to_ascii_lowercase()
}

/// Whittles `Accept-Encoding` down to the codings in [`SUPPORTED_ENCODINGS`].
///
/// The header is removed when nothing supported remains. Returns whether the
/// header was changed.
pub fn remove_unsupported_encodings(headers: &mut HeaderMap) -> bool {
  if !headers.contains_key(ACCEPT_ENCODING) {
    return false;
  }
  let tokens: Vec<String> = headers
    .get_all(ACCEPT_ENCODING)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .map(|t| t.trim().to_string())
    .filter(|t| !t.is_empty())
    .collect();
  let kept: Vec<&String> = tokens
    .iter()
    .filter(|t| SUPPORTED_ENCODINGS.contains(&coding_name(t).as_str()))
    .collect();
  if kept.len() == tokens.len() && headers.get_all(ACCEPT_ENCODING).iter().count() == 1 {
    return false;
  }
  headers.remove(ACCEPT_ENCODING);
  if kept.is_empty() {
    return true;
  }
  let joined = kept
    .iter()
    .map(|t| t.as_str())
    .collect::<Vec<_>>()
    .join(", ");
  if let Ok(value) = HeaderValue::from_str(&joined) {
    headers.insert(ACCEPT_ENCODING, value);
  }
  true
}

/// Decodes a gzip or deflate coded response body in place.
///
/// On success `Content-Encoding` is dropped and `Content-Length` matches the
/// decoded body. Returns `Ok(false)` when the body was not coded with a
/// supported coding.
pub fn decode_body(response: &mut Response) -> Result<bool> {
  let coding = match response
    .headers()
    .get(CONTENT_ENCODING)
    .and_then(|v| v.to_str().ok())
  {
    Some(v) => v.trim().to_ascii_lowercase(),
    None => return Ok(false),
  };
  let body = response.body().map(|b| b.to_vec()).unwrap_or_default();
  let mut decoded = Vec::new();
  match coding.as_str() {
    "gzip" | "x-gzip" => {
      if !body.is_empty() {
        MultiGzDecoder::new(&body[..]).read_to_end(&mut decoded)?;
      }
    }
    "deflate" => {
      if !body.is_empty() && ZlibDecoder::new(&body[..]).read_to_end(&mut decoded).is_err() {
        // some servers send raw deflate without the zlib wrapper
        decoded.clear();
        DeflateDecoder::new(&body[..]).read_to_end(&mut decoded)?;
      }
    }
    _ => return Ok(false),
  }
  let headers = response.headers_mut();
  headers.remove(CONTENT_ENCODING);
  headers.insert(CONTENT_LENGTH, HeaderValue::from(decoded.len()));
  response.set_body(decoded);
  Ok(true)
}
