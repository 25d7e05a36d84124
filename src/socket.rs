use std::fmt;
use std::io::{Error, ErrorKind};
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;

const READ_CHUNK: usize = 8 * 1024;

/// Any byte stream a [`Socket`] can carry.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

/// Client connection as seen by a connection worker.
///
/// Reads and writes go through whatever transport is underneath (plain TCP,
/// or TLS after a CONNECT), while addresses and timeouts stay those of the
/// accepted connection.
pub struct Socket {
  inner: StreamWrapper,
  pending: BytesMut,
  local_addr: SocketAddr,
  peer_addr: SocketAddr,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
}

/// The transport underneath a [`Socket`]
pub enum StreamWrapper {
  /// TCP
  Tcp(TcpStream),
  /// TLS terminated by the proxy, on top of the original socket
  Tls(Box<TlsStream<Socket>>),
  /// Anything else, e.g. an in-memory pipe
  Custom(Box<dyn Stream>),
}

impl fmt::Debug for StreamWrapper {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      StreamWrapper::Tcp(s) => f.debug_tuple("Tcp").field(s).finish(),
      StreamWrapper::Tls(_) => f.write_str("Tls"),
      StreamWrapper::Custom(_) => f.write_str("Custom"),
    }
  }
}

impl fmt::Debug for Socket {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Socket")
      .field("inner", &self.inner)
      .field("local_addr", &self.local_addr)
      .field("peer_addr", &self.peer_addr)
      .field("read_timeout", &self.read_timeout)
      .field("write_timeout", &self.write_timeout)
      .finish()
  }
}

impl Socket {
  /// Wrap an accepted TCP connection
  pub fn from_tcp(stream: TcpStream) -> std::io::Result<Self> {
    let local_addr = stream.local_addr()?;
    let peer_addr = stream.peer_addr()?;
    Ok(Self::new(StreamWrapper::Tcp(stream), local_addr, peer_addr))
  }

  /// Wrap an arbitrary stream, reporting the given addresses
  pub fn from_stream<S: Stream + 'static>(
    stream: S,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
  ) -> Self {
    Self::new(StreamWrapper::Custom(Box::new(stream)), local_addr, peer_addr)
  }

  /// Continue on top of a finished server-side TLS handshake.
  pub(crate) fn from_tls(stream: TlsStream<Socket>) -> Self {
    let (io, _) = stream.get_ref();
    let local_addr = io.local_addr;
    let peer_addr = io.peer_addr;
    let read_timeout = io.read_timeout;
    let write_timeout = io.write_timeout;
    let mut socket = Self::new(StreamWrapper::Tls(Box::new(stream)), local_addr, peer_addr);
    socket.read_timeout = read_timeout;
    socket.write_timeout = write_timeout;
    socket
  }

  fn new(inner: StreamWrapper, local_addr: SocketAddr, peer_addr: SocketAddr) -> Self {
    Self {
      inner,
      pending: BytesMut::new(),
      local_addr,
      peer_addr,
      read_timeout: None,
      write_timeout: None,
    }
  }

  /// Address the connection was accepted on
  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  /// Address of the client
  pub fn peer_addr(&self) -> SocketAddr {
    self.peer_addr
  }

  /// Whether reads and writes go through a TLS layer
  pub fn is_tls(&self) -> bool {
    matches!(self.inner, StreamWrapper::Tls(_))
  }

  /// Enable or disable Nagle's algorithm on the underlying TCP socket.
  pub fn set_nodelay(&self, nodelay: bool) -> std::io::Result<()> {
    match &self.inner {
      StreamWrapper::Tcp(s) => s.set_nodelay(nodelay),
      StreamWrapper::Tls(t) => t.get_ref().0.set_nodelay(nodelay),
      StreamWrapper::Custom(_) => Ok(()),
    }
  }

  /// Set the timeout applied to every read
  pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
    self.read_timeout = timeout;
    if let StreamWrapper::Tls(t) = &mut self.inner {
      t.get_mut().0.read_timeout = timeout;
    }
  }

  /// Set the timeout applied to every write
  pub fn set_write_timeout(&mut self, timeout: Option<Duration>) {
    self.write_timeout = timeout;
    if let StreamWrapper::Tls(t) = &mut self.inner {
      t.get_mut().0.write_timeout = timeout;
    }
  }

  /// The current read timeout
  pub fn read_timeout(&self) -> Option<Duration> {
    self.read_timeout
  }
}

impl Socket {
  /// Reads one header block, up to and including the blank line.
  ///
  /// Empty lines before the header are skipped. Returns `Ok(None)` when the
  /// peer closed the connection before sending anything. Bytes read past the
  /// header stay buffered for the next read.
  pub async fn read_header(&mut self, max_size: usize) -> std::io::Result<Option<Bytes>> {
    loop {
      while self.pending.starts_with(b"\r\n") || self.pending.starts_with(b"\n") {
        let skip = if self.pending.starts_with(b"\r\n") { 2 } else { 1 };
        self.pending.advance(skip);
      }
      if let Some(end) = header_end(&self.pending) {
        return Ok(Some(self.pending.split_to(end).freeze()));
      }
      if self.pending.len() > max_size {
        return Err(Error::new(
          ErrorKind::InvalidData,
          "header size exceeds maximum allowed",
        ));
      }
      let n = match self.read_timeout {
        None => self.inner.read_buf(&mut self.pending).await?,
        Some(t) => tokio::time::timeout(t, self.inner.read_buf(&mut self.pending)).await??,
      };
      if n == 0 {
        if self.pending.is_empty() {
          return Ok(None);
        }
        return Err(Error::new(
          ErrorKind::UnexpectedEof,
          "connection closed in the middle of a header",
        ));
      }
    }
  }

  /// Reads exactly `len` body bytes.
  ///
  /// The buffer grows with the data actually received and the read timeout
  /// bounds each read, not the whole body.
  pub async fn read_body(&mut self, len: u64) -> std::io::Result<Bytes> {
    let mut body = BytesMut::with_capacity(len.min(READ_CHUNK as u64) as usize);
    let mut chunk = [0u8; READ_CHUNK];
    let mut remaining = len;
    while remaining > 0 {
      let want = usize::try_from(remaining).map_or(READ_CHUNK, |r| r.min(READ_CHUNK));
      let n = self.read(&mut chunk[..want]).await?;
      if n == 0 {
        return Err(Error::new(
          ErrorKind::UnexpectedEof,
          "connection closed in the middle of a body",
        ));
      }
      body.extend_from_slice(&chunk[..n]);
      remaining -= n as u64;
    }
    Ok(body.freeze())
  }

  /// Reads the exact number of bytes required to fill buf.
  pub async fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
      let n = self.read(&mut buf[filled..]).await?;
      if n == 0 {
        return Err(Error::new(ErrorKind::UnexpectedEof, "early eof"));
      }
      filled += n;
    }
    Ok(filled)
  }

  /// Pulls some bytes from this source into the specified buffer, returning how many bytes were read.
  pub async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
    match self.read_timeout {
      None => AsyncReadExt::read(self, buf).await,
      Some(t) => tokio::time::timeout(t, AsyncReadExt::read(self, buf)).await?,
    }
  }
}

impl Socket {
  /// Attempts to write an entire buffer into this writer.
  pub async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
    match self.write_timeout {
      None => AsyncWriteExt::write_all(self, buf).await,
      Some(t) => tokio::time::timeout(t, AsyncWriteExt::write_all(self, buf)).await?,
    }
  }
  /// Flushes this output stream, ensuring that all intermediately buffered
  /// contents reach their destination.
  pub async fn flush(&mut self) -> std::io::Result<()> {
    match self.write_timeout {
      None => AsyncWriteExt::flush(self).await,
      Some(t) => tokio::time::timeout(t, AsyncWriteExt::flush(self)).await?,
    }
  }
  /// Shuts down the output stream, ensuring that the value can be dropped
  /// cleanly.
  pub async fn shutdown(&mut self) -> std::io::Result<()> {
    match self.write_timeout {
      None => AsyncWriteExt::shutdown(self).await,
      Some(t) => tokio::time::timeout(t, AsyncWriteExt::shutdown(self)).await?,
    }
  }
}

fn header_end(buf: &[u8]) -> Option<usize> {
  let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4);
  let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| p + 2);
  match (crlf, lf) {
    (Some(a), Some(b)) => Some(a.min(b)),
    (a, b) => a.or(b),
  }
}

impl AsyncRead for Socket {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    let this = self.get_mut();
    if !this.pending.is_empty() {
      let n = this.pending.len().min(buf.remaining());
      buf.put_slice(&this.pending[..n]);
      this.pending.advance(n);
      return Poll::Ready(Ok(()));
    }
    Pin::new(&mut this.inner).poll_read(cx, buf)
  }
}

impl AsyncWrite for Socket {
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    Pin::new(&mut self.inner).poll_write(cx, buf)
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.inner).poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.inner).poll_shutdown(cx)
  }
}

impl AsyncRead for StreamWrapper {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      StreamWrapper::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
      StreamWrapper::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
      StreamWrapper::Custom(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for StreamWrapper {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    match self.get_mut() {
      StreamWrapper::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
      StreamWrapper::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
      StreamWrapper::Custom(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      StreamWrapper::Tcp(stream) => Pin::new(stream).poll_flush(cx),
      StreamWrapper::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
      StreamWrapper::Custom(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      StreamWrapper::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
      StreamWrapper::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
      StreamWrapper::Custom(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
    }
  }
}
