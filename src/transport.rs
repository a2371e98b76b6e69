use std::fmt;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;

/// A connected, non-blocking, stream-oriented transport handle.
///
/// Read semantics follow non-blocking sockets: `Ok(0)` means the peer closed
/// the connection, `ErrorKind::WouldBlock` means no data is available right
/// now. The engine owns the handle and closes it on destroy.
pub trait StreamTransport: Read + Write + fmt::Debug + Send {
  /// Peer network address, if the transport has one.
  fn peer_addr_string(&self) -> Option<String> {
    None
  }

  /// Local network address, if the transport has one.
  fn local_addr_string(&self) -> Option<String> {
    None
  }

  /// Shuts the stream down. Errors on an already-dead connection are moot.
  fn close(&mut self) {}
}

impl StreamTransport for TcpStream {
  fn peer_addr_string(&self) -> Option<String> {
    self.peer_addr().ok().map(|a| a.to_string())
  }

  fn local_addr_string(&self) -> Option<String> {
    self.local_addr().ok().map(|a| a.to_string())
  }

  fn close(&mut self) {
    let _ = self.shutdown(std::net::Shutdown::Both);
  }
}

impl StreamTransport for UnixStream {
  fn peer_addr_string(&self) -> Option<String> {
    self
      .peer_addr()
      .ok()
      .and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
  }

  fn local_addr_string(&self) -> Option<String> {
    self
      .local_addr()
      .ok()
      .and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
  }

  fn close(&mut self) {
    let _ = self.shutdown(std::net::Shutdown::Both);
  }
}

/// Puts a TCP stream into the non-blocking mode the engine requires.
pub fn prepare_tcp(stream: TcpStream) -> io::Result<TcpStream> {
  stream.set_nonblocking(true)?;
  stream.set_nodelay(true)?;
  Ok(stream)
}

/// Puts a UNIX stream into the non-blocking mode the engine requires.
pub fn prepare_unix(stream: UnixStream) -> io::Result<UnixStream> {
  stream.set_nonblocking(true)?;
  Ok(stream)
}
