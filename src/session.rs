use crate::error::ZmqError;
use crate::message::Msg;
use crate::protocol::ZmtpVersion;

/// Kinds of fatal engine failure reported to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorReason {
  /// Transport-level failure: peer closed, socket error on read/write.
  Connection,
  /// Framing error, disallowed greeting, crypto failure, mechanism state
  /// violation, or a rejected message.
  Protocol,
  /// Handshake, PING-response, or peer-TTL deadline expired.
  Timeout,
}

/// Why `push_msg` declined a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
  /// Backpressure: the pipe is full, retry after `restart_input`.
  Full,
  /// The session refuses the message; a protocol error for the engine.
  Rejected,
}

/// The upstream owner of the application-visible queues.
///
/// The engine calls into the session from within reactor callbacks; the
/// session never calls back into the engine re-entrantly except through the
/// documented `restart_input` / `restart_output` entry points.
pub trait Session {
  /// Fetches the next outgoing message, or `None` when the pipe is empty.
  fn pull_msg(&mut self) -> Option<Msg>;

  /// Delivers an incoming message. `Err(PushError::Full)` pauses input until
  /// the session calls `restart_input`.
  fn push_msg(&mut self, msg: Msg) -> Result<(), PushError>;

  /// Makes previously pushed messages visible to the application.
  fn flush(&mut self);

  // --- ZAP authentication ---

  /// Whether a ZAP authenticator is configured.
  fn zap_enabled(&self) -> bool {
    false
  }

  /// Opens the connection to the ZAP authenticator. An error means no
  /// authenticator is reachable and the handshake proceeds unauthenticated.
  fn zap_connect(&mut self) -> Result<(), ZmqError> {
    Err(ZmqError::InvalidState("No ZAP authenticator"))
  }

  /// Queues one frame of a ZAP request.
  fn write_zap_msg(&mut self, msg: Msg) -> Result<(), ZmqError> {
    let _ = msg;
    Err(ZmqError::InvalidState("No ZAP authenticator"))
  }

  /// Reads one frame of the ZAP reply; `Ok(None)` means it would block and
  /// the engine will be re-entered via `zap_msg_available`.
  fn read_zap_msg(&mut self) -> Result<Option<Msg>, ZmqError> {
    Ok(None)
  }

  // --- Lifecycle ---

  /// Reports a fatal engine error. `handshake_done` is false while the
  /// greeting or security handshake was still in progress.
  fn engine_error(&mut self, handshake_done: bool, reason: ErrorReason);

  // --- Socket events ---

  fn event_handshaken(&mut self, endpoint: &str, version: ZmtpVersion) {
    let _ = (endpoint, version);
  }

  fn event_disconnected(&mut self, endpoint: &str) {
    let _ = endpoint;
  }

  fn event_handshake_failed_protocol(&mut self, endpoint: &str, code: i32) {
    let _ = (endpoint, code);
  }
}
