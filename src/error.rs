use std::io;
use thiserror::Error;

/// Errors surfaced by the stream engine and its protocol layers.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ZmqError {
  // --- I/O Errors ---
  #[error("I/O error: {0}")]
  Io(#[from] io::Error),

  // --- Timeouts ---
  #[error("Operation timed out")]
  Timeout,

  // --- Connection Errors ---
  #[error("Connection closed by peer or transport")]
  ConnectionClosed,

  // --- Protocol Errors ---
  #[error("ZMTP protocol violation: {0}")]
  ProtocolViolation(String),

  #[error("Message exceeds configured maximum size ({0} bytes)")]
  MessageTooLong(usize),

  // --- Security Errors ---
  #[error("Security error: {0}")]
  SecurityError(String),
  #[error("Authentication failed: {0}")]
  AuthenticationFailure(String),
  #[error("Encryption/Decryption error: {0}")]
  EncryptionError(String),

  // --- State Errors ---
  #[error("Operation is invalid for the current engine state: {0}")]
  InvalidState(&'static str),

  // --- Internal Errors ---
  #[error("Internal library error: {0}")]
  Internal(String),
}
