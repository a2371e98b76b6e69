pub mod raw;
pub mod v1;
pub mod v2;

pub use raw::{RawDecoder, RawEncoder};
pub use v1::{V1Decoder, V1Encoder};
pub use v2::{V2Decoder, V2Encoder};

use crate::error::ZmqError;
use crate::message::Msg;
use bytes::BytesMut;
use std::fmt;

/// Turns a raw byte stream into messages.
///
/// The engine owns the input buffer and feeds it to `decode`, which consumes
/// the bytes of at most one complete frame per call. Maximum-message-size
/// enforcement is internal to each decoder.
pub trait Decoder: fmt::Debug + Send {
  /// Attempts to decode a single message from `src`.
  ///
  /// - `Ok(Some(msg))`: a full frame was consumed from `src`.
  /// - `Ok(None)`: more data is needed; `src` may be partially consumed
  ///   (header bytes of an incomplete frame).
  /// - `Err(_)`: framing violation or oversized message; the connection is
  ///   unusable afterwards.
  fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Msg>, ZmqError>;
}

/// Turns messages into the wire byte stream.
///
/// The engine owns the output buffer; `encode` appends the complete framing
/// and payload of one message per call.
pub trait Encoder: fmt::Debug + Send {
  fn encode(&mut self, msg: Msg, dst: &mut BytesMut) -> Result<(), ZmqError>;
}
