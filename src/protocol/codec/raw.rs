use crate::error::ZmqError;
use crate::message::Msg;
use crate::protocol::codec::{Decoder, Encoder};
use bytes::BytesMut;

/// Decoder for raw sockets: no framing, every received chunk becomes one
/// message. Connect/disconnect notifications (zero-length messages) are
/// synthesized by the engine, not here.
#[derive(Debug)]
pub struct RawDecoder {
  max_msg_size: Option<usize>,
}

impl RawDecoder {
  pub fn new(max_msg_size: Option<usize>) -> Self {
    Self { max_msg_size }
  }
}

impl Decoder for RawDecoder {
  fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Msg>, ZmqError> {
    if src.is_empty() {
      return Ok(None);
    }
    if let Some(max) = self.max_msg_size {
      if src.len() > max {
        return Err(ZmqError::MessageTooLong(src.len()));
      }
    }
    Ok(Some(Msg::from_bytes(src.split().freeze())))
  }
}

/// Encoder for raw sockets: the payload goes on the wire verbatim.
#[derive(Debug, Default)]
pub struct RawEncoder;

impl RawEncoder {
  pub fn new() -> Self {
    Self
  }
}

impl Encoder for RawEncoder {
  fn encode(&mut self, msg: Msg, dst: &mut BytesMut) -> Result<(), ZmqError> {
    if let Some(data) = msg.data() {
      dst.extend_from_slice(data);
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn chunk_becomes_one_message() {
    let mut src = BytesMut::from(&b"opaque payload"[..]);
    let msg = RawDecoder::new(None).decode(&mut src).unwrap().unwrap();
    assert_eq!(msg.data().unwrap(), b"opaque payload");
    assert!(src.is_empty());
    assert!(RawDecoder::new(None).decode(&mut src).unwrap().is_none());
  }

  #[test]
  fn encoder_adds_no_framing() {
    let mut dst = BytesMut::new();
    RawEncoder::new().encode(Msg::from_static(b"\x00\x01\x02"), &mut dst).unwrap();
    assert_eq!(&dst[..], &[0, 1, 2]);
  }
}
