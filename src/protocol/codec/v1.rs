use crate::error::ZmqError;
use crate::message::{Msg, MsgFlags};
use crate::protocol::codec::{Decoder, Encoder};
use bytes::{Buf, BufMut, BytesMut};

/// Flags octet of a ZMTP/1.0 frame: bit 0 means more frames follow.
const V1_FLAG_MORE: u8 = 0x01;

/// Decoder for ZMTP/1.0 framing: the length covers the flags octet plus the
/// body, encoded as one byte, or as `0xFF` followed by an 8-byte big-endian
/// length for larger frames.
#[derive(Debug)]
pub struct V1Decoder {
  state: DecodingState,
  max_msg_size: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default)]
enum DecodingState {
  #[default]
  ReadLength,
  ReadLongLength,
  ReadFlags {
    body_size: usize,
  },
  ReadBody {
    flags: u8,
    body_size: usize,
  },
}

impl V1Decoder {
  pub fn new(max_msg_size: Option<usize>) -> Self {
    Self {
      state: DecodingState::ReadLength,
      max_msg_size,
    }
  }

  fn check_size(&self, body_size: usize) -> Result<(), ZmqError> {
    if let Some(max) = self.max_msg_size {
      if body_size > max {
        return Err(ZmqError::MessageTooLong(body_size));
      }
    }
    Ok(())
  }
}

impl Decoder for V1Decoder {
  fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Msg>, ZmqError> {
    loop {
      match self.state {
        DecodingState::ReadLength => {
          if src.is_empty() {
            return Ok(None);
          }
          let length = src.get_u8();
          if length == 0xFF {
            self.state = DecodingState::ReadLongLength;
          } else {
            if length == 0 {
              return Err(ZmqError::ProtocolViolation("Zero frame length".into()));
            }
            let body_size = length as usize - 1;
            self.check_size(body_size)?;
            self.state = DecodingState::ReadFlags { body_size };
          }
        }

        DecodingState::ReadLongLength => {
          if src.len() < 8 {
            return Ok(None);
          }
          let length = src.get_u64();
          if length == 0 || length > usize::MAX as u64 {
            return Err(ZmqError::ProtocolViolation("Invalid long frame length".into()));
          }
          let body_size = length as usize - 1;
          self.check_size(body_size)?;
          self.state = DecodingState::ReadFlags { body_size };
        }

        DecodingState::ReadFlags { body_size } => {
          if src.is_empty() {
            return Ok(None);
          }
          let flags = src.get_u8();
          self.state = DecodingState::ReadBody { flags, body_size };
        }

        DecodingState::ReadBody { flags, body_size } => {
          if src.len() < body_size {
            src.reserve(body_size - src.len());
            return Ok(None);
          }
          let body = src.split_to(body_size).freeze();
          self.state = DecodingState::ReadLength;

          let mut msg = Msg::from_bytes(body);
          if (flags & V1_FLAG_MORE) != 0 {
            msg.set_flags(MsgFlags::MORE);
          }
          return Ok(Some(msg));
        }
      }
    }
  }
}

/// Encoder for ZMTP/1.0 framing.
#[derive(Debug, Default)]
pub struct V1Encoder;

impl V1Encoder {
  pub fn new() -> Self {
    Self
  }

  /// Size of the header `encode` emits for a body of `body_size` bytes.
  pub fn header_size(body_size: usize) -> usize {
    if body_size + 1 < 255 {
      2
    } else {
      10
    }
  }
}

impl Encoder for V1Encoder {
  fn encode(&mut self, msg: Msg, dst: &mut BytesMut) -> Result<(), ZmqError> {
    let data = msg.data().unwrap_or(&[]);
    let length = data.len() + 1; // flags octet included

    if length < 255 {
      dst.reserve(2 + data.len());
      dst.put_u8(length as u8);
    } else {
      dst.reserve(10 + data.len());
      dst.put_u8(0xFF);
      dst.put_u64(length as u64);
    }
    dst.put_u8(if msg.is_more() { V1_FLAG_MORE } else { 0 });
    dst.put_slice(data);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn short_frame_round_trip() {
    let mut wire = BytesMut::new();
    let mut msg = Msg::from_static(b"abc");
    msg.set_flags(MsgFlags::MORE);
    V1Encoder::new().encode(msg, &mut wire).unwrap();
    assert_eq!(&wire[..], &[4, 1, b'a', b'b', b'c']);

    let decoded = V1Decoder::new(None).decode(&mut wire).unwrap().unwrap();
    assert_eq!(decoded.data().unwrap(), b"abc");
    assert!(decoded.is_more());
  }

  #[test]
  fn long_frame_round_trip() {
    let payload = vec![7u8; 300];
    let mut wire = BytesMut::new();
    V1Encoder::new().encode(Msg::from_vec(payload.clone()), &mut wire).unwrap();
    assert_eq!(wire[0], 0xFF);
    assert_eq!(wire.len(), 10 + 300);

    let decoded = V1Decoder::new(None).decode(&mut wire).unwrap().unwrap();
    assert_eq!(decoded.data().unwrap(), &payload[..]);
    assert!(!decoded.is_more());
  }

  #[test]
  fn length_boundary_uses_long_form_at_255() {
    // body 253 -> length 254, still short form
    let mut wire = BytesMut::new();
    V1Encoder::new().encode(Msg::from_vec(vec![0; 253]), &mut wire).unwrap();
    assert_eq!(wire[0], 254);

    // body 254 -> length 255, must escape to long form
    let mut wire = BytesMut::new();
    V1Encoder::new().encode(Msg::from_vec(vec![0; 254]), &mut wire).unwrap();
    assert_eq!(wire[0], 0xFF);
  }

  #[test]
  fn zero_length_is_rejected() {
    let mut wire = BytesMut::from(&[0u8][..]);
    assert!(V1Decoder::new(None).decode(&mut wire).is_err());
  }

  #[test]
  fn oversized_frame_is_an_error() {
    let mut wire = BytesMut::new();
    V1Encoder::new().encode(Msg::from_vec(vec![0; 100]), &mut wire).unwrap();
    assert!(matches!(
      V1Decoder::new(Some(10)).decode(&mut wire),
      Err(ZmqError::MessageTooLong(100))
    ));
  }
}
