use crate::error::ZmqError;
use crate::message::{Msg, MsgFlags};
use crate::protocol::command::{ZMTP_FLAG_COMMAND, ZMTP_FLAG_LONG, ZMTP_FLAG_MORE};
use crate::protocol::codec::{Decoder, Encoder};
use bytes::{Buf, BufMut, BytesMut};

/// Decoder for ZMTP/2.0+ framing: flags octet, then a 1-byte length for
/// frames up to 255 bytes or an 8-byte big-endian length otherwise.
#[derive(Debug)]
pub struct V2Decoder {
  state: DecodingState,
  max_msg_size: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default)]
enum DecodingState {
  #[default]
  ReadHeader,
  ReadBody {
    flags: u8,
    size: usize,
  },
}

impl V2Decoder {
  pub fn new(max_msg_size: Option<usize>) -> Self {
    Self {
      state: DecodingState::ReadHeader,
      max_msg_size,
    }
  }
}

impl Decoder for V2Decoder {
  fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Msg>, ZmqError> {
    loop {
      match self.state {
        DecodingState::ReadHeader => {
          if src.is_empty() {
            return Ok(None);
          }
          let flags = src[0]; // Peek
          let is_long = (flags & ZMTP_FLAG_LONG) != 0;
          let header_len = if is_long { 1 + 8 } else { 1 + 1 };
          if src.len() < header_len {
            return Ok(None);
          }

          src.advance(1);
          let size = if is_long {
            let size = src.get_u64();
            if size > usize::MAX as u64 {
              return Err(ZmqError::ProtocolViolation("Frame length overflows".into()));
            }
            size as usize
          } else {
            src.get_u8() as usize
          };

          if let Some(max) = self.max_msg_size {
            if size > max {
              return Err(ZmqError::MessageTooLong(size));
            }
          }

          self.state = DecodingState::ReadBody { flags, size };
          // Fall through to try the body immediately.
        }

        DecodingState::ReadBody { flags, size } => {
          if src.len() < size {
            src.reserve(size - src.len());
            return Ok(None);
          }

          let body = src.split_to(size).freeze();
          self.state = DecodingState::ReadHeader;

          let mut msg = Msg::from_bytes(body);
          let mut msg_flags = MsgFlags::empty();
          if (flags & ZMTP_FLAG_MORE) != 0 {
            msg_flags |= MsgFlags::MORE;
          }
          if (flags & ZMTP_FLAG_COMMAND) != 0 {
            msg_flags |= MsgFlags::COMMAND;
          }
          msg.set_flags(msg_flags);
          return Ok(Some(msg));
        }
      }
    }
  }
}

/// Encoder for ZMTP/2.0+ framing.
#[derive(Debug, Default)]
pub struct V2Encoder;

impl V2Encoder {
  pub fn new() -> Self {
    Self
  }
}

impl Encoder for V2Encoder {
  fn encode(&mut self, msg: Msg, dst: &mut BytesMut) -> Result<(), ZmqError> {
    let data = msg.data().unwrap_or(&[]);
    let size = data.len();

    let mut flags = 0u8;
    if msg.is_more() {
      flags |= ZMTP_FLAG_MORE;
    }
    if msg.is_command() {
      flags |= ZMTP_FLAG_COMMAND;
    }

    if size <= 255 {
      dst.reserve(2 + size);
      dst.put_u8(flags);
      dst.put_u8(size as u8);
    } else {
      flags |= ZMTP_FLAG_LONG;
      dst.reserve(9 + size);
      dst.put_u8(flags);
      dst.put_u64(size as u64);
    }
    dst.put_slice(data);
    Ok(())
  }
}
