use crate::error::ZmqError;
use crate::message::{Msg, MsgFlags};
use bytes::{BufMut, BytesMut};

// --- ZMTP/2.0+ Frame Flags ---
// Located in the first octet of each frame.
pub const ZMTP_FLAG_MORE: u8 = 0b0000_0001;
pub const ZMTP_FLAG_LONG: u8 = 0b0000_0010; // 8-byte length instead of 1-byte
pub const ZMTP_FLAG_COMMAND: u8 = 0b0000_0100;

// --- Command Names ---
// The first short-string of a COMMAND frame body.
pub const CMD_READY: &[u8] = b"READY";
pub const CMD_ERROR: &[u8] = b"ERROR";
pub const CMD_HELLO: &[u8] = b"HELLO";
pub const CMD_WELCOME: &[u8] = b"WELCOME";
pub const CMD_INITIATE: &[u8] = b"INITIATE";
pub const CMD_MESSAGE: &[u8] = b"MESSAGE";
pub const CMD_PING: &[u8] = b"PING";
pub const CMD_PONG: &[u8] = b"PONG";

/// A PING context is at most 16 bytes; longer contexts are truncated.
pub const PING_CONTEXT_MAX: usize = 16;

/// Appends a ZMTP short-string (1-byte length followed by the bytes).
pub fn put_short_string(dst: &mut BytesMut, data: &[u8]) {
  debug_assert!(data.len() <= 255);
  dst.put_u8(data.len() as u8);
  dst.put_slice(data);
}

/// Checks whether a command body starts with the short-string form of `name`.
pub fn is_command(body: &[u8], name: &[u8]) -> bool {
  body.len() > name.len() && body[0] as usize == name.len() && &body[1..1 + name.len()] == name
}

/// Creates a PING command frame: `%x04 "PING" ttl(2, big-endian) context`.
pub fn create_ping(ttl_deciseconds: u16, context: &[u8]) -> Msg {
  let mut body = BytesMut::with_capacity(1 + CMD_PING.len() + 2 + context.len());
  put_short_string(&mut body, CMD_PING);
  body.put_u16(ttl_deciseconds);
  body.put_slice(context);

  let mut msg = Msg::from_bytes(body.freeze());
  msg.set_flags(MsgFlags::COMMAND);
  msg
}

/// Creates a PONG command frame: `%x04 "PONG" context`.
pub fn create_pong(context: &[u8]) -> Msg {
  let mut body = BytesMut::with_capacity(1 + CMD_PONG.len() + context.len());
  put_short_string(&mut body, CMD_PONG);
  body.put_slice(context);

  let mut msg = Msg::from_bytes(body.freeze());
  msg.set_flags(MsgFlags::COMMAND);
  msg
}

/// Parsed contents of a peer PING command.
#[derive(Debug, PartialEq, Eq)]
pub struct Ping {
  /// Peer TTL in deciseconds, as carried on the wire.
  pub ttl_deciseconds: u16,
  /// Context bytes, truncated to [`PING_CONTEXT_MAX`].
  pub context: Vec<u8>,
}

/// Parses the body of a PING command frame.
pub fn parse_ping(body: &[u8]) -> Result<Ping, ZmqError> {
  if !is_command(body, CMD_PING) || body.len() < 7 {
    return Err(ZmqError::ProtocolViolation("Malformed PING command".into()));
  }
  let ttl = u16::from_be_bytes([body[5], body[6]]);
  let context = &body[7..];
  let take = context.len().min(PING_CONTEXT_MAX);
  Ok(Ping {
    ttl_deciseconds: ttl,
    context: context[..take].to_vec(),
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn ping_round_trip() {
    let msg = create_ping(100, b"ctx");
    assert!(msg.is_command());
    let ping = parse_ping(msg.data().unwrap()).unwrap();
    assert_eq!(ping.ttl_deciseconds, 100);
    assert_eq!(ping.context, b"ctx");
  }

  #[test]
  fn ping_context_is_truncated_to_sixteen_bytes() {
    let long_context = [0xABu8; 32];
    let msg = create_ping(1, &long_context);
    let ping = parse_ping(msg.data().unwrap()).unwrap();
    assert_eq!(ping.context.len(), PING_CONTEXT_MAX);
  }

  #[test]
  fn short_ping_is_rejected() {
    assert!(parse_ping(b"\x04PING").is_err());
  }

  #[test]
  fn pong_carries_context() {
    let msg = create_pong(b"echo");
    assert!(is_command(msg.data().unwrap(), CMD_PONG));
    assert_eq!(&msg.data().unwrap()[5..], b"echo");
  }
}
