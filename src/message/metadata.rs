use crate::error::ZmqError;
use bytes::{BufMut, BytesMut};
use std::collections::BTreeMap;
use std::fmt;

/// Standard property name for the peer identity (routing id).
pub const IDENTITY: &str = "Identity";
/// Standard property name for the peer socket type.
pub const SOCKET_TYPE: &str = "Socket-Type";
/// Standard property name for the authenticated user id (from ZAP).
pub const USER_ID: &str = "User-Id";
/// Standard property name for the network address of the peer.
pub const PEER_ADDRESS: &str = "Peer-Address";

/// An ordered map of connection properties (`name` -> value bytes).
///
/// Carries the ZMTP metadata wire encoding: 1-byte name length, name,
/// 4-byte big-endian value length, value.
#[derive(Default, Clone, PartialEq, Eq)]
pub struct Metadata {
  properties: BTreeMap<String, Vec<u8>>,
}

impl Metadata {
  pub fn new() -> Self {
    Self::default()
  }

  /// Inserts a property, replacing any previous value under the same name.
  pub fn set(&mut self, name: &str, value: impl Into<Vec<u8>>) {
    debug_assert!(name.len() <= 255);
    self.properties.insert(name.to_string(), value.into());
  }

  pub fn get(&self, name: &str) -> Option<&[u8]> {
    self.properties.get(name).map(|v| v.as_slice())
  }

  pub fn is_empty(&self) -> bool {
    self.properties.is_empty()
  }

  pub fn len(&self) -> usize {
    self.properties.len()
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
    self.properties.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
  }

  /// Copies all properties of `other` into `self`.
  pub fn merge(&mut self, other: &Metadata) {
    for (name, value) in other.iter() {
      self.set(name, value.to_vec());
    }
  }

  /// Appends the wire encoding of all properties to `dst`.
  pub fn encode(&self, dst: &mut BytesMut) {
    for (name, value) in self.iter() {
      dst.put_u8(name.len() as u8);
      dst.put_slice(name.as_bytes());
      dst.put_u32(value.len() as u32);
      dst.put_slice(value);
    }
  }

  /// Parses the wire encoding in `data`, inserting each property.
  ///
  /// Trailing bytes that do not form a complete property are a protocol
  /// violation; an empty input parses to no properties.
  pub fn parse(&mut self, data: &[u8]) -> Result<(), ZmqError> {
    let mut pos = 0;
    while pos < data.len() {
      let name_len = data[pos] as usize;
      pos += 1;
      if name_len == 0 || pos + name_len > data.len() {
        return Err(ZmqError::ProtocolViolation("Malformed metadata property name".into()));
      }
      let name = std::str::from_utf8(&data[pos..pos + name_len])
        .map_err(|_| ZmqError::ProtocolViolation("Metadata property name is not UTF-8".into()))?
        .to_string();
      pos += name_len;

      if pos + 4 > data.len() {
        return Err(ZmqError::ProtocolViolation("Truncated metadata property length".into()));
      }
      let value_len = u32::from_be_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
      pos += 4;
      if pos + value_len > data.len() {
        return Err(ZmqError::ProtocolViolation("Truncated metadata property value".into()));
      }
      self.properties.insert(name, data[pos..pos + value_len].to_vec());
      pos += value_len;
    }
    Ok(())
  }
}

impl fmt::Debug for Metadata {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut map = f.debug_map();
    for (name, value) in self.iter() {
      map.entry(&name, &format_args!("{} bytes", value.len()));
    }
    map.finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn encode_parse_round_trip() {
    let mut meta = Metadata::new();
    meta.set(SOCKET_TYPE, b"DEALER".to_vec());
    meta.set(IDENTITY, b"node-1".to_vec());

    let mut wire = BytesMut::new();
    meta.encode(&mut wire);

    let mut parsed = Metadata::new();
    parsed.parse(&wire).unwrap();
    assert_eq!(parsed, meta);
    assert_eq!(parsed.get(SOCKET_TYPE), Some(&b"DEALER"[..]));
  }

  #[test]
  fn parse_rejects_truncated_value() {
    // name "a", declared value length 10, only 2 bytes present
    let data = [1u8, b'a', 0, 0, 0, 10, 1, 2];
    let mut meta = Metadata::new();
    assert!(meta.parse(&data).is_err());
  }

  #[test]
  fn parse_rejects_empty_name() {
    let data = [0u8, 0, 0, 0, 0];
    let mut meta = Metadata::new();
    assert!(meta.parse(&data).is_err());
  }
}
