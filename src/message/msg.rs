use crate::message::flags::MsgFlags;
use crate::message::metadata::Metadata;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

/// Represents a single message part (frame).
#[derive(Clone, Default)]
pub struct Msg {
  // Bytes gives cheap, reference-counted slicing and cloning.
  data: Option<Bytes>,
  flags: MsgFlags,
  metadata: Option<Arc<Metadata>>,
}

impl Msg {
  /// Creates an empty message with no data.
  pub fn new() -> Self {
    Self::default()
  }

  /// Creates a message from a `Vec<u8>`, taking ownership.
  pub fn from_vec(data: Vec<u8>) -> Self {
    Self {
      data: Some(Bytes::from(data)),
      ..Default::default()
    }
  }

  /// Creates a message from `bytes::Bytes`.
  pub fn from_bytes(data: Bytes) -> Self {
    Self {
      data: Some(data),
      ..Default::default()
    }
  }

  /// Creates a message from a static byte slice (zero-copy).
  pub fn from_static(data: &'static [u8]) -> Self {
    Self {
      data: Some(Bytes::from_static(data)),
      ..Default::default()
    }
  }

  /// Returns a reference to the message payload bytes, if any.
  pub fn data(&self) -> Option<&[u8]> {
    self.data.as_deref()
  }

  /// Returns the size of the message payload in bytes.
  pub fn size(&self) -> usize {
    self.data.as_ref().map_or(0, |d| d.len())
  }

  /// Returns the flags associated with the message.
  pub fn flags(&self) -> MsgFlags {
    self.flags
  }

  /// Sets the flags for the message, replacing the previous set.
  pub fn set_flags(&mut self, flags: MsgFlags) {
    self.flags = flags;
  }

  /// Adds `flags` to the current set.
  pub fn add_flags(&mut self, flags: MsgFlags) {
    self.flags |= flags;
  }

  /// Returns the connection metadata attached to this message, if any.
  pub fn metadata(&self) -> Option<&Arc<Metadata>> {
    self.metadata.as_ref()
  }

  /// Attaches connection metadata to this message.
  pub fn set_metadata(&mut self, metadata: Arc<Metadata>) {
    self.metadata = Some(metadata);
  }

  // --- Flag Helpers ---

  /// Checks if the `MORE` flag is set.
  pub fn is_more(&self) -> bool {
    self.flags.contains(MsgFlags::MORE)
  }

  /// Checks if the `COMMAND` flag is set.
  pub fn is_command(&self) -> bool {
    self.flags.contains(MsgFlags::COMMAND)
  }

  /// Checks if the `IDENTITY` flag is set.
  pub fn is_identity(&self) -> bool {
    self.flags.contains(MsgFlags::IDENTITY)
  }

  /// Checks if the `CREDENTIAL` flag is set.
  pub fn is_credential(&self) -> bool {
    self.flags.contains(MsgFlags::CREDENTIAL)
  }

  /// Returns the internal `Bytes` object if data is present.
  ///
  /// Cloning `Bytes` is cheap as it is reference-counted.
  pub fn data_bytes(&self) -> Option<Bytes> {
    self.data.clone()
  }
}

impl fmt::Debug for Msg {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Msg")
      .field("size", &self.size())
      .field("flags", &self.flags)
      .field("has_metadata", &self.metadata.is_some())
      .finish()
  }
}
