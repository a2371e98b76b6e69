use bytes::BytesMut;

/// Size of the initial signature: `%xFF length(8) %x7F`.
pub const SIGNATURE_SIZE: usize = 10;
/// Size of a ZMTP/1.0 or ZMTP/2.0 greeting (signature, revision, socket type).
pub const V2_GREETING_SIZE: usize = 12;
/// Size of a ZMTP/3.x greeting.
pub const V3_GREETING_SIZE: usize = 64;
/// Size of the NUL-padded mechanism name field in a v3 greeting.
pub const MECHANISM_NAME_SIZE: usize = 20;

/// Position of the protocol revision octet.
pub const REVISION_POS: usize = SIGNATURE_SIZE;
/// Position of the mechanism name in a v3 greeting.
pub const MECHANISM_POS: usize = 12;
/// Position of the as-server octet in a v3 greeting.
pub const AS_SERVER_POS: usize = MECHANISM_POS + MECHANISM_NAME_SIZE;

/// Revision octet we propose (ZMTP/3.x).
pub const OWN_REVISION: u8 = 3;

/// Greeting exchange state: two fixed 64-byte buffers.
///
/// The send side is staged incrementally: only the bytes justified by what
/// the peer has revealed so far are handed to the output stream. The receive
/// side widens its expectation from 12 to 64 bytes once the peer turns out to
/// speak ZMTP/3.x.
#[derive(Debug)]
pub struct Greeting {
  send: [u8; V3_GREETING_SIZE],
  /// Number of send bytes staged into the output stream so far.
  staged: usize,
  recv: [u8; V3_GREETING_SIZE],
  recv_pos: usize,
  expected: usize,
}

impl Greeting {
  pub fn new() -> Self {
    Self {
      send: [0u8; V3_GREETING_SIZE],
      staged: 0,
      recv: [0u8; V3_GREETING_SIZE],
      recv_pos: 0,
      expected: V2_GREETING_SIZE,
    }
  }

  // --- Send side ---

  /// Stages the 10-byte signature. The length field doubles as the header of
  /// the identity message for unversioned peers.
  pub fn stage_signature(&mut self, identity_size: usize, out: &mut BytesMut) {
    debug_assert_eq!(self.staged, 0);
    self.send[0] = 0xFF;
    self.send[1..9].copy_from_slice(&((identity_size as u64) + 1).to_be_bytes());
    self.send[9] = 0x7F;
    self.stage_to(SIGNATURE_SIZE, out);
  }

  /// Stages the revision octet once the peer is known to be versioned.
  /// Returns false if already staged.
  pub fn stage_revision(&mut self, out: &mut BytesMut) -> bool {
    if self.staged != SIGNATURE_SIZE {
      return false;
    }
    self.send[REVISION_POS] = OWN_REVISION;
    self.stage_to(SIGNATURE_SIZE + 1, out);
    true
  }

  /// True once the revision octet is staged but the greeting tail is not.
  pub fn awaiting_tail(&self) -> bool {
    self.staged == SIGNATURE_SIZE + 1
  }

  /// Stages the 2-byte tail of a v1/v2 greeting (socket type octet).
  pub fn stage_v2_tail(&mut self, socket_type: u8, out: &mut BytesMut) {
    debug_assert!(self.awaiting_tail());
    self.send[SIGNATURE_SIZE + 1] = socket_type;
    self.stage_to(V2_GREETING_SIZE, out);
  }

  /// Stages the v3 greeting tail: minor revision, mechanism name, as-server
  /// octet, filler. Widens the receive expectation to 64 bytes.
  pub fn stage_v3_tail(&mut self, mechanism_name: &[u8], as_server: bool, out: &mut BytesMut) {
    debug_assert!(self.awaiting_tail());
    debug_assert!(mechanism_name.len() <= MECHANISM_NAME_SIZE);
    self.send[SIGNATURE_SIZE + 1] = 0; // minor revision
    self.send[MECHANISM_POS..MECHANISM_POS + mechanism_name.len()].copy_from_slice(mechanism_name);
    self.send[AS_SERVER_POS] = as_server as u8;
    self.stage_to(V3_GREETING_SIZE, out);
    self.expected = V3_GREETING_SIZE;
  }

  fn stage_to(&mut self, limit: usize, out: &mut BytesMut) {
    out.extend_from_slice(&self.send[self.staged..limit]);
    self.staged = limit;
  }

  // --- Receive side ---

  /// Remaining receive window for the expected greeting bytes.
  pub fn recv_window(&mut self) -> &mut [u8] {
    let (pos, expected) = (self.recv_pos, self.expected);
    &mut self.recv[pos..expected]
  }

  pub fn advance_recv(&mut self, n: usize) {
    self.recv_pos += n;
    debug_assert!(self.recv_pos <= self.expected);
  }

  pub fn received(&self) -> usize {
    self.recv_pos
  }

  pub fn expected(&self) -> usize {
    self.expected
  }

  pub fn complete(&self) -> bool {
    self.recv_pos >= self.expected
  }

  /// True once enough bytes prove the peer speaks the unversioned protocol:
  /// the first octet is not `0xFF`, or bit 0 of the tenth octet is clear
  /// (making it the flags field of an identity message).
  pub fn peer_is_unversioned(&self) -> bool {
    debug_assert!(self.recv_pos >= 1);
    self.recv[0] != 0xFF || (self.recv_pos >= SIGNATURE_SIZE && (self.recv[9] & 0x01) == 0)
  }

  /// Peer revision octet; valid once more than `SIGNATURE_SIZE` bytes arrived.
  pub fn peer_revision(&self) -> u8 {
    debug_assert!(self.recv_pos > REVISION_POS);
    self.recv[REVISION_POS]
  }

  /// Mechanism name field of the peer's v3 greeting.
  pub fn peer_mechanism(&self) -> &[u8] {
    &self.recv[MECHANISM_POS..MECHANISM_POS + MECHANISM_NAME_SIZE]
  }

  /// Bytes the peer sent beyond its greeting, to be handed to the decoder.
  pub fn trailing(&self, greeting_size: usize) -> &[u8] {
    &self.recv[greeting_size.min(self.recv_pos)..self.recv_pos]
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn signature_layout() {
    let mut g = Greeting::new();
    let mut out = BytesMut::new();
    g.stage_signature(2, &mut out);
    assert_eq!(&out[..], &[0xFF, 0, 0, 0, 0, 0, 0, 0, 3, 0x7F]);
  }

  #[test]
  fn staging_is_incremental_and_idempotent() {
    let mut g = Greeting::new();
    let mut out = BytesMut::new();
    g.stage_signature(0, &mut out);
    assert!(g.stage_revision(&mut out));
    assert!(!g.stage_revision(&mut out));
    assert_eq!(out.len(), 11);
    assert_eq!(out[10], OWN_REVISION);
  }

  #[test]
  fn v3_tail_layout() {
    let mut g = Greeting::new();
    let mut out = BytesMut::new();
    g.stage_signature(0, &mut out);
    g.stage_revision(&mut out);
    g.stage_v3_tail(b"CURVE", true, &mut out);
    assert_eq!(out.len(), V3_GREETING_SIZE);
    assert_eq!(out[11], 0); // minor revision
    assert_eq!(&out[12..17], b"CURVE");
    assert_eq!(&out[17..32], &[0u8; 15][..]); // NUL padding
    assert_eq!(out[32], 1); // as-server
    assert_eq!(&out[33..64], &[0u8; 31][..]);
    assert_eq!(g.expected(), V3_GREETING_SIZE);
  }

  #[test]
  fn unversioned_detection() {
    let mut g = Greeting::new();
    g.recv_window()[0] = 0x03;
    g.advance_recv(1);
    assert!(g.peer_is_unversioned());

    let mut g = Greeting::new();
    let window = g.recv_window();
    window[0] = 0xFF;
    window[9] = 0x00; // flags octet of a v0 identity message
    g.advance_recv(10);
    assert!(g.peer_is_unversioned());

    let mut g = Greeting::new();
    let window = g.recv_window();
    window[0] = 0xFF;
    window[9] = 0x7F;
    g.advance_recv(10);
    assert!(!g.peer_is_unversioned());
  }
}
