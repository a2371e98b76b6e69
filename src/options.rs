use crate::message::Blob;
use std::time::Duration;

/// Default lower bound for the input batch buffer, in bytes.
pub const IN_BATCH_SIZE: usize = 8192;
/// Default lower bound for the output batch buffer, in bytes.
pub const OUT_BATCH_SIZE: usize = 8192;

/// Socket pattern the engine speaks on behalf of. Pattern semantics live
/// upstream; the engine only needs the wire name, the greeting type octet,
/// and the pairing rules for the `Socket-Type` handshake property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
  Pair,
  Pub,
  Sub,
  Req,
  Rep,
  Dealer,
  Router,
  Pull,
  Push,
  Xpub,
  Xsub,
}

impl SocketType {
  /// Wire name used in the `Socket-Type` handshake property.
  pub fn name(&self) -> &'static str {
    match self {
      SocketType::Pair => "PAIR",
      SocketType::Pub => "PUB",
      SocketType::Sub => "SUB",
      SocketType::Req => "REQ",
      SocketType::Rep => "REP",
      SocketType::Dealer => "DEALER",
      SocketType::Router => "ROUTER",
      SocketType::Pull => "PULL",
      SocketType::Push => "PUSH",
      SocketType::Xpub => "XPUB",
      SocketType::Xsub => "XSUB",
    }
  }

  /// Numeric type octet carried in v1/v2 greetings.
  pub fn code(&self) -> u8 {
    match self {
      SocketType::Pair => 0,
      SocketType::Pub => 1,
      SocketType::Sub => 2,
      SocketType::Req => 3,
      SocketType::Rep => 4,
      SocketType::Dealer => 5,
      SocketType::Router => 6,
      SocketType::Pull => 7,
      SocketType::Push => 8,
      SocketType::Xpub => 9,
      SocketType::Xsub => 10,
    }
  }

  /// Whether this type announces an identity in its READY metadata.
  pub fn sends_identity(&self) -> bool {
    matches!(self, SocketType::Req | SocketType::Dealer | SocketType::Router)
  }

  /// Checks ZMTP socket-type pairing rules against a peer's announced name.
  pub fn compatible_with(&self, peer: &str) -> bool {
    let allowed: &[&str] = match self {
      SocketType::Pair => &["PAIR"],
      SocketType::Pub => &["SUB", "XSUB"],
      SocketType::Sub => &["PUB", "XPUB"],
      SocketType::Req => &["REP", "ROUTER"],
      SocketType::Rep => &["REQ", "DEALER"],
      SocketType::Dealer => &["REP", "DEALER", "ROUTER"],
      SocketType::Router => &["REQ", "DEALER", "ROUTER"],
      SocketType::Pull => &["PUSH"],
      SocketType::Push => &["PULL"],
      SocketType::Xpub => &["SUB", "XSUB"],
      SocketType::Xsub => &["PUB", "XPUB"],
    };
    allowed.contains(&peer)
  }
}

/// Security mechanism selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MechanismKind {
  Null,
  Plain,
  Curve,
  Gssapi,
}

impl MechanismKind {
  pub fn name(&self) -> &'static str {
    match self {
      MechanismKind::Null => "NULL",
      MechanismKind::Plain => "PLAIN",
      MechanismKind::Curve => "CURVE",
      MechanismKind::Gssapi => "GSSAPI",
    }
  }

  /// The mechanism field of a v3 greeting: the name, NUL-padded to 20 bytes.
  pub fn greeting_name(&self) -> [u8; 20] {
    let mut padded = [0u8; 20];
    let name = self.name().as_bytes();
    padded[..name.len()].copy_from_slice(name);
    padded
  }
}

/// Per-connection engine configuration.
#[derive(Debug, Clone)]
pub struct EngineOptions {
  pub socket_type: SocketType,
  /// Identity sent in the v0/v1/v2 identity message and the v3 `Identity`
  /// READY property (for the types that announce one).
  pub identity: Blob,
  /// Whether peer identities are delivered to the session.
  pub recv_identity: bool,
  /// Skip greeting and handshake; opaque byte framing.
  pub raw_socket: bool,
  pub mechanism: MechanismKind,
  /// Server role for the security mechanism.
  pub as_server: bool,
  /// ZAP authentication domain.
  pub zap_domain: String,

  /// PING interval; `None` disables the heartbeat subsystem.
  pub heartbeat_interval: Option<Duration>,
  /// How long to wait for traffic after a PING; defaults to the interval.
  pub heartbeat_timeout: Option<Duration>,
  /// TTL advertised to the peer in PING commands.
  pub heartbeat_ttl: Option<Duration>,
  /// Context bytes appended to outgoing PING commands.
  pub heartbeat_context: Vec<u8>,

  /// Overall handshake deadline; `None` disables.
  pub handshake_ivl: Option<Duration>,

  /// Decoder message size limit; `None` is unlimited.
  pub max_msg_size: Option<usize>,

  /// Kernel receive buffer hint; lower-bounds the input batch buffer.
  pub rcvbuf: usize,
  /// Kernel send buffer hint; lower-bounds the output batch buffer.
  pub sndbuf: usize,

  /// When set, the local address is published to the peer metadata under
  /// this property name.
  pub self_address_property_name: Option<String>,

  // CURVE key material.
  pub curve_secret_key: Option<[u8; 32]>,
  pub curve_public_key: Option<[u8; 32]>,
  /// Long-term public key of the server (client role only).
  pub curve_server_key: Option<[u8; 32]>,

  // PLAIN credentials (client role only).
  pub plain_username: Option<Vec<u8>>,
  pub plain_password: Option<Vec<u8>>,
}

impl Default for EngineOptions {
  fn default() -> Self {
    Self {
      socket_type: SocketType::Pair,
      identity: Blob::new(),
      recv_identity: false,
      raw_socket: false,
      mechanism: MechanismKind::Null,
      as_server: false,
      zap_domain: String::new(),
      heartbeat_interval: None,
      heartbeat_timeout: None,
      heartbeat_ttl: None,
      heartbeat_context: Vec::new(),
      handshake_ivl: Some(Duration::from_secs(30)),
      max_msg_size: None,
      rcvbuf: 0,
      sndbuf: 0,
      self_address_property_name: None,
      curve_secret_key: None,
      curve_public_key: None,
      curve_server_key: None,
      plain_username: None,
      plain_password: None,
    }
  }
}

impl EngineOptions {
  /// Input batch buffer size: the configured floor or the kernel hint,
  /// whichever is larger.
  pub fn in_batch_size(&self) -> usize {
    IN_BATCH_SIZE.max(self.rcvbuf)
  }

  pub fn out_batch_size(&self) -> usize {
    OUT_BATCH_SIZE.max(self.sndbuf)
  }

  /// Effective PING-response timeout: explicit value, or the interval.
  pub fn effective_heartbeat_timeout(&self) -> Option<Duration> {
    match self.heartbeat_interval {
      Some(ivl) => Some(self.heartbeat_timeout.unwrap_or(ivl)),
      None => None,
    }
  }

  /// TTL advertised in PING commands, in wire deciseconds.
  pub fn heartbeat_ttl_deciseconds(&self) -> u16 {
    self
      .heartbeat_ttl
      .map(|ttl| (ttl.as_millis() / 100).min(u16::MAX as u128) as u16)
      .unwrap_or(0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn pairing_rules() {
    assert!(SocketType::Req.compatible_with("REP"));
    assert!(SocketType::Req.compatible_with("ROUTER"));
    assert!(!SocketType::Req.compatible_with("REQ"));
    assert!(SocketType::Pub.compatible_with("SUB"));
    assert!(!SocketType::Pub.compatible_with("PULL"));
  }

  #[test]
  fn greeting_name_is_nul_padded() {
    let name = MechanismKind::Curve.greeting_name();
    assert_eq!(&name[..5], b"CURVE");
    assert!(name[5..].iter().all(|&b| b == 0));
  }

  #[test]
  fn ttl_converts_to_deciseconds() {
    let mut options = EngineOptions::default();
    options.heartbeat_ttl = Some(Duration::from_millis(6400));
    assert_eq!(options.heartbeat_ttl_deciseconds(), 64);
  }
}
