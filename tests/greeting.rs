mod common;

use common::Endpoint;
use zmtp_engine::{EngineOptions, ErrorReason, SocketType, TimerId, ZmtpVersion};

fn options(socket_type: SocketType) -> EngineOptions {
  let mut options = EngineOptions::default();
  options.socket_type = socket_type;
  options.recv_identity = true;
  options
}

#[test]
fn signature_is_sent_at_plug() {
  common::init_tracing();
  let mut ep = Endpoint::new(options(SocketType::Dealer));
  ep.plug();

  let sent = ep.pump_out();
  assert_eq!(sent, [0xFF, 0, 0, 0, 0, 0, 0, 0, 1, 0x7F]);
  assert!(ep.engine.is_handshaking());
  assert!(ep.reactor.poll_in());
}

#[test]
fn v2_peer_negotiation_downgrades_and_delivers_identity() {
  common::init_tracing();
  let mut ep = Endpoint::new(options(SocketType::Pub));
  ep.plug();
  let _signature = ep.pump_out();

  // Peer: signature, revision 1 (ZMTP 2.0), socket type, then its identity
  // message in v2 framing, all in one burst.
  let mut peer = vec![0xFF, 0, 0, 0, 0, 0, 0, 0, 3, 0x7F, 0x01, 0x02];
  peer.extend_from_slice(&[0x00, 0x02, b'i', b'd']);
  ep.feed(&peer);

  assert!(!ep.engine.is_handshaking());
  assert_eq!(ep.engine.zmtp_version(), Some(ZmtpVersion::V2));
  {
    let state = ep.session.state();
    let (_, version) = state.handshaken.clone().expect("handshake event");
    assert_eq!(version, ZmtpVersion::V2);
    assert_eq!(state.pushed.len(), 1);
    assert_eq!(state.pushed[0].data().unwrap(), b"id");
    assert!(state.pushed[0].is_identity());
  }

  // Our reply finishes the 12-byte greeting: revision octet, then socket
  // type; the empty identity message follows in v2 framing.
  let sent = ep.pump_out();
  assert_eq!(&sent[..2], &[0x03, SocketType::Pub.code()]);
  assert_eq!(&sent[2..4], &[0x00, 0x00]);
}

#[test]
fn v1_peer_negotiation_uses_v1_framing() {
  common::init_tracing();
  let mut ep = Endpoint::new(options(SocketType::Dealer));
  ep.plug();
  let _ = ep.pump_out();

  // Revision 0 peer; identity "ab" in v1 framing: length 3, flags, body.
  let mut peer = vec![0xFF, 0, 0, 0, 0, 0, 0, 0, 3, 0x7F, 0x00, 0x05];
  peer.extend_from_slice(&[0x03, 0x00, b'a', b'b']);
  ep.feed(&peer);

  assert_eq!(ep.engine.zmtp_version(), Some(ZmtpVersion::V1));
  let payloads = ep.session.pushed_payloads();
  assert_eq!(payloads, vec![b"ab".to_vec()]);
}

#[test]
fn partial_v3_greeting_does_not_commit() {
  common::init_tracing();
  let mut ep = Endpoint::new(options(SocketType::Dealer));
  ep.plug();
  let _ = ep.pump_out();

  // Nine bytes: everything but the final signature octet.
  ep.feed(&[0xFF, 0, 0, 0, 0, 0, 0, 0, 1]);
  assert!(ep.engine.is_handshaking());
  assert_eq!(ep.engine.zmtp_version(), None);
  assert!(ep.session.state().handshaken.is_none());

  // The rest of a v3 greeting makes it commit.
  let full = common::v3_greeting("NULL", false);
  ep.feed(&full[9..]);
  assert!(!ep.engine.is_handshaking());
  assert_eq!(ep.engine.zmtp_version(), Some(ZmtpVersion::V3));
}

#[test]
fn tenth_byte_with_clear_bit_commits_to_v0() {
  common::init_tracing();
  let mut ep = Endpoint::new(options(SocketType::Dealer));
  ep.plug();
  let _ = ep.pump_out();

  // A large v0 identity uses the escaped header: 0xFF, 8-byte length, then
  // a flags octet with bit 0 clear, which is the version tell.
  let identity = vec![0x55u8; 255];
  let mut header = vec![0xFF];
  header.extend_from_slice(&256u64.to_be_bytes());
  assert_eq!(header.len(), 9);
  header.push(0x00); // flags octet of the identity frame

  ep.feed(&header);
  assert!(!ep.engine.is_handshaking());
  assert_eq!(ep.engine.zmtp_version(), Some(ZmtpVersion::V0));

  // The identity body still decodes through the v1 decoder.
  ep.feed(&identity);
  let payloads = ep.session.pushed_payloads();
  assert_eq!(payloads, vec![identity]);
}

#[test]
fn v0_peer_of_a_pub_socket_gets_a_phantom_subscription() {
  common::init_tracing();
  let mut options = options(SocketType::Pub);
  options.identity = zmtp_engine::Blob::from(b"me".to_vec());
  let mut ep = Endpoint::new(options);
  ep.plug();

  let sent = ep.pump_out();
  assert_eq!(sent, [0xFF, 0, 0, 0, 0, 0, 0, 0, 3, 0x7F]);

  // Unversioned peer: its first bytes are a short identity message.
  ep.feed(&[0x01, 0x00]);
  assert_eq!(ep.engine.zmtp_version(), Some(ZmtpVersion::V0));

  // The peer's identity is delivered, then the injected subscribe-to-all,
  // so a v0 SUB peer receives publishes.
  {
    let state = ep.session.state();
    assert_eq!(state.pushed.len(), 2);
    assert!(state.pushed[0].is_identity());
    assert_eq!(state.pushed[0].size(), 0);
    assert_eq!(state.pushed[1].data().unwrap(), &[1]);
  }

  // Our identity body follows the already-sent header on the wire.
  let sent = ep.pump_out();
  assert_eq!(&sent[..2], b"me");
}

#[test]
fn unversioned_peer_is_rejected_when_zap_is_enabled() {
  common::init_tracing();
  let mut ep = Endpoint::new(options(SocketType::Dealer));
  ep.session.state().zap_enabled = true;
  ep.plug();
  let _ = ep.pump_out();

  ep.feed(&[0x02, 0x00, b'x']); // no signature: a v0 peer
  assert_eq!(ep.session.state().errors, vec![(false, ErrorReason::Protocol)]);
  assert!(ep.session.state().disconnected);
  assert!(!ep.engine.is_plugged());
}

#[test]
fn mechanism_mismatch_fails_the_handshake() {
  common::init_tracing();
  let mut ep = Endpoint::new(options(SocketType::Dealer)); // expects NULL
  ep.plug();
  let _ = ep.pump_out();

  ep.feed(&common::v3_greeting("CURVE", true));
  let state = ep.session.state();
  assert_eq!(state.errors, vec![(false, ErrorReason::Protocol)]);
  assert!(state
    .failure_codes
    .contains(&zmtp_engine::protocol::failure::ZMTP_MECHANISM_MISMATCH));
}

#[test]
fn silent_peer_times_out_exactly_once() {
  common::init_tracing();
  let mut options = options(SocketType::Dealer);
  options.handshake_ivl = Some(std::time::Duration::from_millis(100));
  let mut ep = Endpoint::new(options);
  ep.plug();
  let _ = ep.pump_out();

  assert!(ep.reactor.armed(TimerId::Handshake).is_some());
  let reactor = ep.reactor.clone();
  reactor.fire(&mut ep.engine, TimerId::Handshake);

  assert_eq!(ep.session.state().errors, vec![(false, ErrorReason::Timeout)]);
  assert!(!ep.engine.is_plugged());
}
