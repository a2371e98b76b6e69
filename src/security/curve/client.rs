use crate::error::ZmqError;
use crate::message::{Msg, MsgFlags};
use crate::protocol::command::{self, put_short_string};
use crate::protocol::failure;
use crate::security::curve::crypto;
use crate::security::mechanism::{MechanismBase, MechanismStatus};
use crate::session::Session;
use bytes::{BufMut, BytesMut};
use zeroize::Zeroize;

/// CURVE client handshake states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
  SendHello,
  ExpectWelcome,
  SendInitiate,
  ExpectReady,
  Connected,
  ErrorReceived,
}

/// Client side of the CURVE mechanism.
///
/// Knows the server long-term key `S` up front; learns `S'` from WELCOME and
/// vouches for its own short-term key `C'` with its long-term pair `(C, c)`.
#[derive(Debug)]
pub struct CurveClientMechanism {
  pub(crate) base: MechanismBase,
  state: State,
  /// Outgoing short-nonce counter; HELLO consumes 1, INITIATE 2.
  cn_nonce: u64,
  /// Last seen server short-nonce (READY, then MESSAGE frames).
  cn_peer_nonce: u64,
  public_key: [u8; 32],
  secret_key: [u8; 32],
  server_key: [u8; 32],
  cn_public: [u8; 32],
  cn_secret: [u8; 32],
  cn_server: [u8; 32],
  /// Cookie from WELCOME (nonce tail + box), echoed verbatim in INITIATE.
  cn_cookie: [u8; 96],
  cn_precom: [u8; 32],
}

impl CurveClientMechanism {
  pub const NAME: &'static str = "CURVE";

  pub(crate) fn new(base: MechanismBase) -> Result<Self, ZmqError> {
    let missing = || ZmqError::SecurityError("CURVE client requires its key pair and the server key".into());
    let public_key = base.options.curve_public_key.ok_or_else(missing)?;
    let secret_key = base.options.curve_secret_key.ok_or_else(missing)?;
    let server_key = base.options.curve_server_key.ok_or_else(missing)?;
    let (cn_public, cn_secret) = crypto::keypair();
    Ok(Self {
      base,
      state: State::SendHello,
      cn_nonce: 1,
      cn_peer_nonce: 0,
      public_key,
      secret_key,
      server_key,
      cn_public,
      cn_secret,
      cn_server: [0u8; 32],
      cn_cookie: [0u8; 96],
      cn_precom: [0u8; 32],
    })
  }

  pub fn status(&self) -> MechanismStatus {
    match self.state {
      State::Connected => MechanismStatus::Ready,
      State::ErrorReceived => MechanismStatus::Error,
      _ => MechanismStatus::Handshaking,
    }
  }

  pub(crate) fn next_handshake_command(&mut self, _session: &mut dyn Session) -> Result<Option<Msg>, ZmqError> {
    match self.state {
      State::SendHello => {
        let msg = self.produce_hello();
        self.state = State::ExpectWelcome;
        Ok(Some(msg))
      }
      State::SendInitiate => {
        let msg = self.produce_initiate();
        self.state = State::ExpectReady;
        Ok(Some(msg))
      }
      _ => Ok(None),
    }
  }

  pub(crate) fn process_handshake_command(&mut self, session: &mut dyn Session, msg: &Msg) -> Result<(), ZmqError> {
    let body = msg.data().unwrap_or(&[]);
    match self.state {
      State::ExpectWelcome if command::is_command(body, command::CMD_WELCOME) => self.process_welcome(session, body),
      State::ExpectReady if command::is_command(body, command::CMD_READY) => self.process_ready(session, body),
      State::ExpectWelcome | State::ExpectReady if command::is_command(body, command::CMD_ERROR) => {
        let status = self.base.parse_error_command(session, body)?;
        tracing::debug!(status = %status, "CURVE server refused the connection");
        self.state = State::ErrorReceived;
        Ok(())
      }
      _ => {
        session.event_handshake_failed_protocol(&self.base.endpoint, failure::ZMTP_UNEXPECTED_COMMAND);
        Err(ZmqError::ProtocolViolation("Command out of CURVE handshake sequence".into()))
      }
    }
  }

  fn produce_hello(&mut self) -> Msg {
    let nonce_tail = self.cn_nonce.to_be_bytes();
    // Box[64 * %x0](C' -> S): proves possession of c', pads against
    // amplification.
    let hello_box = crypto::seal(
      &[0u8; 64],
      &crypto::counter_nonce(b"CurveZMQHELLO---", &nonce_tail),
      &self.server_key,
      &self.cn_secret,
    );
    self.cn_nonce += 1;
    debug_assert_eq!(hello_box.len(), 80);

    let mut body = BytesMut::with_capacity(200);
    put_short_string(&mut body, command::CMD_HELLO);
    body.put_u8(1); // major version
    body.put_u8(0); // minor version
    body.put_bytes(0, 72);
    body.put_slice(&self.cn_public);
    body.put_slice(&nonce_tail);
    body.put_slice(&hello_box);
    debug_assert_eq!(body.len(), 200);

    let mut msg = Msg::from_bytes(body.freeze());
    msg.set_flags(MsgFlags::COMMAND);
    msg
  }

  fn process_welcome(&mut self, session: &mut dyn Session, body: &[u8]) -> Result<(), ZmqError> {
    if body.len() != 168 {
      session.event_handshake_failed_protocol(&self.base.endpoint, failure::ZMTP_MALFORMED_COMMAND_WELCOME);
      return Err(ZmqError::ProtocolViolation("WELCOME command must be 168 bytes".into()));
    }

    let nonce_tail: [u8; 16] = body[8..24].try_into().unwrap();
    let plaintext = crypto::open(
      &body[24..168],
      &crypto::random_nonce(b"WELCOME-", &nonce_tail),
      &self.server_key,
      &self.cn_secret,
    )
    .map_err(|_| {
      session.event_handshake_failed_protocol(&self.base.endpoint, failure::ZMTP_CRYPTOGRAPHIC);
      ZmqError::ProtocolViolation("WELCOME box does not open".into())
    })?;

    self.cn_server.copy_from_slice(&plaintext[..32]);
    self.cn_cookie.copy_from_slice(&plaintext[32..128]);
    self.cn_precom = crypto::precompute(&self.cn_server, &self.cn_secret);
    tracing::debug!(server_short_key = %hex::encode(&self.cn_server[..4]), "CURVE client processed WELCOME");
    self.state = State::SendInitiate;
    Ok(())
  }

  fn produce_initiate(&mut self) -> Msg {
    // vouch = Box[C' + S](C -> S')
    let vouch_nonce_tail = crypto::random::<16>();
    let mut vouch_plaintext = [0u8; 64];
    vouch_plaintext[..32].copy_from_slice(&self.cn_public);
    vouch_plaintext[32..].copy_from_slice(&self.server_key);
    let vouch_box = crypto::seal(
      &vouch_plaintext,
      &crypto::random_nonce(b"VOUCH---", &vouch_nonce_tail),
      &self.cn_server,
      &self.secret_key,
    );
    debug_assert_eq!(vouch_box.len(), 80);

    let mut metadata = BytesMut::new();
    self.base.announce_metadata().encode(&mut metadata);

    // Box[C + vouch + metadata](C' -> S')
    let mut plaintext = Vec::with_capacity(128 + metadata.len());
    plaintext.extend_from_slice(&self.public_key);
    plaintext.extend_from_slice(&vouch_nonce_tail);
    plaintext.extend_from_slice(&vouch_box);
    plaintext.extend_from_slice(&metadata);

    let nonce_tail = self.cn_nonce.to_be_bytes();
    let initiate_box = crypto::seal_afternm(
      &plaintext,
      &crypto::counter_nonce(b"CurveZMQINITIATE", &nonce_tail),
      &self.cn_precom,
    );
    self.cn_nonce += 1;

    let mut body = BytesMut::with_capacity(113 + initiate_box.len());
    put_short_string(&mut body, command::CMD_INITIATE);
    body.put_slice(&self.cn_cookie);
    body.put_slice(&nonce_tail);
    body.put_slice(&initiate_box);
    debug_assert!(body.len() >= 257);

    let mut msg = Msg::from_bytes(body.freeze());
    msg.set_flags(MsgFlags::COMMAND);
    msg
  }

  fn process_ready(&mut self, session: &mut dyn Session, body: &[u8]) -> Result<(), ZmqError> {
    if body.len() < 30 {
      session.event_handshake_failed_protocol(&self.base.endpoint, failure::ZMTP_MALFORMED_COMMAND_READY);
      return Err(ZmqError::ProtocolViolation("READY command too short".into()));
    }

    let nonce_tail: [u8; 8] = body[6..14].try_into().unwrap();
    self.cn_peer_nonce = u64::from_be_bytes(nonce_tail);
    let plaintext = crypto::open_afternm(
      &body[14..],
      &crypto::counter_nonce(b"CurveZMQREADY---", &nonce_tail),
      &self.cn_precom,
    )
    .map_err(|_| {
      session.event_handshake_failed_protocol(&self.base.endpoint, failure::ZMTP_CRYPTOGRAPHIC);
      ZmqError::ProtocolViolation("READY box does not open".into())
    })?;

    self.base.parse_peer_metadata(session, &plaintext)?;
    self.state = State::Connected;
    tracing::debug!("CURVE client handshake complete");
    Ok(())
  }

  pub(crate) fn zap_msg_available(&mut self, _session: &mut dyn Session) -> Result<(), ZmqError> {
    // ZAP authenticates clients; there is nothing to resume on this side.
    Err(ZmqError::ProtocolViolation("Unexpected ZAP reply".into()))
  }

  /// Wraps one message into a `MESSAGE` frame for the data phase.
  pub(crate) fn encode(&mut self, msg: Msg) -> Result<Msg, ZmqError> {
    debug_assert_eq!(self.state, State::Connected);

    let mut flags = 0u8;
    if msg.is_more() {
      flags |= 0x01;
    }
    if msg.is_command() {
      flags |= 0x02;
    }

    let mut plaintext = Vec::with_capacity(1 + msg.size());
    plaintext.push(flags);
    plaintext.extend_from_slice(msg.data().unwrap_or(&[]));

    let nonce_tail = self.cn_nonce.to_be_bytes();
    let message_box = crypto::seal_afternm(
      &plaintext,
      &crypto::counter_nonce(b"CurveZMQMESSAGEC", &nonce_tail),
      &self.cn_precom,
    );
    self.cn_nonce += 1;

    let mut body = BytesMut::with_capacity(16 + message_box.len());
    put_short_string(&mut body, command::CMD_MESSAGE);
    body.put_slice(&nonce_tail);
    body.put_slice(&message_box);
    Ok(Msg::from_bytes(body.freeze()))
  }

  /// Unwraps one `MESSAGE` frame from the data phase.
  pub(crate) fn decode(&mut self, session: &mut dyn Session, msg: Msg) -> Result<Msg, ZmqError> {
    debug_assert_eq!(self.state, State::Connected);

    let body = msg.data().unwrap_or(&[]);
    if !command::is_command(body, command::CMD_MESSAGE) {
      session.event_handshake_failed_protocol(&self.base.endpoint, failure::ZMTP_UNEXPECTED_COMMAND);
      return Err(ZmqError::ProtocolViolation("Expected MESSAGE frame".into()));
    }
    if body.len() < 33 {
      session.event_handshake_failed_protocol(&self.base.endpoint, failure::ZMTP_MALFORMED_COMMAND_MESSAGE);
      return Err(ZmqError::ProtocolViolation("MESSAGE frame too short".into()));
    }

    let nonce_tail: [u8; 8] = body[8..16].try_into().unwrap();
    let nonce = u64::from_be_bytes(nonce_tail);
    if nonce <= self.cn_peer_nonce {
      session.event_handshake_failed_protocol(&self.base.endpoint, failure::ZMTP_INVALID_SEQUENCE);
      return Err(ZmqError::ProtocolViolation("MESSAGE nonce is not increasing".into()));
    }
    self.cn_peer_nonce = nonce;

    let plaintext = crypto::open_afternm(
      &body[16..],
      &crypto::counter_nonce(b"CurveZMQMESSAGES", &nonce_tail),
      &self.cn_precom,
    )
    .map_err(|_| {
      session.event_handshake_failed_protocol(&self.base.endpoint, failure::ZMTP_CRYPTOGRAPHIC);
      ZmqError::ProtocolViolation("MESSAGE box does not open".into())
    })?;

    let flags = plaintext[0];
    let mut decoded = Msg::from_vec(plaintext[1..].to_vec());
    let mut msg_flags = MsgFlags::empty();
    if (flags & 0x01) != 0 {
      msg_flags |= MsgFlags::MORE;
    }
    if (flags & 0x02) != 0 {
      msg_flags |= MsgFlags::COMMAND;
    }
    decoded.set_flags(msg_flags);
    Ok(decoded)
  }
}

impl Drop for CurveClientMechanism {
  fn drop(&mut self) {
    self.secret_key.zeroize();
    self.cn_secret.zeroize();
    self.cn_precom.zeroize();
  }
}
