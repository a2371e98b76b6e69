use crate::error::ZmqError;
use crate::message::{Msg, MsgFlags};
use crate::protocol::command::{self, put_short_string};
use crate::protocol::failure;
use crate::security::curve::crypto;
use crate::security::mechanism::{MechanismBase, MechanismStatus, ZapReplyOutcome};
use crate::session::Session;
use bytes::{BufMut, BytesMut};
use zeroize::Zeroize;

/// CURVE server handshake states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
  ExpectHello,
  SendWelcome,
  ExpectInitiate,
  ExpectZapReply,
  SendReady,
  SendError,
  ErrorSent,
  Connected,
}

/// Server side of the CURVE mechanism (RFC 25/26).
///
/// Key vocabulary: `s` is our long-term secret, `(S', s')` our short-term
/// pair, `C` the client's long-term public key and `C'` its short-term
/// public key. The cookie lets the server stay stateless between HELLO and
/// INITIATE in the original design; here it authenticates the echo.
#[derive(Debug)]
pub struct CurveServerMechanism {
  pub(crate) base: MechanismBase,
  state: State,
  /// Outgoing short-nonce counter; READY consumes the first value.
  cn_nonce: u64,
  /// Last accepted peer short-nonce.
  cn_peer_nonce: u64,
  secret_key: [u8; 32],
  cn_public: [u8; 32],
  cn_secret: [u8; 32],
  cn_client: [u8; 32],
  /// Fresh symmetric key for this connection's cookie.
  cookie_key: [u8; 32],
  /// Precomputed (C', s') key for READY and the data phase.
  cn_precom: [u8; 32],
}

impl CurveServerMechanism {
  pub const NAME: &'static str = "CURVE";

  pub(crate) fn new(base: MechanismBase) -> Result<Self, ZmqError> {
    let secret_key = base
      .options
      .curve_secret_key
      .ok_or_else(|| ZmqError::SecurityError("CURVE server requires a secret key".into()))?;
    let (cn_public, cn_secret) = crypto::keypair();
    Ok(Self {
      base,
      state: State::ExpectHello,
      cn_nonce: 1,
      cn_peer_nonce: 1,
      secret_key,
      cn_public,
      cn_secret,
      cn_client: [0u8; 32],
      cookie_key: [0u8; 32],
      cn_precom: [0u8; 32],
    })
  }

  pub fn status(&self) -> MechanismStatus {
    match self.state {
      State::Connected => MechanismStatus::Ready,
      State::ErrorSent => MechanismStatus::Error,
      _ => MechanismStatus::Handshaking,
    }
  }

  pub(crate) fn next_handshake_command(&mut self, _session: &mut dyn Session) -> Result<Option<Msg>, ZmqError> {
    match self.state {
      State::SendWelcome => {
        let msg = self.produce_welcome();
        self.state = State::ExpectInitiate;
        Ok(Some(msg))
      }
      State::SendReady => {
        let msg = self.produce_ready();
        self.state = State::Connected;
        Ok(Some(msg))
      }
      State::SendError => {
        let status = self.base.status_code.clone();
        self.state = State::ErrorSent;
        Ok(Some(self.base.error_command(status.as_deref())))
      }
      _ => Ok(None),
    }
  }

  pub(crate) fn process_handshake_command(&mut self, session: &mut dyn Session, msg: &Msg) -> Result<(), ZmqError> {
    match self.state {
      State::ExpectHello => self.process_hello(session, msg),
      State::ExpectInitiate => self.process_initiate(session, msg),
      _ => {
        session.event_handshake_failed_protocol(&self.base.endpoint, failure::ZMTP_UNSPECIFIED);
        Err(ZmqError::ProtocolViolation("Command out of CURVE handshake sequence".into()))
      }
    }
  }

  fn process_hello(&mut self, session: &mut dyn Session, msg: &Msg) -> Result<(), ZmqError> {
    let body = msg.data().unwrap_or(&[]);
    if !command::is_command(body, command::CMD_HELLO) {
      session.event_handshake_failed_protocol(&self.base.endpoint, failure::ZMTP_UNEXPECTED_COMMAND);
      return Err(ZmqError::ProtocolViolation("Expected HELLO command".into()));
    }
    if body.len() != 200 {
      session.event_handshake_failed_protocol(&self.base.endpoint, failure::ZMTP_MALFORMED_COMMAND_HELLO);
      return Err(ZmqError::ProtocolViolation("HELLO command must be 200 bytes".into()));
    }
    if body[6] != 1 || body[7] != 0 {
      session.event_handshake_failed_protocol(&self.base.endpoint, failure::ZMTP_MALFORMED_COMMAND_HELLO);
      return Err(ZmqError::ProtocolViolation("Unsupported CURVE version in HELLO".into()));
    }

    self.cn_client.copy_from_slice(&body[80..112]);
    let nonce_tail: [u8; 8] = body[112..120].try_into().unwrap();
    self.cn_peer_nonce = u64::from_be_bytes(nonce_tail);
    let hello_nonce = crypto::counter_nonce(b"CurveZMQHELLO---", &nonce_tail);

    // Open the 64-byte zero block [64 * %x0](C' -> S).
    match crypto::open(&body[120..200], &hello_nonce, &self.cn_client, &self.secret_key) {
      Ok(_) => {
        tracing::debug!(client_short_key = %hex::encode(&self.cn_client[..4]), "CURVE server accepted HELLO");
        self.state = State::SendWelcome;
        Ok(())
      }
      Err(_) => {
        // An attacker who cannot produce the box gets an ERROR frame with no
        // status, then the connection dies as a protocol failure.
        session.event_handshake_failed_protocol(&self.base.endpoint, failure::ZMTP_CRYPTOGRAPHIC);
        self.base.status_code = None;
        self.state = State::SendError;
        Ok(())
      }
    }
  }

  fn produce_welcome(&mut self) -> Msg {
    // cookie = secretbox[C' + s'](t) under a key freshly drawn per connection
    let cookie_nonce_tail = crypto::random::<16>();
    let mut cookie_plaintext = [0u8; 64];
    cookie_plaintext[..32].copy_from_slice(&self.cn_client);
    cookie_plaintext[32..].copy_from_slice(&self.cn_secret);
    self.cookie_key = crypto::random::<32>();
    let cookie_box = crypto::secretbox_seal(
      &cookie_plaintext,
      &crypto::random_nonce(b"COOKIE--", &cookie_nonce_tail),
      &self.cookie_key,
    );
    cookie_plaintext.zeroize();
    debug_assert_eq!(cookie_box.len(), 80);

    // welcome = Box[S' + cookie](S -> C')
    let mut welcome_plaintext = Vec::with_capacity(128);
    welcome_plaintext.extend_from_slice(&self.cn_public);
    welcome_plaintext.extend_from_slice(&cookie_nonce_tail);
    welcome_plaintext.extend_from_slice(&cookie_box);

    let welcome_nonce_tail = crypto::random::<16>();
    let welcome_box = crypto::seal(
      &welcome_plaintext,
      &crypto::random_nonce(b"WELCOME-", &welcome_nonce_tail),
      &self.cn_client,
      &self.secret_key,
    );
    debug_assert_eq!(welcome_box.len(), 144);

    let mut body = BytesMut::with_capacity(168);
    put_short_string(&mut body, command::CMD_WELCOME);
    body.put_slice(&welcome_nonce_tail);
    body.put_slice(&welcome_box);
    debug_assert_eq!(body.len(), 168);

    let mut msg = Msg::from_bytes(body.freeze());
    msg.set_flags(MsgFlags::COMMAND);
    msg
  }

  fn process_initiate(&mut self, session: &mut dyn Session, msg: &Msg) -> Result<(), ZmqError> {
    let body = msg.data().unwrap_or(&[]);
    if !command::is_command(body, command::CMD_INITIATE) {
      session.event_handshake_failed_protocol(&self.base.endpoint, failure::ZMTP_UNEXPECTED_COMMAND);
      return Err(ZmqError::ProtocolViolation("Expected INITIATE command".into()));
    }
    if body.len() < 257 {
      session.event_handshake_failed_protocol(&self.base.endpoint, failure::ZMTP_MALFORMED_COMMAND_INITIATE);
      return Err(ZmqError::ProtocolViolation("INITIATE command too short".into()));
    }

    // Re-open the cookie: proves the INITIATE answers our own WELCOME.
    let cookie_nonce_tail: [u8; 16] = body[9..25].try_into().unwrap();
    let cookie_plaintext = crypto::secretbox_open(
      &body[25..105],
      &crypto::random_nonce(b"COOKIE--", &cookie_nonce_tail),
      &self.cookie_key,
    )
    .map_err(|_| {
      session.event_handshake_failed_protocol(&self.base.endpoint, failure::ZMTP_CRYPTOGRAPHIC);
      ZmqError::ProtocolViolation("INITIATE cookie does not open".into())
    })?;
    if cookie_plaintext[..32] != self.cn_client || cookie_plaintext[32..] != self.cn_secret {
      session.event_handshake_failed_protocol(&self.base.endpoint, failure::ZMTP_CRYPTOGRAPHIC);
      return Err(ZmqError::ProtocolViolation("INITIATE cookie contents differ".into()));
    }

    let nonce_tail: [u8; 8] = body[105..113].try_into().unwrap();
    self.cn_peer_nonce = u64::from_be_bytes(nonce_tail);
    let initiate_nonce = crypto::counter_nonce(b"CurveZMQINITIATE", &nonce_tail);

    // Open Box[C + vouch + metadata](C' -> S').
    let initiate_plaintext = crypto::open(&body[113..], &initiate_nonce, &self.cn_client, &self.cn_secret)
      .map_err(|_| {
        session.event_handshake_failed_protocol(&self.base.endpoint, failure::ZMTP_CRYPTOGRAPHIC);
        ZmqError::ProtocolViolation("INITIATE box does not open".into())
      })?;
    debug_assert!(initiate_plaintext.len() >= 128);

    let mut client_key = [0u8; 32];
    client_key.copy_from_slice(&initiate_plaintext[..32]);
    let vouch_nonce_tail: [u8; 16] = initiate_plaintext[32..48].try_into().unwrap();

    // Open the vouch Box[C' + S](C -> s') and check it names C'.
    let vouch_plaintext = crypto::open(
      &initiate_plaintext[48..128],
      &crypto::random_nonce(b"VOUCH---", &vouch_nonce_tail),
      &client_key,
      &self.cn_secret,
    )
    .map_err(|_| {
      session.event_handshake_failed_protocol(&self.base.endpoint, failure::ZMTP_CRYPTOGRAPHIC);
      ZmqError::ProtocolViolation("INITIATE vouch does not open".into())
    })?;
    if vouch_plaintext[..32] != self.cn_client {
      session.event_handshake_failed_protocol(&self.base.endpoint, failure::ZMTP_KEY_EXCHANGE);
      return Err(ZmqError::ProtocolViolation("Vouch does not authorize the short-term key".into()));
    }

    // Connection key for READY and the data phase.
    self.cn_precom = crypto::precompute(&self.cn_client, &self.cn_secret);

    // ZAP (RFC 27) authentication of the client's long-term key.
    match session.zap_connect() {
      Ok(()) => {
        self.base.send_zap_request(session, Self::NAME, &[client_key.as_slice()])?;
        match self.base.receive_and_process_zap_reply(session)? {
          ZapReplyOutcome::Complete => {
            self.state = if self.base.zap_allowed() {
              State::SendReady
            } else {
              State::SendError
            };
          }
          ZapReplyOutcome::WouldBlock => self.state = State::ExpectZapReply,
        }
      }
      Err(_) => self.state = State::SendReady,
    }

    self.base.parse_peer_metadata(session, &initiate_plaintext[128..])?;
    tracing::debug!(
      client_key = %hex::encode(&client_key[..4]),
      state = ?self.state,
      "CURVE server processed INITIATE"
    );
    Ok(())
  }

  fn produce_ready(&mut self) -> Msg {
    let mut metadata = BytesMut::new();
    self.base.announce_metadata().encode(&mut metadata);

    let nonce_tail = self.cn_nonce.to_be_bytes();
    let ready_box = crypto::seal_afternm(
      &metadata,
      &crypto::counter_nonce(b"CurveZMQREADY---", &nonce_tail),
      &self.cn_precom,
    );

    let mut body = BytesMut::with_capacity(14 + ready_box.len());
    put_short_string(&mut body, command::CMD_READY);
    body.put_slice(&nonce_tail);
    body.put_slice(&ready_box);
    self.cn_nonce += 1;

    let mut msg = Msg::from_bytes(body.freeze());
    msg.set_flags(MsgFlags::COMMAND);
    msg
  }

  pub(crate) fn zap_msg_available(&mut self, session: &mut dyn Session) -> Result<(), ZmqError> {
    if self.state != State::ExpectZapReply {
      return Err(ZmqError::ProtocolViolation("Unexpected ZAP reply".into()));
    }
    match self.base.receive_and_process_zap_reply(session)? {
      ZapReplyOutcome::Complete => {
        self.state = if self.base.zap_allowed() {
          State::SendReady
        } else {
          State::SendError
        };
        Ok(())
      }
      ZapReplyOutcome::WouldBlock => Ok(()),
    }
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
      &crypto::counter_nonce(b"CurveZMQMESSAGES", &nonce_tail),
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
      &crypto::counter_nonce(b"CurveZMQMESSAGEC", &nonce_tail),
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

impl Drop for CurveServerMechanism {
  fn drop(&mut self) {
    self.secret_key.zeroize();
    self.cn_secret.zeroize();
    self.cookie_key.zeroize();
    self.cn_precom.zeroize();
  }
}
