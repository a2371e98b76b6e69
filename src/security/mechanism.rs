use crate::error::ZmqError;
use crate::message::{metadata, Blob, Metadata, Msg, MsgFlags};
use crate::options::EngineOptions;
use crate::protocol::command::{self, put_short_string};
use crate::protocol::failure;
use crate::security::curve::{CurveClientMechanism, CurveServerMechanism};
use crate::security::null::NullMechanism;
use crate::security::plain::PlainMechanism;
use crate::session::Session;
use bytes::BytesMut;

/// Observable state of a security mechanism handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MechanismStatus {
  Handshaking,
  Ready,
  Error,
}

/// Whether a full ZAP reply has been consumed or reading would block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ZapReplyOutcome {
  Complete,
  WouldBlock,
}

/// State shared by every mechanism variant: configuration, the identities
/// and properties established by the handshake, and the ZAP exchange.
#[derive(Debug)]
pub(crate) struct MechanismBase {
  pub(crate) options: EngineOptions,
  pub(crate) endpoint: String,
  pub(crate) peer_address: Option<String>,
  pub(crate) peer_identity: Option<Blob>,
  pub(crate) user_id: Option<Blob>,
  /// Properties received from the ZAP authenticator.
  pub(crate) zap_properties: Metadata,
  /// Properties received from the ZMTP peer.
  pub(crate) zmtp_properties: Metadata,
  /// Status code of the last ZAP reply.
  pub(crate) status_code: Option<String>,
  /// Partially collected ZAP reply frames.
  zap_reply: Vec<Msg>,
}

impl MechanismBase {
  pub(crate) fn new(options: EngineOptions, endpoint: String, peer_address: Option<String>) -> Self {
    Self {
      options,
      endpoint,
      peer_address,
      peer_identity: None,
      user_id: None,
      zap_properties: Metadata::new(),
      zmtp_properties: Metadata::new(),
      status_code: None,
      zap_reply: Vec::new(),
    }
  }

  /// Properties this side announces in its READY (or INITIATE) metadata.
  pub(crate) fn announce_metadata(&self) -> Metadata {
    let mut meta = Metadata::new();
    meta.set(metadata::SOCKET_TYPE, self.options.socket_type.name().as_bytes().to_vec());
    if self.options.socket_type.sends_identity() {
      meta.set(metadata::IDENTITY, self.options.identity.to_vec());
    }
    meta
  }

  /// Parses handshake metadata sent by the peer, enforcing socket-type
  /// pairing and capturing the identity when configured to.
  pub(crate) fn parse_peer_metadata(&mut self, session: &mut dyn Session, data: &[u8]) -> Result<(), ZmqError> {
    let mut parsed = Metadata::new();
    if let Err(e) = parsed.parse(data) {
      session.event_handshake_failed_protocol(&self.endpoint, failure::ZMTP_MALFORMED_COMMAND_UNSPECIFIED);
      return Err(e);
    }

    if let Some(peer_type) = parsed.get(metadata::SOCKET_TYPE) {
      let peer_type = std::str::from_utf8(peer_type).unwrap_or("");
      if !self.options.socket_type.compatible_with(peer_type) {
        session.event_handshake_failed_protocol(&self.endpoint, failure::ZMTP_UNSPECIFIED);
        return Err(ZmqError::ProtocolViolation(format!(
          "Socket type {} is not compatible with peer {}",
          self.options.socket_type.name(),
          peer_type
        )));
      }
    }
    if self.options.recv_identity {
      if let Some(identity) = parsed.get(metadata::IDENTITY) {
        self.peer_identity = Some(Blob::from(identity.to_vec()));
      }
    }
    self.zmtp_properties.merge(&parsed);
    Ok(())
  }

  fn set_user_id(&mut self, data: &[u8]) {
    self.user_id = Some(Blob::from(data.to_vec()));
    self.zap_properties.set(metadata::USER_ID, data.to_vec());
  }

  /// Builds an `ERROR` handshake command with an optional 3-byte status.
  pub(crate) fn error_command(&self, status_code: Option<&str>) -> Msg {
    let status = status_code.unwrap_or("");
    let mut body = BytesMut::with_capacity(1 + command::CMD_ERROR.len() + 1 + status.len());
    put_short_string(&mut body, command::CMD_ERROR);
    put_short_string(&mut body, status.as_bytes());
    let mut msg = Msg::from_bytes(body.freeze());
    msg.set_flags(MsgFlags::COMMAND);
    msg
  }

  /// Parses a peer `ERROR` command body, returning the status code.
  pub(crate) fn parse_error_command(&mut self, session: &mut dyn Session, body: &[u8]) -> Result<String, ZmqError> {
    // Body: %x05 "ERROR" reason-length reason
    if body.len() < 7 && body.len() != 6 {
      session.event_handshake_failed_protocol(&self.endpoint, failure::ZMTP_MALFORMED_COMMAND_ERROR);
      return Err(ZmqError::ProtocolViolation("Malformed ERROR command".into()));
    }
    if body.len() >= 7 {
      let reason_len = body[6] as usize;
      if reason_len > body.len() - 7 {
        session.event_handshake_failed_protocol(&self.endpoint, failure::ZMTP_MALFORMED_COMMAND_ERROR);
        return Err(ZmqError::ProtocolViolation("Malformed ERROR command".into()));
      }
      return Ok(String::from_utf8_lossy(&body[7..7 + reason_len]).into_owned());
    }
    Ok(String::new())
  }

  // --- ZAP (RFC 27) ---

  /// Writes a ZAP request: delimiter, version, request id, domain, peer
  /// address, identity, mechanism name, then the credential frames.
  pub(crate) fn send_zap_request(
    &self,
    session: &mut dyn Session,
    mechanism_name: &str,
    credentials: &[&[u8]],
  ) -> Result<(), ZmqError> {
    let peer_address = self.peer_address.clone().unwrap_or_default();
    let mut frames: Vec<Vec<u8>> = vec![
      Vec::new(),
      b"1.0".to_vec(),
      b"1".to_vec(),
      self.options.zap_domain.as_bytes().to_vec(),
      peer_address.into_bytes(),
      self.options.identity.to_vec(),
      mechanism_name.as_bytes().to_vec(),
    ];
    for credential in credentials {
      frames.push(credential.to_vec());
    }

    let last = frames.len() - 1;
    for (idx, frame) in frames.into_iter().enumerate() {
      let mut msg = Msg::from_vec(frame);
      if idx < last {
        msg.set_flags(MsgFlags::MORE);
      }
      session.write_zap_msg(msg)?;
    }
    Ok(())
  }

  /// Drains the 7-frame ZAP reply, buffering across calls so the synchronous
  /// and deferred (`zap_msg_available`) paths share one code path.
  pub(crate) fn receive_and_process_zap_reply(
    &mut self,
    session: &mut dyn Session,
  ) -> Result<ZapReplyOutcome, ZmqError> {
    while self.zap_reply.len() < 7 {
      let msg = match session.read_zap_msg()? {
        Some(msg) => msg,
        None => return Ok(ZapReplyOutcome::WouldBlock),
      };
      let expect_more = self.zap_reply.len() < 6;
      if msg.is_more() != expect_more {
        session.event_handshake_failed_protocol(&self.endpoint, failure::ZAP_MALFORMED_REPLY);
        return Err(ZmqError::ProtocolViolation("Malformed ZAP reply framing".into()));
      }
      self.zap_reply.push(msg);
    }
    let reply = std::mem::take(&mut self.zap_reply);

    if reply[0].size() != 0 {
      session.event_handshake_failed_protocol(&self.endpoint, failure::ZAP_UNSPECIFIED);
      return Err(ZmqError::ProtocolViolation("ZAP reply missing delimiter".into()));
    }
    if reply[1].data() != Some(&b"1.0"[..]) {
      session.event_handshake_failed_protocol(&self.endpoint, failure::ZAP_BAD_VERSION);
      return Err(ZmqError::ProtocolViolation("Bad ZAP version".into()));
    }
    if reply[2].data() != Some(&b"1"[..]) {
      session.event_handshake_failed_protocol(&self.endpoint, failure::ZAP_BAD_REQUEST_ID);
      return Err(ZmqError::ProtocolViolation("Bad ZAP request id".into()));
    }
    if reply[3].size() != 3 {
      session.event_handshake_failed_protocol(&self.endpoint, failure::ZAP_INVALID_STATUS_CODE);
      return Err(ZmqError::ProtocolViolation("Invalid ZAP status code".into()));
    }

    self.status_code = Some(String::from_utf8_lossy(reply[3].data().unwrap_or(&[])).into_owned());
    self.set_user_id(reply[5].data().unwrap_or(&[]));
    if let Err(e) = self.zap_properties.parse(reply[6].data().unwrap_or(&[])) {
      session.event_handshake_failed_protocol(&self.endpoint, failure::ZAP_INVALID_METADATA);
      return Err(e);
    }
    tracing::debug!(
      endpoint = %self.endpoint,
      status = self.status_code.as_deref().unwrap_or(""),
      "Processed ZAP reply"
    );
    Ok(ZapReplyOutcome::Complete)
  }

  pub(crate) fn zap_allowed(&self) -> bool {
    self.status_code.as_deref() == Some("200")
  }
}

/// The security mechanism attached to one connection: a closed set of
/// variants, each carrying its own handshake state machine.
#[derive(Debug)]
pub enum SecurityMechanism {
  Null(NullMechanism),
  Plain(PlainMechanism),
  CurveServer(CurveServerMechanism),
  CurveClient(CurveClientMechanism),
}

impl SecurityMechanism {
  /// Instantiates the mechanism configured in `options` for this connection.
  pub fn create(
    options: &EngineOptions,
    endpoint: &str,
    peer_address: Option<String>,
  ) -> Result<Self, ZmqError> {
    let base = MechanismBase::new(options.clone(), endpoint.to_string(), peer_address);
    match options.mechanism {
      crate::options::MechanismKind::Null => Ok(Self::Null(NullMechanism::new(base))),
      crate::options::MechanismKind::Plain => Ok(Self::Plain(PlainMechanism::new(base))),
      crate::options::MechanismKind::Curve => {
        if options.as_server {
          Ok(Self::CurveServer(CurveServerMechanism::new(base)?))
        } else {
          Ok(Self::CurveClient(CurveClientMechanism::new(base)?))
        }
      }
      crate::options::MechanismKind::Gssapi => {
        Err(ZmqError::SecurityError("GSSAPI mechanism is not supported".into()))
      }
    }
  }

  pub fn status(&self) -> MechanismStatus {
    match self {
      Self::Null(m) => m.status(),
      Self::Plain(m) => m.status(),
      Self::CurveServer(m) => m.status(),
      Self::CurveClient(m) => m.status(),
    }
  }

  /// Produces the next handshake command to send, or `None` when the
  /// mechanism is waiting for the peer or the authenticator.
  pub fn next_handshake_command(&mut self, session: &mut dyn Session) -> Result<Option<Msg>, ZmqError> {
    match self {
      Self::Null(m) => m.next_handshake_command(session),
      Self::Plain(m) => m.next_handshake_command(session),
      Self::CurveServer(m) => m.next_handshake_command(session),
      Self::CurveClient(m) => m.next_handshake_command(session),
    }
  }

  /// Feeds a handshake command received from the peer into the state machine.
  pub fn process_handshake_command(&mut self, session: &mut dyn Session, msg: &Msg) -> Result<(), ZmqError> {
    match self {
      Self::Null(m) => m.process_handshake_command(session, msg),
      Self::Plain(m) => m.process_handshake_command(session, msg),
      Self::CurveServer(m) => m.process_handshake_command(session, msg),
      Self::CurveClient(m) => m.process_handshake_command(session, msg),
    }
  }

  /// Resumes a handshake stalled on `EXPECT_ZAP_REPLY`.
  pub fn zap_msg_available(&mut self, session: &mut dyn Session) -> Result<(), ZmqError> {
    match self {
      Self::Null(m) => m.zap_msg_available(session),
      Self::Plain(m) => m.zap_msg_available(session),
      Self::CurveServer(m) => m.zap_msg_available(session),
      Self::CurveClient(m) => m.zap_msg_available(session),
    }
  }

  /// Applies the data-phase transform to an outgoing message.
  pub fn encode(&mut self, msg: Msg) -> Result<Msg, ZmqError> {
    match self {
      Self::Null(_) | Self::Plain(_) => Ok(msg),
      Self::CurveServer(m) => m.encode(msg),
      Self::CurveClient(m) => m.encode(msg),
    }
  }

  /// Reverses the data-phase transform on an incoming message.
  pub fn decode(&mut self, session: &mut dyn Session, msg: Msg) -> Result<Msg, ZmqError> {
    match self {
      Self::Null(_) | Self::Plain(_) => Ok(msg),
      Self::CurveServer(m) => m.decode(session, msg),
      Self::CurveClient(m) => m.decode(session, msg),
    }
  }

  pub fn peer_identity(&self) -> Option<Blob> {
    self.base().peer_identity.clone()
  }

  /// The authenticated user id, pushed upstream as a CREDENTIAL frame.
  pub fn user_id(&self) -> Option<Blob> {
    self.base().user_id.clone()
  }

  pub fn zap_properties(&self) -> &Metadata {
    &self.base().zap_properties
  }

  pub fn zmtp_properties(&self) -> &Metadata {
    &self.base().zmtp_properties
  }

  fn base(&self) -> &MechanismBase {
    match self {
      Self::Null(m) => &m.base,
      Self::Plain(m) => &m.base,
      Self::CurveServer(m) => &m.base,
      Self::CurveClient(m) => &m.base,
    }
  }
}
