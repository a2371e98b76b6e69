use crate::error::ZmqError;
use crate::message::{Msg, MsgFlags};
use crate::protocol::command::{self, put_short_string};
use crate::protocol::failure;
use crate::security::mechanism::{MechanismBase, MechanismStatus, ZapReplyOutcome};
use crate::session::Session;
use bytes::{Buf, BufMut, BytesMut};

/// State of the PLAIN handshake (RFC 27).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlainState {
  // Client side
  SendHello,
  ExpectWelcome,
  SendInitiate,
  ExpectReady,
  // Server side
  ExpectHello,
  SendWelcome,
  ExpectInitiate,
  SendReady,
  ExpectZapReply,
  SendError,
  // Terminal
  Connected,
  ErrorSent,
  ErrorReceived,
}

/// The PLAIN mechanism: username/password in clear text, no data-phase
/// transform. `HELLO -> WELCOME -> INITIATE -> READY`, with server-side ZAP
/// between HELLO and WELCOME.
#[derive(Debug)]
pub struct PlainMechanism {
  pub(crate) base: MechanismBase,
  state: PlainState,
  /// Credentials: the client's own, or those received from the peer.
  username: Vec<u8>,
  password: Vec<u8>,
}

impl PlainMechanism {
  pub const NAME: &'static str = "PLAIN";

  pub(crate) fn new(base: MechanismBase) -> Self {
    let is_server = base.options.as_server;
    let username = base.options.plain_username.clone().unwrap_or_default();
    let password = base.options.plain_password.clone().unwrap_or_default();
    Self {
      base,
      state: if is_server {
        PlainState::ExpectHello
      } else {
        PlainState::SendHello
      },
      username,
      password,
    }
  }

  pub fn status(&self) -> MechanismStatus {
    match self.state {
      PlainState::Connected => MechanismStatus::Ready,
      PlainState::ErrorSent | PlainState::ErrorReceived => MechanismStatus::Error,
      _ => MechanismStatus::Handshaking,
    }
  }

  /// Parses the HELLO body: `<user-len(1)><user><pass-len(1)><pass>`.
  fn parse_hello_body(body: &[u8]) -> Result<(Vec<u8>, Vec<u8>), ZmqError> {
    let mut cursor = body;
    if cursor.remaining() < 1 {
      return Err(ZmqError::SecurityError("PLAIN HELLO body too short".into()));
    }
    let user_len = cursor.get_u8() as usize;
    if cursor.remaining() < user_len + 1 {
      return Err(ZmqError::SecurityError("Invalid PLAIN HELLO username length".into()));
    }
    let username = cursor[..user_len].to_vec();
    cursor.advance(user_len);

    let pass_len = cursor.get_u8() as usize;
    if cursor.remaining() != pass_len {
      return Err(ZmqError::SecurityError("Invalid PLAIN HELLO password length".into()));
    }
    let password = cursor[..pass_len].to_vec();
    Ok((username, password))
  }

  fn command_with_metadata(&self, name: &[u8]) -> Msg {
    let mut body = BytesMut::new();
    put_short_string(&mut body, name);
    self.base.announce_metadata().encode(&mut body);
    let mut msg = Msg::from_bytes(body.freeze());
    msg.set_flags(MsgFlags::COMMAND);
    msg
  }

  /// ZAP decision after HELLO: authenticate when an authenticator is
  /// reachable, otherwise accept outright.
  fn authenticate(&mut self, session: &mut dyn Session) -> Result<(), ZmqError> {
    if !session.zap_enabled() {
      self.state = PlainState::SendWelcome;
      return Ok(());
    }
    match session.zap_connect() {
      Err(_) => {
        self.state = PlainState::SendWelcome;
        Ok(())
      }
      Ok(()) => {
        let (username, password) = (self.username.clone(), self.password.clone());
        self.base.send_zap_request(session, Self::NAME, &[username.as_slice(), password.as_slice()])?;
        match self.base.receive_and_process_zap_reply(session)? {
          ZapReplyOutcome::Complete => {
            self.state = if self.base.zap_allowed() {
              PlainState::SendWelcome
            } else {
              PlainState::SendError
            };
            Ok(())
          }
          ZapReplyOutcome::WouldBlock => {
            self.state = PlainState::ExpectZapReply;
            Ok(())
          }
        }
      }
    }
  }

  pub(crate) fn next_handshake_command(&mut self, _session: &mut dyn Session) -> Result<Option<Msg>, ZmqError> {
    match self.state {
      PlainState::SendHello => {
        let mut body = BytesMut::with_capacity(1 + command::CMD_HELLO.len() + 2 + self.username.len() + self.password.len());
        put_short_string(&mut body, command::CMD_HELLO);
        body.put_u8(self.username.len().min(255) as u8);
        body.put_slice(&self.username[..self.username.len().min(255)]);
        body.put_u8(self.password.len().min(255) as u8);
        body.put_slice(&self.password[..self.password.len().min(255)]);
        let mut msg = Msg::from_bytes(body.freeze());
        msg.set_flags(MsgFlags::COMMAND);
        self.state = PlainState::ExpectWelcome;
        tracing::debug!(mechanism = Self::NAME, "Client sending HELLO");
        Ok(Some(msg))
      }
      PlainState::SendWelcome => {
        let mut body = BytesMut::new();
        put_short_string(&mut body, command::CMD_WELCOME);
        let mut msg = Msg::from_bytes(body.freeze());
        msg.set_flags(MsgFlags::COMMAND);
        self.state = PlainState::ExpectInitiate;
        Ok(Some(msg))
      }
      PlainState::SendInitiate => {
        self.state = PlainState::ExpectReady;
        Ok(Some(self.command_with_metadata(command::CMD_INITIATE)))
      }
      PlainState::SendReady => {
        self.state = PlainState::Connected;
        Ok(Some(self.command_with_metadata(command::CMD_READY)))
      }
      PlainState::SendError => {
        let status = self.base.status_code.clone();
        self.state = PlainState::ErrorSent;
        Ok(Some(self.base.error_command(status.as_deref())))
      }
      _ => Ok(None),
    }
  }

  pub(crate) fn process_handshake_command(&mut self, session: &mut dyn Session, msg: &Msg) -> Result<(), ZmqError> {
    let body = msg.data().unwrap_or(&[]);
    match self.state {
      PlainState::ExpectHello if command::is_command(body, command::CMD_HELLO) => {
        let (username, password) = Self::parse_hello_body(&body[1 + command::CMD_HELLO.len()..]).map_err(|e| {
          session.event_handshake_failed_protocol(&self.base.endpoint, failure::ZMTP_MALFORMED_COMMAND_HELLO);
          e
        })?;
        tracing::debug!(mechanism = Self::NAME, user_len = username.len(), "Server received HELLO");
        self.username = username;
        self.password = password;
        self.authenticate(session)
      }
      PlainState::ExpectWelcome if command::is_command(body, command::CMD_WELCOME) => {
        self.state = PlainState::SendInitiate;
        Ok(())
      }
      PlainState::ExpectInitiate if command::is_command(body, command::CMD_INITIATE) => {
        self.base.parse_peer_metadata(session, &body[1 + command::CMD_INITIATE.len()..])?;
        self.state = PlainState::SendReady;
        Ok(())
      }
      PlainState::ExpectReady if command::is_command(body, command::CMD_READY) => {
        self.base.parse_peer_metadata(session, &body[1 + command::CMD_READY.len()..])?;
        self.state = PlainState::Connected;
        tracing::debug!(mechanism = Self::NAME, "Client handshake complete");
        Ok(())
      }
      PlainState::ExpectWelcome | PlainState::ExpectReady if command::is_command(body, command::CMD_ERROR) => {
        let status = self.base.parse_error_command(session, body)?;
        tracing::debug!(mechanism = Self::NAME, status = %status, "Peer reported handshake error");
        self.state = PlainState::ErrorReceived;
        Ok(())
      }
      _ => {
        session.event_handshake_failed_protocol(&self.base.endpoint, failure::ZMTP_UNEXPECTED_COMMAND);
        Err(ZmqError::ProtocolViolation("Unexpected PLAIN handshake command".into()))
      }
    }
  }

  pub(crate) fn zap_msg_available(&mut self, session: &mut dyn Session) -> Result<(), ZmqError> {
    if self.state != PlainState::ExpectZapReply {
      return Err(ZmqError::ProtocolViolation("Unexpected ZAP reply".into()));
    }
    match self.base.receive_and_process_zap_reply(session)? {
      ZapReplyOutcome::Complete => {
        self.state = if self.base.zap_allowed() {
          PlainState::SendWelcome
        } else {
          PlainState::SendError
        };
        Ok(())
      }
      ZapReplyOutcome::WouldBlock => Ok(()),
    }
  }
}
