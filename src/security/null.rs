use crate::error::ZmqError;
use crate::message::{Msg, MsgFlags};
use crate::protocol::command::{self, put_short_string};
use crate::protocol::failure;
use crate::security::mechanism::{MechanismBase, MechanismStatus, ZapReplyOutcome};
use crate::session::Session;
use bytes::BytesMut;

/// The NULL security mechanism: no credentials, no data-phase transform.
/// Both peers exchange READY commands carrying their metadata. A server with
/// a ZAP authenticator configured still authenticates the connection before
/// emitting its READY.
#[derive(Debug)]
pub struct NullMechanism {
  pub(crate) base: MechanismBase,
  ready_sent: bool,
  ready_received: bool,
  error_sent: bool,
  error_received: bool,
  zap_request_sent: bool,
  zap_done: bool,
}

impl NullMechanism {
  pub const NAME: &'static str = "NULL";

  pub(crate) fn new(base: MechanismBase) -> Self {
    Self {
      base,
      ready_sent: false,
      ready_received: false,
      error_sent: false,
      error_received: false,
      zap_request_sent: false,
      zap_done: false,
    }
  }

  pub fn status(&self) -> MechanismStatus {
    if self.ready_sent && self.ready_received {
      MechanismStatus::Ready
    } else if self.error_sent || self.error_received {
      MechanismStatus::Error
    } else {
      MechanismStatus::Handshaking
    }
  }

  pub(crate) fn next_handshake_command(&mut self, session: &mut dyn Session) -> Result<Option<Msg>, ZmqError> {
    if self.ready_sent || self.error_sent {
      return Ok(None);
    }

    if self.base.options.as_server && session.zap_enabled() && !self.zap_done {
      if !self.zap_request_sent {
        match session.zap_connect() {
          Ok(()) => {
            self.base.send_zap_request(session, Self::NAME, &[])?;
            self.zap_request_sent = true;
          }
          Err(_) => {
            // No authenticator reachable; proceed unauthenticated.
            self.zap_done = true;
          }
        }
      }
      if self.zap_request_sent && !self.zap_done {
        match self.base.receive_and_process_zap_reply(session)? {
          ZapReplyOutcome::Complete => self.zap_done = true,
          ZapReplyOutcome::WouldBlock => return Ok(None),
        }
      }
    }

    if self.zap_request_sent && !self.base.zap_allowed() {
      let status = self.base.status_code.clone();
      self.error_sent = true;
      tracing::debug!(status = status.as_deref().unwrap_or(""), "NULL server rejecting peer");
      return Ok(Some(self.base.error_command(status.as_deref())));
    }

    let mut body = BytesMut::new();
    put_short_string(&mut body, command::CMD_READY);
    self.base.announce_metadata().encode(&mut body);
    let mut msg = Msg::from_bytes(body.freeze());
    msg.set_flags(MsgFlags::COMMAND);
    self.ready_sent = true;
    Ok(Some(msg))
  }

  pub(crate) fn process_handshake_command(&mut self, session: &mut dyn Session, msg: &Msg) -> Result<(), ZmqError> {
    let body = msg.data().unwrap_or(&[]);
    if self.ready_received || self.error_received {
      session.event_handshake_failed_protocol(&self.base.endpoint, failure::ZMTP_UNEXPECTED_COMMAND);
      return Err(ZmqError::ProtocolViolation("Unexpected command after NULL handshake".into()));
    }

    if command::is_command(body, command::CMD_READY) {
      self.base.parse_peer_metadata(session, &body[1 + command::CMD_READY.len()..])?;
      self.ready_received = true;
      Ok(())
    } else if command::is_command(body, command::CMD_ERROR) {
      let status = self.base.parse_error_command(session, body)?;
      tracing::debug!(status = %status, "NULL peer reported handshake error");
      self.error_received = true;
      Ok(())
    } else {
      session.event_handshake_failed_protocol(&self.base.endpoint, failure::ZMTP_UNEXPECTED_COMMAND);
      Err(ZmqError::ProtocolViolation("Expected READY or ERROR command".into()))
    }
  }

  pub(crate) fn zap_msg_available(&mut self, session: &mut dyn Session) -> Result<(), ZmqError> {
    if !self.zap_request_sent || self.zap_done {
      return Err(ZmqError::ProtocolViolation("Unexpected ZAP reply".into()));
    }
    match self.base.receive_and_process_zap_reply(session)? {
      ZapReplyOutcome::Complete => {
        self.zap_done = true;
        Ok(())
      }
      ZapReplyOutcome::WouldBlock => Ok(()),
    }
  }
}
