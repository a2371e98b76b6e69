use crate::error::ZmqError;
use crate::message::{metadata, Metadata, Msg, MsgFlags};
use crate::options::EngineOptions;
use crate::protocol::codec::{Decoder, Encoder, RawDecoder, RawEncoder, V1Decoder, V1Encoder, V2Decoder, V2Encoder};
use crate::protocol::command;
use crate::protocol::failure;
use crate::protocol::greeting::{Greeting, SIGNATURE_SIZE, V2_GREETING_SIZE};
use crate::protocol::ZmtpVersion;
use crate::reactor::{Reactor, TimerId};
use crate::security::{MechanismStatus, SecurityMechanism};
use crate::session::{ErrorReason, PushError, Session};
use crate::transport::StreamTransport;

use bytes::{Buf, BytesMut};
use std::fmt;
use std::io;
use std::sync::Arc;

/// Source of the next outgoing message. Rewired by the controller at each
/// phase transition; the one-shot PING/PONG producers revert to the resting
/// slot after a single message.
#[derive(Debug, Clone)]
enum NextMsgSlot {
  /// Own identity message (v0/v1/v2 pre-data phase).
  Identity,
  /// Plain pull from the session (raw sockets and v0/v1/v2 data phase).
  PullFromSession,
  /// Drive the security handshake.
  HandshakeCommand,
  /// Pull from the session and apply the mechanism data-phase transform.
  PullAndEncode,
  /// Emit one PING, then revert.
  ProducePing,
  /// Emit one PONG echoing the stored context, then revert.
  ProducePong(Vec<u8>),
}

/// Handler for the next decoded incoming message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessMsgSlot {
  /// Expect the peer identity message (v0/v1/v2).
  Identity,
  /// Deliver to the session as-is.
  PushToSession,
  /// Deliver with raw-socket connection metadata attached.
  PushRawToSession,
  /// Feed the security handshake.
  HandshakeCommand,
  /// One-shot: push the mechanism credential, then become `DecodeAndPush`.
  WriteCredential,
  /// Data phase: mechanism decode, heartbeat bookkeeping, deliver.
  DecodeAndPush,
  /// Backpressure recovery: drain one queued message, then revert.
  PushOneThenDecodeAndPush,
}

/// Result of running the current `process_msg` slot on one message.
enum Processed {
  Done,
  /// The session is full; the message is handed back for retry.
  Backpressure(Msg),
}

/// Result of a non-blocking transport read.
enum ReadOutcome {
  Bytes(usize),
  WouldBlock,
  Closed,
  Failed,
}

/// Result of draining buffered input through the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainOutcome {
  /// Everything decodable was processed; waiting for more bytes.
  Completed,
  /// Stopped on session backpressure; a message is pending retry.
  Stalled,
  /// The engine terminated while draining.
  Dead,
}

fn read_stream(stream: &mut dyn StreamTransport, buf: &mut [u8]) -> ReadOutcome {
  match stream.read(buf) {
    Ok(0) => ReadOutcome::Closed,
    Ok(n) => ReadOutcome::Bytes(n),
    Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => {
      ReadOutcome::WouldBlock
    }
    Err(_) => ReadOutcome::Failed,
  }
}

/// Drives a single stream-oriented connection: greeting and version
/// negotiation, the security handshake, framed message flow, and heartbeats.
///
/// The engine is single-threaded and entirely callback-driven: the reactor
/// that owns its file descriptor invokes [`readable`](Self::readable),
/// [`writable`](Self::writable) and [`timer_fired`](Self::timer_fired); the
/// session re-enters through [`restart_input`](Self::restart_input),
/// [`restart_output`](Self::restart_output) and
/// [`zap_msg_available`](Self::zap_msg_available).
pub struct StreamEngine {
  transport: Option<Box<dyn StreamTransport>>,
  reactor: Option<Box<dyn Reactor>>,
  session: Option<Box<dyn Session>>,
  options: EngineOptions,
  endpoint: String,

  greeting: Greeting,
  /// Still determining the peer protocol version / security state.
  handshaking: bool,

  /// Bytes read from the transport, not yet decoded.
  inbuf: BytesMut,
  /// Reusable read buffer, sized once at plug time.
  read_scratch: Vec<u8>,
  /// Encoded bytes not yet written to the transport.
  outbuf: BytesMut,

  decoder: Option<Box<dyn Decoder>>,
  encoder: Option<Box<dyn Encoder>>,
  mechanism: Option<SecurityMechanism>,

  next_msg: NextMsgSlot,
  process_msg: ProcessMsgSlot,
  /// Decoded message the session could not accept yet.
  pending_msg: Option<Msg>,

  zmtp_version: Option<ZmtpVersion>,
  /// Connection metadata attached to delivered messages.
  metadata: Option<Arc<Metadata>>,
  peer_address: Option<String>,
  self_address: Option<String>,

  plugged: bool,
  io_error: bool,
  input_stopped: bool,
  output_stopped: bool,
  /// Inject a phantom subscription so v0 SUB peers receive publishes.
  subscription_required: bool,

  heartbeat_timeout: Option<std::time::Duration>,
  has_handshake_timer: bool,
  has_ttl_timer: bool,
  has_timeout_timer: bool,
  has_heartbeat_timer: bool,
}

impl StreamEngine {
  pub fn new(transport: Box<dyn StreamTransport>, options: EngineOptions, endpoint: impl Into<String>) -> Self {
    let peer_address = transport.peer_addr_string();
    let self_address = transport.local_addr_string();
    let heartbeat_timeout = options.effective_heartbeat_timeout();
    Self {
      transport: Some(transport),
      reactor: None,
      session: None,
      options,
      endpoint: endpoint.into(),
      greeting: Greeting::new(),
      handshaking: true,
      inbuf: BytesMut::new(),
      read_scratch: Vec::new(),
      outbuf: BytesMut::new(),
      decoder: None,
      encoder: None,
      mechanism: None,
      next_msg: NextMsgSlot::Identity,
      process_msg: ProcessMsgSlot::Identity,
      pending_msg: None,
      zmtp_version: None,
      metadata: None,
      peer_address,
      self_address,
      plugged: false,
      io_error: false,
      input_stopped: false,
      output_stopped: false,
      subscription_required: false,
      heartbeat_timeout,
      has_handshake_timer: false,
      has_ttl_timer: false,
      has_timeout_timer: false,
      has_heartbeat_timer: false,
    }
  }

  // --- Introspection ---

  pub fn is_plugged(&self) -> bool {
    self.plugged
  }

  pub fn is_handshaking(&self) -> bool {
    self.handshaking
  }

  pub fn input_stopped(&self) -> bool {
    self.input_stopped
  }

  pub fn output_stopped(&self) -> bool {
    self.output_stopped
  }

  pub fn zmtp_version(&self) -> Option<ZmtpVersion> {
    self.zmtp_version
  }

  pub fn endpoint(&self) -> &str {
    &self.endpoint
  }

  // --- Lifecycle ---

  /// Attaches the engine to its reactor registration and session. Called
  /// exactly once.
  pub fn plug(&mut self, reactor: Box<dyn Reactor>, session: Box<dyn Session>) {
    assert!(!self.plugged, "an engine is plugged exactly once");
    self.plugged = true;
    self.io_error = false;
    self.reactor = Some(reactor);
    self.session = Some(session);

    self.read_scratch = vec![0u8; self.options.in_batch_size()];
    self.inbuf.reserve(self.options.in_batch_size());
    self.outbuf.reserve(self.options.out_batch_size());

    if self.options.raw_socket {
      self.decoder = Some(Box::new(RawDecoder::new(self.options.max_msg_size)));
      self.encoder = Some(Box::new(RawEncoder::new()));
      self.handshaking = false;
      self.next_msg = NextMsgSlot::PullFromSession;
      self.process_msg = ProcessMsgSlot::PushRawToSession;
      self.compile_address_metadata();

      if let Some(ivl) = self.options.heartbeat_interval {
        self.reactor.as_mut().unwrap().add_timer(ivl, TimerId::HeartbeatInterval);
        self.has_heartbeat_timer = true;
      }

      // A zero-length message tells the application a peer connected.
      let _ = self.apply_process(Msg::new());
      self.session.as_mut().unwrap().flush();
    } else {
      if let Some(ivl) = self.options.handshake_ivl {
        self.reactor.as_mut().unwrap().add_timer(ivl, TimerId::Handshake);
        self.has_handshake_timer = true;
      }
      self
        .greeting
        .stage_signature(self.options.identity.size(), &mut self.outbuf);
    }

    let reactor = self.reactor.as_mut().unwrap();
    reactor.set_poll_in();
    reactor.set_poll_out();

    tracing::debug!(endpoint = %self.endpoint, raw = self.options.raw_socket, "Engine plugged");

    // Flush any bytes the transport may already hold.
    self.readable();
  }

  /// Detaches from the reactor and session and closes the transport. The
  /// engine is not reusable afterwards.
  pub fn terminate(&mut self) {
    if self.plugged {
      self.unplug();
    }
    self.destroy();
  }

  fn unplug(&mut self) {
    debug_assert!(self.plugged);
    self.plugged = false;

    let reactor = self.reactor.as_mut().expect("plugged engine has a reactor");
    if self.has_handshake_timer {
      reactor.cancel_timer(TimerId::Handshake);
      self.has_handshake_timer = false;
    }
    if self.has_ttl_timer {
      reactor.cancel_timer(TimerId::HeartbeatTtl);
      self.has_ttl_timer = false;
    }
    if self.has_timeout_timer {
      reactor.cancel_timer(TimerId::HeartbeatTimeout);
      self.has_timeout_timer = false;
    }
    if self.has_heartbeat_timer {
      reactor.cancel_timer(TimerId::HeartbeatInterval);
      self.has_heartbeat_timer = false;
    }
    if !self.io_error {
      reactor.remove_fd();
    }

    self.reactor = None;
    self.session = None;
  }

  fn destroy(&mut self) {
    debug_assert!(!self.plugged);
    if let Some(mut transport) = self.transport.take() {
      transport.close();
    }
    self.decoder = None;
    self.encoder = None;
    self.mechanism = None;
  }

  /// Fatal failure: notify the session, then unplug and destroy.
  fn error(&mut self, reason: ErrorReason) {
    debug_assert!(self.plugged);
    tracing::debug!(endpoint = %self.endpoint, ?reason, "Engine error");

    if self.options.raw_socket {
      // A zero-length terminator tells the application the peer is gone.
      let _ = self.apply_process(Msg::new());
    }

    let handshake_done = !self.handshaking
      && self
        .mechanism
        .as_ref()
        .map_or(true, |m| m.status() != MechanismStatus::Handshaking);
    {
      let session = self.session.as_mut().expect("plugged engine has a session");
      session.event_disconnected(&self.endpoint);
      session.flush();
      session.engine_error(handshake_done, reason);
    }
    self.unplug();
    self.destroy();
  }

  // --- Reactor callbacks ---

  /// The transport became readable.
  pub fn readable(&mut self) {
    if !self.plugged || self.io_error {
      return;
    }

    if self.handshaking && !self.handshake() {
      return;
    }

    debug_assert!(self.decoder.is_some());

    if self.input_stopped {
      // Readiness fired while input is paused: stop watching the descriptor
      // altogether until the session restarts us.
      self.reactor.as_mut().unwrap().remove_fd();
      self.io_error = true;
      return;
    }

    if self.inbuf.is_empty() {
      match self.read_into_inbuf() {
        ReadOutcome::Bytes(_) => {}
        ReadOutcome::WouldBlock => return,
        ReadOutcome::Closed | ReadOutcome::Failed => {
          self.error(ErrorReason::Connection);
          return;
        }
      }
    }

    if self.drain_inbuf() == DrainOutcome::Dead {
      return;
    }
    self.session.as_mut().unwrap().flush();
  }

  /// The transport became writable.
  pub fn writable(&mut self) {
    if !self.plugged || self.io_error {
      return;
    }

    if self.outbuf.is_empty() {
      if self.encoder.is_none() {
        // A speculative write can land here before version negotiation
        // produced the codecs.
        debug_assert!(self.handshaking);
        return;
      }

      let batch = self.options.out_batch_size();
      while self.outbuf.len() < batch {
        match self.apply_next() {
          Ok(Some(msg)) => {
            let encoder = self.encoder.as_mut().unwrap();
            if let Err(e) = encoder.encode(msg, &mut self.outbuf) {
              tracing::error!(endpoint = %self.endpoint, error = %e, "Encoder failure");
              self.error(ErrorReason::Protocol);
              return;
            }
          }
          Ok(None) => break,
          Err(e) => {
            // Mechanism failure. Any frame already encoded (an ERROR command)
            // must reach the wire before the connection dies.
            if self.outbuf.is_empty() {
              tracing::debug!(endpoint = %self.endpoint, error = %e, "Handshake failed");
              self.error(ErrorReason::Protocol);
              return;
            }
            break;
          }
        }
      }

      if self.outbuf.is_empty() {
        self.output_stopped = true;
        self.reactor.as_mut().unwrap().reset_poll_out();
        return;
      }
    }

    let transport = self.transport.as_mut().unwrap();
    match transport.write(&self.outbuf) {
      Ok(0) => return,
      Ok(n) => self.outbuf.advance(n),
      Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => return,
      Err(_) => {
        // Write failures stop output polling but do not tear the engine
        // down; reads stay alive to collect any final bytes from the peer.
        self.reactor.as_mut().unwrap().reset_poll_out();
        return;
      }
    }

    if self.handshaking && self.outbuf.is_empty() {
      self.reactor.as_mut().unwrap().reset_poll_out();
    }
  }

  /// A timer armed through the reactor expired.
  pub fn timer_fired(&mut self, id: TimerId) {
    if !self.plugged {
      return;
    }
    match id {
      TimerId::Handshake => {
        self.has_handshake_timer = false;
        self.error(ErrorReason::Timeout);
      }
      TimerId::HeartbeatInterval => {
        self.next_msg = NextMsgSlot::ProducePing;
        self.writable();
        if self.plugged {
          let ivl = self.options.heartbeat_interval.expect("interval timer was armed");
          self.reactor.as_mut().unwrap().add_timer(ivl, TimerId::HeartbeatInterval);
        }
      }
      TimerId::HeartbeatTtl => {
        self.has_ttl_timer = false;
        self.error(ErrorReason::Timeout);
      }
      TimerId::HeartbeatTimeout => {
        self.has_timeout_timer = false;
        self.error(ErrorReason::Timeout);
      }
    }
  }

  // --- Session re-entry points ---

  /// The session drained a pipe slot: retry the pending message, resume the
  /// decode loop and re-arm input.
  pub fn restart_input(&mut self) {
    if !self.plugged {
      return;
    }
    debug_assert!(self.input_stopped);
    let pending = self
      .pending_msg
      .take()
      .expect("restart_input requires a pending message");

    match self.apply_process(pending) {
      Ok(Processed::Done) => {}
      Ok(Processed::Backpressure(msg)) => {
        self.pending_msg = Some(msg);
        self.session.as_mut().unwrap().flush();
        return;
      }
      Err(e) => {
        tracing::error!(endpoint = %self.endpoint, error = %e, "Pending message rejected");
        self.error(ErrorReason::Protocol);
        return;
      }
    }

    match self.drain_inbuf() {
      DrainOutcome::Dead => {}
      DrainOutcome::Stalled => {
        self.session.as_mut().unwrap().flush();
      }
      DrainOutcome::Completed => {
        self.input_stopped = false;
        self.reactor.as_mut().unwrap().set_poll_in();
        self.session.as_mut().unwrap().flush();
        // Speculative read: data may have queued while input was paused.
        self.readable();
      }
    }
  }

  /// The session queued an outgoing message: re-arm output and try to write
  /// immediately, skipping one poll round trip.
  pub fn restart_output(&mut self) {
    if !self.plugged || self.io_error {
      return;
    }
    if self.output_stopped {
      self.reactor.as_mut().unwrap().set_poll_out();
      self.output_stopped = false;
    }
    self.writable();
  }

  /// The ZAP authenticator produced (part of) a reply.
  pub fn zap_msg_available(&mut self) {
    if !self.plugged {
      return;
    }
    let result = {
      let mechanism = self.mechanism.as_mut().expect("ZAP reply without a mechanism");
      let session = self.session.as_mut().unwrap();
      mechanism.zap_msg_available(session.as_mut())
    };
    if let Err(e) = result {
      tracing::error!(endpoint = %self.endpoint, error = %e, "ZAP reply rejected");
      self.error(ErrorReason::Protocol);
      return;
    }
    if self.input_stopped {
      self.restart_input();
    }
    if self.output_stopped {
      self.restart_output();
    }
  }

  // --- Greeting / version negotiation ---

  /// Advances the greeting exchange. Returns true when negotiation finished
  /// and normal message flow may start.
  fn handshake(&mut self) -> bool {
    debug_assert!(self.handshaking);

    while !self.greeting.complete() {
      let outcome = {
        let transport = self.transport.as_mut().unwrap();
        read_stream(transport.as_mut(), self.greeting.recv_window())
      };
      match outcome {
        ReadOutcome::Bytes(n) => self.greeting.advance_recv(n),
        ReadOutcome::WouldBlock => return false,
        ReadOutcome::Closed | ReadOutcome::Failed => {
          self.error(ErrorReason::Connection);
          return false;
        }
      }

      if self.greeting.peer_is_unversioned() {
        break;
      }
      if self.greeting.received() < SIGNATURE_SIZE {
        continue;
      }

      // The peer is versioned; reveal our own greeting piecewise.
      let pending_before = self.outbuf.len();
      self.greeting.stage_revision(&mut self.outbuf);
      if self.greeting.received() > SIGNATURE_SIZE && self.greeting.awaiting_tail() {
        let revision = self.greeting.peer_revision();
        if revision == 0 || revision == 1 {
          self.greeting.stage_v2_tail(self.options.socket_type.code(), &mut self.outbuf);
        } else {
          let name = self.options.mechanism.greeting_name();
          self.greeting.stage_v3_tail(&name, self.options.as_server, &mut self.outbuf);
        }
      }
      if pending_before == 0 && !self.outbuf.is_empty() {
        self.reactor.as_mut().unwrap().set_poll_out();
      }
    }

    let version = if self.greeting.peer_is_unversioned() {
      ZmtpVersion::V0
    } else {
      match self.greeting.peer_revision() {
        0 => ZmtpVersion::V1,
        1 => ZmtpVersion::V2,
        _ => ZmtpVersion::V3,
      }
    };

    let zap_enabled = self.session.as_ref().unwrap().zap_enabled();
    let max_msg_size = self.options.max_msg_size;

    match version {
      ZmtpVersion::V0 => {
        if zap_enabled {
          // ZAP requires the mechanism-aware protocol.
          self.error(ErrorReason::Protocol);
          return false;
        }
        self.encoder = Some(Box::new(V1Encoder::new()));
        self.decoder = Some(Box::new(V1Decoder::new(max_msg_size)));

        // The signature already carried the identity header; encode the
        // identity message and drop the header bytes it duplicates.
        let mut scratch = BytesMut::new();
        let identity = Msg::from_vec(self.options.identity.to_vec());
        let mut encoder = V1Encoder::new();
        encoder
          .encode(identity, &mut scratch)
          .expect("identity encoding is infallible");
        let header_size = V1Encoder::header_size(self.options.identity.size());
        self.outbuf.extend_from_slice(&scratch[header_size..]);

        // Everything received so far is framing data for the decoder.
        self.inbuf.extend_from_slice(self.greeting.trailing(0));

        // Old SUB peers do not forward subscriptions; inject one.
        if matches!(
          self.options.socket_type,
          crate::options::SocketType::Pub | crate::options::SocketType::Xpub
        ) {
          self.subscription_required = true;
        }

        self.next_msg = NextMsgSlot::PullFromSession;
        self.process_msg = ProcessMsgSlot::Identity;
      }
      ZmtpVersion::V1 => {
        if zap_enabled {
          self.error(ErrorReason::Protocol);
          return false;
        }
        self.encoder = Some(Box::new(V1Encoder::new()));
        self.decoder = Some(Box::new(V1Decoder::new(max_msg_size)));
        let trailing = self.greeting.trailing(V2_GREETING_SIZE);
        self.inbuf.extend_from_slice(trailing);
      }
      ZmtpVersion::V2 => {
        if zap_enabled {
          self.error(ErrorReason::Protocol);
          return false;
        }
        self.encoder = Some(Box::new(V2Encoder::new()));
        self.decoder = Some(Box::new(V2Decoder::new(max_msg_size)));
        let trailing = self.greeting.trailing(V2_GREETING_SIZE);
        self.inbuf.extend_from_slice(trailing);
      }
      ZmtpVersion::V3 => {
        self.encoder = Some(Box::new(V2Encoder::new()));
        self.decoder = Some(Box::new(V2Decoder::new(max_msg_size)));

        let expected = self.options.mechanism.greeting_name();
        if self.greeting.peer_mechanism() != expected {
          let session = self.session.as_mut().unwrap();
          session.event_handshake_failed_protocol(&self.endpoint, failure::ZMTP_MECHANISM_MISMATCH);
          self.error(ErrorReason::Protocol);
          return false;
        }

        match SecurityMechanism::create(&self.options, &self.endpoint, self.peer_address.clone()) {
          Ok(mechanism) => self.mechanism = Some(mechanism),
          Err(e) => {
            tracing::error!(endpoint = %self.endpoint, error = %e, "Cannot create security mechanism");
            self.error(ErrorReason::Protocol);
            return false;
          }
        }

        self.next_msg = NextMsgSlot::HandshakeCommand;
        self.process_msg = ProcessMsgSlot::HandshakeCommand;
      }
    }

    // Re-arm output: either staged bytes are waiting, or the next_msg slot
    // has something to produce (identity, first handshake command).
    self.reactor.as_mut().unwrap().set_poll_out();

    self.handshaking = false;
    if self.has_handshake_timer {
      self.reactor.as_mut().unwrap().cancel_timer(TimerId::Handshake);
      self.has_handshake_timer = false;
    }

    self.zmtp_version = Some(version);
    tracing::debug!(endpoint = %self.endpoint, ?version, "Protocol version negotiated");
    let session = self.session.as_mut().unwrap();
    session.event_handshaken(&self.endpoint, version);
    true
  }

  // --- Input pipeline ---

  fn read_into_inbuf(&mut self) -> ReadOutcome {
    let transport = self.transport.as_mut().unwrap();
    let outcome = read_stream(transport.as_mut(), &mut self.read_scratch);
    if let ReadOutcome::Bytes(n) = outcome {
      self.inbuf.extend_from_slice(&self.read_scratch[..n]);
    }
    outcome
  }

  fn drain_inbuf(&mut self) -> DrainOutcome {
    while !self.inbuf.is_empty() {
      let decoded = {
        let decoder = self.decoder.as_mut().unwrap();
        decoder.decode(&mut self.inbuf)
      };
      match decoded {
        Ok(Some(msg)) => match self.apply_process(msg) {
          Ok(Processed::Done) => {}
          Ok(Processed::Backpressure(msg)) => {
            self.pending_msg = Some(msg);
            self.input_stopped = true;
            self.reactor.as_mut().unwrap().reset_poll_in();
            return DrainOutcome::Stalled;
          }
          Err(e) => {
            tracing::error!(endpoint = %self.endpoint, error = %e, "Message processing failed");
            self.error(ErrorReason::Protocol);
            return DrainOutcome::Dead;
          }
        },
        Ok(None) => break,
        Err(e) => {
          tracing::error!(endpoint = %self.endpoint, error = %e, "Decoder failure");
          self.error(ErrorReason::Protocol);
          return DrainOutcome::Dead;
        }
      }
    }
    DrainOutcome::Completed
  }

  // --- next_msg dispatch ---

  fn apply_next(&mut self) -> Result<Option<Msg>, ZmqError> {
    match self.next_msg.clone() {
      NextMsgSlot::Identity => {
        self.next_msg = NextMsgSlot::PullFromSession;
        Ok(Some(Msg::from_vec(self.options.identity.to_vec())))
      }
      NextMsgSlot::PullFromSession => Ok(self.session.as_mut().unwrap().pull_msg()),
      NextMsgSlot::HandshakeCommand => match self.mechanism.as_ref().unwrap().status() {
        MechanismStatus::Ready => {
          self.mechanism_ready();
          self.pull_and_encode()
        }
        MechanismStatus::Error => Err(ZmqError::ProtocolViolation("Security handshake failed".into())),
        MechanismStatus::Handshaking => {
          let mechanism = self.mechanism.as_mut().unwrap();
          let session = self.session.as_mut().unwrap();
          match mechanism.next_handshake_command(session.as_mut())? {
            Some(mut msg) => {
              msg.add_flags(MsgFlags::COMMAND);
              Ok(Some(msg))
            }
            None => Ok(None),
          }
        }
      },
      NextMsgSlot::PullAndEncode => self.pull_and_encode(),
      NextMsgSlot::ProducePing => {
        self.next_msg = self.resting_next_slot();
        let ping = command::create_ping(self.options.heartbeat_ttl_deciseconds(), &self.options.heartbeat_context);
        let ping = match self.mechanism.as_mut() {
          Some(mechanism) => mechanism.encode(ping)?,
          None => ping,
        };
        if !self.has_timeout_timer {
          if let Some(timeout) = self.heartbeat_timeout {
            self.reactor.as_mut().unwrap().add_timer(timeout, TimerId::HeartbeatTimeout);
            self.has_timeout_timer = true;
          }
        }
        tracing::trace!(endpoint = %self.endpoint, "Producing PING");
        Ok(Some(ping))
      }
      NextMsgSlot::ProducePong(context) => {
        self.next_msg = self.resting_next_slot();
        let pong = command::create_pong(&context);
        match self.mechanism.as_mut() {
          Some(mechanism) => Ok(Some(mechanism.encode(pong)?)),
          None => Ok(Some(pong)),
        }
      }
    }
  }

  fn resting_next_slot(&self) -> NextMsgSlot {
    if self.options.raw_socket {
      NextMsgSlot::PullFromSession
    } else {
      NextMsgSlot::PullAndEncode
    }
  }

  fn pull_and_encode(&mut self) -> Result<Option<Msg>, ZmqError> {
    let pulled = self.session.as_mut().unwrap().pull_msg();
    match pulled {
      Some(msg) => Ok(Some(self.mechanism.as_mut().unwrap().encode(msg)?)),
      None => Ok(None),
    }
  }

  // --- process_msg dispatch ---

  fn apply_process(&mut self, msg: Msg) -> Result<Processed, ZmqError> {
    match self.process_msg {
      ProcessMsgSlot::Identity => self.process_identity(msg),
      ProcessMsgSlot::PushToSession => self.push_to_session(msg),
      ProcessMsgSlot::PushRawToSession => {
        let mut msg = msg;
        if let Some(meta) = &self.metadata {
          msg.set_metadata(meta.clone());
        }
        self.push_to_session(msg)
      }
      ProcessMsgSlot::HandshakeCommand => self.process_handshake_command(msg),
      ProcessMsgSlot::WriteCredential => self.write_credential(msg),
      ProcessMsgSlot::DecodeAndPush => self.decode_and_push(msg),
      ProcessMsgSlot::PushOneThenDecodeAndPush => self.push_one_then_decode_and_push(msg),
    }
  }

  fn push_to_session(&mut self, msg: Msg) -> Result<Processed, ZmqError> {
    let session = self.session.as_mut().unwrap();
    match session.push_msg(msg.clone()) {
      Ok(()) => Ok(Processed::Done),
      Err(PushError::Full) => Ok(Processed::Backpressure(msg)),
      Err(PushError::Rejected) => Err(ZmqError::ProtocolViolation("Session rejected message".into())),
    }
  }

  fn process_identity(&mut self, msg: Msg) -> Result<Processed, ZmqError> {
    if self.options.recv_identity {
      let mut identity = msg;
      identity.add_flags(MsgFlags::IDENTITY);
      let pushed = self.session.as_mut().unwrap().push_msg(identity);
      debug_assert!(pushed.is_ok(), "identity delivery must not fail at startup");
    }

    if self.subscription_required {
      // Phantom subscribe-to-all, so v0 peers receive publishes.
      let pushed = self.session.as_mut().unwrap().push_msg(Msg::from_vec(vec![1]));
      debug_assert!(pushed.is_ok());
    }

    self.process_msg = ProcessMsgSlot::PushToSession;
    Ok(Processed::Done)
  }

  fn process_handshake_command(&mut self, msg: Msg) -> Result<Processed, ZmqError> {
    {
      let mechanism = self.mechanism.as_mut().unwrap();
      let session = self.session.as_mut().unwrap();
      mechanism.process_handshake_command(session.as_mut(), &msg)?;
    }
    match self.mechanism.as_ref().unwrap().status() {
      MechanismStatus::Ready => self.mechanism_ready(),
      MechanismStatus::Error => {
        return Err(ZmqError::ProtocolViolation("Security handshake failed".into()));
      }
      MechanismStatus::Handshaking => {}
    }
    if self.output_stopped {
      self.restart_output();
    }
    Ok(Processed::Done)
  }

  fn write_credential(&mut self, msg: Msg) -> Result<Processed, ZmqError> {
    if let Some(credential) = self.mechanism.as_ref().unwrap().user_id() {
      if !credential.is_empty() {
        let mut cred_msg = Msg::from_vec(credential.to_vec());
        cred_msg.set_flags(MsgFlags::CREDENTIAL);
        match self.session.as_mut().unwrap().push_msg(cred_msg) {
          Ok(()) => {}
          Err(PushError::Full) => return Ok(Processed::Backpressure(msg)),
          Err(PushError::Rejected) => {
            return Err(ZmqError::ProtocolViolation("Session rejected credential".into()));
          }
        }
      }
    }
    self.process_msg = ProcessMsgSlot::DecodeAndPush;
    self.decode_and_push(msg)
  }

  fn decode_and_push(&mut self, msg: Msg) -> Result<Processed, ZmqError> {
    let decoded = {
      let session = self.session.as_mut().unwrap();
      match self.mechanism.as_mut() {
        Some(mechanism) => mechanism.decode(session.as_mut(), msg)?,
        None => msg,
      }
    };

    // Any inbound frame proves the peer is alive.
    if self.has_timeout_timer {
      self.reactor.as_mut().unwrap().cancel_timer(TimerId::HeartbeatTimeout);
      self.has_timeout_timer = false;
    }
    if self.has_ttl_timer {
      self.reactor.as_mut().unwrap().cancel_timer(TimerId::HeartbeatTtl);
      self.has_ttl_timer = false;
    }

    if decoded.is_command() {
      if let Some(body) = decoded.data() {
        if command::is_command(body, command::CMD_PING) {
          let body = body.to_vec();
          self.process_peer_ping(&body)?;
        }
      }
    }

    let mut decoded = decoded;
    if let Some(meta) = &self.metadata {
      decoded.set_metadata(meta.clone());
    }
    let session = self.session.as_mut().unwrap();
    match session.push_msg(decoded.clone()) {
      Ok(()) => Ok(Processed::Done),
      Err(PushError::Full) => {
        self.process_msg = ProcessMsgSlot::PushOneThenDecodeAndPush;
        Ok(Processed::Backpressure(decoded))
      }
      Err(PushError::Rejected) => Err(ZmqError::ProtocolViolation("Session rejected message".into())),
    }
  }

  fn push_one_then_decode_and_push(&mut self, msg: Msg) -> Result<Processed, ZmqError> {
    let session = self.session.as_mut().unwrap();
    match session.push_msg(msg.clone()) {
      Ok(()) => {
        self.process_msg = ProcessMsgSlot::DecodeAndPush;
        Ok(Processed::Done)
      }
      Err(PushError::Full) => Ok(Processed::Backpressure(msg)),
      Err(PushError::Rejected) => Err(ZmqError::ProtocolViolation("Session rejected message".into())),
    }
  }

  /// A PING arrived: arm the peer-TTL timer and schedule the PONG reply.
  fn process_peer_ping(&mut self, body: &[u8]) -> Result<(), ZmqError> {
    let ping = command::parse_ping(body)?;

    let ttl_ms = u64::from(ping.ttl_deciseconds) * 100;
    if !self.has_ttl_timer && ttl_ms > 0 {
      self
        .reactor
        .as_mut()
        .unwrap()
        .add_timer(std::time::Duration::from_millis(ttl_ms), TimerId::HeartbeatTtl);
      self.has_ttl_timer = true;
    }

    self.next_msg = NextMsgSlot::ProducePong(ping.context);
    // Sequential PINGs are safe: the PONG is produced before returning.
    self.writable();
    Ok(())
  }

  // --- Mechanism completion ---

  /// The security handshake reached READY: arm heartbeats, deliver the peer
  /// identity, rewire the data-phase slots and compile connection metadata.
  fn mechanism_ready(&mut self) {
    tracing::debug!(endpoint = %self.endpoint, "Security mechanism ready");

    if let Some(ivl) = self.options.heartbeat_interval {
      self.reactor.as_mut().unwrap().add_timer(ivl, TimerId::HeartbeatInterval);
      self.has_heartbeat_timer = true;
    }

    if self.options.recv_identity {
      let identity = self.mechanism.as_ref().unwrap().peer_identity().unwrap_or_default();
      let mut msg = Msg::from_vec(identity.to_vec());
      msg.set_flags(MsgFlags::IDENTITY);
      let session = self.session.as_mut().unwrap();
      match session.push_msg(msg) {
        Ok(()) => session.flush(),
        // The pipe is already shutting down; skip identity delivery.
        Err(PushError::Full) => return,
        Err(PushError::Rejected) => {
          debug_assert!(false, "identity delivery must not be rejected");
          return;
        }
      }
    }

    self.next_msg = NextMsgSlot::PullAndEncode;
    self.process_msg = ProcessMsgSlot::WriteCredential;

    let mut meta = Metadata::new();
    if let Some(addr) = &self.peer_address {
      meta.set(metadata::PEER_ADDRESS, addr.as_bytes().to_vec());
    }
    if let (Some(name), Some(addr)) = (&self.options.self_address_property_name, &self.self_address) {
      meta.set(name, addr.as_bytes().to_vec());
    }
    let mechanism = self.mechanism.as_ref().unwrap();
    meta.merge(mechanism.zap_properties());
    meta.merge(mechanism.zmtp_properties());
    if !meta.is_empty() {
      self.metadata = Some(Arc::new(meta));
    }
  }

  fn compile_address_metadata(&mut self) {
    let mut meta = Metadata::new();
    if let Some(addr) = &self.peer_address {
      meta.set(metadata::PEER_ADDRESS, addr.as_bytes().to_vec());
    }
    if let (Some(name), Some(addr)) = (&self.options.self_address_property_name, &self.self_address) {
      meta.set(name, addr.as_bytes().to_vec());
    }
    if !meta.is_empty() {
      self.metadata = Some(Arc::new(meta));
    }
  }
}

impl fmt::Debug for StreamEngine {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("StreamEngine")
      .field("endpoint", &self.endpoint)
      .field("plugged", &self.plugged)
      .field("handshaking", &self.handshaking)
      .field("zmtp_version", &self.zmtp_version)
      .field("input_stopped", &self.input_stopped)
      .field("output_stopped", &self.output_stopped)
      .field("inbuf_len", &self.inbuf.len())
      .field("outbuf_len", &self.outbuf.len())
      .field("mechanism", &self.mechanism.as_ref().map(|m| m.status()))
      .finish_non_exhaustive()
  }
}
