#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use zmtp_engine::{
  EngineOptions, ErrorReason, Msg, PushError, Reactor, Session, StreamEngine, StreamTransport, TimerId, ZmqError,
  ZmtpVersion,
};

/// Installs a subscriber reading RUST_LOG; repeated calls are no-ops.
pub fn init_tracing() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}

// --- In-memory byte pipe ---

#[derive(Debug, Default)]
struct BufState {
  data: VecDeque<u8>,
  eof: bool,
}

/// One direction of an in-memory connection.
#[derive(Debug, Clone, Default)]
pub struct SharedBuf(Arc<Mutex<BufState>>);

impl SharedBuf {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn feed(&self, bytes: &[u8]) {
    self.0.lock().unwrap().data.extend(bytes.iter().copied());
  }

  pub fn take_all(&self) -> Vec<u8> {
    self.0.lock().unwrap().data.drain(..).collect()
  }

  pub fn len(&self) -> usize {
    self.0.lock().unwrap().data.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Marks the write side closed: reads drain the buffered bytes, then
  /// report an orderly shutdown.
  pub fn close(&self) {
    self.0.lock().unwrap().eof = true;
  }
}

/// A scripted, non-blocking stream: reads from `rx`, writes into `tx`.
#[derive(Debug)]
pub struct TestTransport {
  pub rx: SharedBuf,
  pub tx: SharedBuf,
  /// Caps the bytes accepted per `write` call, to exercise partial writes.
  pub write_limit: Option<usize>,
}

impl Read for TestTransport {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    let mut state = self.rx.0.lock().unwrap();
    if state.data.is_empty() {
      if state.eof {
        return Ok(0);
      }
      return Err(io::Error::from(io::ErrorKind::WouldBlock));
    }
    let n = buf.len().min(state.data.len());
    for slot in buf.iter_mut().take(n) {
      *slot = state.data.pop_front().unwrap();
    }
    Ok(n)
  }
}

impl Write for TestTransport {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    let n = self.write_limit.map_or(buf.len(), |limit| buf.len().min(limit));
    self.tx.0.lock().unwrap().data.extend(buf[..n].iter().copied());
    Ok(n)
  }

  fn flush(&mut self) -> io::Result<()> {
    Ok(())
  }
}

impl StreamTransport for TestTransport {
  fn peer_addr_string(&self) -> Option<String> {
    Some("127.0.0.1:4000".into())
  }

  fn local_addr_string(&self) -> Option<String> {
    Some("127.0.0.1:5000".into())
  }
}

// --- Recording reactor ---

#[derive(Debug, Default)]
pub struct ReactorState {
  pub poll_in: bool,
  pub poll_out: bool,
  pub timers: Vec<(Duration, TimerId)>,
  pub removed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ReactorHandle(Arc<Mutex<ReactorState>>);

impl ReactorHandle {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn poll_in(&self) -> bool {
    self.0.lock().unwrap().poll_in
  }

  pub fn poll_out(&self) -> bool {
    self.0.lock().unwrap().poll_out
  }

  pub fn removed(&self) -> bool {
    self.0.lock().unwrap().removed
  }

  pub fn armed(&self, id: TimerId) -> Option<Duration> {
    self
      .0
      .lock()
      .unwrap()
      .timers
      .iter()
      .find(|(_, timer)| *timer == id)
      .map(|(timeout, _)| *timeout)
  }

  /// Simulates timer expiry: forget the registration, then deliver.
  pub fn fire(&self, engine: &mut StreamEngine, id: TimerId) {
    self.0.lock().unwrap().timers.retain(|(_, timer)| *timer != id);
    engine.timer_fired(id);
  }
}

impl Reactor for ReactorHandle {
  fn set_poll_in(&mut self) {
    self.0.lock().unwrap().poll_in = true;
  }

  fn reset_poll_in(&mut self) {
    self.0.lock().unwrap().poll_in = false;
  }

  fn set_poll_out(&mut self) {
    self.0.lock().unwrap().poll_out = true;
  }

  fn reset_poll_out(&mut self) {
    self.0.lock().unwrap().poll_out = false;
  }

  fn add_timer(&mut self, timeout: Duration, id: TimerId) {
    let mut state = self.0.lock().unwrap();
    state.timers.retain(|(_, timer)| *timer != id);
    state.timers.push((timeout, id));
  }

  fn cancel_timer(&mut self, id: TimerId) {
    self.0.lock().unwrap().timers.retain(|(_, timer)| *timer != id);
  }

  fn remove_fd(&mut self) {
    let mut state = self.0.lock().unwrap();
    state.poll_in = false;
    state.poll_out = false;
    state.removed = true;
  }
}

// --- Recording session ---

#[derive(Debug, Default)]
pub struct SessionState {
  pub pushed: Vec<Msg>,
  pub pull_queue: VecDeque<Msg>,
  /// `Some(n)`: pushes beyond `n` report backpressure.
  pub push_capacity: Option<usize>,
  pub flushes: usize,
  pub errors: Vec<(bool, ErrorReason)>,
  pub handshaken: Option<(String, ZmtpVersion)>,
  pub disconnected: bool,
  pub failure_codes: Vec<i32>,
  pub zap_enabled: bool,
  pub zap_connect_ok: bool,
  pub zap_request: Vec<Msg>,
  pub zap_replies: VecDeque<Msg>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionHandle(Arc<Mutex<SessionState>>);

impl SessionHandle {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn state(&self) -> MutexGuard<'_, SessionState> {
    self.0.lock().unwrap()
  }

  pub fn queue_pull(&self, msg: Msg) {
    self.state().pull_queue.push_back(msg);
  }

  pub fn pushed_payloads(&self) -> Vec<Vec<u8>> {
    self
      .state()
      .pushed
      .iter()
      .map(|m| m.data().unwrap_or(&[]).to_vec())
      .collect()
  }

  /// Queues a well-formed 7-frame ZAP reply.
  pub fn script_zap_reply(&self, status: &str, user_id: &str) {
    let frames: [(&[u8], bool); 7] = [
      (b"", true),
      (b"1.0", true),
      (b"1", true),
      (status.as_bytes(), true),
      (b"OK", true),
      (user_id.as_bytes(), true),
      (b"", false),
    ];
    let mut state = self.state();
    for (data, more) in frames {
      let mut msg = Msg::from_vec(data.to_vec());
      if more {
        msg.set_flags(zmtp_engine::MsgFlags::MORE);
      }
      state.zap_replies.push_back(msg);
    }
  }
}

impl Session for SessionHandle {
  fn pull_msg(&mut self) -> Option<Msg> {
    self.state().pull_queue.pop_front()
  }

  fn push_msg(&mut self, msg: Msg) -> Result<(), PushError> {
    let mut state = self.state();
    if let Some(capacity) = state.push_capacity {
      if state.pushed.len() >= capacity {
        return Err(PushError::Full);
      }
    }
    state.pushed.push(msg);
    Ok(())
  }

  fn flush(&mut self) {
    self.state().flushes += 1;
  }

  fn zap_enabled(&self) -> bool {
    self.state().zap_enabled
  }

  fn zap_connect(&mut self) -> Result<(), ZmqError> {
    if self.state().zap_connect_ok {
      Ok(())
    } else {
      Err(ZmqError::InvalidState("No ZAP authenticator"))
    }
  }

  fn write_zap_msg(&mut self, msg: Msg) -> Result<(), ZmqError> {
    self.state().zap_request.push(msg);
    Ok(())
  }

  fn read_zap_msg(&mut self) -> Result<Option<Msg>, ZmqError> {
    Ok(self.state().zap_replies.pop_front())
  }

  fn engine_error(&mut self, handshake_done: bool, reason: ErrorReason) {
    self.state().errors.push((handshake_done, reason));
  }

  fn event_handshaken(&mut self, endpoint: &str, version: ZmtpVersion) {
    self.state().handshaken = Some((endpoint.to_string(), version));
  }

  fn event_disconnected(&mut self, _endpoint: &str) {
    self.state().disconnected = true;
  }

  fn event_handshake_failed_protocol(&mut self, _endpoint: &str, code: i32) {
    self.state().failure_codes.push(code);
  }
}

// --- Engine under test ---

pub struct Endpoint {
  pub engine: StreamEngine,
  pub reactor: ReactorHandle,
  pub session: SessionHandle,
  /// Peer-to-engine direction.
  pub rx: SharedBuf,
  /// Engine-to-peer direction.
  pub tx: SharedBuf,
}

impl Endpoint {
  pub fn new(options: EngineOptions) -> Self {
    let rx = SharedBuf::new();
    let tx = SharedBuf::new();
    let transport = TestTransport {
      rx: rx.clone(),
      tx: tx.clone(),
      write_limit: None,
    };
    Self {
      engine: StreamEngine::new(Box::new(transport), options, "tcp://127.0.0.1:4000"),
      reactor: ReactorHandle::new(),
      session: SessionHandle::new(),
      rx,
      tx,
    }
  }

  pub fn plug(&mut self) {
    self
      .engine
      .plug(Box::new(self.reactor.clone()), Box::new(self.session.clone()));
  }

  /// Runs writable callbacks while the engine polls for output and makes
  /// progress; returns everything written.
  pub fn pump_out(&mut self) -> Vec<u8> {
    for _ in 0..32 {
      if !self.reactor.poll_out() {
        break;
      }
      let before = self.tx.len();
      self.engine.writable();
      if self.tx.len() == before {
        break;
      }
    }
    self.tx.take_all()
  }

  /// Feeds bytes from the peer and runs the readable callback.
  pub fn feed(&mut self, bytes: &[u8]) {
    self.rx.feed(bytes);
    self.engine.readable();
  }
}

/// Two engines wired back to back through a pair of in-memory pipes.
pub fn pair(options_a: EngineOptions, options_b: EngineOptions) -> (Endpoint, Endpoint) {
  let a_to_b = SharedBuf::new();
  let b_to_a = SharedBuf::new();

  let make = |options: EngineOptions, rx: SharedBuf, tx: SharedBuf| {
    let transport = TestTransport {
      rx: rx.clone(),
      tx: tx.clone(),
      write_limit: None,
    };
    Endpoint {
      engine: StreamEngine::new(Box::new(transport), options, "tcp://127.0.0.1:4000"),
      reactor: ReactorHandle::new(),
      session: SessionHandle::new(),
      rx,
      tx,
    }
  };

  let a = make(options_a, b_to_a.clone(), a_to_b.clone());
  let b = make(options_b, a_to_b, b_to_a);
  (a, b)
}

fn step(endpoint: &mut Endpoint) -> bool {
  let mut progress = false;
  if endpoint.reactor.poll_out() {
    let before = endpoint.tx.len();
    endpoint.engine.writable();
    progress |= endpoint.tx.len() != before;
  }
  if endpoint.reactor.poll_in() && !endpoint.rx.is_empty() {
    let before = endpoint.rx.len();
    endpoint.engine.readable();
    progress |= endpoint.rx.len() != before;
  }
  progress
}

/// Cooperative scheduler for an engine pair: alternates readiness callbacks
/// until neither side makes progress.
pub fn run_pair(a: &mut Endpoint, b: &mut Endpoint, max_rounds: usize) {
  let mut idle_rounds = 0;
  for _ in 0..max_rounds {
    let mut progress = false;
    progress |= step(a);
    progress |= step(b);

    if progress {
      idle_rounds = 0;
    } else {
      idle_rounds += 1;
      if idle_rounds >= 2 {
        break;
      }
    }
  }
}

/// A canonical 64-byte ZMTP/3.x greeting for hand-crafted peers.
pub fn v3_greeting(mechanism: &str, as_server: bool) -> [u8; 64] {
  let mut greeting = [0u8; 64];
  greeting[0] = 0xFF;
  greeting[8] = 1; // identity length placeholder, as the signature carries
  greeting[9] = 0x7F;
  greeting[10] = 3;
  greeting[11] = 0;
  greeting[12..12 + mechanism.len()].copy_from_slice(mechanism.as_bytes());
  greeting[32] = as_server as u8;
  greeting
}

/// Frames `body` as a ZMTP/2.0+ command frame.
pub fn v2_command_frame(body: &[u8]) -> Vec<u8> {
  let mut frame = Vec::with_capacity(body.len() + 9);
  if body.len() <= 255 {
    frame.push(0x04);
    frame.push(body.len() as u8);
  } else {
    frame.push(0x04 | 0x02);
    frame.extend_from_slice(&(body.len() as u64).to_be_bytes());
  }
  frame.extend_from_slice(body);
  frame
}
