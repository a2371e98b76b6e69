use std::time::Duration;

/// Timers the engine schedules with its reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
  /// Overall handshake deadline, armed at plug time.
  Handshake,
  /// Periodic PING generation.
  HeartbeatInterval,
  /// Deadline for traffic after a PING was sent.
  HeartbeatTimeout,
  /// Deadline derived from the peer's advertised TTL.
  HeartbeatTtl,
}

/// Registration handle into the I/O reactor that owns this engine's file
/// descriptor.
///
/// The reactor delivers readiness by calling the engine's `readable` /
/// `writable` / `timer_fired` methods; this trait is the engine's side of
/// the contract. All calls are made from the reactor thread the engine lives
/// on. After `remove_fd` the reactor guarantees no further callbacks.
pub trait Reactor {
  fn set_poll_in(&mut self);
  fn reset_poll_in(&mut self);
  fn set_poll_out(&mut self);
  fn reset_poll_out(&mut self);

  /// Arms a one-shot timer. Re-arming an already armed id resets it.
  fn add_timer(&mut self, timeout: Duration, id: TimerId);
  fn cancel_timer(&mut self, id: TimerId);

  /// Deregisters the file descriptor; no callbacks fire afterwards.
  fn remove_fd(&mut self);
}
