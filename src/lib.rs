//! zmtp-engine - the per-connection stream engine of a ZMTP messaging stack.
//!
//! One [`StreamEngine`] drives a single connected stream transport (TCP or
//! UNIX domain) from attachment to teardown: it negotiates the protocol
//! revision from a partial byte stream, runs the configured security
//! handshake (NULL, PLAIN or CURVE, with ZAP authentication), frames and
//! deframes application messages, and multiplexes heartbeat traffic over the
//! same channel.
//!
//! The engine is callback-driven and single-threaded. The surrounding stack
//! is expressed as traits: a [`reactor::Reactor`] delivers readiness and
//! timers, a [`session::Session`] owns the application-visible queues, and a
//! [`transport::StreamTransport`] is the non-blocking byte stream.

/// The engine controller: phases, pipeline slots, heartbeats.
pub mod engine;
/// Custom error types used throughout the library.
pub mod error;
/// Message representation (Msg, Blob, flags, metadata).
pub mod message;
/// Per-connection configuration.
pub mod options;
/// ZMTP wire details: greetings, commands, framing codecs.
pub mod protocol;
/// The reactor-side contract the engine is driven by.
pub mod reactor;
/// Security mechanisms (NULL, PLAIN, CURVE) and ZAP plumbing.
pub mod security;
/// The upstream session contract.
pub mod session;
/// Non-blocking stream transports (TCP, UNIX domain).
pub mod transport;

pub use engine::StreamEngine;
pub use error::ZmqError;
pub use message::{Blob, Metadata, Msg, MsgFlags};
pub use options::{EngineOptions, MechanismKind, SocketType};
pub use protocol::ZmtpVersion;
pub use reactor::{Reactor, TimerId};
pub use security::{MechanismStatus, SecurityMechanism};
pub use session::{ErrorReason, PushError, Session};
pub use transport::StreamTransport;
