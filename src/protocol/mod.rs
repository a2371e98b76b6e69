pub mod codec;
pub mod command;
pub mod greeting;

/// Negotiated ZMTP protocol revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ZmtpVersion {
  /// Unversioned (ZMTP/1.0 framing, no signature from peer).
  V0,
  /// Revision octet 0.
  V1,
  /// Revision octet 1.
  V2,
  /// Revision octet 3 or greater.
  V3,
}

/// Detail codes reported through `event_handshake_failed_protocol`.
pub mod failure {
  pub const ZMTP_UNSPECIFIED: i32 = 0x10000000;
  pub const ZMTP_UNEXPECTED_COMMAND: i32 = 0x10000001;
  pub const ZMTP_INVALID_SEQUENCE: i32 = 0x10000002;
  pub const ZMTP_KEY_EXCHANGE: i32 = 0x10000003;
  pub const ZMTP_MALFORMED_COMMAND_UNSPECIFIED: i32 = 0x10000011;
  pub const ZMTP_MALFORMED_COMMAND_MESSAGE: i32 = 0x10000012;
  pub const ZMTP_MALFORMED_COMMAND_HELLO: i32 = 0x10000013;
  pub const ZMTP_MALFORMED_COMMAND_INITIATE: i32 = 0x10000014;
  pub const ZMTP_MALFORMED_COMMAND_ERROR: i32 = 0x10000015;
  pub const ZMTP_MALFORMED_COMMAND_READY: i32 = 0x10000016;
  pub const ZMTP_MALFORMED_COMMAND_WELCOME: i32 = 0x10000017;
  pub const ZMTP_CRYPTOGRAPHIC: i32 = 0x11000001;
  pub const ZMTP_MECHANISM_MISMATCH: i32 = 0x11000002;
  pub const ZAP_UNSPECIFIED: i32 = 0x20000000;
  pub const ZAP_MALFORMED_REPLY: i32 = 0x20000001;
  pub const ZAP_BAD_REQUEST_ID: i32 = 0x20000002;
  pub const ZAP_BAD_VERSION: i32 = 0x20000003;
  pub const ZAP_INVALID_STATUS_CODE: i32 = 0x20000004;
  pub const ZAP_INVALID_METADATA: i32 = 0x20000005;
}
