//! Gateway WebSocket close codes in the application range.

/// Malformed frame or envelope the gateway could not parse at all.
pub const CLOSE_PROTOCOL_ERROR: u16 = 4000;
/// Token validation failed during the handshake.
pub const CLOSE_AUTH_FAILED: u16 = 4001;
/// The user already has the maximum number of concurrent sessions.
pub const CLOSE_SESSION_LIMIT: u16 = 4008;
/// No ping received within the heartbeat deadline.
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4009;
/// The session's outbound queue overflowed; slow consumers are dropped.
pub const CLOSE_SLOW_CONSUMER: u16 = 4010;
