pub mod auth;
pub mod collaborators;
pub mod error;
pub mod registry;
pub mod router;
pub mod session;
pub mod testing;

use std::sync::Arc;
use std::time::Duration;

use crate::collaborators::AuthValidator;
use crate::registry::ConnectionRegistry;
use crate::router::MessageRouter;

/// Timings and limits for the gateway. Everything is configurable so
/// integration tests can run with millisecond values.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Expected client ping cadence, advertised to each session in the
    /// handshake greeting.
    pub heartbeat_interval: Duration,
    /// Deadline for silence before a session is closed. A small multiple
    /// of the interval.
    pub heartbeat_timeout: Duration,
    /// Bounded outbound queue depth per session. Overflow drops the
    /// session rather than blocking other sessions.
    pub send_queue_capacity: usize,
    /// Maximum concurrent sessions per user (multi-device cap).
    pub max_sessions_per_user: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            send_queue_capacity: 256,
            max_sessions_per_user: 5,
        }
    }
}

/// Shared state handed to every gateway connection. Built once by the
/// composition root; collaborators are injected so tests can substitute
/// fakes.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub router: Arc<MessageRouter>,
    pub auth: Arc<dyn AuthValidator>,
    pub config: GatewayConfig,
}
