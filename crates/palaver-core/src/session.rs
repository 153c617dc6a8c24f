use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// Server-side lifecycle of one connection. Forward-only; `Closed` is
/// terminal and must always be reached so no session stays registered
/// without a live socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Connecting,
    Active,
    Closing,
    Closed,
}

#[derive(Debug, Error)]
#[error("invalid session transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: SessionPhase,
    pub to: SessionPhase,
}

impl SessionPhase {
    /// Consume the current phase and move to `to`, rejecting anything that
    /// is not a legal forward step.
    pub fn advance(self, to: SessionPhase) -> Result<SessionPhase, InvalidTransition> {
        use SessionPhase::*;
        let ok = matches!(
            (self, to),
            (Connecting, Active) | (Connecting, Closing) | (Active, Closing) | (Closing, Closed)
        );
        if ok {
            Ok(to)
        } else {
            Err(InvalidTransition { from: self, to })
        }
    }

    pub fn is_terminal(self) -> bool {
        self == SessionPhase::Closed
    }
}

/// Identity of one live connection: one authenticated user on one device.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub user_id: i64,
    pub device_id: String,
    pub connected_at: DateTime<Utc>,
}

impl SessionInfo {
    pub fn new(user_id: i64, device_id: impl Into<String>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            user_id,
            device_id: device_id.into(),
            connected_at: Utc::now(),
        }
    }
}
