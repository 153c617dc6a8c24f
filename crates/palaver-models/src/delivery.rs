use serde::{Deserialize, Serialize};

/// Per-message delivery state on the sending client. Advanced only by
/// explicit acknowledgement envelopes, never inferred locally except for
/// the optimistic `Sending` at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryState {
    fn rank(self) -> u8 {
        match self {
            Self::Sending => 0,
            Self::Sent => 1,
            Self::Delivered => 2,
            Self::Read => 3,
            // Failed is terminal until a manual resend restarts the cycle.
            Self::Failed => 4,
        }
    }

    /// Whether an acknowledgement for `next` may advance a message
    /// currently in `self`. Late or duplicate acks for earlier states are
    /// dropped; a failed message only leaves `Failed` via manual resend.
    pub fn can_advance_to(self, next: DeliveryState) -> bool {
        if self == Self::Failed {
            return false;
        }
        if next == Self::Failed {
            return self == Self::Sending;
        }
        next.rank() > self.rank()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advances_forward_only() {
        assert!(DeliveryState::Sending.can_advance_to(DeliveryState::Sent));
        assert!(DeliveryState::Sent.can_advance_to(DeliveryState::Read));
        assert!(!DeliveryState::Delivered.can_advance_to(DeliveryState::Sent));
        assert!(!DeliveryState::Read.can_advance_to(DeliveryState::Read));
    }

    #[test]
    fn failed_only_from_sending() {
        assert!(DeliveryState::Sending.can_advance_to(DeliveryState::Failed));
        assert!(!DeliveryState::Sent.can_advance_to(DeliveryState::Failed));
        assert!(!DeliveryState::Failed.can_advance_to(DeliveryState::Sent));
    }
}
