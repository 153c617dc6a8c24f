use std::collections::HashMap;
use std::time::{Duration, Instant};

use palaver_models::DeliveryState;
use uuid::Uuid;

struct Entry {
    state: DeliveryState,
    since: Instant,
}

/// Tracks the delivery state of locally-created messages. States advance
/// only on explicit acknowledgement envelopes; the single local inference
/// is the optimistic `Sending` at creation and the timeout into `Failed`.
///
/// Bounded by construction: `Read` is terminal and removes the entry, and
/// `Failed` entries are evicted after a retention window that keeps them
/// available for a manual resend.
pub struct DeliveryTracker {
    entries: HashMap<Uuid, Entry>,
    ack_timeout: Duration,
    failed_retention: Duration,
}

impl DeliveryTracker {
    pub fn new(ack_timeout: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ack_timeout,
            failed_retention: ack_timeout.saturating_mul(8),
        }
    }

    /// Begin tracking a message about to be sent. Also used for a manual
    /// resend of a failed message, which restarts the cycle. Returns false
    /// when the message is already in flight or acknowledged, so a
    /// duplicate send is refused.
    pub fn track(&mut self, message_id: Uuid) -> bool {
        match self.entries.get(&message_id) {
            Some(entry) if entry.state != DeliveryState::Failed => false,
            _ => {
                self.entries.insert(
                    message_id,
                    Entry {
                        state: DeliveryState::Sending,
                        since: Instant::now(),
                    },
                );
                true
            }
        }
    }

    /// Apply an acknowledgement. Out-of-order or duplicate acks are
    /// dropped. Returns the new state when it changed. Reaching `Read`
    /// ends tracking entirely.
    pub fn advance(&mut self, message_id: Uuid, next: DeliveryState) -> Option<DeliveryState> {
        let current = self.entries.get(&message_id)?.state;
        if !current.can_advance_to(next) {
            return None;
        }
        if next == DeliveryState::Read {
            self.entries.remove(&message_id);
        } else if let Some(entry) = self.entries.get_mut(&message_id) {
            entry.state = next;
            entry.since = Instant::now();
        }
        Some(next)
    }

    pub fn state(&self, message_id: Uuid) -> Option<DeliveryState> {
        self.entries.get(&message_id).map(|e| e.state)
    }

    /// Fail every message that has waited longer than the ack timeout
    /// without leaving `Sending`, and evict failed messages whose resend
    /// window has lapsed. Returns the newly failed IDs; those stay tracked
    /// for the retention window and are eligible for manual resend.
    pub fn sweep(&mut self) -> Vec<Uuid> {
        let deadline = self.ack_timeout;
        let mut failed = Vec::new();
        for (id, entry) in &mut self.entries {
            if entry.state == DeliveryState::Sending && entry.since.elapsed() >= deadline {
                entry.state = DeliveryState::Failed;
                entry.since = Instant::now();
                failed.push(*id);
            }
        }
        let retention = self.failed_retention;
        self.entries
            .retain(|_, entry| entry.state != DeliveryState::Failed || entry.since.elapsed() < retention);
        failed
    }

    /// Mark a message failed immediately (outright send failure).
    pub fn fail(&mut self, message_id: Uuid) -> bool {
        self.advance(message_id, DeliveryState::Failed).is_some()
    }
}
