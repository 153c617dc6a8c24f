use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use palaver_models::Envelope;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use crate::error::{EnqueueError, RegistryError};
use crate::session::SessionInfo;

struct SessionShared {
    info: SessionInfo,
    tx: mpsc::Sender<Envelope>,
    last_heartbeat_ms: AtomicI64,
    /// 0 while open; once set to a close code the connection loop is
    /// expected to tear the socket down with that code.
    close_code: AtomicU16,
    closed: Notify,
}

/// Cheap handle to one registered session. The gateway's connection loop
/// and the registry each hold one; delivery goes through the bounded
/// outbound queue and never blocks.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
}

impl SessionHandle {
    /// Create a session with a bounded outbound queue. The receiver half
    /// belongs to the connection's write side.
    pub fn new(info: SessionInfo, queue_capacity: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(queue_capacity);
        let handle = Self {
            shared: Arc::new(SessionShared {
                last_heartbeat_ms: AtomicI64::new(Utc::now().timestamp_millis()),
                info,
                tx,
                close_code: AtomicU16::new(0),
                closed: Notify::new(),
            }),
        };
        (handle, rx)
    }

    pub fn session_id(&self) -> Uuid {
        self.shared.info.session_id
    }

    pub fn user_id(&self) -> i64 {
        self.shared.info.user_id
    }

    pub fn device_id(&self) -> &str {
        &self.shared.info.device_id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.shared.info.connected_at
    }

    /// Record a received ping.
    pub fn touch_heartbeat(&self) {
        self.shared
            .last_heartbeat_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_heartbeat(&self) -> DateTime<Utc> {
        let ms = self.shared.last_heartbeat_ms.load(Ordering::Relaxed);
        Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
    }

    /// Non-blocking enqueue onto the outbound queue. A full queue marks
    /// the session for closure and reports overflow; the caller is
    /// expected to unregister it.
    pub fn enqueue(&self, envelope: Envelope) -> Result<(), EnqueueError> {
        match self.shared.tx.try_send(envelope) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.begin_close(palaver_models::close_codes::CLOSE_SLOW_CONSUMER);
                Err(EnqueueError::Overflow)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(EnqueueError::Gone),
        }
    }

    /// Mark the session for closure with the given code. Idempotent: the
    /// first code wins. Wakes the connection loop waiting on
    /// [`SessionHandle::closed`].
    pub fn begin_close(&self, code: u16) {
        if self
            .shared
            .close_code
            .compare_exchange(0, code, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.shared.closed.notify_one();
        }
    }

    /// Close code set by [`SessionHandle::begin_close`], if any.
    pub fn close_code(&self) -> Option<u16> {
        match self.shared.close_code.load(Ordering::SeqCst) {
            0 => None,
            code => Some(code),
        }
    }

    /// Resolves once `begin_close` has been called.
    pub async fn closed(&self) {
        if self.close_code().is_some() {
            return;
        }
        self.shared.closed.notified().await;
    }
}

/// Concurrency-safe map from user ID to that user's live sessions. The
/// single shared mutable structure of the delivery core; all operations
/// are in-memory and never touch the network.
pub struct ConnectionRegistry {
    buckets: DashMap<i64, HashMap<Uuid, SessionHandle>>,
    owners: DashMap<Uuid, i64>,
    max_sessions_per_user: usize,
    active: AtomicUsize,
}

impl ConnectionRegistry {
    pub fn new(max_sessions_per_user: usize) -> Self {
        Self {
            buckets: DashMap::new(),
            owners: DashMap::new(),
            max_sessions_per_user,
            active: AtomicUsize::new(0),
        }
    }

    /// Add a session under its user ID. Multiple sessions per user are
    /// expected (multi-device); the per-user cap bounds them.
    pub fn register(&self, handle: SessionHandle) -> Result<(), RegistryError> {
        let user_id = handle.user_id();
        let session_id = handle.session_id();
        {
            let mut bucket = self.buckets.entry(user_id).or_default();
            if bucket.len() >= self.max_sessions_per_user {
                return Err(RegistryError::SessionLimit { user_id });
            }
            bucket.insert(session_id, handle);
        }
        self.owners.insert(session_id, user_id);
        self.active.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(%session_id, user_id, "session registered");
        Ok(())
    }

    /// Remove a session if present. Disconnect races are expected, so
    /// removing an absent session is a no-op, not an error.
    pub fn unregister(&self, session_id: Uuid) -> bool {
        let Some((_, user_id)) = self.owners.remove(&session_id) else {
            return false;
        };
        let mut emptied = false;
        if let Some(mut bucket) = self.buckets.get_mut(&user_id) {
            bucket.remove(&session_id);
            emptied = bucket.is_empty();
        }
        if emptied {
            self.buckets
                .remove_if(&user_id, |_, bucket| bucket.is_empty());
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!(%session_id, user_id, "session unregistered");
        true
    }

    /// Snapshot of the user's current sessions. The set may go stale the
    /// moment it is returned; delivery to a vanished session fails softly.
    pub fn sessions_for(&self, user_id: i64) -> Vec<SessionHandle> {
        self.buckets
            .get(&user_id)
            .map(|bucket| bucket.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_online(&self, user_id: i64) -> bool {
        self.buckets
            .get(&user_id)
            .map(|bucket| !bucket.is_empty())
            .unwrap_or(false)
    }

    /// Total live sessions, for logging.
    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Users with at least one live session, for logging.
    pub fn online_users(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palaver_models::close_codes::CLOSE_SLOW_CONSUMER;

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(5)
    }

    fn session(user_id: i64, device: &str, capacity: usize) -> (SessionHandle, mpsc::Receiver<Envelope>) {
        SessionHandle::new(SessionInfo::new(user_id, device), capacity)
    }

    #[test]
    fn unregister_is_idempotent() {
        let reg = registry();
        let (handle, _rx) = session(1, "phone", 8);
        let id = handle.session_id();
        reg.register(handle).unwrap();

        assert!(reg.unregister(id));
        assert!(!reg.unregister(id));
        assert!(!reg.unregister(Uuid::new_v4()));
        assert_eq!(reg.active_sessions(), 0);
        assert!(!reg.is_online(1));
    }

    #[test]
    fn multi_device_sessions_coexist() {
        let reg = registry();
        let (phone, _rx1) = session(1, "phone", 8);
        let (tab, _rx2) = session(1, "tab", 8);
        reg.register(phone).unwrap();
        reg.register(tab).unwrap();

        assert!(reg.is_online(1));
        assert_eq!(reg.sessions_for(1).len(), 2);
        assert_eq!(reg.online_users(), 1);
        assert_eq!(reg.active_sessions(), 2);
    }

    #[test]
    fn session_cap_is_enforced() {
        let reg = ConnectionRegistry::new(2);
        let mut keep = Vec::new();
        for i in 0..2 {
            let (h, rx) = session(1, &format!("d{i}"), 8);
            reg.register(h).unwrap();
            keep.push(rx);
        }
        let (extra, _rx) = session(1, "d2", 8);
        assert!(matches!(
            reg.register(extra),
            Err(RegistryError::SessionLimit { user_id: 1 })
        ));
    }

    #[test]
    fn overflow_marks_session_for_closure() {
        let (handle, mut rx) = session(1, "phone", 1);
        handle.enqueue(Envelope::pong()).unwrap();
        let err = handle.enqueue(Envelope::pong()).unwrap_err();
        assert!(matches!(err, EnqueueError::Overflow));
        assert_eq!(handle.close_code(), Some(CLOSE_SLOW_CONSUMER));
        // The queued envelope is still drainable by the write side.
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn enqueue_after_disconnect_fails_softly() {
        let (handle, rx) = session(1, "phone", 4);
        drop(rx);
        assert!(matches!(
            handle.enqueue(Envelope::pong()),
            Err(EnqueueError::Gone)
        ));
    }

    #[tokio::test]
    async fn begin_close_wakes_waiter_even_if_already_closed() {
        let (handle, _rx) = session(1, "phone", 4);
        handle.begin_close(4010);
        handle.begin_close(4999);
        // First code wins, and a late waiter still returns immediately.
        handle.closed().await;
        assert_eq!(handle.close_code(), Some(4010));
    }
}
