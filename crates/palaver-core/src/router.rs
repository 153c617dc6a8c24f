use std::sync::Arc;

use palaver_models::{
    ChatMessagePayload, Envelope, EnvelopeKind, OnlineStatusPayload, ReadReceiptPayload, Target,
    TypingStatusPayload,
};

use crate::collaborators::{GroupDirectory, MessageStore, OfflineNotifier};
use crate::error::{EnqueueError, RouteError};
use crate::registry::ConnectionRegistry;

/// Outcome of one routing operation.
#[derive(Debug)]
pub struct RouteReceipt {
    /// User IDs the router attempted delivery for.
    pub attempted: Vec<i64>,
    /// Number of session queues that accepted the envelope.
    pub delivered_sessions: usize,
    /// Audience members with no live session, handed to the offline path.
    pub offline: Vec<i64>,
    /// Store-assigned row ID when the envelope was persisted.
    pub message_row_id: Option<i64>,
}

impl RouteReceipt {
    /// At least one live session accepted the push.
    pub fn any_delivered(&self) -> bool {
        self.delivered_sessions > 0
    }
}

/// Resolves an envelope's audience and hands it to the registry for
/// delivery to every session of every target user. Assigns no identity of
/// its own; de-duplication after client retries belongs to the sender and
/// the message store.
pub struct MessageRouter {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn MessageStore>,
    groups: Arc<dyn GroupDirectory>,
    offline: Arc<dyn OfflineNotifier>,
}

impl MessageRouter {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn MessageStore>,
        groups: Arc<dyn GroupDirectory>,
        offline: Arc<dyn OfflineNotifier>,
    ) -> Self {
        Self {
            registry,
            store,
            groups,
            offline,
        }
    }

    /// Route one envelope. Persists chat messages exactly once before
    /// fan-out, invokes the offline path at most once, and never blocks on
    /// a slow session: a full queue drops that session and delivery
    /// continues elsewhere.
    pub async fn route(&self, envelope: Envelope) -> Result<RouteReceipt, RouteError> {
        validate(&envelope)?;

        let audience = self.resolve_audience(&envelope).await?;

        // Persist before/alongside live fan-out so history never depends
        // on a recipient being online.
        let message_row_id = if envelope.kind == EnvelopeKind::ChatMessage {
            Some(
                self.store
                    .append(&envelope)
                    .await
                    .map_err(RouteError::Store)?,
            )
        } else {
            None
        };

        let mut delivered_sessions = 0;
        let mut offline = Vec::new();
        for &user_id in &audience {
            let sessions = self.registry.sessions_for(user_id);
            if sessions.is_empty() {
                offline.push(user_id);
                continue;
            }
            for session in sessions {
                match session.enqueue(envelope.clone()) {
                    Ok(()) => delivered_sessions += 1,
                    Err(EnqueueError::Overflow) => {
                        tracing::warn!(
                            session_id = %session.session_id(),
                            user_id,
                            "outbound queue overflow, dropping slow session"
                        );
                        self.registry.unregister(session.session_id());
                    }
                    Err(EnqueueError::Gone) => {
                        // Disconnect raced the snapshot; cleanup is
                        // idempotent.
                        tracing::debug!(
                            session_id = %session.session_id(),
                            user_id,
                            "session vanished between snapshot and write"
                        );
                        self.registry.unregister(session.session_id());
                    }
                }
            }
        }

        if envelope.kind == EnvelopeKind::ChatMessage && !offline.is_empty() {
            self.offline.notify(&envelope, &offline).await;
        }

        Ok(RouteReceipt {
            attempted: audience,
            delivered_sessions,
            offline,
            message_row_id,
        })
    }

    async fn resolve_audience(&self, envelope: &Envelope) -> Result<Vec<i64>, RouteError> {
        match envelope.target {
            Some(Target::User(user_id)) => Ok(vec![user_id]),
            Some(Target::Group(group_id)) => {
                // Membership is fetched fresh per routing call; caching it
                // here would go stale after membership changes.
                let members = self
                    .groups
                    .members_of(group_id)
                    .await
                    .map_err(RouteError::Membership)?;
                Ok(members
                    .into_iter()
                    .filter(|&m| m != envelope.sender_id)
                    .collect())
            }
            None => Err(RouteError::MissingTarget),
        }
    }
}

fn validate(envelope: &Envelope) -> Result<(), RouteError> {
    if envelope.kind.is_heartbeat() || !envelope.kind.client_originated() {
        return Err(RouteError::NotRoutable(envelope.kind));
    }
    match envelope.kind {
        EnvelopeKind::JoinChat | EnvelopeKind::LeaveChat => {
            if !matches!(envelope.target, Some(Target::Group(_))) {
                return Err(RouteError::GroupTargetRequired(envelope.kind));
            }
        }
        EnvelopeKind::ChatMessage => {
            payload_as::<ChatMessagePayload>(envelope, "chat_message")?;
        }
        EnvelopeKind::TypingStatus => {
            payload_as::<TypingStatusPayload>(envelope, "typing_status")?;
        }
        EnvelopeKind::OnlineStatus => {
            payload_as::<OnlineStatusPayload>(envelope, "online_status")?;
        }
        EnvelopeKind::ReadReceipt => {
            payload_as::<ReadReceiptPayload>(envelope, "read_receipt")?;
        }
        _ => {}
    }
    Ok(())
}

/// Require the envelope payload to deserialize into the canonical payload
/// type for its kind.
fn payload_as<T: serde::de::DeserializeOwned>(
    envelope: &Envelope,
    what: &'static str,
) -> Result<T, RouteError> {
    serde_json::from_value(envelope.payload.clone()).map_err(|_| RouteError::MalformedPayload(what))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SessionHandle;
    use crate::session::SessionInfo;
    use crate::testing::{RecordingNotifier, StaticGroups, VecStore};
    use serde_json::json;
    use uuid::Uuid;

    fn chat(sender: i64, target: Target) -> Envelope {
        Envelope::new(
            EnvelopeKind::ChatMessage,
            sender,
            Some(target),
            json!({"message_id": Uuid::new_v4().to_string(), "body": "hello"}),
        )
    }

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        store: Arc<VecStore>,
        notifier: Arc<RecordingNotifier>,
        router: MessageRouter,
    }

    fn fixture(groups: StaticGroups) -> Fixture {
        let registry = Arc::new(ConnectionRegistry::new(5));
        let store = Arc::new(VecStore::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let router = MessageRouter::new(
            registry.clone(),
            store.clone(),
            Arc::new(groups),
            notifier.clone(),
        );
        Fixture {
            registry,
            store,
            notifier,
            router,
        }
    }

    fn connect(fx: &Fixture, user_id: i64, device: &str) -> tokio::sync::mpsc::Receiver<Envelope> {
        let (handle, rx) = SessionHandle::new(SessionInfo::new(user_id, device), 16);
        fx.registry.register(handle).unwrap();
        rx
    }

    #[tokio::test]
    async fn direct_message_fans_out_to_every_device() {
        let fx = fixture(StaticGroups::default());
        let mut phone = connect(&fx, 2, "phone");
        let mut tab = connect(&fx, 2, "tab");

        let receipt = fx.router.route(chat(1, Target::User(2))).await.unwrap();

        assert_eq!(receipt.attempted, vec![2]);
        assert_eq!(receipt.delivered_sessions, 2);
        assert!(receipt.offline.is_empty());
        assert_eq!(phone.try_recv().unwrap().kind, EnvelopeKind::ChatMessage);
        assert_eq!(tab.try_recv().unwrap().kind, EnvelopeKind::ChatMessage);
        // Exactly once each.
        assert!(phone.try_recv().is_err());
        assert!(tab.try_recv().is_err());
        assert_eq!(fx.store.appended().len(), 1);
    }

    #[tokio::test]
    async fn offline_target_persists_once_and_notifies_once() {
        let fx = fixture(StaticGroups::default());
        let receipt = fx.router.route(chat(1, Target::User(9))).await.unwrap();

        assert_eq!(receipt.delivered_sessions, 0);
        assert_eq!(receipt.offline, vec![9]);
        assert_eq!(fx.store.appended().len(), 1);
        assert_eq!(fx.notifier.calls(), 1);
        assert_eq!(fx.notifier.last_offline(), vec![9]);
    }

    #[tokio::test]
    async fn group_fanout_excludes_the_sender() {
        let groups = StaticGroups::with(7, vec![1, 2, 3]);
        let fx = fixture(groups);
        let mut own = connect(&fx, 1, "phone");
        let mut other = connect(&fx, 2, "phone");

        let receipt = fx.router.route(chat(1, Target::Group(7))).await.unwrap();

        assert_eq!(receipt.attempted, vec![2, 3]);
        assert!(other.try_recv().is_ok());
        // The sender's own sessions never see an echo of their message.
        assert!(own.try_recv().is_err());
        // Member 3 is offline and goes to the notifier.
        assert_eq!(fx.notifier.last_offline(), vec![3]);
    }

    #[tokio::test]
    async fn per_sender_order_is_preserved_per_target_session() {
        let fx = fixture(StaticGroups::default());
        let mut rx = connect(&fx, 2, "phone");

        for body in ["a", "b", "c"] {
            let env = Envelope::new(
                EnvelopeKind::ChatMessage,
                1,
                Some(Target::User(2)),
                json!({"message_id": Uuid::new_v4().to_string(), "body": body}),
            );
            fx.router.route(env).await.unwrap();
        }

        let order: Vec<String> = (0..3)
            .map(|_| {
                rx.try_recv().unwrap().payload["body"]
                    .as_str()
                    .unwrap()
                    .to_string()
            })
            .collect();
        assert_eq!(order, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn slow_session_is_dropped_without_stalling_others() {
        let fx = fixture(StaticGroups::default());
        let (slow, _slow_rx) = SessionHandle::new(SessionInfo::new(2, "slow"), 1);
        fx.registry.register(slow.clone()).unwrap();
        let mut healthy = connect(&fx, 2, "healthy");

        fx.router.route(chat(1, Target::User(2))).await.unwrap();
        fx.router.route(chat(1, Target::User(2))).await.unwrap();

        // The one-deep queue overflowed on the second message.
        assert_eq!(slow.close_code(), Some(palaver_models::close_codes::CLOSE_SLOW_CONSUMER));
        assert_eq!(fx.registry.sessions_for(2).len(), 1);
        assert!(healthy.try_recv().is_ok());
        assert!(healthy.try_recv().is_ok());
    }

    #[tokio::test]
    async fn typing_status_is_not_persisted() {
        let fx = fixture(StaticGroups::default());
        let _rx = connect(&fx, 2, "phone");
        let env = Envelope::new(
            EnvelopeKind::TypingStatus,
            1,
            Some(Target::User(2)),
            json!({"typing": true}),
        );
        let receipt = fx.router.route(env).await.unwrap();
        assert!(receipt.message_row_id.is_none());
        assert!(fx.store.appended().is_empty());
        assert_eq!(fx.notifier.calls(), 0);
    }

    #[tokio::test]
    async fn rejects_heartbeats_and_malformed_envelopes() {
        let fx = fixture(StaticGroups::default());

        let ping = Envelope::ping(1);
        assert!(matches!(
            fx.router.route(ping).await,
            Err(RouteError::NotRoutable(EnvelopeKind::Ping))
        ));

        let no_target = Envelope::new(
            EnvelopeKind::ChatMessage,
            1,
            None,
            json!({"message_id": Uuid::new_v4().to_string(), "body": "hi"}),
        );
        assert!(matches!(
            fx.router.route(no_target).await,
            Err(RouteError::MissingTarget)
        ));

        // A payload that does not deserialize into the canonical shape for
        // its kind is rejected before any audience work.
        let no_body = Envelope::new(
            EnvelopeKind::ChatMessage,
            1,
            Some(Target::User(2)),
            json!({"message_id": Uuid::new_v4().to_string()}),
        );
        assert!(matches!(
            fx.router.route(no_body).await,
            Err(RouteError::MalformedPayload("chat_message"))
        ));

        let typing_not_bool = Envelope::new(
            EnvelopeKind::TypingStatus,
            1,
            Some(Target::User(2)),
            json!({"typing": "yes"}),
        );
        assert!(matches!(
            fx.router.route(typing_not_bool).await,
            Err(RouteError::MalformedPayload("typing_status"))
        ));

        let join_user_target = Envelope::new(
            EnvelopeKind::JoinChat,
            1,
            Some(Target::User(2)),
            json!({}),
        );
        assert!(matches!(
            fx.router.route(join_user_target).await,
            Err(RouteError::GroupTargetRequired(EnvelopeKind::JoinChat))
        ));

        assert!(fx.store.appended().is_empty());
    }
}
