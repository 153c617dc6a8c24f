//! Seams to the externally-owned parts of the application. The delivery
//! core only ever talks to persistence, auth, group membership and the
//! offline-notification path through these traits, so the composition
//! root can wire REST clients and tests can wire fakes.

use async_trait::async_trait;
use palaver_models::Envelope;

use crate::error::{AuthError, CollaboratorError};

/// Token validation, invoked exactly once per connection at handshake.
/// Token issuance lives elsewhere.
#[async_trait]
pub trait AuthValidator: Send + Sync {
    /// Returns the authenticated user ID for a valid token.
    async fn validate(&self, token: &str) -> Result<i64, AuthError>;
}

/// Synchronous (from the router's point of view) append into message
/// history, so persistence never depends on any recipient being online.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist the envelope, returning the store-assigned message row ID.
    async fn append(&self, envelope: &Envelope) -> Result<i64, CollaboratorError>;
}

/// Read-only group membership, fetched fresh on every group-addressed
/// routing operation. The router never caches the result.
#[async_trait]
pub trait GroupDirectory: Send + Sync {
    async fn members_of(&self, group_id: i64) -> Result<Vec<i64>, CollaboratorError>;
}

/// Offline fan-out (push notification, badge counts). Invoked at most
/// once per routing call with the audience members that had no live
/// session; failures here never fail the routing call.
#[async_trait]
pub trait OfflineNotifier: Send + Sync {
    async fn notify(&self, envelope: &Envelope, offline_user_ids: &[i64]);
}
