use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token expired")]
    TokenExpired,
    #[error("invalid token")]
    InvalidToken,
    #[error("internal error: {0}")]
    Internal(String),
}

/// Failures from the external message-store and group-membership
/// collaborators.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("not found")]
    NotFound,
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("session limit reached for user {user_id}")]
    SessionLimit { user_id: i64 },
}

/// Failure to enqueue onto a session's bounded outbound queue.
#[derive(Debug, Error)]
pub enum EnqueueError {
    /// Queue full: the consumer is too slow and the session is being
    /// dropped.
    #[error("outbound queue overflow")]
    Overflow,
    /// The session's receive side is already gone; a disconnect raced the
    /// delivery attempt.
    #[error("session gone")]
    Gone,
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("envelope kind {0:?} is not routable")]
    NotRoutable(palaver_models::EnvelopeKind),
    #[error("envelope is missing a target")]
    MissingTarget,
    #[error("malformed payload: {0}")]
    MalformedPayload(&'static str),
    #[error("group-addressed {0:?} requires a group target")]
    GroupTargetRequired(palaver_models::EnvelopeKind),
    #[error("message store append failed: {0}")]
    Store(#[source] CollaboratorError),
    #[error("group membership lookup failed: {0}")]
    Membership(#[source] CollaboratorError),
}
