//! In-memory collaborator fakes for tests and local development.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use palaver_models::Envelope;

use crate::collaborators::{AuthValidator, GroupDirectory, MessageStore, OfflineNotifier};
use crate::error::{AuthError, CollaboratorError};

/// Message store that appends into a vector and hands out sequential row
/// IDs.
#[derive(Default)]
pub struct VecStore {
    appended: Mutex<Vec<Envelope>>,
    next_id: AtomicI64,
}

impl VecStore {
    pub fn appended(&self) -> Vec<Envelope> {
        self.appended.lock().expect("store lock").clone()
    }
}

#[async_trait]
impl MessageStore for VecStore {
    async fn append(&self, envelope: &Envelope) -> Result<i64, CollaboratorError> {
        self.appended.lock().expect("store lock").push(envelope.clone());
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

/// Fixed group membership table.
#[derive(Default)]
pub struct StaticGroups {
    groups: HashMap<i64, Vec<i64>>,
}

impl StaticGroups {
    pub fn with(group_id: i64, members: Vec<i64>) -> Self {
        let mut groups = HashMap::new();
        groups.insert(group_id, members);
        Self { groups }
    }

    pub fn insert(&mut self, group_id: i64, members: Vec<i64>) {
        self.groups.insert(group_id, members);
    }
}

#[async_trait]
impl GroupDirectory for StaticGroups {
    async fn members_of(&self, group_id: i64) -> Result<Vec<i64>, CollaboratorError> {
        self.groups
            .get(&group_id)
            .cloned()
            .ok_or(CollaboratorError::NotFound)
    }
}

/// Records offline-notification calls.
#[derive(Default)]
pub struct RecordingNotifier {
    calls: Mutex<Vec<Vec<i64>>>,
}

impl RecordingNotifier {
    pub fn calls(&self) -> usize {
        self.calls.lock().expect("notifier lock").len()
    }

    pub fn last_offline(&self) -> Vec<i64> {
        self.calls
            .lock()
            .expect("notifier lock")
            .last()
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl OfflineNotifier for RecordingNotifier {
    async fn notify(&self, _envelope: &Envelope, offline_user_ids: &[i64]) {
        self.calls
            .lock()
            .expect("notifier lock")
            .push(offline_user_ids.to_vec());
    }
}

/// Validator accepting a fixed token -> user table.
#[derive(Default)]
pub struct StaticTokens {
    tokens: HashMap<String, i64>,
}

impl StaticTokens {
    pub fn with(token: impl Into<String>, user_id: i64) -> Self {
        let mut tokens = HashMap::new();
        tokens.insert(token.into(), user_id);
        Self { tokens }
    }

    pub fn insert(&mut self, token: impl Into<String>, user_id: i64) {
        self.tokens.insert(token.into(), user_id);
    }
}

#[async_trait]
impl AuthValidator for StaticTokens {
    async fn validate(&self, token: &str) -> Result<i64, AuthError> {
        self.tokens
            .get(token)
            .copied()
            .ok_or(AuthError::InvalidToken)
    }
}
