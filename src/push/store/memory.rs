//! In-memory store implementations

use std::collections::BTreeSet;

use async_trait::async_trait;
use dashmap::DashMap;

use super::traits::{
    CredentialStore, DeleteOutcome, RegistrationStore, SessionLookup, StoreBackend, StoreError,
};
use crate::push::types::{Credentials, PushUser, Session};

/// Registrations kept in memory (lost on restart)
#[derive(Default)]
pub struct MemoryRegistrationStore {
    /// push user -> registered client ids
    registrations: DashMap<PushUser, BTreeSet<String>>,
}

impl MemoryRegistrationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RegistrationStore for MemoryRegistrationStore {
    fn backend_type(&self) -> StoreBackend {
        StoreBackend::Memory
    }

    async fn insert(&self, push_user: &PushUser, client_id: &str) -> Result<bool, StoreError> {
        let key = PushUser::new(push_user.user_id, push_user.context_id);
        Ok(self
            .registrations
            .entry(key)
            .or_default()
            .insert(client_id.to_string()))
    }

    async fn delete(
        &self,
        push_user: &PushUser,
        client_id: &str,
    ) -> Result<DeleteOutcome, StoreError> {
        let outcome = match self.registrations.get_mut(push_user) {
            Some(mut clients) => {
                if !clients.remove(client_id) {
                    DeleteOutcome::NotFound
                } else if clients.is_empty() {
                    DeleteOutcome::LastRemoved
                } else {
                    DeleteOutcome::OtherRemaining
                }
            }
            None => DeleteOutcome::NotFound,
        };

        if outcome == DeleteOutcome::LastRemoved {
            self.registrations.remove_if(push_user, |_, clients| clients.is_empty());
        }
        Ok(outcome)
    }

    async fn delete_all(&self, push_user: &PushUser) -> Result<u64, StoreError> {
        Ok(self
            .registrations
            .remove(push_user)
            .map(|(_, clients)| clients.len() as u64)
            .unwrap_or(0))
    }

    async fn list_push_users(&self) -> Result<Vec<PushUser>, StoreError> {
        let mut users: Vec<_> = self
            .registrations
            .iter()
            .filter(|e| !e.value().is_empty())
            .map(|e| e.key().clone())
            .collect();
        users.sort();
        Ok(users)
    }

    async fn exists(&self, push_user: &PushUser) -> Result<bool, StoreError> {
        Ok(self
            .registrations
            .get(push_user)
            .map(|clients| !clients.is_empty())
            .unwrap_or(false))
    }
}

/// Credentials kept in memory
#[derive(Default)]
pub struct MemoryCredentialStore {
    credentials: DashMap<(i32, i32), Credentials>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    fn backend_type(&self) -> StoreBackend {
        StoreBackend::Memory
    }

    async fn get(&self, user_id: i32, context_id: i32) -> Result<Option<Credentials>, StoreError> {
        Ok(self
            .credentials
            .get(&(context_id, user_id))
            .map(|c| c.clone()))
    }

    async fn store(&self, credentials: &Credentials) -> Result<(), StoreError> {
        self.credentials.insert(
            (credentials.context_id, credentials.user_id),
            credentials.clone(),
        );
        Ok(())
    }

    async fn delete(&self, user_id: i32, context_id: i32) -> Result<bool, StoreError> {
        Ok(self.credentials.remove(&(context_id, user_id)).is_some())
    }
}

/// Directory of live sessions, keyed by push user.
///
/// The most recently added session of a user wins.
#[derive(Default)]
pub struct MemorySessionDirectory {
    sessions: DashMap<PushUser, Session>,
}

impl MemorySessionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, session: Session) {
        self.sessions
            .insert(PushUser::new(session.user_id, session.context_id), session);
    }

    pub fn remove(&self, push_user: &PushUser) -> Option<Session> {
        self.sessions.remove(push_user).map(|(_, s)| s)
    }
}

#[async_trait]
impl SessionLookup for MemorySessionDirectory {
    async fn find_session(&self, push_user: &PushUser) -> Option<Session> {
        self.sessions.get(push_user).map(|s| s.clone())
    }
}
