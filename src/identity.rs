//! Resolving a presented credential to a subject.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::error::Result;
use crate::repositories::{SessionStore, bounded};

/// A resolved subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub subject_id: Uuid,
}

/// The external authority that turns a bearer token or session cookie into a subject.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// `Ok(None)` for an unknown or invalid credential; `Err` only when the
    /// provider itself cannot answer.
    async fn resolve_user(&self, credential: &str) -> Result<Option<Identity>>;
}

/// A fixed token table.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentityProvider {
    tokens: HashMap<String, Uuid>,
}

impl StaticIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, subject_id: Uuid) -> Self {
        self.tokens.insert(token.into(), subject_id);
        self
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn resolve_user(&self, credential: &str) -> Result<Option<Identity>> {
        Ok(self
            .tokens
            .get(credential)
            .map(|subject_id| Identity { subject_id: *subject_id }))
    }
}

/// Treats an active, unexpired session token as the credential.
///
/// Read-only: expiry and activity bookkeeping stay with the session manager.
#[derive(Clone)]
pub struct SessionIdentityProvider {
    sessions: Arc<dyn SessionStore>,
    clock: SharedClock,
    inactivity_timeout: chrono::Duration,
    store_timeout: Duration,
}

impl SessionIdentityProvider {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        clock: SharedClock,
        inactivity_timeout: chrono::Duration,
        store_timeout: Duration,
    ) -> Self {
        Self {
            sessions,
            clock,
            inactivity_timeout,
            store_timeout,
        }
    }
}

#[async_trait]
impl IdentityProvider for SessionIdentityProvider {
    async fn resolve_user(&self, credential: &str) -> Result<Option<Identity>> {
        let session = bounded(
            self.store_timeout,
            "resolve session identity",
            self.sessions.find(credential),
        )
        .await?;

        let now = self.clock.now();
        Ok(session
            .filter(|s| s.is_active && !s.is_expired_at(now) && !s.is_idle_at(now, self.inactivity_timeout))
            .map(|s| Identity { subject_id: s.subject_id }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::models::session::{LoginMethod, Session, SessionState};
    use crate::repositories::MemoryStore;

    #[tokio::test]
    async fn static_provider_knows_only_its_tokens() {
        let subject = Uuid::new_v4();
        let provider = StaticIdentityProvider::new().with_token("t-1", subject);
        assert_eq!(
            provider.resolve_user("t-1").await.unwrap(),
            Some(Identity { subject_id: subject })
        );
        assert!(provider.resolve_user("t-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn session_provider_ignores_idle_sessions() {
        let store = MemoryStore::new();
        let clock = ManualClock::default();
        let subject = Uuid::new_v4();
        let now = clock.now();
        store
            .insert_session(Session {
                session_id: "abc".into(),
                subject_id: subject,
                created_at: now,
                last_activity_at: now,
                expires_at: now + chrono::Duration::hours(24),
                ip_address: None,
                user_agent: None,
                is_active: true,
                state: SessionState::Active,
                login_method: LoginMethod::Email,
            })
            .await;

        let provider = SessionIdentityProvider::new(
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            chrono::Duration::hours(8),
            Duration::from_secs(1),
        );

        assert!(provider.resolve_user("abc").await.unwrap().is_some());
        clock.advance(chrono::Duration::hours(9));
        assert!(provider.resolve_user("abc").await.unwrap().is_none());
    }
}
