//! An in-memory implementation of every store, for single-node runs and tests.
//!
//! All tables sit behind one lock, so each trait call is atomic just like its
//! Postgres counterpart.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    error::{AppError, Result},
    models::{
        access::{DataAccessPermission, Role},
        consent::{Consent, ConsentGrant, ConsentStatus, ConsentType},
        security_event::{AuditRecord, SecurityEvent},
        session::{Session, SessionState},
    },
    repositories::{ConsentStore, PermissionStore, SecurityEventStore, SessionStore},
};

#[derive(Default)]
struct Tables {
    consents: Vec<Consent>,
    sessions: HashMap<String, Session>,
    events: Vec<SecurityEvent>,
    audits: Vec<AuditRecord>,
    roles: HashMap<Uuid, Vec<(Role, Option<DateTime<Utc>>)>>,
    permissions: HashMap<Uuid, Vec<(DataAccessPermission, Option<DateTime<Utc>>)>>,
}

#[derive(Default)]
struct Faults {
    offline: AtomicBool,
    latency: std::sync::RwLock<Option<Duration>>,
}

/// In-memory store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
    faults: Arc<Faults>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail with `StoreUnavailable` until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.faults.offline.store(offline, Ordering::SeqCst);
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.faults.latency.write().unwrap_or_else(|e| e.into_inner()) = latency;
    }

    async fn gate(&self) -> Result<()> {
        let latency = *self.faults.latency.read().unwrap_or_else(|e| e.into_inner());
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.faults.offline.load(Ordering::SeqCst) {
            return Err(AppError::StoreUnavailable("memory store offline".to_string()));
        }
        Ok(())
    }

    pub async fn grant_role(&self, subject_id: Uuid, role: Role, expires_at: Option<DateTime<Utc>>) {
        let mut tables = self.tables.write().await;
        tables.roles.entry(subject_id).or_default().push((role, expires_at));
    }

    pub async fn grant_permission(
        &self,
        subject_id: Uuid,
        permission: DataAccessPermission,
        expires_at: Option<DateTime<Utc>>,
    ) {
        let mut tables = self.tables.write().await;
        tables
            .permissions
            .entry(subject_id)
            .or_default()
            .push((permission, expires_at));
    }

    /// Inserts a session row as-is, bypassing the concurrency cap.
    pub async fn insert_session(&self, session: Session) {
        let mut tables = self.tables.write().await;
        tables.sessions.insert(session.session_id.clone(), session);
    }

    pub async fn security_events(&self) -> Vec<SecurityEvent> {
        self.tables.read().await.events.clone()
    }

    pub async fn audit_records(&self) -> Vec<AuditRecord> {
        self.tables.read().await.audits.clone()
    }

    pub async fn consents(&self) -> Vec<Consent> {
        self.tables.read().await.consents.clone()
    }
}

fn deactivate_in_place(session: &mut Session, state: SessionState) {
    session.is_active = false;
    session.state = state;
}

#[async_trait]
impl ConsentStore for MemoryStore {
    async fn upsert_granted(&self, grant: &ConsentGrant, now: DateTime<Utc>) -> Result<Consent> {
        self.gate().await?;
        let mut tables = self.tables.write().await;

        let existing = tables.consents.iter_mut().find(|c| {
            c.subject_id == grant.subject_id
                && c.consent_type == grant.consent_type
                && c.application_context == grant.application_context
                && c.status == ConsentStatus::Granted
        });

        if let Some(consent) = existing {
            consent.purpose = grant.purpose.clone();
            consent.legal_basis = grant.legal_basis.clone();
            consent.granted_at = now;
            consent.expires_at = grant.expires_at;
            consent.withdrawn_at = None;
            consent.withdrawal_reason = None;
            consent.updated_at = now;
            return Ok(consent.clone());
        }

        let consent = Consent {
            id: Uuid::new_v4(),
            subject_id: grant.subject_id,
            consent_type: grant.consent_type,
            purpose: grant.purpose.clone(),
            legal_basis: grant.legal_basis.clone(),
            status: ConsentStatus::Granted,
            application_context: grant.application_context.clone(),
            granted_at: now,
            withdrawn_at: None,
            expires_at: grant.expires_at,
            withdrawal_reason: None,
            updated_at: now,
        };
        tables.consents.push(consent.clone());
        Ok(consent)
    }

    async fn find_granted(&self, subject_id: Uuid, consent_type: ConsentType) -> Result<Vec<Consent>> {
        self.gate().await?;
        let tables = self.tables.read().await;
        let mut found: Vec<Consent> = tables
            .consents
            .iter()
            .filter(|c| {
                c.subject_id == subject_id
                    && c.consent_type == consent_type
                    && c.status == ConsentStatus::Granted
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| b.granted_at.cmp(&a.granted_at));
        Ok(found)
    }

    async fn mark_expired(&self, consent_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        self.gate().await?;
        let mut tables = self.tables.write().await;
        match tables
            .consents
            .iter_mut()
            .find(|c| c.id == consent_id && c.status == ConsentStatus::Granted)
        {
            Some(consent) => {
                consent.status = ConsentStatus::Expired;
                consent.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn withdraw(
        &self,
        subject_id: Uuid,
        consent_type: ConsentType,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        self.gate().await?;
        let mut tables = self.tables.write().await;
        let mut changed = 0;
        for consent in tables.consents.iter_mut().filter(|c| {
            c.subject_id == subject_id
                && c.consent_type == consent_type
                && c.status == ConsentStatus::Granted
        }) {
            consent.status = ConsentStatus::Withdrawn;
            consent.withdrawn_at = Some(now);
            consent.withdrawal_reason = reason.map(str::to_string);
            consent.updated_at = now;
            changed += 1;
        }
        Ok(changed)
    }

    async fn list_for_subject(&self, subject_id: Uuid) -> Result<Vec<Consent>> {
        self.gate().await?;
        let tables = self.tables.read().await;
        let mut found: Vec<Consent> = tables
            .consents
            .iter()
            .filter(|c| c.subject_id == subject_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.granted_at.cmp(&a.granted_at));
        Ok(found)
    }

    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<u64> {
        self.gate().await?;
        let mut tables = self.tables.write().await;
        let mut changed = 0;
        for consent in tables.consents.iter_mut().filter(|c| {
            c.status == ConsentStatus::Granted && c.expires_at.is_some_and(|exp| exp <= now)
        }) {
            consent.status = ConsentStatus::Expired;
            consent.updated_at = now;
            changed += 1;
        }
        Ok(changed)
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert_with_cap(
        &self,
        session: &Session,
        max_active: usize,
        _now: DateTime<Utc>,
    ) -> Result<Vec<Session>> {
        self.gate().await?;
        let mut tables = self.tables.write().await;

        let mut active: Vec<(DateTime<Utc>, String)> = tables
            .sessions
            .values()
            .filter(|s| s.subject_id == session.subject_id && s.is_active)
            .map(|s| (s.last_activity_at, s.session_id.clone()))
            .collect();
        active.sort();

        let overflow = (active.len() + 1).saturating_sub(max_active);
        let mut evicted = Vec::with_capacity(overflow);
        for (_, id) in active.into_iter().take(overflow) {
            if let Some(victim) = tables.sessions.get_mut(&id) {
                evicted.push(victim.clone());
                deactivate_in_place(victim, SessionState::Revoked);
            }
        }

        tables
            .sessions
            .insert(session.session_id.clone(), session.clone());
        Ok(evicted)
    }

    async fn find(&self, session_id: &str) -> Result<Option<Session>> {
        self.gate().await?;
        Ok(self.tables.read().await.sessions.get(session_id).cloned())
    }

    async fn touch(&self, session_id: &str, at: DateTime<Utc>) -> Result<bool> {
        self.gate().await?;
        let mut tables = self.tables.write().await;
        match tables.sessions.get_mut(session_id) {
            Some(session) if session.is_active => {
                session.last_activity_at = at.min(session.expires_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn deactivate(
        &self,
        session_id: &str,
        state: SessionState,
        _now: DateTime<Utc>,
    ) -> Result<Option<Session>> {
        self.gate().await?;
        let mut tables = self.tables.write().await;
        match tables.sessions.get_mut(session_id) {
            Some(session) if session.is_active => {
                let before = session.clone();
                deactivate_in_place(session, state);
                Ok(Some(before))
            }
            _ => Ok(None),
        }
    }

    async fn list_active(&self, subject_id: Uuid) -> Result<Vec<Session>> {
        self.gate().await?;
        let tables = self.tables.read().await;
        let mut found: Vec<Session> = tables
            .sessions
            .values()
            .filter(|s| s.subject_id == subject_id && s.is_active)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        Ok(found)
    }

    async fn find_stale(
        &self,
        expired_before: DateTime<Utc>,
        idle_before: DateTime<Utc>,
    ) -> Result<Vec<Session>> {
        self.gate().await?;
        let tables = self.tables.read().await;
        Ok(tables
            .sessions
            .values()
            .filter(|s| {
                s.is_active && (s.expires_at < expired_before || s.last_activity_at < idle_before)
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SecurityEventStore for MemoryStore {
    async fn append_event(&self, event: &SecurityEvent) -> Result<()> {
        self.gate().await?;
        self.tables.write().await.events.push(event.clone());
        Ok(())
    }

    async fn append_audit(&self, record: &AuditRecord) -> Result<()> {
        self.gate().await?;
        self.tables.write().await.audits.push(record.clone());
        Ok(())
    }

    async fn count_incidents_since(&self, subject_id: Uuid, since: DateTime<Utc>) -> Result<u64> {
        self.gate().await?;
        let tables = self.tables.read().await;
        Ok(tables
            .events
            .iter()
            .filter(|e| {
                e.subject_id == Some(subject_id) && e.created_at >= since && e.counts_as_incident()
            })
            .count() as u64)
    }

    async fn events_for_subject(&self, subject_id: Uuid, limit: i64) -> Result<Vec<SecurityEvent>> {
        self.gate().await?;
        let tables = self.tables.read().await;
        let mut found: Vec<SecurityEvent> = tables
            .events
            .iter()
            .filter(|e| e.subject_id == Some(subject_id))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        found.truncate(limit.max(0) as usize);
        Ok(found)
    }
}

#[async_trait]
impl PermissionStore for MemoryStore {
    async fn roles(&self, subject_id: Uuid, now: DateTime<Utc>) -> Result<Vec<Role>> {
        self.gate().await?;
        let tables = self.tables.read().await;
        Ok(tables
            .roles
            .get(&subject_id)
            .map(|grants| {
                grants
                    .iter()
                    .filter(|(_, exp)| exp.is_none_or(|e| e > now))
                    .map(|(role, _)| *role)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn permissions(&self, subject_id: Uuid, now: DateTime<Utc>) -> Result<Vec<DataAccessPermission>> {
        self.gate().await?;
        let tables = self.tables.read().await;
        Ok(tables
            .permissions
            .get(&subject_id)
            .map(|grants| {
                grants
                    .iter()
                    .filter(|(_, exp)| exp.is_none_or(|e| e > now))
                    .map(|(perm, _)| perm.clone())
                    .collect()
            })
            .unwrap_or_default())
    }
}
