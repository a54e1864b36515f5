use std::sync::Arc;
use std::time::Duration;

use garde::Validate;
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::config::PurposeTable;
use crate::error::Result;
use crate::models::consent::{
    ApplicationType, Consent, ConsentCheck, ConsentGrant, ConsentRequest, ConsentStatus,
    ConsentSummary, ConsentType, RequiredConsents,
};
use crate::models::security_event::{
    EventMetadata, MetadataKey, SecurityEvent, SecurityEventType, Severity,
};
use crate::repositories::{ConsentStore, bounded};
use crate::services::audit::SecurityEventLog;

/// The consent ledger: grants, checks and withdrawals per subject.
#[derive(Clone)]
pub struct ConsentLedger {
    store: Arc<dyn ConsentStore>,
    events: SecurityEventLog,
    clock: SharedClock,
    purposes: Arc<PurposeTable>,
    store_timeout: Duration,
}

impl ConsentLedger {
    pub fn new(
        store: Arc<dyn ConsentStore>,
        events: SecurityEventLog,
        clock: SharedClock,
        purposes: PurposeTable,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            events,
            clock,
            purposes: Arc::new(purposes),
            store_timeout,
        }
    }

    /// Grants a consent, or refreshes the live grant for the same type and context.
    ///
    /// # Arguments
    ///
    /// * `subject_id` - The subject giving consent.
    /// * `request` - What is consented to. Purpose and legal basis default from the purpose table.
    ///
    /// # Returns
    ///
    /// The stored consent.
    pub async fn grant(&self, subject_id: Uuid, request: ConsentRequest) -> Result<Consent> {
        request.validate()?;

        let (default_purpose, default_basis) = self
            .purposes
            .lookup(request.consent_type, request.application_context.as_deref());
        let grant = ConsentGrant {
            subject_id,
            consent_type: request.consent_type,
            purpose: request.purpose.unwrap_or_else(|| default_purpose.to_string()),
            legal_basis: request.legal_basis.unwrap_or_else(|| default_basis.to_string()),
            application_context: request.application_context,
            expires_at: request.expires_at,
        };

        let now = self.clock.now();
        let consent = bounded(
            self.store_timeout,
            "grant consent",
            self.store.upsert_granted(&grant, now),
        )
        .await?;

        tracing::info!(
            subject_id = %subject_id,
            consent_type = %consent.consent_type,
            context = ?consent.application_context,
            "✅ Consent granted"
        );

        self.events
            .record(
                SecurityEvent::new(
                    SecurityEventType::ConsentGranted,
                    Severity::Low,
                    format!("Consent granted: {}", consent.consent_type),
                )
                .subject(Some(subject_id))
                .metadata(
                    EventMetadata::new()
                        .with(MetadataKey::ConsentType, consent.consent_type.as_str())
                        .with_opt(
                            MetadataKey::ApplicationContext,
                            consent.application_context.clone(),
                        ),
                ),
            )
            .await;

        Ok(consent)
    }

    /// Grants several consents at once, in order. Stops at the first failure.
    pub async fn grant_many(
        &self,
        subject_id: Uuid,
        requests: impl IntoIterator<Item = ConsentRequest>,
    ) -> Result<Vec<Consent>> {
        let mut granted = Vec::new();
        for request in requests {
            granted.push(self.grant(subject_id, request).await?);
        }
        Ok(granted)
    }

    /// Whether the subject holds a valid consent of `consent_type` for `context`.
    ///
    /// Expiry is evaluated now; a GRANTED row found past its expiry is moved
    /// to EXPIRED on the way.
    pub async fn check(
        &self,
        subject_id: Uuid,
        consent_type: ConsentType,
        context: Option<&str>,
    ) -> Result<ConsentCheck> {
        let rows = bounded(
            self.store_timeout,
            "find consents",
            self.store.find_granted(subject_id, consent_type),
        )
        .await?;

        let now = self.clock.now();
        let mut valid = None;
        for row in rows.into_iter().filter(|c| c.covers_context(context)) {
            if row.is_valid_at(now) {
                if valid.is_none() {
                    valid = Some(row);
                }
                continue;
            }

            // Past expiry; the answer is already "no" for this row.
            match bounded(
                self.store_timeout,
                "expire consent",
                self.store.mark_expired(row.id, now),
            )
            .await
            {
                Ok(_) => tracing::debug!(consent_id = %row.id, "Consent expired on read"),
                Err(e) => tracing::warn!(consent_id = %row.id, "⚠️ Failed to mark consent expired: {}", e),
            }
        }

        Ok(ConsentCheck {
            has_consent: valid.is_some(),
            consent: valid,
        })
    }

    /// Withdraws every live grant of `consent_type`, across application contexts.
    ///
    /// Returns `false` when there was nothing to withdraw.
    pub async fn withdraw(
        &self,
        subject_id: Uuid,
        consent_type: ConsentType,
        reason: Option<&str>,
    ) -> Result<bool> {
        let now = self.clock.now();
        let changed = bounded(
            self.store_timeout,
            "withdraw consent",
            self.store.withdraw(subject_id, consent_type, reason, now),
        )
        .await?;

        if changed == 0 {
            tracing::debug!(subject_id = %subject_id, consent_type = %consent_type, "Nothing to withdraw");
            return Ok(false);
        }

        tracing::info!(
            subject_id = %subject_id,
            consent_type = %consent_type,
            rows = changed,
            "Consent withdrawn"
        );

        self.events
            .record(
                SecurityEvent::new(
                    SecurityEventType::ConsentWithdrawn,
                    Severity::Low,
                    format!("Consent withdrawn: {}", consent_type),
                )
                .subject(Some(subject_id))
                .metadata(
                    EventMetadata::new()
                        .with(MetadataKey::ConsentType, consent_type.as_str())
                        .with_opt(MetadataKey::Reason, reason),
                ),
            )
            .await;

        Ok(true)
    }

    /// Checks the consents every application needs, reporting the missing ones in order.
    pub async fn check_required_consents(
        &self,
        subject_id: Uuid,
        application: ApplicationType,
    ) -> Result<RequiredConsents> {
        let mut missing = Vec::new();
        for consent_type in ConsentType::REQUIRED {
            let check = self
                .check(subject_id, consent_type, Some(application.as_str()))
                .await?;
            if !check.has_consent {
                missing.push(consent_type);
            }
        }

        Ok(RequiredConsents {
            has_all_required: missing.is_empty(),
            missing,
        })
    }

    /// Every consent row of the subject, newest grant first.
    pub async fn user_consents(&self, subject_id: Uuid) -> Result<Vec<Consent>> {
        bounded(
            self.store_timeout,
            "list consents",
            self.store.list_for_subject(subject_id),
        )
        .await
    }

    /// Counts for the privacy dashboard. GRANTED rows past expiry count as expired.
    pub async fn consent_summary(&self, subject_id: Uuid) -> Result<ConsentSummary> {
        let consents = self.user_consents(subject_id).await?;
        let now = self.clock.now();

        let active_consents = consents.iter().filter(|c| c.is_valid_at(now)).count();
        let withdrawn_consents = consents
            .iter()
            .filter(|c| c.status == ConsentStatus::Withdrawn)
            .count();

        Ok(ConsentSummary {
            total_consents: consents.len(),
            active_consents,
            withdrawn_consents,
            expired_consents: consents.len() - active_consents - withdrawn_consents,
            last_activity: consents.iter().map(|c| c.updated_at).max(),
        })
    }

    /// Moves every GRANTED row past its expiry to EXPIRED.
    pub async fn expire_overdue(&self) -> Result<u64> {
        let now = self.clock.now();
        let expired = bounded(
            self.store_timeout,
            "expire overdue consents",
            self.store.expire_overdue(now),
        )
        .await?;
        if expired > 0 {
            tracing::info!("🧹 Expired {} overdue consents", expired);
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::error::AppError;
    use crate::repositories::MemoryStore;
    use chrono::Duration as ChronoDuration;

    fn ledger(store: &MemoryStore, clock: &ManualClock) -> ConsentLedger {
        let clock: SharedClock = Arc::new(clock.clone());
        let events = SecurityEventLog::new(Arc::new(store.clone()), clock.clone(), Duration::from_secs(1));
        ConsentLedger::new(
            Arc::new(store.clone()),
            events,
            clock,
            PurposeTable::default(),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn regrant_updates_in_place() {
        let store = MemoryStore::new();
        let clock = ManualClock::default();
        let ledger = ledger(&store, &clock);
        let subject = Uuid::new_v4();

        let first = ledger
            .grant(subject, ConsentRequest::new(ConsentType::Analytics))
            .await
            .unwrap();
        clock.advance(ChronoDuration::minutes(5));
        let second = ledger
            .grant(subject, ConsentRequest::new(ConsentType::Analytics))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.granted_at, clock.now());
        assert_eq!(store.consents().await.len(), 1);
    }

    #[tokio::test]
    async fn purpose_defaults_come_from_the_table() {
        let store = MemoryStore::new();
        let clock = ManualClock::default();
        let ledger = ledger(&store, &clock);

        let consent = ledger
            .grant(
                Uuid::new_v4(),
                ConsentRequest::new(ConsentType::FinancialData).in_context(ApplicationType::Kita),
            )
            .await
            .unwrap();

        assert_eq!(consent.purpose, "Berechnung des Elternbeitrags");
    }

    #[tokio::test]
    async fn expired_grant_fails_the_check_and_is_marked() {
        let store = MemoryStore::new();
        let clock = ManualClock::default();
        let ledger = ledger(&store, &clock);
        let subject = Uuid::new_v4();

        ledger
            .grant(
                subject,
                ConsentRequest::new(ConsentType::ChildData)
                    .expiring_at(clock.now() + ChronoDuration::hours(1)),
            )
            .await
            .unwrap();

        assert!(ledger.check(subject, ConsentType::ChildData, None).await.unwrap().has_consent);

        clock.advance(ChronoDuration::hours(2));
        let check = ledger.check(subject, ConsentType::ChildData, None).await.unwrap();
        assert!(!check.has_consent);
        assert_eq!(store.consents().await[0].status, ConsentStatus::Expired);
    }

    #[tokio::test]
    async fn context_free_grant_covers_applications() {
        let store = MemoryStore::new();
        let clock = ManualClock::default();
        let ledger = ledger(&store, &clock);
        let subject = Uuid::new_v4();

        ledger
            .grant(subject, ConsentRequest::new(ConsentType::DataProcessing))
            .await
            .unwrap();
        ledger
            .grant(
                subject,
                ConsentRequest::new(ConsentType::ChildData).in_context(ApplicationType::Elterngeld),
            )
            .await
            .unwrap();

        assert!(ledger
            .check(subject, ConsentType::DataProcessing, Some("kita"))
            .await
            .unwrap()
            .has_consent);
        assert!(!ledger
            .check(subject, ConsentType::ChildData, Some("kita"))
            .await
            .unwrap()
            .has_consent);
    }

    #[tokio::test]
    async fn withdraw_without_grant_returns_false() {
        let store = MemoryStore::new();
        let clock = ManualClock::default();
        let ledger = ledger(&store, &clock);

        assert!(!ledger
            .withdraw(Uuid::new_v4(), ConsentType::Analytics, None)
            .await
            .unwrap());
        assert!(store.security_events().await.is_empty());
    }

    #[tokio::test]
    async fn summary_counts_each_status() {
        let store = MemoryStore::new();
        let clock = ManualClock::default();
        let ledger = ledger(&store, &clock);
        let subject = Uuid::new_v4();

        ledger
            .grant(subject, ConsentRequest::new(ConsentType::Analytics))
            .await
            .unwrap();
        ledger
            .grant(subject, ConsentRequest::new(ConsentType::EmailNotifications))
            .await
            .unwrap();
        ledger
            .grant(
                subject,
                ConsentRequest::new(ConsentType::DocumentVault)
                    .expiring_at(clock.now() + ChronoDuration::minutes(1)),
            )
            .await
            .unwrap();
        ledger
            .withdraw(subject, ConsentType::Analytics, Some("no longer needed"))
            .await
            .unwrap();
        clock.advance(ChronoDuration::minutes(2));

        let summary = ledger.consent_summary(subject).await.unwrap();
        assert_eq!(summary.total_consents, 3);
        assert_eq!(summary.active_consents, 1);
        assert_eq!(summary.withdrawn_consents, 1);
        assert_eq!(summary.expired_consents, 1);
    }

    #[tokio::test]
    async fn invalid_request_is_rejected() {
        let store = MemoryStore::new();
        let clock = ManualClock::default();
        let ledger = ledger(&store, &clock);

        let err = ledger
            .grant(
                Uuid::new_v4(),
                ConsentRequest::new(ConsentType::Analytics).with_purpose("", "basis"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
