use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use tokio_postgres::Row;
use uuid::Uuid;

use crate::{
    error::Result,
    models::consent::{Consent, ConsentGrant, ConsentStatus, ConsentType},
    repositories::column,
};

/// Row storage for consents.
///
/// Implementations guarantee at most one GRANTED row per
/// `(subject_id, consent_type, application_context)`, also under concurrent grants.
#[async_trait]
pub trait ConsentStore: Send + Sync {
    /// Updates the GRANTED row for the grant's key in place, or inserts a new one.
    async fn upsert_granted(&self, grant: &ConsentGrant, now: DateTime<Utc>) -> Result<Consent>;

    /// GRANTED rows of one type for a subject, any context, newest grant first.
    async fn find_granted(&self, subject_id: Uuid, consent_type: ConsentType) -> Result<Vec<Consent>>;

    /// GRANTED → EXPIRED for one row. False if the row was no longer GRANTED.
    async fn mark_expired(&self, consent_id: Uuid, now: DateTime<Utc>) -> Result<bool>;

    /// GRANTED → WITHDRAWN for every row of the type. Returns the number of rows changed.
    async fn withdraw(
        &self,
        subject_id: Uuid,
        consent_type: ConsentType,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    /// Every row for a subject, newest grant first.
    async fn list_for_subject(&self, subject_id: Uuid) -> Result<Vec<Consent>>;

    /// GRANTED rows past `expires_at` → EXPIRED. Returns the number of rows changed.
    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// A helper function to map a `tokio_postgres::Row` to a `Consent`.
fn row_to_consent(row: &Row) -> Result<Consent> {
    let consent_type: String = column(row, "consent_type")?;
    Ok(Consent {
        id: column(row, "id")?,
        subject_id: column(row, "subject_id")?,
        consent_type: consent_type.parse()?,
        purpose: column(row, "purpose")?,
        legal_basis: column(row, "legal_basis")?,
        status: column(row, "status")?,
        application_context: column(row, "application_context")?,
        granted_at: column(row, "granted_at")?,
        withdrawn_at: column(row, "withdrawn_at")?,
        expires_at: column(row, "expires_at")?,
        withdrawal_reason: column(row, "withdrawal_reason")?,
        updated_at: column(row, "updated_at")?,
    })
}

/// Postgres-backed consent storage.
#[derive(Clone)]
pub struct PgConsentStore {
    pool: Pool,
}

impl PgConsentStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConsentStore for PgConsentStore {
    async fn upsert_granted(&self, grant: &ConsentGrant, now: DateTime<Utc>) -> Result<Consent> {
        let client = self.pool.get().await?;
        // The partial unique index turns a racing second insert into an update.
        let row = client
            .query_one(
                r#"
                INSERT INTO user_consents (
                    id, subject_id, consent_type, purpose, legal_basis, status,
                    application_context, granted_at, expires_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, 'GRANTED', $6, $7, $8, $7)
                ON CONFLICT (subject_id, consent_type, (COALESCE(application_context, '')))
                    WHERE status = 'GRANTED'
                DO UPDATE SET
                    purpose = EXCLUDED.purpose,
                    legal_basis = EXCLUDED.legal_basis,
                    granted_at = EXCLUDED.granted_at,
                    expires_at = EXCLUDED.expires_at,
                    withdrawn_at = NULL,
                    withdrawal_reason = NULL,
                    updated_at = EXCLUDED.updated_at
                RETURNING *
                "#,
                &[
                    &Uuid::new_v4(),
                    &grant.subject_id,
                    &grant.consent_type.as_str(),
                    &grant.purpose,
                    &grant.legal_basis,
                    &grant.application_context,
                    &now,
                    &grant.expires_at,
                ],
            )
            .await?;
        row_to_consent(&row)
    }

    async fn find_granted(&self, subject_id: Uuid, consent_type: ConsentType) -> Result<Vec<Consent>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                r#"
                SELECT *
                FROM user_consents
                WHERE subject_id = $1 AND consent_type = $2 AND status = 'GRANTED'
                ORDER BY granted_at DESC
                "#,
                &[&subject_id, &consent_type.as_str()],
            )
            .await?;
        rows.iter().map(row_to_consent).collect()
    }

    async fn mark_expired(&self, consent_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let client = self.pool.get().await?;
        let changed = client
            .execute(
                r#"
                UPDATE user_consents
                SET status = $2, updated_at = $3
                WHERE id = $1 AND status = 'GRANTED'
                "#,
                &[&consent_id, &ConsentStatus::Expired, &now],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn withdraw(
        &self,
        subject_id: Uuid,
        consent_type: ConsentType,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let client = self.pool.get().await?;
        let changed = client
            .execute(
                r#"
                UPDATE user_consents
                SET status = $3, withdrawn_at = $4, withdrawal_reason = $5, updated_at = $4
                WHERE subject_id = $1 AND consent_type = $2 AND status = 'GRANTED'
                "#,
                &[
                    &subject_id,
                    &consent_type.as_str(),
                    &ConsentStatus::Withdrawn,
                    &now,
                    &reason,
                ],
            )
            .await?;
        Ok(changed)
    }

    async fn list_for_subject(&self, subject_id: Uuid) -> Result<Vec<Consent>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                r#"
                SELECT *
                FROM user_consents
                WHERE subject_id = $1
                ORDER BY granted_at DESC
                "#,
                &[&subject_id],
            )
            .await?;
        rows.iter().map(row_to_consent).collect()
    }

    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<u64> {
        let client = self.pool.get().await?;
        let changed = client
            .execute(
                r#"
                UPDATE user_consents
                SET status = $2, updated_at = $1
                WHERE status = 'GRANTED' AND expires_at IS NOT NULL AND expires_at <= $1
                "#,
                &[&now, &ConsentStatus::Expired],
            )
            .await?;
        Ok(changed)
    }
}
