use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use tokio_postgres::{Row, types::Json};
use uuid::Uuid;

use crate::{
    error::{AppError, Result},
    models::security_event::{
        AuditRecord, EventMetadata, LOW_SCORE_PATTERN, SecurityEvent, SecurityEventType,
    },
    repositories::column,
};

/// Append-only storage for security events and audit records.
#[async_trait]
pub trait SecurityEventStore: Send + Sync {
    async fn append_event(&self, event: &SecurityEvent) -> Result<()>;

    async fn append_audit(&self, record: &AuditRecord) -> Result<()>;

    /// Number of incident events for a subject created at or after `since`,
    /// excluding events raised only for a low score.
    async fn count_incidents_since(&self, subject_id: Uuid, since: DateTime<Utc>) -> Result<u64>;

    /// Events for a subject, newest first.
    async fn events_for_subject(&self, subject_id: Uuid, limit: i64) -> Result<Vec<SecurityEvent>>;
}

fn row_to_event(row: &Row) -> Result<SecurityEvent> {
    let event_type: String = column(row, "event_type")?;
    let metadata: Json<EventMetadata> = column(row, "metadata")?;
    Ok(SecurityEvent {
        id: column(row, "id")?,
        event_type: SecurityEventType::parse(&event_type)
            .ok_or_else(|| AppError::MissingData("event_type".to_string()))?,
        severity: column(row, "severity")?,
        subject_id: column(row, "subject_id")?,
        session_id: column(row, "session_id")?,
        ip_address: column(row, "ip_address")?,
        details: column(row, "details")?,
        metadata: metadata.0,
        created_at: column(row, "created_at")?,
    })
}

/// Names of the event types that count toward the incident total.
fn incident_type_names() -> Vec<&'static str> {
    [
        SecurityEventType::SuspiciousActivity,
        SecurityEventType::SessionHijack,
        SecurityEventType::AccessDenied,
        SecurityEventType::RateLimit,
        SecurityEventType::DataBreach,
    ]
    .iter()
    .filter(|t| t.is_incident())
    .map(|t| t.as_str())
    .collect()
}

#[derive(Clone)]
pub struct PgSecurityEventStore {
    pool: Pool,
}

impl PgSecurityEventStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SecurityEventStore for PgSecurityEventStore {
    async fn append_event(&self, event: &SecurityEvent) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                r#"
                INSERT INTO security_events (
                    id, event_type, severity, subject_id, session_id,
                    ip_address, details, metadata, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
                &[
                    &event.id,
                    &event.event_type.as_str(),
                    &event.severity,
                    &event.subject_id,
                    &event.session_id,
                    &event.ip_address,
                    &event.details,
                    &Json(&event.metadata),
                    &event.created_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn append_audit(&self, record: &AuditRecord) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                r#"
                INSERT INTO audit_logs (
                    id, subject_id, table_name, action, data_category, purpose,
                    legal_basis, ip_address, user_agent, session_id, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
                &[
                    &record.id,
                    &record.subject_id,
                    &record.table_name,
                    &record.action,
                    &record.data_category,
                    &record.purpose,
                    &record.legal_basis,
                    &record.ip_address,
                    &record.user_agent,
                    &record.session_id,
                    &record.created_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn count_incidents_since(&self, subject_id: Uuid, since: DateTime<Utc>) -> Result<u64> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                r#"
                SELECT COUNT(*) AS incidents
                FROM security_events
                WHERE subject_id = $1 AND created_at >= $2 AND event_type = ANY($3)
                  AND metadata->'patterns' IS DISTINCT FROM $4::jsonb
                "#,
                &[&subject_id, &since, &incident_type_names(), &Json(vec![LOW_SCORE_PATTERN])],
            )
            .await?;
        let incidents: i64 = column(&row, "incidents")?;
        Ok(incidents.max(0) as u64)
    }

    async fn events_for_subject(&self, subject_id: Uuid, limit: i64) -> Result<Vec<SecurityEvent>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                r#"
                SELECT *
                FROM security_events
                WHERE subject_id = $1
                ORDER BY created_at DESC
                LIMIT $2
                "#,
                &[&subject_id, &limit],
            )
            .await?;
        rows.iter().map(row_to_event).collect()
    }
}
