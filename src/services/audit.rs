use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::error::Result;
use crate::models::security_event::{AuditRecord, SecurityEvent, Severity};
use crate::repositories::{SecurityEventStore, bounded};

/// Receives CRITICAL events for out-of-band alerting.
#[async_trait]
pub trait EscalationHook: Send + Sync {
    async fn escalate(&self, event: &SecurityEvent);
}

/// Escalates by logging at error level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogEscalation;

#[async_trait]
impl EscalationHook for LogEscalation {
    async fn escalate(&self, event: &SecurityEvent) {
        tracing::error!(
            event_id = %event.id,
            event_type = %event.event_type,
            subject_id = ?event.subject_id,
            "🚨 CRITICAL security event: {}",
            event.details
        );
    }
}

/// Append-only log of security events and audit records.
///
/// Writing is telemetry: a failing store is logged and swallowed so the
/// request being observed still completes.
#[derive(Clone)]
pub struct SecurityEventLog {
    store: Arc<dyn SecurityEventStore>,
    clock: SharedClock,
    escalation: Arc<dyn EscalationHook>,
    store_timeout: Duration,
}

impl SecurityEventLog {
    pub fn new(store: Arc<dyn SecurityEventStore>, clock: SharedClock, store_timeout: Duration) -> Self {
        Self {
            store,
            clock,
            escalation: Arc::new(LogEscalation),
            store_timeout,
        }
    }

    /// Replaces the escalation hook.
    pub fn with_escalation(mut self, hook: Arc<dyn EscalationHook>) -> Self {
        self.escalation = hook;
        self
    }

    /// Records an event, stamped with the current time.
    ///
    /// # Arguments
    ///
    /// * `event` - The event to append.
    ///
    /// CRITICAL events are handed to the escalation hook on a spawned task.
    pub async fn record(&self, mut event: SecurityEvent) {
        event.created_at = self.clock.now();

        match event.severity {
            Severity::Low => tracing::debug!(
                event_type = %event.event_type,
                subject_id = ?event.subject_id,
                "{}",
                event.details
            ),
            Severity::Medium | Severity::High => tracing::warn!(
                event_type = %event.event_type,
                severity = ?event.severity,
                subject_id = ?event.subject_id,
                "{}",
                event.details
            ),
            Severity::Critical => {}
        }

        if let Err(e) = bounded(
            self.store_timeout,
            "append security event",
            self.store.append_event(&event),
        )
        .await
        {
            tracing::warn!("⚠️ Failed to persist {} event: {}", event.event_type, e);
        }

        if event.severity == Severity::Critical {
            let hook = self.escalation.clone();
            tokio::spawn(async move {
                hook.escalate(&event).await;
            });
        }
    }

    /// Appends an audit record, stamped with the current time.
    pub async fn audit(&self, mut record: AuditRecord) {
        record.created_at = self.clock.now();
        if let Err(e) = bounded(
            self.store_timeout,
            "append audit record",
            self.store.append_audit(&record),
        )
        .await
        {
            tracing::warn!(
                table = %record.table_name,
                action = %record.action,
                "⚠️ Failed to persist audit record: {}",
                e
            );
        }
    }

    /// Incident events for a subject since `since`.
    pub async fn incidents_since(&self, subject_id: Uuid, since: DateTime<Utc>) -> Result<u64> {
        bounded(
            self.store_timeout,
            "count incidents",
            self.store.count_incidents_since(subject_id, since),
        )
        .await
    }

    pub async fn events_for_subject(&self, subject_id: Uuid, limit: i64) -> Result<Vec<SecurityEvent>> {
        bounded(
            self.store_timeout,
            "list security events",
            self.store.events_for_subject(subject_id, limit),
        )
        .await
    }
}
