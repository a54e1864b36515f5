use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use postgres_types::{FromSql, ToSql};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::access::DataCategory;

/// Event severity. `Critical` triggers escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, ToSql, FromSql)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[postgres(name = "event_severity")]
pub enum Severity {
    #[postgres(name = "LOW")]
    Low,
    #[postgres(name = "MEDIUM")]
    Medium,
    #[postgres(name = "HIGH")]
    High,
    #[postgres(name = "CRITICAL")]
    Critical,
}

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventType {
    Login,
    Logout,
    Timeout,
    SuspiciousActivity,
    SessionHijack,
    AccessDenied,
    RateLimit,
    DataBreach,
    ConsentGranted,
    ConsentWithdrawn,
}

impl SecurityEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityEventType::Login => "login",
            SecurityEventType::Logout => "logout",
            SecurityEventType::Timeout => "timeout",
            SecurityEventType::SuspiciousActivity => "suspicious_activity",
            SecurityEventType::SessionHijack => "session_hijack",
            SecurityEventType::AccessDenied => "access_denied",
            SecurityEventType::RateLimit => "rate_limit",
            SecurityEventType::DataBreach => "data_breach",
            SecurityEventType::ConsentGranted => "consent_granted",
            SecurityEventType::ConsentWithdrawn => "consent_withdrawn",
        }
    }

    /// Parses the stored name back. Unknown names map to `None`.
    pub fn parse(s: &str) -> Option<Self> {
        use SecurityEventType::*;
        [
            Login,
            Logout,
            Timeout,
            SuspiciousActivity,
            SessionHijack,
            AccessDenied,
            RateLimit,
            DataBreach,
            ConsentGranted,
            ConsentWithdrawn,
        ]
        .into_iter()
        .find(|t| t.as_str() == s)
    }

    /// Whether this event counts as an incident for the security score.
    pub fn is_incident(&self) -> bool {
        matches!(
            self,
            SecurityEventType::SuspiciousActivity
                | SecurityEventType::SessionHijack
                | SecurityEventType::AccessDenied
                | SecurityEventType::RateLimit
                | SecurityEventType::DataBreach
        )
    }
}

impl fmt::Display for SecurityEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pattern the gatekeeper records when a score falls below its threshold.
pub const LOW_SCORE_PATTERN: &str = "low_security_score";

/// The closed set of keys event metadata may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataKey {
    Path,
    Method,
    IpAddress,
    PreviousIp,
    CurrentIp,
    PreviousBrowser,
    CurrentBrowser,
    Reason,
    SecurityScore,
    Patterns,
    LimitClass,
    RetryAfter,
    ConsentType,
    ApplicationContext,
    Error,
}

/// A metadata value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Number(i64),
    Text(String),
    List(Vec<String>),
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::Text(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::Text(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        MetadataValue::Number(value)
    }
}

impl From<Vec<String>> for MetadataValue {
    fn from(value: Vec<String>) -> Self {
        MetadataValue::List(value)
    }
}

/// Typed key/value metadata attached to a security event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventMetadata(BTreeMap<MetadataKey, MetadataValue>);

impl EventMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: MetadataKey, value: impl Into<MetadataValue>) -> Self {
        self.0.insert(key, value.into());
        self
    }

    /// Inserts only when `value` is present.
    pub fn with_opt(self, key: MetadataKey, value: Option<impl Into<MetadataValue>>) -> Self {
        match value {
            Some(v) => self.with(key, v),
            None => self,
        }
    }

    pub fn get(&self, key: MetadataKey) -> Option<&MetadataValue> {
        self.0.get(&key)
    }

    /// Returns the text stored under `key`, if any.
    pub fn text(&self, key: MetadataKey) -> Option<&str> {
        match self.0.get(&key) {
            Some(MetadataValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// An immutable, append-only security event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: Uuid,
    pub event_type: SecurityEventType,
    pub severity: Severity,
    pub subject_id: Option<Uuid>,
    pub session_id: Option<String>,
    pub ip_address: Option<String>,
    pub details: String,
    pub metadata: EventMetadata,
    pub created_at: DateTime<Utc>,
}

impl SecurityEvent {
    pub fn new(event_type: SecurityEventType, severity: Severity, details: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            severity,
            subject_id: None,
            session_id: None,
            ip_address: None,
            details: details.into(),
            metadata: EventMetadata::new(),
            created_at: Utc::now(),
        }
    }

    pub fn subject(mut self, subject_id: Option<Uuid>) -> Self {
        self.subject_id = subject_id;
        self
    }

    pub fn session(mut self, session_id: Option<&str>) -> Self {
        self.session_id = session_id.map(str::to_string);
        self
    }

    pub fn ip(mut self, ip_address: Option<&str>) -> Self {
        self.ip_address = ip_address.map(str::to_string);
        self
    }

    pub fn metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Whether this event lowers later security scores.
    ///
    /// An event raised only because a score was already low does not count,
    /// otherwise one low score would keep lowering the next.
    pub fn counts_as_incident(&self) -> bool {
        self.event_type.is_incident() && !self.is_low_score_only()
    }

    fn is_low_score_only(&self) -> bool {
        matches!(
            self.metadata.get(MetadataKey::Patterns),
            Some(MetadataValue::List(patterns)) if patterns.len() == 1 && patterns[0] == LOW_SCORE_PATTERN
        )
    }
}

/// An immutable compliance record of who touched which data, when and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub subject_id: Option<Uuid>,
    pub table_name: String,
    pub action: String,
    pub data_category: DataCategory,
    pub purpose: String,
    pub legal_basis: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
}
