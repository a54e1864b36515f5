use chrono::{DateTime, Utc};
use postgres_types::{FromSql, ToSql};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a session.
///
/// Every state but `Active` means "invalid"; they differ only in audit detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSql, FromSql)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[postgres(name = "session_state")]
pub enum SessionState {
    #[postgres(name = "ACTIVE")]
    Active,
    #[postgres(name = "EXPIRED")]
    Expired,
    #[postgres(name = "TIMED_OUT")]
    TimedOut,
    #[postgres(name = "REVOKED")]
    Revoked,
}

/// How the subject authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSql, FromSql)]
#[serde(rename_all = "lowercase")]
#[postgres(name = "login_method")]
pub enum LoginMethod {
    #[postgres(name = "email")]
    Email,
    #[postgres(name = "social")]
    Social,
    #[postgres(name = "mfa")]
    Mfa,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Explicit logout, including bulk logout.
    Logout,
    /// Pushed out by the concurrent session cap.
    Evicted,
    /// Absolute lifetime or inactivity window exceeded.
    Timeout,
    /// Absolute lifetime exceeded, found by the cleanup sweep.
    Expired,
    /// Anomaly check failed.
    SuspiciousActivity,
}

impl EndReason {
    /// The terminal state this reason leaves the session in.
    pub fn terminal_state(&self) -> SessionState {
        match self {
            EndReason::Timeout => SessionState::TimedOut,
            EndReason::Expired => SessionState::Expired,
            EndReason::Logout | EndReason::Evicted | EndReason::SuspiciousActivity => {
                SessionState::Revoked
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Logout => "logout",
            EndReason::Evicted => "evicted",
            EndReason::Timeout => "timeout",
            EndReason::Expired => "expired",
            EndReason::SuspiciousActivity => "suspicious_activity",
        }
    }
}

/// Represents a user session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Opaque 64-char hex token.
    pub session_id: String,
    /// The subject this session belongs to.
    pub subject_id: Uuid,
    /// The timestamp when the session was created.
    pub created_at: DateTime<Utc>,
    /// The timestamp of the last successful validation.
    pub last_activity_at: DateTime<Utc>,
    /// The timestamp when the session expires.
    pub expires_at: DateTime<Utc>,
    /// IP address recorded at login.
    pub ip_address: Option<String>,
    /// User agent recorded at login.
    pub user_agent: Option<String>,
    pub is_active: bool,
    pub state: SessionState,
    pub login_method: LoginMethod,
}

impl Session {
    /// Past the absolute lifetime at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Idle for longer than `inactivity` at `now`.
    pub fn is_idle_at(&self, now: DateTime<Utc>, inactivity: chrono::Duration) -> bool {
        now - self.last_activity_at > inactivity
    }
}
