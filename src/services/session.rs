use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::clock::SharedClock;
use crate::config::{AnomalyPolicy, SessionConfig};
use crate::crypto::field::generate_secure_token;
use crate::error::Result;
use crate::models::security_event::{
    EventMetadata, MetadataKey, SecurityEvent, SecurityEventType, Severity,
};
use crate::models::session::{EndReason, LoginMethod, Session, SessionState};
use crate::repositories::{SessionStore, bounded};
use crate::services::audit::SecurityEventLog;

/// Length of a session token in random bytes (hex-encoded to twice that).
pub const SESSION_TOKEN_BYTES: usize = 32;

/// Maps a user agent to its browser family.
///
/// Checked in a fixed order, so an Edge agent (which also names Chrome) reads as `chrome`.
pub fn browser_family(user_agent: &str) -> &'static str {
    let ua = user_agent.to_lowercase();
    ["chrome", "firefox", "safari", "edge"]
        .into_iter()
        .find(|family| ua.contains(family))
        .unwrap_or("unknown")
}

/// A drift between the session's recorded client and the current one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAnomaly {
    IpChanged { previous: String, current: String },
    BrowserChanged { previous: &'static str, current: &'static str },
}

impl SessionAnomaly {
    fn describe(&self) -> String {
        match self {
            SessionAnomaly::IpChanged { previous, current } => {
                format!("IP address change: {} -> {}", previous, current)
            }
            SessionAnomaly::BrowserChanged { previous, current } => {
                format!("Browser change detected: {} -> {}", previous, current)
            }
        }
    }
}

/// Outcome of a detailed validation.
#[derive(Debug, Clone, Default)]
pub struct SessionValidation {
    /// The session, if it is still valid.
    pub session: Option<Session>,
    /// Anomalies tolerated under the soft-score policy.
    pub anomalies: Vec<SessionAnomaly>,
}

/// Compares the recorded client against the current one. Missing values on
/// either side are not an anomaly.
pub fn detect_anomalies(
    session: &Session,
    current_ip: Option<&str>,
    current_user_agent: Option<&str>,
) -> Vec<SessionAnomaly> {
    let mut anomalies = Vec::new();

    if let (Some(previous), Some(current)) = (session.ip_address.as_deref(), current_ip) {
        if previous != current {
            anomalies.push(SessionAnomaly::IpChanged {
                previous: previous.to_string(),
                current: current.to_string(),
            });
        }
    }

    if let (Some(previous), Some(current)) = (session.user_agent.as_deref(), current_user_agent) {
        let (previous, current) = (browser_family(previous), browser_family(current));
        if previous != current {
            anomalies.push(SessionAnomaly::BrowserChanged { previous, current });
        }
    }

    anomalies
}

fn anomaly_metadata(anomalies: &[SessionAnomaly]) -> EventMetadata {
    let reasons: Vec<String> = anomalies.iter().map(SessionAnomaly::describe).collect();
    anomalies.iter().fold(
        EventMetadata::new().with(MetadataKey::Reason, reasons.join("; ")),
        |metadata, anomaly| match anomaly {
            SessionAnomaly::IpChanged { previous, current } => metadata
                .with(MetadataKey::PreviousIp, previous.as_str())
                .with(MetadataKey::CurrentIp, current.as_str()),
            SessionAnomaly::BrowserChanged { previous, current } => metadata
                .with(MetadataKey::PreviousBrowser, *previous)
                .with(MetadataKey::CurrentBrowser, *current),
        },
    )
}

/// Creates, validates and ends sessions.
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    events: SecurityEventLog,
    clock: SharedClock,
    config: SessionConfig,
    store_timeout: Duration,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        events: SecurityEventLog,
        clock: SharedClock,
        config: SessionConfig,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            events,
            clock,
            config,
            store_timeout,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Creates a session for an email login.
    pub async fn create(
        &self,
        subject_id: Uuid,
        ip_address: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<Session> {
        self.create_with_method(subject_id, ip_address, user_agent, LoginMethod::Email)
            .await
    }

    /// Creates a session, evicting the least recently active ones above the cap.
    ///
    /// # Arguments
    ///
    /// * `subject_id` - The authenticated subject.
    /// * `ip_address` - Client IP at login, kept for anomaly checks.
    /// * `user_agent` - Client user agent at login, kept for anomaly checks.
    /// * `login_method` - How the subject authenticated.
    ///
    /// # Returns
    ///
    /// The new active session.
    pub async fn create_with_method(
        &self,
        subject_id: Uuid,
        ip_address: Option<&str>,
        user_agent: Option<&str>,
        login_method: LoginMethod,
    ) -> Result<Session> {
        let now = self.clock.now();
        let session = Session {
            session_id: generate_secure_token(SESSION_TOKEN_BYTES),
            subject_id,
            created_at: now,
            last_activity_at: now,
            expires_at: now + self.config.max_session_duration,
            ip_address: ip_address.map(str::to_string),
            user_agent: user_agent.map(str::to_string),
            is_active: true,
            state: SessionState::Active,
            login_method,
        };

        let evicted = bounded(
            self.store_timeout,
            "create session",
            self.store
                .insert_with_cap(&session, self.config.max_concurrent_sessions, now),
        )
        .await?;

        for old in &evicted {
            self.log_end(old, EndReason::Evicted).await;
        }

        tracing::info!(
            subject_id = %subject_id,
            evicted = evicted.len(),
            "✅ Session created"
        );

        self.events
            .record(
                SecurityEvent::new(SecurityEventType::Login, Severity::Low, "Session created")
                    .subject(Some(subject_id))
                    .session(Some(&session.session_id))
                    .ip(ip_address),
            )
            .await;

        Ok(session)
    }

    /// Returns the session if it is still valid, refreshing its activity time.
    pub async fn validate(
        &self,
        session_id: &str,
        current_ip: Option<&str>,
        current_user_agent: Option<&str>,
    ) -> Result<Option<Session>> {
        Ok(self
            .validate_detailed(session_id, current_ip, current_user_agent)
            .await?
            .session)
    }

    /// Like [`validate`](Self::validate), also returning anomalies that the
    /// soft-score policy let through.
    pub async fn validate_detailed(
        &self,
        session_id: &str,
        current_ip: Option<&str>,
        current_user_agent: Option<&str>,
    ) -> Result<SessionValidation> {
        let found = bounded(
            self.store_timeout,
            "find session",
            self.store.find(session_id),
        )
        .await?;

        let mut session = match found {
            Some(s) if s.is_active => s,
            _ => return Ok(SessionValidation::default()),
        };

        let now = self.clock.now();
        if session.is_expired_at(now) || session.is_idle_at(now, self.config.inactivity_timeout) {
            self.end(&session.session_id, EndReason::Timeout).await?;
            return Ok(SessionValidation::default());
        }

        let anomalies = detect_anomalies(&session, current_ip, current_user_agent);
        if !anomalies.is_empty() {
            match self.config.anomaly_policy {
                AnomalyPolicy::HardRevoke => {
                    let revoked = bounded(
                        self.store_timeout,
                        "revoke session",
                        self.store
                            .deactivate(session_id, EndReason::SuspiciousActivity.terminal_state(), now),
                    )
                    .await?;
                    if revoked.is_some() {
                        self.record_anomaly(&session, current_ip, &anomalies, Severity::High, "Session revoked")
                            .await;
                    }
                    return Ok(SessionValidation::default());
                }
                AnomalyPolicy::SoftScore => {
                    self.record_anomaly(&session, current_ip, &anomalies, Severity::Medium, "Session anomaly")
                        .await;
                }
            }
        }

        let touched = bounded(
            self.store_timeout,
            "touch session",
            self.store.touch(session_id, now),
        )
        .await?;
        if !touched {
            // Ended concurrently.
            return Ok(SessionValidation::default());
        }

        session.last_activity_at = now.min(session.expires_at);
        tracing::debug!(subject_id = %session.subject_id, "Session validated");

        Ok(SessionValidation {
            session: Some(session),
            anomalies,
        })
    }

    /// Ends a session. Returns `false` if it was already inactive or unknown.
    pub async fn destroy(&self, session_id: &str, reason: EndReason) -> Result<bool> {
        self.end(session_id, reason).await
    }

    /// Active sessions of a subject, most recent activity first.
    pub async fn user_sessions(&self, subject_id: Uuid) -> Result<Vec<Session>> {
        bounded(
            self.store_timeout,
            "list sessions",
            self.store.list_active(subject_id),
        )
        .await
    }

    /// Logs out every active session of the subject except `except`.
    pub async fn logout_all(&self, subject_id: Uuid, except: Option<&str>) -> Result<usize> {
        let mut count = 0;
        for session in self.user_sessions(subject_id).await? {
            if Some(session.session_id.as_str()) == except {
                continue;
            }
            if self.end(&session.session_id, EndReason::Logout).await? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Ends every active session past its lifetime or inactivity window.
    pub async fn cleanup_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let stale = bounded(
            self.store_timeout,
            "find stale sessions",
            self.store
                .find_stale(now, now - self.config.inactivity_timeout),
        )
        .await?;

        let mut cleaned = 0;
        for session in stale {
            let reason = if session.is_expired_at(now) {
                EndReason::Expired
            } else {
                EndReason::Timeout
            };
            if self.end(&session.session_id, reason).await? {
                cleaned += 1;
            }
        }

        if cleaned > 0 {
            tracing::info!("🧹 Cleaned up {} stale sessions", cleaned);
        }
        Ok(cleaned)
    }

    async fn end(&self, session_id: &str, reason: EndReason) -> Result<bool> {
        let now = self.clock.now();
        let ended = bounded(
            self.store_timeout,
            "end session",
            self.store.deactivate(session_id, reason.terminal_state(), now),
        )
        .await?;

        match ended {
            Some(session) => {
                self.log_end(&session, reason).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn log_end(&self, session: &Session, reason: EndReason) {
        let event_type = match reason {
            EndReason::Timeout | EndReason::Expired => SecurityEventType::Timeout,
            EndReason::SuspiciousActivity => SecurityEventType::SuspiciousActivity,
            EndReason::Logout | EndReason::Evicted => SecurityEventType::Logout,
        };
        let severity = match reason {
            EndReason::SuspiciousActivity => Severity::High,
            _ => Severity::Low,
        };

        tracing::info!(
            subject_id = %session.subject_id,
            reason = reason.as_str(),
            "Session ended"
        );

        self.events
            .record(
                SecurityEvent::new(event_type, severity, format!("Session ended: {}", reason.as_str()))
                    .subject(Some(session.subject_id))
                    .session(Some(&session.session_id))
                    .metadata(EventMetadata::new().with(MetadataKey::Reason, reason.as_str())),
            )
            .await;
    }

    async fn record_anomaly(
        &self,
        session: &Session,
        current_ip: Option<&str>,
        anomalies: &[SessionAnomaly],
        severity: Severity,
        details: &str,
    ) {
        self.events
            .record(
                SecurityEvent::new(SecurityEventType::SuspiciousActivity, severity, details)
                    .subject(Some(session.subject_id))
                    .session(Some(&session.session_id))
                    .ip(current_ip)
                    .metadata(anomaly_metadata(anomalies)),
            )
            .await;
    }
}
