//! Threat signals and the request security score.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::Result;
use crate::models::security_event::LOW_SCORE_PATTERN;

/// Requests per minute from one IP above which traffic counts as rapid.
pub const RAPID_REQUEST_THRESHOLD: u64 = 50;

/// Score deduction when the request carries no session.
pub const NO_SESSION_PENALTY: u8 = 20;
/// Score deduction for a high-risk IP.
pub const HIGH_RISK_IP_PENALTY: u8 = 30;
/// Score deduction for a missing or unrecognized user agent.
pub const UNKNOWN_AGENT_PENALTY: u8 = 10;
/// Score deduction per soft session anomaly.
pub const SESSION_ANOMALY_PENALTY: u8 = 25;
/// Score deduction per incident in the last 24 hours.
pub const INCIDENT_PENALTY: u8 = 10;

/// External reputation and behaviour signals.
#[async_trait]
pub trait ThreatIntelligence: Send + Sync {
    async fn is_high_risk_ip(&self, ip: &str) -> Result<bool>;

    async fn has_unusual_access_pattern(&self, subject_id: Option<Uuid>, ip: &str) -> Result<bool>;
}

/// Reports every IP as benign.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoThreatIntelligence;

#[async_trait]
impl ThreatIntelligence for NoThreatIntelligence {
    async fn is_high_risk_ip(&self, _ip: &str) -> Result<bool> {
        Ok(false)
    }

    async fn has_unusual_access_pattern(&self, _subject_id: Option<Uuid>, _ip: &str) -> Result<bool> {
        Ok(false)
    }
}

/// Flags IPs from a fixed blocklist.
#[derive(Debug, Clone, Default)]
pub struct BlocklistThreatIntelligence {
    high_risk: HashSet<String>,
}

impl BlocklistThreatIntelligence {
    pub fn new<I, S>(ips: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            high_risk: ips.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl ThreatIntelligence for BlocklistThreatIntelligence {
    async fn is_high_risk_ip(&self, ip: &str) -> Result<bool> {
        Ok(self.high_risk.contains(ip))
    }

    async fn has_unusual_access_pattern(&self, _subject_id: Option<Uuid>, _ip: &str) -> Result<bool> {
        Ok(false)
    }
}

/// Counts recent requests per IP.
#[async_trait]
pub trait RequestRateTracker: Send + Sync {
    /// Records one request and returns how many arrived in the last minute, this one included.
    async fn record_request(&self, ip: &str, now: DateTime<Utc>) -> Result<u64>;
}

/// Sliding one-minute window per IP, kept in memory.
///
/// IPs with no hit inside the window are swept at most once a minute, so the
/// map only holds recently active clients.
#[derive(Debug, Clone, Default)]
pub struct SlidingWindowTracker {
    seen: Arc<Mutex<TrackedIps>>,
}

#[derive(Debug, Default)]
struct TrackedIps {
    hits: HashMap<String, VecDeque<DateTime<Utc>>>,
    swept_at: Option<DateTime<Utc>>,
}

impl SlidingWindowTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of IPs currently tracked.
    pub async fn tracked_ips(&self) -> usize {
        self.seen.lock().await.hits.len()
    }
}

#[async_trait]
impl RequestRateTracker for SlidingWindowTracker {
    async fn record_request(&self, ip: &str, now: DateTime<Utc>) -> Result<u64> {
        let window = chrono::Duration::minutes(1);
        let cutoff = now - window;
        let mut seen = self.seen.lock().await;

        if seen.swept_at.is_none_or(|at| now - at >= window) {
            seen.hits
                .retain(|_, hits| hits.back().is_some_and(|t| *t > cutoff));
            seen.swept_at = Some(now);
        }

        let hits = seen.hits.entry(ip.to_string()).or_default();
        while hits.front().is_some_and(|t| *t <= cutoff) {
            hits.pop_front();
        }
        hits.push_back(now);
        Ok(hits.len() as u64)
    }
}

/// Inputs to the security score. Unknown signals count as benign.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScoreSignals {
    pub has_session: bool,
    pub high_risk_ip: bool,
    pub unknown_user_agent: bool,
    pub session_anomalies: u32,
    pub recent_incidents: u64,
}

/// Scores a request from 100 down, clamped to `0..=100`.
pub fn security_score(signals: &ScoreSignals) -> u8 {
    let mut deduction: u64 = 0;
    if !signals.has_session {
        deduction += NO_SESSION_PENALTY as u64;
    }
    if signals.high_risk_ip {
        deduction += HIGH_RISK_IP_PENALTY as u64;
    }
    if signals.unknown_user_agent {
        deduction += UNKNOWN_AGENT_PENALTY as u64;
    }
    deduction += signals.session_anomalies as u64 * SESSION_ANOMALY_PENALTY as u64;
    deduction += signals.recent_incidents.saturating_mul(INCIDENT_PENALTY as u64);

    100u64.saturating_sub(deduction) as u8
}

/// A pattern that marks a request as suspicious.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspiciousPattern {
    RapidRequests,
    UnusualAccessPattern,
    LowSecurityScore,
}

impl SuspiciousPattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuspiciousPattern::RapidRequests => "rapid_requests",
            SuspiciousPattern::UnusualAccessPattern => "unusual_access_pattern",
            SuspiciousPattern::LowSecurityScore => LOW_SCORE_PATTERN,
        }
    }
}

/// Collects the suspicious patterns that apply.
pub fn suspicious_patterns(
    requests_last_minute: u64,
    unusual_access: bool,
    score: u8,
    score_threshold: u8,
) -> Vec<SuspiciousPattern> {
    let mut patterns = Vec::new();
    if requests_last_minute > RAPID_REQUEST_THRESHOLD {
        patterns.push(SuspiciousPattern::RapidRequests);
    }
    if unusual_access {
        patterns.push(SuspiciousPattern::UnusualAccessPattern);
    }
    if score < score_threshold {
        patterns.push(SuspiciousPattern::LowSecurityScore);
    }
    patterns
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_authenticated_request_scores_full() {
        let signals = ScoreSignals {
            has_session: true,
            ..Default::default()
        };
        assert_eq!(security_score(&signals), 100);
    }

    #[test]
    fn deductions_add_up() {
        let signals = ScoreSignals {
            has_session: false,
            high_risk_ip: true,
            unknown_user_agent: true,
            session_anomalies: 0,
            recent_incidents: 2,
        };
        assert_eq!(security_score(&signals), 100 - 20 - 30 - 10 - 20);
    }

    #[test]
    fn score_clamps_at_zero() {
        let signals = ScoreSignals {
            has_session: false,
            high_risk_ip: true,
            recent_incidents: 50,
            ..Default::default()
        };
        assert_eq!(security_score(&signals), 0);
    }

    #[test]
    fn low_score_is_a_pattern() {
        let patterns = suspicious_patterns(51, false, 40, 50);
        assert_eq!(
            patterns,
            vec![SuspiciousPattern::RapidRequests, SuspiciousPattern::LowSecurityScore]
        );
        assert!(suspicious_patterns(50, false, 50, 50).is_empty());
    }

    #[tokio::test]
    async fn tracker_forgets_requests_older_than_a_minute() {
        let tracker = SlidingWindowTracker::new();
        let start = Utc::now();
        for _ in 0..3 {
            tracker.record_request("10.0.0.1", start).await.unwrap();
        }
        let later = start + chrono::Duration::seconds(61);
        assert_eq!(tracker.record_request("10.0.0.1", later).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn idle_ips_are_swept() {
        let tracker = SlidingWindowTracker::new();
        let start = Utc::now();
        for i in 0..1000 {
            tracker
                .record_request(&format!("198.51.100.{}", i), start)
                .await
                .unwrap();
        }
        assert_eq!(tracker.tracked_ips().await, 1000);

        let later = start + chrono::Duration::hours(1);
        tracker.record_request("203.0.113.9", later).await.unwrap();
        assert_eq!(tracker.tracked_ips().await, 1);
    }
}
