use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypto::kdf::KdfParams;
use crate::error::AppError;
use crate::middleware_layer::policy::RoutePolicy;
use crate::middleware_layer::rate_limit::LimitClass;
use crate::models::consent::ConsentType;

/// Minimum length of the master secret, in characters.
pub const MIN_MASTER_SECRET_LEN: usize = 32;

/// The trust plane's configuration.
#[derive(Clone)]
pub struct Config {
    /// The URL of the PostgreSQL database. `None` runs on the in-memory store.
    pub database_url: Option<String>,
    /// The URL of the Redis server holding rate-limit counters.
    pub redis_url: Option<String>,
    /// Field encryption settings.
    pub encryption: EncryptionConfig,
    /// Session lifecycle settings.
    pub sessions: SessionConfig,
    /// Per-class rate limits.
    pub rate_limits: RateLimitConfig,
    /// Gatekeeper settings.
    pub gatekeeper: GatekeeperConfig,
    /// Purpose and legal basis recorded for each consent type.
    pub consent_purposes: PurposeTable,
}

/// Field encryption settings.
#[derive(Clone)]
pub struct EncryptionConfig {
    /// The master secret keys are derived from.
    pub master_secret: Option<Zeroizing<String>>,
    /// The salt used by `hash_for_search`.
    pub search_salt: Option<Zeroizing<String>>,
    /// Argon2id cost parameters.
    pub kdf: KdfParams,
}

impl EncryptionConfig {
    /// Builds a config from a master secret with default KDF costs.
    pub fn with_secret(master_secret: impl Into<String>) -> Self {
        Self {
            master_secret: Some(Zeroizing::new(master_secret.into())),
            search_salt: None,
            kdf: KdfParams::default(),
        }
    }

    /// Fails with `Configuration` when the master secret is missing or shorter
    /// than [`MIN_MASTER_SECRET_LEN`] characters.
    pub fn validate(&self) -> crate::error::Result<()> {
        let secret = self.master_secret.as_ref().ok_or_else(|| {
            AppError::Configuration("ENCRYPTION_KEY must be set".to_string())
        })?;

        if secret.chars().count() < MIN_MASTER_SECRET_LEN {
            return Err(AppError::Configuration(format!(
                "ENCRYPTION_KEY must be at least {} characters",
                MIN_MASTER_SECRET_LEN
            )));
        }

        self.kdf.validate()
    }
}

/// What a session anomaly (IP or browser drift) does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyPolicy {
    /// Revoke the session immediately.
    HardRevoke,
    /// Keep the session and lower the request's security score.
    SoftScore,
}

impl FromStr for AnomalyPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hard_revoke" => Ok(Self::HardRevoke),
            "soft_score" => Ok(Self::SoftScore),
            other => anyhow::bail!("unknown anomaly policy: {}", other),
        }
    }
}

/// Session lifecycle settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Absolute session lifetime.
    pub max_session_duration: chrono::Duration,
    /// Inactivity window after which a session times out.
    pub inactivity_timeout: chrono::Duration,
    /// Maximum number of concurrently active sessions per subject.
    pub max_concurrent_sessions: usize,
    /// What an anomaly does to the session.
    pub anomaly_policy: AnomalyPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_session_duration: chrono::Duration::hours(24),
            inactivity_timeout: chrono::Duration::hours(8),
            max_concurrent_sessions: 3,
            anomaly_policy: AnomalyPolicy::HardRevoke,
        }
    }
}

/// A `(requests, window)` budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRule {
    /// Requests allowed per window.
    pub requests: u32,
    /// Window length.
    pub window: Duration,
}

impl RateLimitRule {
    pub const fn new(requests: u32, window: Duration) -> Self {
        Self { requests, window }
    }
}

impl FromStr for RateLimitRule {
    type Err = anyhow::Error;

    /// Parses `requests/window_secs`, e.g. `5/900`.
    fn from_str(s: &str) -> Result<Self> {
        let (requests, window) = s
            .split_once('/')
            .context("rate limit must look like <requests>/<window_secs>")?;
        let requests: u32 = requests.trim().parse().context("invalid request count")?;
        let window: u64 = window.trim().parse().context("invalid window seconds")?;

        if requests == 0 || window == 0 {
            anyhow::bail!("rate limit requests and window must be positive");
        }

        Ok(Self::new(requests, Duration::from_secs(window)))
    }
}

/// Per-class rate limits.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub login: RateLimitRule,
    pub sensitive: RateLimitRule,
    pub default: RateLimitRule,
}

impl RateLimitConfig {
    /// Returns the rule that applies to a limit class.
    pub fn rule_for(&self, class: LimitClass) -> RateLimitRule {
        match class {
            LimitClass::Login => self.login,
            LimitClass::Sensitive => self.sensitive,
            LimitClass::Default => self.default,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            login: RateLimitRule::new(5, Duration::from_secs(15 * 60)),
            sensitive: RateLimitRule::new(10, Duration::from_secs(60)),
            default: RateLimitRule::new(100, Duration::from_secs(60)),
        }
    }
}

/// Gatekeeper settings.
#[derive(Debug, Clone)]
pub struct GatekeeperConfig {
    /// Upper bound on every store call.
    pub store_timeout: Duration,
    /// Scores below this are reported as suspicious.
    pub suspicious_score_threshold: u8,
    /// Protected, sensitive and permission-bearing routes.
    pub routes: RoutePolicy,
}

impl Default for GatekeeperConfig {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_millis(2000),
            suspicious_score_threshold: 50,
            routes: RoutePolicy::default(),
        }
    }
}

/// One row of the consent purpose table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurposeEntry {
    pub consent_type: ConsentType,
    #[serde(default)]
    pub application_context: Option<String>,
    pub purpose: String,
    pub legal_basis: String,
}

/// Maps `(consent_type, application_context)` to the purpose and legal basis
/// recorded on a consent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurposeTable {
    pub entries: Vec<PurposeEntry>,
}

/// Purpose recorded for consent types the table does not know.
pub const FALLBACK_PURPOSE: &str = "Data processing for application";
/// Legal basis recorded for consent types the table does not know.
pub const FALLBACK_LEGAL_BASIS: &str = "Art. 6.1.a GDPR (consent)";

impl PurposeTable {
    /// Returns `(purpose, legal_basis)`. An entry for the exact context wins
    /// over a context-free entry.
    pub fn lookup(&self, consent_type: ConsentType, context: Option<&str>) -> (&str, &str) {
        let exact = context.and_then(|ctx| {
            self.entries.iter().find(|e| {
                e.consent_type == consent_type && e.application_context.as_deref() == Some(ctx)
            })
        });
        let generic = || {
            self.entries
                .iter()
                .find(|e| e.consent_type == consent_type && e.application_context.is_none())
        };

        match exact.or_else(generic) {
            Some(entry) => (entry.purpose.as_str(), entry.legal_basis.as_str()),
            None => (FALLBACK_PURPOSE, FALLBACK_LEGAL_BASIS),
        }
    }

    fn entry(consent_type: ConsentType, context: Option<&str>, purpose: &str, basis: &str) -> PurposeEntry {
        PurposeEntry {
            consent_type,
            application_context: context.map(str::to_string),
            purpose: purpose.to_string(),
            legal_basis: basis.to_string(),
        }
    }
}

impl Default for PurposeTable {
    fn default() -> Self {
        use ConsentType::*;
        Self {
            entries: vec![
                Self::entry(
                    DataProcessing,
                    None,
                    "Antragstellung und -bearbeitung für Hamburg Familienservices",
                    "Art. 6.1.e GDPR (public task) + Art. 6.1.a GDPR (consent)",
                ),
                Self::entry(
                    ChildData,
                    None,
                    "Identifikation und Berechtigung für Betreuungs-/Unterstützungsleistungen",
                    "Art. 9.2.a GDPR (explicit consent for special categories)",
                ),
                Self::entry(
                    FinancialData,
                    Some("kita"),
                    "Berechnung des Elternbeitrags",
                    "Art. 6.1.a GDPR (consent) + Art. 6.1.e GDPR (public task)",
                ),
                Self::entry(
                    FinancialData,
                    None,
                    "Berechnung der Elterngeld-Höhe",
                    "Art. 6.1.a GDPR (consent) + Art. 6.1.e GDPR (public task)",
                ),
                Self::entry(
                    DocumentVault,
                    None,
                    "Vereinfachung zukünftiger Antragsstellungen",
                    FALLBACK_LEGAL_BASIS,
                ),
                Self::entry(
                    EmailNotifications,
                    None,
                    "Information über Antragsfortschritt und wichtige Fristen",
                    FALLBACK_LEGAL_BASIS,
                ),
                Self::entry(
                    Analytics,
                    None,
                    "Service-Verbesserung und Benutzerfreundlichkeit",
                    FALLBACK_LEGAL_BASIS,
                ),
            ],
        }
    }
}

impl Config {
    /// Creates a new `Config` from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Creates a new `Config` from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let master_secret = lookup("ENCRYPTION_KEY").map(Zeroizing::new);
        let search_salt = lookup("SEARCH_SALT").map(Zeroizing::new);

        let defaults = KdfParams::default();
        let kdf = KdfParams {
            memory_kib: parse_or(&lookup, "KDF_MEMORY_KIB", defaults.memory_kib)?,
            iterations: parse_or(&lookup, "KDF_ITERATIONS", defaults.iterations)?,
            parallelism: parse_or(&lookup, "KDF_PARALLELISM", defaults.parallelism)?,
        };

        let session_defaults = SessionConfig::default();
        let sessions = SessionConfig {
            max_session_duration: hours_or(
                &lookup,
                "SESSION_MAX_HOURS",
                session_defaults.max_session_duration,
            )?,
            inactivity_timeout: hours_or(
                &lookup,
                "SESSION_INACTIVITY_HOURS",
                session_defaults.inactivity_timeout,
            )?,
            max_concurrent_sessions: parse_or(
                &lookup,
                "MAX_CONCURRENT_SESSIONS",
                session_defaults.max_concurrent_sessions,
            )?,
            anomaly_policy: parse_or(&lookup, "ANOMALY_POLICY", session_defaults.anomaly_policy)?,
        };

        if sessions.max_concurrent_sessions == 0 {
            anyhow::bail!("MAX_CONCURRENT_SESSIONS must be at least 1");
        }
        if sessions.inactivity_timeout > sessions.max_session_duration {
            anyhow::bail!("SESSION_INACTIVITY_HOURS must not exceed SESSION_MAX_HOURS");
        }

        let limit_defaults = RateLimitConfig::default();
        let rate_limits = RateLimitConfig {
            login: parse_or(&lookup, "RATE_LIMIT_LOGIN", limit_defaults.login)?,
            sensitive: parse_or(&lookup, "RATE_LIMIT_SENSITIVE", limit_defaults.sensitive)?,
            default: parse_or(&lookup, "RATE_LIMIT_DEFAULT", limit_defaults.default)?,
        };

        let gate_defaults = GatekeeperConfig::default();
        let gatekeeper = GatekeeperConfig {
            store_timeout: Duration::from_millis(parse_or(
                &lookup,
                "STORE_TIMEOUT_MS",
                gate_defaults.store_timeout.as_millis() as u64,
            )?),
            suspicious_score_threshold: parse_or(
                &lookup,
                "SUSPICIOUS_SCORE_THRESHOLD",
                gate_defaults.suspicious_score_threshold,
            )?,
            routes: gate_defaults.routes,
        };

        if gatekeeper.store_timeout.is_zero() {
            anyhow::bail!("STORE_TIMEOUT_MS must be positive");
        }

        let consent_purposes = match lookup("CONSENT_PURPOSES_FILE") {
            Some(path) => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("cannot read CONSENT_PURPOSES_FILE {}", path))?;
                sonic_rs::from_str(&raw).context("CONSENT_PURPOSES_FILE is not a valid purpose table")?
            }
            None => PurposeTable::default(),
        };

        Ok(Self {
            database_url: lookup("DATABASE_URL"),
            redis_url: lookup("REDIS_URL"),
            encryption: EncryptionConfig { master_secret, search_salt, kdf },
            sessions,
            rate_limits,
            gatekeeper,
            consent_purposes,
        })
    }

    /// Fails fast on anything that would otherwise break at first use.
    pub fn validate(&self) -> crate::error::Result<()> {
        self.encryption.validate()
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {}: {}", key, e)),
        None => Ok(default),
    }
}

/// Reads a positive whole number of hours.
fn hours_or<F>(lookup: &F, key: &str, default: chrono::Duration) -> Result<chrono::Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let hours: i64 = parse_or(lookup, key, default.num_hours())?;
    if hours <= 0 {
        anyhow::bail!("{} must be positive", key);
    }
    chrono::Duration::try_hours(hours).with_context(|| format!("{} is out of range", key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = Config::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.sessions.max_concurrent_sessions, 3);
        assert_eq!(config.sessions.inactivity_timeout, chrono::Duration::hours(8));
        assert_eq!(config.rate_limits.login.requests, 5);
        assert_eq!(config.sessions.anomaly_policy, AnomalyPolicy::HardRevoke);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn missing_secret_fails_validation() {
        let config = Config::from_lookup(lookup_from(&[])).unwrap();
        assert!(matches!(config.validate(), Err(AppError::Configuration(_))));
    }

    #[test]
    fn short_secret_fails_validation() {
        let config = Config::from_lookup(lookup_from(&[("ENCRYPTION_KEY", "too-short")])).unwrap();
        assert!(matches!(config.validate(), Err(AppError::Configuration(_))));
    }

    #[test]
    fn parses_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            ("ENCRYPTION_KEY", "0123456789abcdef0123456789abcdef"),
            ("RATE_LIMIT_LOGIN", "3/60"),
            ("ANOMALY_POLICY", "soft_score"),
            ("MAX_CONCURRENT_SESSIONS", "5"),
        ]))
        .unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.rate_limits.login, RateLimitRule::new(3, Duration::from_secs(60)));
        assert_eq!(config.sessions.anomaly_policy, AnomalyPolicy::SoftScore);
        assert_eq!(config.sessions.max_concurrent_sessions, 5);
    }

    #[test]
    fn rejects_malformed_rate_limit() {
        assert!(Config::from_lookup(lookup_from(&[("RATE_LIMIT_DEFAULT", "100")])).is_err());
        assert!(Config::from_lookup(lookup_from(&[("RATE_LIMIT_DEFAULT", "0/60")])).is_err());
    }

    #[test]
    fn rejects_unusable_session_and_timeout_settings() {
        for pairs in [
            [("SESSION_MAX_HOURS", "9999999999999")],
            [("SESSION_MAX_HOURS", "0")],
            [("SESSION_MAX_HOURS", "-5")],
            [("SESSION_INACTIVITY_HOURS", "-1")],
            [("SESSION_INACTIVITY_HOURS", "48")],
            [("STORE_TIMEOUT_MS", "0")],
        ] {
            assert!(Config::from_lookup(lookup_from(&pairs)).is_err(), "{:?}", pairs);
        }

        let config = Config::from_lookup(lookup_from(&[
            ("SESSION_MAX_HOURS", "12"),
            ("SESSION_INACTIVITY_HOURS", "12"),
            ("STORE_TIMEOUT_MS", "1"),
        ]))
        .unwrap();
        assert_eq!(config.sessions.max_session_duration, chrono::Duration::hours(12));
        assert_eq!(config.gatekeeper.store_timeout, Duration::from_millis(1));
    }

    #[test]
    fn purpose_lookup_prefers_exact_context() {
        let table = PurposeTable::default();
        let (kita, _) = table.lookup(ConsentType::FinancialData, Some("kita"));
        let (elterngeld, _) = table.lookup(ConsentType::FinancialData, Some("elterngeld"));
        assert_eq!(kita, "Berechnung des Elternbeitrags");
        assert_eq!(elterngeld, "Berechnung der Elterngeld-Höhe");
    }
}
