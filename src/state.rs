use std::sync::Arc;

use redis::aio::ConnectionManager;

use crate::clock::{SharedClock, SystemClock};
use crate::config::Config;
use crate::crypto::field::EncryptionEngine;
use crate::error::Result;
use crate::identity::{IdentityProvider, SessionIdentityProvider};
use crate::middleware_layer::gatekeeper::Gatekeeper;
use crate::middleware_layer::rate_limit::RateLimiter;
use crate::repositories::{
    ConsentStore, MemoryStore, PermissionStore, RateLimitStore, SecurityEventStore, SessionStore,
    consent::PgConsentStore,
    permission::PgPermissionStore,
    rate_limit::{MemoryRateLimitStore, RedisRateLimitStore},
    security_event::PgSecurityEventStore,
    session::PgSessionStore,
};
use crate::services::{audit::SecurityEventLog, consent::ConsentLedger, session::SessionManager};

/// The storage backends the services run on.
#[derive(Clone)]
pub struct Stores {
    pub consents: Arc<dyn ConsentStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub events: Arc<dyn SecurityEventStore>,
    pub permissions: Arc<dyn PermissionStore>,
    pub rate_limits: Arc<dyn RateLimitStore>,
}

impl Stores {
    /// Every store backed by one in-memory instance.
    pub fn in_memory(store: &MemoryStore) -> Self {
        Self {
            consents: Arc::new(store.clone()),
            sessions: Arc::new(store.clone()),
            events: Arc::new(store.clone()),
            permissions: Arc::new(store.clone()),
            rate_limits: Arc::new(MemoryRateLimitStore::new()),
        }
    }
}

/// The application's state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub clock: SharedClock,
    pub encryption: EncryptionEngine,
    pub events: SecurityEventLog,
    pub consents: ConsentLedger,
    pub sessions: SessionManager,
    pub gatekeeper: Gatekeeper,
}

impl AppState {
    /// Connects to Postgres and Redis when configured, falling back to
    /// process-local stores otherwise.
    pub async fn new(config: &Config) -> Result<Self> {
        config.validate()?;
        let timeout = config.gatekeeper.store_timeout;

        let mut stores = match &config.database_url {
            Some(url) => {
                let pool = crate::db::create_pool(url, timeout)?;
                tracing::info!("✅ PostgreSQL pool initialized");
                Stores {
                    consents: Arc::new(PgConsentStore::new(pool.clone())),
                    sessions: Arc::new(PgSessionStore::new(pool.clone())),
                    events: Arc::new(PgSecurityEventStore::new(pool.clone())),
                    permissions: Arc::new(PgPermissionStore::new(pool)),
                    rate_limits: Arc::new(MemoryRateLimitStore::new()),
                }
            }
            None => {
                tracing::warn!("⚠️ DATABASE_URL not set, using in-memory stores (data is lost on restart)");
                Stores::in_memory(&MemoryStore::new())
            }
        };

        if let Some(url) = &config.redis_url {
            let client = redis::Client::open(url.as_str())?;
            let redis = ConnectionManager::new(client).await?;
            stores.rate_limits = Arc::new(RedisRateLimitStore::new(redis));
            tracing::info!("✅ Redis rate-limit counters initialized");
        } else {
            tracing::warn!("⚠️ REDIS_URL not set, rate-limit counters are per process");
        }

        let clock: SharedClock = Arc::new(SystemClock);
        let identity = Arc::new(SessionIdentityProvider::new(
            stores.sessions.clone(),
            clock.clone(),
            config.sessions.inactivity_timeout,
            timeout,
        ));

        Self::from_parts(config.clone(), clock, stores, identity)
    }

    /// Wires the services over the given stores, clock and identity provider.
    pub fn from_parts(
        config: Config,
        clock: SharedClock,
        stores: Stores,
        identity: Arc<dyn IdentityProvider>,
    ) -> Result<Self> {
        config.validate()?;
        let timeout = config.gatekeeper.store_timeout;

        let encryption = EncryptionEngine::new(config.encryption.clone());
        encryption.validate_configuration()?;

        let events = SecurityEventLog::new(stores.events.clone(), clock.clone(), timeout);

        let consents = ConsentLedger::new(
            stores.consents.clone(),
            events.clone(),
            clock.clone(),
            config.consent_purposes.clone(),
            timeout,
        );

        let sessions = SessionManager::new(
            stores.sessions.clone(),
            events.clone(),
            clock.clone(),
            config.sessions.clone(),
            timeout,
        );

        let limiter = RateLimiter::new(
            stores.rate_limits.clone(),
            config.rate_limits.clone(),
            clock.clone(),
            timeout,
        );

        let gatekeeper = Gatekeeper::new(
            limiter,
            identity,
            sessions.clone(),
            stores.permissions.clone(),
            events.clone(),
            clock.clone(),
            config.gatekeeper.clone(),
        );

        Ok(AppState {
            config: Arc::new(config),
            clock,
            encryption,
            events,
            consents,
            sessions,
            gatekeeper,
        })
    }

    /// Everything on one in-memory store.
    pub fn in_memory(
        config: Config,
        clock: SharedClock,
        store: &MemoryStore,
        identity: Arc<dyn IdentityProvider>,
    ) -> Result<Self> {
        Self::from_parts(config, clock, Stores::in_memory(store), identity)
    }
}
