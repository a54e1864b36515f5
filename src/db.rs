use std::time::Duration;

use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use tokio_postgres::NoTls;

use crate::error::{AppError, Result};

/// Maximum number of pooled connections.
const MAX_POOL_SIZE: usize = 32;

/// Creates the Postgres pool backing the consent, session, event and permission stores.
///
/// Waiting for a connection is bounded by `store_timeout`, so an exhausted
/// pool surfaces as a store failure instead of a stalled request.
pub fn create_pool(database_url: &str, store_timeout: Duration) -> Result<Pool> {
    let pg_config: tokio_postgres::Config = database_url.parse()?;
    let mut cfg = Config::new();

    if let Some(tokio_postgres::config::Host::Tcp(hostname)) = pg_config.get_hosts().first() {
        cfg.host = Some(hostname.clone());
    }
    if let Some(port) = pg_config.get_ports().first() {
        cfg.port = Some(*port);
    }
    cfg.dbname = pg_config.get_dbname().map(str::to_string);
    cfg.user = pg_config.get_user().map(str::to_string);
    cfg.password = pg_config
        .get_password()
        .map(|p| String::from_utf8_lossy(p).to_string());

    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });

    cfg.pool = Some(PoolConfig {
        max_size: MAX_POOL_SIZE,
        timeouts: deadpool_postgres::Timeouts {
            wait: Some(store_timeout),
            create: Some(Duration::from_secs(2)),
            recycle: Some(Duration::from_secs(1)),
        },
        ..Default::default()
    });

    cfg.create_pool(Some(Runtime::Tokio1), NoTls)
        .map_err(|e| AppError::Configuration(format!("cannot create database pool: {}", e)))
}
