#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use trustgate::{
    AppState, Config,
    clock::{ManualClock, SharedClock},
    identity::{IdentityProvider, SessionIdentityProvider},
    repositories::MemoryStore,
};

pub const SECRET: &str = "integration-master-secret-0123456789abcdef";

pub const FIREFOX: &str = "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0";
pub const CHROME: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0 Safari/537.36";

/// A config with a valid secret, cheap KDF costs and the given overrides.
pub fn config(overrides: &[(&str, &str)]) -> Config {
    let mut vars: HashMap<String, String> = [
        ("ENCRYPTION_KEY", SECRET),
        ("KDF_MEMORY_KIB", "1024"),
        ("KDF_ITERATIONS", "1"),
        ("KDF_PARALLELISM", "1"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    for (k, v) in overrides {
        vars.insert(k.to_string(), v.to_string());
    }
    Config::from_lookup(move |key| vars.get(key).cloned()).expect("test config")
}

pub struct Harness {
    pub state: AppState,
    pub store: MemoryStore,
    pub clock: ManualClock,
}

pub fn harness(overrides: &[(&str, &str)], identity: Arc<dyn IdentityProvider>) -> Harness {
    let store = MemoryStore::new();
    let clock = ManualClock::default();
    let shared: SharedClock = Arc::new(clock.clone());
    let state = AppState::in_memory(config(overrides), shared, &store, identity).expect("state");
    Harness { state, store, clock }
}

/// A harness whose identity provider accepts the store's own session tokens.
pub fn session_harness(overrides: &[(&str, &str)]) -> Harness {
    let store = MemoryStore::new();
    let clock = ManualClock::default();
    let shared: SharedClock = Arc::new(clock.clone());
    let config = config(overrides);
    let identity = Arc::new(SessionIdentityProvider::new(
        Arc::new(store.clone()),
        shared.clone(),
        config.sessions.inactivity_timeout,
        config.gatekeeper.store_timeout,
    ));
    let state = AppState::in_memory(config, shared, &store, identity).expect("state");
    Harness { state, store, clock }
}
