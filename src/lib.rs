//! Trust and access-control plane for family-benefit applications: field
//! encryption, a consent ledger, session lifecycle and a request gatekeeper.

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod identity;
pub mod state;

pub mod crypto {
    pub mod aes;
    pub mod field;
    pub mod kdf;
}

pub mod models {
    pub mod access;
    pub mod consent;
    pub mod personal_data;
    pub mod security_event;
    pub mod session;
}

pub mod repositories;

pub mod services {
    pub mod audit;
    pub mod consent;
    pub mod session;
    pub mod threat;
}

pub mod middleware_layer {
    pub mod gatekeeper;
    pub mod policy;
    pub mod rate_limit;
}

pub use config::Config;
pub use error::{AppError, Result};
pub use state::AppState;
