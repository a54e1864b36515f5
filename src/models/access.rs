use postgres_types::{FromSql, ToSql};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Ordinal access level: `Read < Write < Delete < Admin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSql, FromSql)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[postgres(name = "access_level")]
pub enum AccessLevel {
    #[postgres(name = "READ")]
    Read,
    #[postgres(name = "WRITE")]
    Write,
    #[postgres(name = "DELETE")]
    Delete,
    #[postgres(name = "ADMIN")]
    Admin,
}

impl AccessLevel {
    /// The level an HTTP method needs.
    pub fn for_method(method: &http::Method) -> Self {
        if *method == http::Method::GET || *method == http::Method::HEAD {
            AccessLevel::Read
        } else if *method == http::Method::DELETE {
            AccessLevel::Delete
        } else {
            AccessLevel::Write
        }
    }
}

/// Category of personal data a table holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSql, FromSql)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[postgres(name = "data_category")]
pub enum DataCategory {
    #[postgres(name = "PERSONAL")]
    Personal,
    #[postgres(name = "SPECIAL_CHILD")]
    SpecialChild,
    #[postgres(name = "FINANCIAL")]
    Financial,
    #[postgres(name = "DOCUMENT")]
    Document,
    #[postgres(name = "COMMUNICATION")]
    Communication,
}

/// A subject's role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSql, FromSql)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[postgres(name = "app_role")]
pub enum Role {
    #[postgres(name = "USER")]
    User,
    #[postgres(name = "ADMIN")]
    Admin,
}

/// A granted right to touch one table's data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataAccessPermission {
    pub table_name: String,
    pub access_level: AccessLevel,
    pub data_category: DataCategory,
    /// Row-level conditions, evaluated by the data layer.
    #[serde(default)]
    pub conditions: Vec<String>,
}

impl DataAccessPermission {
    pub fn new(table_name: impl Into<String>, access_level: AccessLevel, data_category: DataCategory) -> Self {
        Self {
            table_name: table_name.into(),
            access_level,
            data_category,
            conditions: Vec::new(),
        }
    }

    /// Same table and category, and a level at or above the required one.
    pub fn satisfies(&self, required: &RequiredPermission) -> bool {
        self.table_name == required.table
            && self.data_category == required.category
            && self.access_level >= required.level
    }
}

/// The `(table, level, category)` triple a protected route demands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiredPermission {
    pub table: String,
    pub level: AccessLevel,
    pub category: DataCategory,
}

/// Per-request security context built by the gatekeeper.
#[derive(Debug, Clone, Serialize)]
pub struct SecurityContext {
    pub subject_id: Option<Uuid>,
    pub session_id: Option<String>,
    pub ip_address: String,
    pub user_agent: Option<String>,
    pub roles: Vec<Role>,
    pub permissions: Vec<DataAccessPermission>,
    pub is_authenticated: bool,
    pub is_authorized: bool,
    pub security_score: u8,
}

impl SecurityContext {
    /// An anonymous context with a perfect score.
    pub fn anonymous(ip_address: impl Into<String>, user_agent: Option<String>) -> Self {
        Self {
            subject_id: None,
            session_id: None,
            ip_address: ip_address.into(),
            user_agent,
            roles: Vec::new(),
            permissions: Vec::new(),
            is_authenticated: false,
            is_authorized: false,
            security_score: 100,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.roles.contains(&Role::Admin)
    }

    /// The per-request decision handed to downstream handlers.
    pub fn decision(&self) -> AccessDecision {
        AccessDecision {
            authenticated: self.is_authenticated,
            authorized: self.is_authorized,
            security_score: self.security_score,
            permissions: self.permissions.clone(),
        }
    }
}

/// Transient access decision, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccessDecision {
    pub authenticated: bool,
    pub authorized: bool,
    pub security_score: u8,
    pub permissions: Vec<DataAccessPermission>,
}
