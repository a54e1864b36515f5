use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use garde::Validate;
use postgres_types::{FromSql, ToSql};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// A named processing purpose subject to independent grant and withdrawal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentType {
    DataProcessing,
    ChildData,
    FinancialData,
    DocumentVault,
    EmailNotifications,
    Analytics,
}

impl ConsentType {
    /// Consents every application needs before its protected data may change.
    pub const REQUIRED: [ConsentType; 3] = [
        ConsentType::DataProcessing,
        ConsentType::ChildData,
        ConsentType::FinancialData,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConsentType::DataProcessing => "data_processing",
            ConsentType::ChildData => "child_data",
            ConsentType::FinancialData => "financial_data",
            ConsentType::DocumentVault => "document_vault",
            ConsentType::EmailNotifications => "email_notifications",
            ConsentType::Analytics => "analytics",
        }
    }
}

impl fmt::Display for ConsentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConsentType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "data_processing" => Ok(ConsentType::DataProcessing),
            "child_data" => Ok(ConsentType::ChildData),
            "financial_data" => Ok(ConsentType::FinancialData),
            "document_vault" => Ok(ConsentType::DocumentVault),
            "email_notifications" => Ok(ConsentType::EmailNotifications),
            "analytics" => Ok(ConsentType::Analytics),
            other => Err(AppError::Validation(format!("Unknown consent type: {}", other))),
        }
    }
}

/// Lifecycle state of a consent row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSql, FromSql)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[postgres(name = "consent_status")]
pub enum ConsentStatus {
    #[postgres(name = "GRANTED")]
    Granted,
    #[postgres(name = "WITHDRAWN")]
    Withdrawn,
    #[postgres(name = "EXPIRED")]
    Expired,
}

/// The benefit application a consent is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplicationType {
    Kita,
    Elterngeld,
}

impl ApplicationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationType::Kita => "kita",
            ApplicationType::Elterngeld => "elterngeld",
        }
    }
}

/// A recorded consent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Consent {
    pub id: Uuid,
    pub subject_id: Uuid,
    pub consent_type: ConsentType,
    pub purpose: String,
    pub legal_basis: String,
    pub status: ConsentStatus,
    pub application_context: Option<String>,
    pub granted_at: DateTime<Utc>,
    pub withdrawn_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub withdrawal_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Consent {
    /// GRANTED and not past `expires_at` at `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.status == ConsentStatus::Granted && self.expires_at.is_none_or(|exp| exp > now)
    }

    /// Whether this row answers a check scoped to `context`.
    ///
    /// A row without context covers every application; `None` accepts any row.
    pub fn covers_context(&self, context: Option<&str>) -> bool {
        match (context, self.application_context.as_deref()) {
            (None, _) => true,
            (Some(_), None) => true,
            (Some(wanted), Some(own)) => wanted == own,
        }
    }
}

/// A request to grant a consent.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ConsentRequest {
    #[garde(skip)]
    pub consent_type: ConsentType,
    /// Overrides the purpose from the purpose table.
    #[garde(length(min = 1, max = 512))]
    pub purpose: Option<String>,
    /// Overrides the legal basis from the purpose table.
    #[garde(length(min = 1, max = 256))]
    pub legal_basis: Option<String>,
    #[garde(ascii, length(min = 1, max = 64))]
    pub application_context: Option<String>,
    #[garde(skip)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl ConsentRequest {
    pub fn new(consent_type: ConsentType) -> Self {
        Self {
            consent_type,
            purpose: None,
            legal_basis: None,
            application_context: None,
            expires_at: None,
        }
    }

    pub fn in_context(mut self, application: ApplicationType) -> Self {
        self.application_context = Some(application.as_str().to_string());
        self
    }

    pub fn expiring_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_purpose(mut self, purpose: impl Into<String>, legal_basis: impl Into<String>) -> Self {
        self.purpose = Some(purpose.into());
        self.legal_basis = Some(legal_basis.into());
        self
    }
}

/// A validated grant, with purpose and legal basis resolved, as handed to the store.
#[derive(Debug, Clone)]
pub struct ConsentGrant {
    pub subject_id: Uuid,
    pub consent_type: ConsentType,
    pub purpose: String,
    pub legal_basis: String,
    pub application_context: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Result of a consent check.
#[derive(Debug, Clone, Serialize)]
pub struct ConsentCheck {
    pub has_consent: bool,
    pub consent: Option<Consent>,
}

/// Result of the required-consent gate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequiredConsents {
    pub has_all_required: bool,
    pub missing: Vec<ConsentType>,
}

/// Counts shown on the privacy dashboard.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsentSummary {
    pub total_consents: usize,
    pub active_consents: usize,
    pub withdrawn_consents: usize,
    pub expired_consents: usize,
    pub last_activity: Option<DateTime<Utc>>,
}
