//! Route classification: which paths are protected, sensitive or permission-bearing.

use http::Method;
use serde::{Deserialize, Serialize};

use crate::models::access::{AccessLevel, DataCategory, RequiredPermission};

/// A path segment that binds a table to a data category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRule {
    /// Substring looked for in `/api/` paths, e.g. `/parents`.
    pub segment: String,
    pub table: String,
    pub category: DataCategory,
}

/// Route tables the gatekeeper classifies requests with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutePolicy {
    /// Prefixes that require an authenticated subject.
    pub protected_prefixes: Vec<String>,
    /// Read prefixes audited like writes.
    pub sensitive_read_prefixes: Vec<String>,
    /// Rules checked in order; the first match decides.
    pub permission_rules: Vec<PermissionRule>,
    /// `(segment, table)` pairs used to name the audited table.
    pub audit_tables: Vec<(String, String)>,
    /// Unauthenticated requests to protected routes are sent here.
    pub login_path: String,
}

impl Default for RoutePolicy {
    fn default() -> Self {
        let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
        Self {
            protected_prefixes: strings(&[
                "/dashboard",
                "/kita-gutschein",
                "/elterngeld",
                "/api/protected",
                "/api/applications",
                "/api/documents",
            ]),
            sensitive_read_prefixes: strings(&[
                "/api/personal-data",
                "/api/audit-logs",
                "/api/export",
                "/dashboard",
            ]),
            permission_rules: vec![
                PermissionRule {
                    segment: "/parents".into(),
                    table: "parents".into(),
                    category: DataCategory::Personal,
                },
                PermissionRule {
                    segment: "/children".into(),
                    table: "children".into(),
                    category: DataCategory::SpecialChild,
                },
            ],
            audit_tables: [
                ("/parents", "parents"),
                ("/children", "children"),
                ("/employment", "employment_records"),
                ("/documents", "documents"),
                ("/consents", "user_consents"),
            ]
            .iter()
            .map(|(segment, table)| (segment.to_string(), table.to_string()))
            .collect(),
            login_path: "/auth/login".into(),
        }
    }
}

impl RoutePolicy {
    pub fn is_protected(&self, path: &str) -> bool {
        self.protected_prefixes.iter().any(|p| path.starts_with(p.as_str()))
    }

    /// Mutating methods are always sensitive; reads only under the sensitive prefixes.
    pub fn is_sensitive(&self, path: &str, method: &Method) -> bool {
        if matches!(*method, Method::POST | Method::PUT | Method::PATCH | Method::DELETE) {
            return true;
        }
        self.sensitive_read_prefixes
            .iter()
            .any(|p| path.starts_with(p.as_str()))
    }

    /// The permission an `/api/` route demands, if any.
    pub fn required_permission(&self, path: &str, method: &Method) -> Option<RequiredPermission> {
        if !path.starts_with("/api/") {
            return None;
        }
        self.permission_rules
            .iter()
            .find(|rule| path.contains(rule.segment.as_str()))
            .map(|rule| RequiredPermission {
                table: rule.table.clone(),
                level: AccessLevel::for_method(method),
                category: rule.category,
            })
    }

    /// Table name recorded in audit logs, or `unknown`.
    pub fn table_for_path(&self, path: &str) -> &str {
        self.audit_tables
            .iter()
            .find(|(segment, _)| path.contains(segment.as_str()))
            .map(|(_, table)| table.as_str())
            .unwrap_or("unknown")
    }

    /// Data category recorded in audit logs; `Personal` when no rule matches.
    pub fn category_for_path(&self, path: &str) -> DataCategory {
        self.permission_rules
            .iter()
            .find(|rule| path.contains(rule.segment.as_str()))
            .map_or(DataCategory::Personal, |rule| rule.category)
    }

    pub fn is_login(&self, path: &str) -> bool {
        path.contains(self.login_path.as_str())
    }
}
