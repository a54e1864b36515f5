//! The access gatekeeper: rate limiting, identity, authorization, anomaly
//! scoring and audit, in that order, for every request.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use http::{HeaderMap, Method, header};
use tower_cookies::Cookies;
use uuid::Uuid;

use crate::{
    clock::SharedClock,
    config::GatekeeperConfig,
    error::{AppError, Result, error_body},
    identity::IdentityProvider,
    middleware_layer::rate_limit::{LimitClass, LimitDecision, RateLimiter},
    models::{
        access::{Role, SecurityContext},
        security_event::{
            AuditRecord, EventMetadata, MetadataKey, SecurityEvent, SecurityEventType, Severity,
        },
    },
    repositories::{PermissionStore, bounded},
    services::{
        audit::SecurityEventLog,
        session::SessionManager,
        threat::{
            NoThreatIntelligence, RequestRateTracker, ScoreSignals, SlidingWindowTracker,
            ThreatIntelligence, security_score, suspicious_patterns,
        },
    },
    state::AppState,
};

/// Name of the session cookie.
pub const SESSION_COOKIE: &str = "session_token";

/// Purpose recorded on gatekeeper audit records.
pub const AUDIT_PURPOSE: &str = "User data access";
/// Legal basis recorded on gatekeeper audit records.
pub const AUDIT_LEGAL_BASIS: &str = "Art. 6.1.a GDPR (Consent)";

/// The request attributes the gatekeeper decides on.
#[derive(Debug, Clone)]
pub struct GateRequest {
    pub method: Method,
    pub path: String,
    pub ip: String,
    pub user_agent: Option<String>,
    pub bearer_token: Option<String>,
    pub session_token: Option<String>,
}

impl GateRequest {
    pub fn new(method: Method, path: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            ip: ip.into(),
            user_agent: None,
            bearer_token: None,
            session_token: None,
        }
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn session_cookie(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    /// Builds a request from HTTP parts.
    pub fn from_http(
        method: &Method,
        path: &str,
        headers: &HeaderMap,
        socket: Option<SocketAddr>,
        session_token: Option<String>,
    ) -> Self {
        let bearer_token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        Self {
            method: method.clone(),
            path: path.to_string(),
            ip: client_ip(headers, socket),
            user_agent: headers
                .get(header::USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            bearer_token,
            session_token: session_token.filter(|t| !t.is_empty()),
        }
    }

    /// The IP, unless it could not be determined.
    fn known_ip(&self) -> Option<&str> {
        Some(self.ip.as_str()).filter(|ip| *ip != "unknown")
    }
}

/// Client IP: first `x-forwarded-for` hop, then `x-real-ip`, then the socket, then `unknown`.
pub fn client_ip(headers: &HeaderMap, socket: Option<SocketAddr>) -> String {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    if let Some(first) = header_value("x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return first.to_string();
    }

    if let Some(real_ip) = header_value("x-real-ip") {
        return real_ip.to_string();
    }

    socket
        .map(|s| s.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// A blocking response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateResponse {
    RateLimited { retry_after_secs: u64 },
    LoginRedirect { location: String },
    Forbidden,
    Internal,
}

impl IntoResponse for GateResponse {
    fn into_response(self) -> Response {
        match self {
            GateResponse::RateLimited { retry_after_secs } => {
                AppError::RateLimitExceeded { retry_after_secs }.into_response()
            }
            GateResponse::LoginRedirect { location } => Redirect::temporary(&location).into_response(),
            GateResponse::Forbidden => AppError::Unauthorized.into_response(),
            GateResponse::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("Internal server error"),
            )
                .into_response(),
        }
    }
}

/// What the gatekeeper decided.
#[derive(Debug, Clone)]
pub struct GateOutcome {
    pub context: SecurityContext,
    /// Present when the request must not proceed.
    pub response: Option<GateResponse>,
}

/// Per-request access control.
#[derive(Clone)]
pub struct Gatekeeper {
    limiter: RateLimiter,
    identity: Arc<dyn IdentityProvider>,
    sessions: SessionManager,
    permissions: Arc<dyn PermissionStore>,
    events: SecurityEventLog,
    threat: Arc<dyn ThreatIntelligence>,
    tracker: Arc<dyn RequestRateTracker>,
    clock: SharedClock,
    config: GatekeeperConfig,
}

impl Gatekeeper {
    pub fn new(
        limiter: RateLimiter,
        identity: Arc<dyn IdentityProvider>,
        sessions: SessionManager,
        permissions: Arc<dyn PermissionStore>,
        events: SecurityEventLog,
        clock: SharedClock,
        config: GatekeeperConfig,
    ) -> Self {
        Self {
            limiter,
            identity,
            sessions,
            permissions,
            events,
            threat: Arc::new(NoThreatIntelligence),
            tracker: Arc::new(SlidingWindowTracker::new()),
            clock,
            config,
        }
    }

    pub fn with_threat_intelligence(mut self, threat: Arc<dyn ThreatIntelligence>) -> Self {
        self.threat = threat;
        self
    }

    pub fn with_rate_tracker(mut self, tracker: Arc<dyn RequestRateTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    /// Runs the full pipeline, stopping at the first step that blocks.
    ///
    /// # Arguments
    ///
    /// * `request` - The request to decide on.
    ///
    /// # Returns
    ///
    /// The security context, plus a response when the request is blocked.
    pub async fn process_request(&self, request: &GateRequest) -> GateOutcome {
        let mut context = SecurityContext::anonymous(request.ip.clone(), request.user_agent.clone());

        let class = LimitClass::classify(&self.config.routes, &request.path, &request.method);
        if let LimitDecision::Exceeded { retry_after_secs } = self.limiter.check(&request.ip, class).await {
            self.events
                .record(
                    SecurityEvent::new(
                        SecurityEventType::RateLimit,
                        Severity::Medium,
                        format!("Rate limit exceeded for {}", request.ip),
                    )
                    .ip(Some(&request.ip))
                    .metadata(
                        EventMetadata::new()
                            .with(MetadataKey::Path, request.path.as_str())
                            .with(MetadataKey::Method, request.method.as_str())
                            .with(MetadataKey::IpAddress, request.ip.as_str())
                            .with(MetadataKey::LimitClass, class.as_str())
                            .with(MetadataKey::RetryAfter, retry_after_secs as i64),
                    ),
                )
                .await;
            return GateOutcome {
                context,
                response: Some(GateResponse::RateLimited { retry_after_secs }),
            };
        }

        match self.guard(request, &mut context).await {
            Ok(response) => GateOutcome { context, response },
            Err(e) => {
                tracing::error!(path = %request.path, "❌ Gatekeeper failed closed: {}", e);
                self.events
                    .record(
                        SecurityEvent::new(
                            SecurityEventType::SuspiciousActivity,
                            Severity::High,
                            "Security middleware error",
                        )
                        .subject(context.subject_id)
                        .session(context.session_id.as_deref())
                        .ip(Some(&request.ip))
                        .metadata(
                            EventMetadata::new()
                                .with(MetadataKey::Path, request.path.as_str())
                                .with(MetadataKey::Method, request.method.as_str())
                                .with(MetadataKey::IpAddress, request.ip.as_str())
                                .with(MetadataKey::Error, e.to_string()),
                        ),
                    )
                    .await;
                GateOutcome {
                    context,
                    response: Some(GateResponse::Internal),
                }
            }
        }
    }

    /// Steps 2 to 5. Errors here fail the request closed.
    async fn guard(
        &self,
        request: &GateRequest,
        context: &mut SecurityContext,
    ) -> Result<Option<GateResponse>> {
        let requests_last_minute = match self
            .tracker
            .record_request(&request.ip, self.clock.now())
            .await
        {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!("⚠️ Request tracker unavailable: {}", e);
                0
            }
        };

        let session_anomalies = self.resolve_identity(request, context).await?;

        let routes = &self.config.routes;
        if routes.is_protected(&request.path) {
            if !context.is_authenticated {
                tracing::debug!(path = %request.path, "Unauthenticated request to protected route");
                return Ok(Some(GateResponse::LoginRedirect {
                    location: routes.login_path.clone(),
                }));
            }

            if let Some(reason) = self.denial_reason(context, request) {
                self.events
                    .record(
                        SecurityEvent::new(
                            SecurityEventType::AccessDenied,
                            Severity::High,
                            format!("Unauthorized access attempt to {}", request.path),
                        )
                        .subject(context.subject_id)
                        .session(context.session_id.as_deref())
                        .ip(Some(&request.ip))
                        .metadata(
                            EventMetadata::new()
                                .with(MetadataKey::Path, request.path.as_str())
                                .with(MetadataKey::Method, request.method.as_str())
                                .with(MetadataKey::Reason, reason),
                        ),
                    )
                    .await;
                return Ok(Some(GateResponse::Forbidden));
            }

            context.is_authorized = true;
        }

        if let Some(subject_id) = context.subject_id {
            self.score(request, context, subject_id, session_anomalies, requests_last_minute)
                .await;
        }

        if routes.is_sensitive(&request.path, &request.method) {
            self.audit(request, context).await;
        }

        Ok(None)
    }

    /// Fills in the subject, session, roles and permissions.
    ///
    /// Returns the number of tolerated session anomalies.
    async fn resolve_identity(&self, request: &GateRequest, context: &mut SecurityContext) -> Result<u32> {
        let Some(credential) = request
            .bearer_token
            .as_deref()
            .or(request.session_token.as_deref())
        else {
            return Ok(0);
        };

        let timeout = self.config.store_timeout;
        let Some(identity) = bounded(timeout, "resolve identity", self.identity.resolve_user(credential)).await?
        else {
            tracing::debug!("Credential did not resolve to a subject");
            return Ok(0);
        };

        let mut anomalies = 0;
        if let Some(token) = request.session_token.as_deref() {
            let validation = self
                .sessions
                .validate_detailed(token, request.known_ip(), request.user_agent.as_deref())
                .await?;

            match validation.session {
                Some(session) if session.subject_id == identity.subject_id => {
                    context.session_id = Some(session.session_id);
                    anomalies = validation.anomalies.len() as u32;
                }
                Some(session) => {
                    tracing::warn!("Session cookie does not belong to the resolved subject");
                    self.events
                        .record(
                            SecurityEvent::new(
                                SecurityEventType::SuspiciousActivity,
                                Severity::Medium,
                                "Session presented with another subject's credential",
                            )
                            .subject(Some(identity.subject_id))
                            .session(Some(&session.session_id))
                            .ip(Some(&request.ip)),
                        )
                        .await;
                    return Ok(0);
                }
                None => return Ok(0),
            }
        }

        let now = self.clock.now();
        let (roles, permissions) = futures::try_join!(
            bounded(timeout, "load roles", self.permissions.roles(identity.subject_id, now)),
            bounded(
                timeout,
                "load permissions",
                self.permissions.permissions(identity.subject_id, now)
            ),
        )?;

        context.subject_id = Some(identity.subject_id);
        context.roles = if roles.is_empty() { vec![Role::User] } else { roles };
        context.permissions = permissions;
        context.is_authenticated = true;

        tracing::debug!(subject_id = %identity.subject_id, "✅ Request authenticated");
        Ok(anomalies)
    }

    /// `None` when authorized; otherwise the reason, kept for the event log only.
    fn denial_reason(&self, context: &SecurityContext, request: &GateRequest) -> Option<String> {
        if context.is_admin() {
            return None;
        }

        let required = self
            .config
            .routes
            .required_permission(&request.path, &request.method)?;

        if context.permissions.iter().any(|p| p.satisfies(&required)) {
            None
        } else {
            Some(format!(
                "Missing {:?} permission for {}",
                required.level, required.table
            ))
        }
    }

    async fn score(
        &self,
        request: &GateRequest,
        context: &mut SecurityContext,
        subject_id: Uuid,
        session_anomalies: u32,
        requests_last_minute: u64,
    ) {
        let timeout = self.config.store_timeout;

        let high_risk_ip = bounded(timeout, "high risk ip", self.threat.is_high_risk_ip(&request.ip))
            .await
            .unwrap_or_else(|e| {
                tracing::warn!("⚠️ Threat intelligence unavailable: {}", e);
                false
            });

        let unusual_access = bounded(
            timeout,
            "unusual access",
            self.threat
                .has_unusual_access_pattern(Some(subject_id), &request.ip),
        )
        .await
        .unwrap_or_else(|e| {
            tracing::warn!("⚠️ Access pattern check unavailable: {}", e);
            false
        });

        let since = self.clock.now() - chrono::Duration::hours(24);
        let recent_incidents = self
            .events
            .incidents_since(subject_id, since)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!("⚠️ Incident count unavailable: {}", e);
                0
            });

        let unknown_user_agent = request
            .user_agent
            .as_deref()
            .is_none_or(|ua| ua.trim().is_empty() || ua.eq_ignore_ascii_case("unknown"));

        let score = security_score(&ScoreSignals {
            has_session: context.session_id.is_some(),
            high_risk_ip,
            unknown_user_agent,
            session_anomalies,
            recent_incidents,
        });
        context.security_score = score;

        let patterns = suspicious_patterns(
            requests_last_minute,
            unusual_access,
            score,
            self.config.suspicious_score_threshold,
        );
        if patterns.is_empty() {
            return;
        }

        let names: Vec<String> = patterns.iter().map(|p| p.as_str().to_string()).collect();
        self.events
            .record(
                SecurityEvent::new(
                    SecurityEventType::SuspiciousActivity,
                    Severity::Medium,
                    format!("Suspicious patterns detected: {}", names.join("; ")),
                )
                .subject(Some(subject_id))
                .session(context.session_id.as_deref())
                .ip(Some(&request.ip))
                .metadata(
                    EventMetadata::new()
                        .with(MetadataKey::Patterns, names)
                        .with(MetadataKey::SecurityScore, score as i64)
                        .with(MetadataKey::Path, request.path.as_str()),
                ),
            )
            .await;
    }

    async fn audit(&self, request: &GateRequest, context: &SecurityContext) {
        self.events
            .audit(AuditRecord {
                id: Uuid::new_v4(),
                subject_id: context.subject_id,
                table_name: self.config.routes.table_for_path(&request.path).to_string(),
                action: request.method.as_str().to_string(),
                data_category: self.config.routes.category_for_path(&request.path),
                purpose: AUDIT_PURPOSE.to_string(),
                legal_basis: AUDIT_LEGAL_BASIS.to_string(),
                ip_address: Some(request.ip.clone()),
                user_agent: request.user_agent.clone(),
                session_id: context.session_id.clone(),
                created_at: self.clock.now(),
            })
            .await;
    }
}

/// A middleware that runs the gatekeeper in front of every route.
///
/// Blocked requests get the gatekeeper's response; allowed ones carry the
/// `SecurityContext` and `AccessDecision` in their extensions.
pub async fn enforce(
    State(state): State<AppState>,
    cookies: Cookies,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let socket = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0);
    let gate_request = GateRequest::from_http(
        request.method(),
        request.uri().path(),
        request.headers(),
        socket,
        cookies.get(SESSION_COOKIE).map(|c| c.value().to_string()),
    );

    let outcome = state.gatekeeper.process_request(&gate_request).await;
    if let Some(response) = outcome.response {
        return response.into_response();
    }

    request.extensions_mut().insert(outcome.context.decision());
    request.extensions_mut().insert(outcome.context);
    next.run(request).await
}
