mod common;

use std::sync::Arc;

use axum::{
    Extension, Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
    middleware::from_fn_with_state,
    routing::{get, post},
};
use tower::ServiceExt;
use tower_cookies::CookieManagerLayer;
use uuid::Uuid;

use common::FIREFOX;
use trustgate::{
    AppState,
    identity::StaticIdentityProvider,
    middleware_layer::gatekeeper::{self, SESSION_COOKIE},
    models::access::{AccessDecision, SecurityContext},
};

const TOKEN: &str = "http-adapter-token";

async fn whoami(
    Extension(decision): Extension<AccessDecision>,
    Extension(context): Extension<SecurityContext>,
) -> String {
    format!(
        "{}|{}|{}|{}",
        decision.authenticated,
        decision.security_score,
        context.ip_address,
        context.subject_id.map(|s| s.to_string()).unwrap_or_default()
    )
}

fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(whoami))
        .route("/dashboard", get(whoami))
        .route("/auth/login", post(whoami))
        .layer(from_fn_with_state(state.clone(), gatekeeper::enforce))
        .layer(CookieManagerLayer::new())
        .with_state(state)
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn allowed_request_reaches_the_handler_with_its_context() {
    let subject = Uuid::new_v4();
    let h = common::harness(&[], Arc::new(StaticIdentityProvider::new().with_token(TOKEN, subject)));

    let response = app(h.state.clone())
        .oneshot(
            Request::builder()
                .uri("/health")
                .header("x-forwarded-for", "203.0.113.5, 10.0.0.1")
                .header(header::USER_AGENT, FIREFOX)
                .header(header::AUTHORIZATION, format!("Bearer {}", TOKEN))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, format!("true|80|203.0.113.5|{}", subject));
}

#[tokio::test]
async fn protected_route_redirects_to_login() {
    let h = common::harness(&[], Arc::new(StaticIdentityProvider::new()));

    let response = app(h.state.clone())
        .oneshot(Request::builder().uri("/dashboard").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(response.headers().get(header::LOCATION).unwrap(), "/auth/login");
}

#[tokio::test]
async fn exhausted_budget_returns_429_with_retry_after() {
    let h = common::harness(
        &[("RATE_LIMIT_LOGIN", "2/60")],
        Arc::new(StaticIdentityProvider::new()),
    );
    let app = app(h.state.clone());

    let login = || {
        Request::builder()
            .method("POST")
            .uri("/auth/login")
            .header("x-real-ip", "198.51.100.20")
            .body(Body::empty())
            .unwrap()
    };

    for _ in 0..2 {
        let response = app.clone().oneshot(login()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app.clone().oneshot(login()).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "60");
    assert_eq!(body_text(response).await, r#"{"error":"Rate limit exceeded"}"#);
}

#[tokio::test]
async fn session_cookie_is_read_from_the_request() {
    let h = common::session_harness(&[]);
    let subject = Uuid::new_v4();
    let session = h
        .state
        .sessions
        .create(subject, Some("203.0.113.5"), Some(FIREFOX))
        .await
        .unwrap();

    let response = app(h.state.clone())
        .oneshot(
            Request::builder()
                .uri("/dashboard")
                .header("x-forwarded-for", "203.0.113.5")
                .header(header::USER_AGENT, FIREFOX)
                .header(header::COOKIE, format!("{}={}", SESSION_COOKIE, session.session_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, format!("true|100|203.0.113.5|{}", subject));
}

#[tokio::test]
async fn store_outage_returns_generic_500() {
    let subject = Uuid::new_v4();
    let h = common::harness(&[], Arc::new(StaticIdentityProvider::new().with_token(TOKEN, subject)));
    h.store.set_offline(true);

    let response = app(h.state.clone())
        .oneshot(
            Request::builder()
                .uri("/dashboard")
                .header(header::AUTHORIZATION, format!("Bearer {}", TOKEN))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_text(response).await, r#"{"error":"Internal server error"}"#);
}
