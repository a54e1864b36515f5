use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    Extension, Router,
    middleware::from_fn_with_state,
    routing::get,
};
use tower_cookies::CookieManagerLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnFailure, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use trustgate::{
    AppState, Config,
    middleware_layer::gatekeeper,
    models::access::AccessDecision,
};

/// Interval of the session and consent housekeeping pass.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

async fn health(Extension(decision): Extension<AccessDecision>) -> String {
    sonic_rs::to_string(&sonic_rs::json!({
        "status": "ok",
        "authenticated": decision.authenticated,
        "security_score": decision.security_score,
    }))
    .unwrap_or_else(|_| r#"{"status":"ok"}"#.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    config.validate()?;
    tracing::info!("✅ Configuration loaded successfully");

    let state = AppState::new(&config).await?;
    tracing::info!("✅ AppState initialized");

    let app = Router::new()
        .route("/health", get(health))
        .layer(from_fn_with_state(state.clone(), gatekeeper::enforce))
        .layer(CookieManagerLayer::new())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default())
                .on_request(DefaultOnRequest::default().level(Level::DEBUG))
                .on_response(DefaultOnResponse::default().level(Level::DEBUG))
                .on_failure(DefaultOnFailure::default().level(Level::ERROR)),
        )
        .with_state(state.clone());

    let cleanup_state = state.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(CLEANUP_INTERVAL).await;
            tracing::info!("🧹 Running scheduled session and consent cleanup...");
            match cleanup_state.sessions.cleanup_expired().await {
                Ok(count) => tracing::info!("✅ Session cleanup completed ({} ended)", count),
                Err(e) => tracing::error!("❌ Session cleanup failed: {}", e),
            }
            match cleanup_state.consents.expire_overdue().await {
                Ok(count) => tracing::info!("✅ Consent expiry completed ({} expired)", count),
                Err(e) => tracing::error!("❌ Consent expiry failed: {}", e),
            }
        }
    });

    let addr = SocketAddr::from(([127, 0, 0, 1], 3000));
    tracing::info!("🚀 Server listening on http://{}", addr);
    tracing::info!("✅ Background cleanup job started (runs every hour)");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
