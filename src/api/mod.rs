use crate::api::handlers::{auth, channels, health, home};
use anyhow::{anyhow, Context, Result};
use axum::{
    body::Body,
    extract::MatchedPath,
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderName, HeaderValue, Method, Request,
    },
    routing::{get, post},
    Extension, Router,
};
use sqlx::postgres::PgPoolOptions;
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    trace::TraceLayer,
};
use tracing::{info, info_span, Span};
use ulid::Ulid;
use url::Url;

pub mod email;
pub mod handlers;

/// Start the server
/// # Errors
/// Return error if failed to start the server
pub async fn new(
    port: u16,
    dsn: String,
    auth_config: auth::AuthConfig,
    sessions: auth::SessionStore,
    outbox_config: email::OutboxWorkerConfig,
) -> Result<()> {
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(&dsn)
        .await
        .context("Failed to connect to database")?;

    let app_origin = app_origin(auth_config.base_url())?;
    let auth_state = Arc::new(auth::AuthState::new(
        auth_config,
        sessions,
        Arc::new(auth::FixedWindowRateLimiter::new()),
    ));

    // Background worker drains email_outbox (DB-backed queue), delivering or
    // logging rows and retrying failures with backoff.
    email::spawn_outbox_worker(pool.clone(), Arc::new(email::LogEmailSender), outbox_config);

    let cors = CorsLayer::new()
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
        .allow_methods([Method::GET, Method::POST])
        .allow_origin(AllowOrigin::exact(app_origin))
        .allow_credentials(true);

    let app = Router::new()
        .route("/", get(home::index))
        .route("/health", get(health::health))
        .route("/login", get(auth::login::page).post(auth::login::submit))
        .route("/join", post(auth::join::submit))
        // Kept for old links; same handler as /join.
        .route("/register", post(auth::join::submit))
        .route("/logout", get(auth::session::logout))
        .route("/reset", get(auth::reset::page).post(auth::reset::request))
        .route(
            "/reset/:reset_token",
            get(auth::reset::completion_page).post(auth::reset::complete),
        )
        .route("/profile/change-password", post(auth::profile::submit))
        .route("/api/channels", get(channels::list))
        .route("/api/channel/:channel_id", get(channels::show))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(cors)
                .layer(Extension(auth_state))
                .layer(Extension(pool)),
        );

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Gracefully shutdown");
        })
        .await?;

    Ok(())
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}

/// Origin the browser app is served from, for CORS with credentials.
fn app_origin(base_url: &str) -> Result<HeaderValue> {
    let parsed =
        Url::parse(base_url).with_context(|| format!("Invalid base URL: {base_url}"))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| anyhow!("Base URL must include a valid host: {base_url}"))?;
    let port = parsed
        .port()
        .map_or_else(String::new, |port| format!(":{port}"));
    let origin = format!("{}://{}{}", parsed.scheme(), host, port);
    HeaderValue::from_str(&origin).context("Failed to build app origin header")
}

#[cfg(test)]
mod tests {
    use super::app_origin;

    #[test]
    fn app_origin_strips_path() {
        let origin = app_origin("http://localhost:3000/app").expect("origin");
        assert_eq!(origin, "http://localhost:3000");
    }

    #[test]
    fn app_origin_keeps_default_port_implicit() {
        let origin = app_origin("https://toggle.dev/").expect("origin");
        assert_eq!(origin, "https://toggle.dev");
    }

    #[test]
    fn app_origin_rejects_garbage() {
        assert!(app_origin("not a url").is_err());
    }
}
