//! Password reset: email request plus token-based completion.
//!
//! The request side never reveals whether an address exists; the response is
//! identical either way and unknown addresses are a silent no-op.

use axum::{
    extract::{Extension, Path},
    http::{header::SET_COOKIE, HeaderMap},
    response::{IntoResponse, Response},
    Form, Json,
};
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::flash::{FlashKind, FlashMessage, FlashPayload};
use super::password;
use super::rate_limit::{RateLimitAction, RateLimitDecision};
use super::session::{
    redirect_with_session, KEY_PENDING_USER_ID, KEY_RETURN_TO, KEY_USER_ID,
};
use super::state::AuthState;
use super::storage;
use super::types::{ResetForm, ResetRequestForm};
use super::utils::{extract_client_ip, hash_reset_token, normalize_email, valid_email};

const CHECK_YOUR_EMAIL: &str = "If that email is registered, a reset link is on its way";
const INVALID_LINK: &str = "Reset link is invalid or expired";

/// Page data for the reset-request form.
#[utoipa::path(
    get,
    path = "/reset",
    responses((status = 200, description = "Reset request page data with pending flashes")),
    tag = "auth"
)]
pub async fn page(auth_state: Extension<Arc<AuthState>>, headers: HeaderMap) -> Response {
    let mut session = auth_state.sessions().load(&headers);
    let flashes: Vec<_> = session.take_flashes().iter().map(FlashMessage::view).collect();

    let mut response = Json(json!({ "flashes": flashes })).into_response();
    match auth_state.sessions().commit(&session) {
        Ok(cookie) => {
            response.headers_mut().insert(SET_COOKIE, cookie);
        }
        Err(err) => error!("Failed to commit session: {err}"),
    }
    response
}

/// Ask for a reset link.
#[utoipa::path(
    post,
    path = "/reset",
    request_body = ResetRequestForm,
    responses((status = 303, description = "Redirect to /login, identical for known and unknown addresses")),
    tag = "auth"
)]
pub async fn request(
    auth_state: Extension<Arc<AuthState>>,
    pool: Extension<PgPool>,
    headers: HeaderMap,
    Form(form): Form<ResetRequestForm>,
) -> Response {
    let store = auth_state.sessions();
    let mut session = store.load(&headers);
    let email = normalize_email(&form.email);

    let ip = extract_client_ip(&headers);
    let limited = auth_state
        .rate_limiter()
        .check_ip(ip.as_deref(), RateLimitAction::ResetRequest)
        == RateLimitDecision::Limited
        || auth_state
            .rate_limiter()
            .check_email(&email, RateLimitAction::ResetRequest)
            == RateLimitDecision::Limited;
    if limited {
        warn!(ip = ip.as_deref(), "reset request rate limited");
        session.flash(
            FlashKind::Error,
            FlashPayload::plain("Too many attempts, try again later"),
        );
        return redirect_with_session(store, &session, "/reset");
    }

    if !valid_email(&email) {
        session.flash(
            FlashKind::ErrorDetails,
            FlashPayload::structured("email", "Email address is invalid"),
        );
        return redirect_with_session(store, &session, "/reset");
    }

    match storage::issue_reset_token(&pool, &email, auth_state.config()).await {
        Ok(issued) => {
            // Unknown addresses fall through to the same flash on purpose.
            if issued.is_some() {
                info!("reset token issued");
            }
        }
        Err(err) => {
            error!("Failed to issue reset token: {err}");
            session.flash_storage_failure("ResetError", "could not start a password reset");
            return redirect_with_session(store, &session, "/reset");
        }
    }

    session.flash(FlashKind::Info, FlashPayload::plain(CHECK_YOUR_EMAIL));
    redirect_with_session(store, &session, "/login")
}

/// Page data for the completion form; rejects dead tokens up front so the
/// user is not asked to type a new password for nothing.
#[utoipa::path(
    get,
    path = "/reset/{resetToken}",
    params(("resetToken" = String, Path, description = "Reset token from the email link")),
    responses(
        (status = 200, description = "Reset completion page data"),
        (status = 303, description = "Invalid or expired token, redirect to /login")
    ),
    tag = "auth"
)]
pub async fn completion_page(
    auth_state: Extension<Arc<AuthState>>,
    pool: Extension<PgPool>,
    headers: HeaderMap,
    Path(reset_token): Path<String>,
) -> Response {
    let store = auth_state.sessions();
    let mut session = store.load(&headers);

    let token_hash = hash_reset_token(&reset_token);
    match storage::find_user_id_by_reset_token(&pool, &token_hash).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            session.flash(FlashKind::Error, FlashPayload::plain(INVALID_LINK));
            return redirect_with_session(store, &session, "/login");
        }
        Err(err) => {
            error!("Failed to lookup reset token: {err}");
            session.flash_storage_failure("ResetError", "reset link lookup failed");
            return redirect_with_session(store, &session, "/login");
        }
    }

    let flashes: Vec<_> = session.take_flashes().iter().map(FlashMessage::view).collect();
    let mut response = Json(json!({ "flashes": flashes })).into_response();
    match store.commit(&session) {
        Ok(cookie) => {
            response.headers_mut().insert(SET_COOKIE, cookie);
        }
        Err(err) => error!("Failed to commit session: {err}"),
    }
    response
}

/// Set the new password. Consuming the token and installing the hash is one
/// statement, so a replayed or concurrent submit loses cleanly.
#[utoipa::path(
    post,
    path = "/reset/{resetToken}",
    params(("resetToken" = String, Path, description = "Reset token from the email link")),
    request_body = ResetForm,
    responses(
        (status = 303, description = "Redirect: signed in onward on success, to /login on a dead token, back to the form on validation failure")
    ),
    tag = "auth"
)]
pub async fn complete(
    auth_state: Extension<Arc<AuthState>>,
    pool: Extension<PgPool>,
    headers: HeaderMap,
    Path(reset_token): Path<String>,
    Form(form): Form<ResetForm>,
) -> Response {
    let store = auth_state.sessions();
    let mut session = store.load(&headers);
    let form_path = format!("/reset/{reset_token}");

    let min = auth_state.config().min_password_length();
    if form.password.len() < min {
        session.flash(
            FlashKind::ErrorDetails,
            FlashPayload::structured(
                "password",
                format!("Password must be at least {min} characters"),
            ),
        );
        return redirect_with_session(store, &session, &form_path);
    }
    if form.password != form.password_confirm {
        session.flash(
            FlashKind::ErrorDetails,
            FlashPayload::structured("passwordConfirm", "Passwords do not match"),
        );
        return redirect_with_session(store, &session, &form_path);
    }

    let password_hash = match password::hash(&form.password) {
        Ok(hash) => hash,
        Err(err) => {
            error!("Failed to hash password: {err}");
            session.flash(
                FlashKind::Error,
                FlashPayload::plain("Something went wrong, try again"),
            );
            return redirect_with_session(store, &session, &form_path);
        }
    };

    let token_hash = hash_reset_token(&reset_token);
    match storage::consume_reset_token(&pool, &token_hash, &password_hash).await {
        Ok(Some(user_id)) => {
            info!(%user_id, "password reset completed");
            session.set(KEY_USER_ID, user_id.to_string());
            session.unset(KEY_PENDING_USER_ID);
            session.flash(FlashKind::Success, FlashPayload::plain("Password updated"));
            let target = session
                .take(KEY_RETURN_TO)
                .filter(|target| super::guard::is_safe_return_target(target))
                .unwrap_or_else(|| "/".to_string());
            redirect_with_session(store, &session, &target)
        }
        Ok(None) => {
            session.flash(FlashKind::Error, FlashPayload::plain(INVALID_LINK));
            redirect_with_session(store, &session, "/login")
        }
        Err(err) => {
            error!("Failed to consume reset token: {err}");
            session.flash_storage_failure("ResetError", "password reset failed");
            redirect_with_session(store, &session, &form_path)
        }
    }
}
