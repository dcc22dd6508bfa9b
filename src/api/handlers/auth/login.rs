//! Login flow: credential check, hash upgrades, and `returnTo` handling.

use axum::{
    extract::Extension,
    http::{header::SET_COOKIE, HeaderMap},
    response::{IntoResponse, Response},
    Form, Json,
};
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::flash::{FlashKind, FlashPayload};
use super::guard::is_safe_return_target;
use super::password::{self, Verdict};
use super::rate_limit::{RateLimitAction, RateLimitDecision};
use super::session::{
    redirect_with_session, Session, KEY_PENDING_USER_ID, KEY_RETURN_TO, KEY_USER_ID,
};
use super::state::AuthState;
use super::storage;
use super::types::LoginForm;
use super::utils::{extract_client_ip, normalize_email};

const INVALID_CREDENTIALS: &str = "Invalid credentials";
const TOO_MANY_ATTEMPTS: &str = "Too many attempts, try again later";

/// Page data for the login form: any pending flashes, consumed on read.
#[utoipa::path(
    get,
    path = "/login",
    responses(
        (status = 200, description = "Login page data with pending flashes"),
        (status = 303, description = "Already signed in, redirect to /")
    ),
    tag = "auth"
)]
pub async fn page(
    auth_state: Extension<Arc<AuthState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let mut session = auth_state.sessions().load(&headers);

    if session.get(KEY_USER_ID).is_some() {
        return redirect_with_session(auth_state.sessions(), &session, "/");
    }

    let flashes: Vec<_> = session
        .take_flashes()
        .iter()
        .map(super::flash::FlashMessage::view)
        .collect();

    let mut response = Json(json!({ "flashes": flashes })).into_response();
    match auth_state.sessions().commit(&session) {
        Ok(cookie) => {
            response.headers_mut().insert(SET_COOKIE, cookie);
        }
        Err(err) => error!("Failed to commit session: {err}"),
    }
    response
}

/// Authenticate and establish the session.
#[utoipa::path(
    post,
    path = "/login",
    request_body = LoginForm,
    responses(
        (status = 303, description = "Redirect: to returnTo or / on success, back to /login on failure")
    ),
    tag = "auth"
)]
pub async fn submit(
    auth_state: Extension<Arc<AuthState>>,
    pool: Extension<PgPool>,
    headers: HeaderMap,
    Form(form): Form<LoginForm>,
) -> Response {
    let store = auth_state.sessions();
    let mut session = store.load(&headers);
    let email = normalize_email(&form.email);

    let ip = extract_client_ip(&headers);
    let limited = auth_state
        .rate_limiter()
        .check_ip(ip.as_deref(), RateLimitAction::Login)
        == RateLimitDecision::Limited
        || auth_state
            .rate_limiter()
            .check_email(&email, RateLimitAction::Login)
            == RateLimitDecision::Limited;
    if limited {
        warn!(ip = ip.as_deref(), "login rate limited");
        session.flash(FlashKind::Error, FlashPayload::plain(TOO_MANY_ATTEMPTS));
        return redirect_with_session(store, &session, "/login");
    }

    let user = match storage::find_user_by_email(&pool, &email).await {
        Ok(user) => user,
        Err(err) => {
            error!("Failed to lookup user: {err}");
            session.flash_storage_failure("LoginError", "something went wrong, try again");
            return redirect_with_session(store, &session, "/login");
        }
    };

    let Some(user) = user else {
        session.flash(FlashKind::Error, FlashPayload::plain(INVALID_CREDENTIALS));
        return redirect_with_session(store, &session, "/login");
    };

    // Accounts created without a password (imports, invites) carry the empty
    // sentinel: they cannot log in with a password, they must set one first.
    if password::is_empty_sentinel(&user.password_hash) {
        session.set(KEY_PENDING_USER_ID, user.id.to_string());
        session.flash(
            FlashKind::Info,
            FlashPayload::plain("Set a password to finish signing in"),
        );
        return redirect_with_session(store, &session, "/profile/change-password");
    }

    match password::verify(&form.password, &user.password_hash) {
        Verdict::Invalid => {
            session.flash(FlashKind::Error, FlashPayload::plain(INVALID_CREDENTIALS));
            redirect_with_session(store, &session, "/login")
        }
        verdict @ (Verdict::Valid | Verdict::ValidNeedsRehash) => {
            if verdict == Verdict::ValidNeedsRehash {
                // Best effort: a failed upgrade never blocks the login.
                match password::hash(&form.password) {
                    Ok(upgraded) => {
                        if let Err(err) =
                            storage::update_password(&pool, user.id, &upgraded).await
                        {
                            warn!("Failed to upgrade password hash: {err}");
                        }
                    }
                    Err(err) => warn!("Failed to rehash password: {err}"),
                }
            }

            session.set(KEY_USER_ID, user.id.to_string());
            session.unset(KEY_PENDING_USER_ID);
            let target = resolve_return_target(&mut session, form.return_to.as_deref());
            info!(user_id = %user.id, "login succeeded");
            redirect_with_session(store, &session, &target)
        }
    }
}

/// Pick the post-login destination: the form's `returnTo` wins over the one
/// remembered in the session, both are always consumed, unsafe targets fall
/// back to `/`.
fn resolve_return_target(session: &mut Session, form_return_to: Option<&str>) -> String {
    let remembered = session.take(KEY_RETURN_TO);
    form_return_to
        .map(str::to_string)
        .or(remembered)
        .filter(|target| is_safe_return_target(target))
        .unwrap_or_else(|| "/".to_string())
}
