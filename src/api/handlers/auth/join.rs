//! Signup flow: field-scoped validation, then user + team bootstrap.

use axum::{extract::Extension, http::HeaderMap, response::Response, Form};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::flash::{FlashKind, FlashPayload};
use super::rate_limit::{RateLimitAction, RateLimitDecision};
use super::session::{redirect_with_session, KEY_USER_ID};
use super::state::AuthState;
use super::storage::{self, NewUser, SignupOutcome};
use super::types::JoinForm;
use super::utils::{extract_client_ip, normalize_email, valid_email, valid_username};

/// First validation failure, scoped to the offending field. The password is
/// never echoed back.
fn validate(form: &JoinForm, min_password_length: usize) -> Result<(), (&'static str, String)> {
    let email = normalize_email(&form.email);
    if email.is_empty() {
        return Err(("email", "Email is required".to_string()));
    }
    if !valid_email(&email) {
        return Err(("email", "Email address is invalid".to_string()));
    }
    if form.username.trim().is_empty() {
        return Err(("username", "Username is required".to_string()));
    }
    if !valid_username(form.username.trim()) {
        return Err((
            "username",
            "Username must be 3-39 lowercase letters, digits, or dashes".to_string(),
        ));
    }
    if form.name.trim().is_empty() {
        return Err(("name", "Name is required".to_string()));
    }
    if form.password.len() < min_password_length {
        return Err((
            "password",
            format!("Password must be at least {min_password_length} characters"),
        ));
    }
    if form.password != form.confirm_password {
        return Err(("confirmPassword", "Passwords do not match".to_string()));
    }
    Ok(())
}

/// Create an account: user, owning team, membership, and a starter feature
/// channel, then sign the browser in.
#[utoipa::path(
    post,
    path = "/join",
    request_body = JoinForm,
    responses(
        (status = 303, description = "Redirect: to / on success, back to /join on failure")
    ),
    tag = "auth"
)]
pub async fn submit(
    auth_state: Extension<Arc<AuthState>>,
    pool: Extension<PgPool>,
    headers: HeaderMap,
    Form(form): Form<JoinForm>,
) -> Response {
    let store = auth_state.sessions();
    let mut session = store.load(&headers);

    let ip = extract_client_ip(&headers);
    if auth_state
        .rate_limiter()
        .check_ip(ip.as_deref(), RateLimitAction::Join)
        == RateLimitDecision::Limited
    {
        warn!(ip = ip.as_deref(), "join rate limited");
        session.flash(
            FlashKind::Error,
            FlashPayload::plain("Too many attempts, try again later"),
        );
        return redirect_with_session(store, &session, "/join");
    }

    if let Err((field, message)) = validate(&form, auth_state.config().min_password_length()) {
        session.flash(FlashKind::ErrorDetails, FlashPayload::structured(field, message));
        return redirect_with_session(store, &session, "/join");
    }

    let password_hash = match super::password::hash(&form.password) {
        Ok(hash) => hash,
        Err(err) => {
            error!("Failed to hash password: {err}");
            session.flash(
                FlashKind::Error,
                FlashPayload::plain("Something went wrong, try again"),
            );
            return redirect_with_session(store, &session, "/join");
        }
    };

    let new_user = NewUser {
        email: normalize_email(&form.email),
        username: form.username.trim().to_string(),
        name: form.name.trim().to_string(),
        password_hash,
    };

    match storage::insert_user_with_team(&pool, &new_user).await {
        Ok(SignupOutcome::Created(user_id)) => {
            info!(%user_id, "account created");
            session.set(KEY_USER_ID, user_id.to_string());
            redirect_with_session(store, &session, "/")
        }
        Ok(SignupOutcome::Conflict(field)) => {
            let key = match field {
                storage::ConflictField::Email => "email",
                storage::ConflictField::Username => "username",
            };
            session.flash(
                FlashKind::ErrorDetails,
                FlashPayload::structured(key, field.message()),
            );
            redirect_with_session(store, &session, "/join")
        }
        Err(err) => {
            error!("Failed to create account: {err}");
            session.flash_storage_failure("JoinError", "account creation failed");
            redirect_with_session(store, &session, "/join")
        }
    }
}
