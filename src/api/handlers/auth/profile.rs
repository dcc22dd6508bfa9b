//! Password change, also the landing flow for accounts that have never set
//! one (`pendingUserId` sessions coming out of login).

use axum::{extract::Extension, http::HeaderMap, response::Response, Form};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::flash::{FlashKind, FlashPayload};
use super::password::{self, Verdict};
use super::session::{
    redirect_with_session, KEY_PENDING_USER_ID, KEY_RETURN_TO, KEY_USER_ID,
};
use super::state::AuthState;
use super::storage;
use super::types::ChangePasswordForm;

const FORM_PATH: &str = "/profile/change-password";

/// Set a new password for the signed-in (or pending) user.
#[utoipa::path(
    post,
    path = "/profile/change-password",
    request_body = ChangePasswordForm,
    responses(
        (status = 303, description = "Redirect: onward on success, back to the form on failure, to /login when unauthenticated")
    ),
    tag = "auth"
)]
pub async fn submit(
    auth_state: Extension<Arc<AuthState>>,
    pool: Extension<PgPool>,
    headers: HeaderMap,
    Form(form): Form<ChangePasswordForm>,
) -> Response {
    let store = auth_state.sessions();
    let mut session = store.load(&headers);

    let pending = session.get(KEY_USER_ID).is_none();
    let raw_id = session
        .get(KEY_USER_ID)
        .or_else(|| session.get(KEY_PENDING_USER_ID))
        .map(str::to_string);

    let Some(raw_id) = raw_id else {
        session.set(KEY_RETURN_TO, FORM_PATH);
        return redirect_with_session(store, &session, "/login");
    };
    let Ok(user_id) = Uuid::parse_str(&raw_id) else {
        warn!("session carried a malformed user id, scrubbing");
        session.unset(KEY_USER_ID);
        session.unset(KEY_PENDING_USER_ID);
        return redirect_with_session(store, &session, "/login");
    };

    let user = match storage::find_user_by_id(&pool, user_id).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            warn!(%user_id, "session user no longer exists, scrubbing");
            session.unset(KEY_USER_ID);
            session.unset(KEY_PENDING_USER_ID);
            return redirect_with_session(store, &session, "/login");
        }
        Err(err) => {
            error!("Failed to resolve session user: {err}");
            session.flash_storage_failure("ChangePasswordError", "could not load your account");
            return redirect_with_session(store, &session, FORM_PATH);
        }
    };

    // Accounts with a real password must prove they know it first; sentinel
    // accounts have nothing to prove.
    if !password::is_empty_sentinel(&user.password_hash) {
        let current = form.current_password.as_deref().unwrap_or_default();
        if current.is_empty() {
            session.flash(
                FlashKind::ErrorDetails,
                FlashPayload::structured("currentPassword", "Current password is required"),
            );
            return redirect_with_session(store, &session, FORM_PATH);
        }
        if password::verify(current, &user.password_hash) == Verdict::Invalid {
            session.flash(
                FlashKind::ErrorDetails,
                FlashPayload::structured("currentPassword", "Current password is incorrect"),
            );
            return redirect_with_session(store, &session, FORM_PATH);
        }
    }

    let min = auth_state.config().min_password_length();
    if form.new_password.len() < min {
        session.flash(
            FlashKind::ErrorDetails,
            FlashPayload::structured(
                "newPassword",
                format!("Password must be at least {min} characters"),
            ),
        );
        return redirect_with_session(store, &session, FORM_PATH);
    }
    if form.new_password != form.new_password_confirm {
        session.flash(
            FlashKind::ErrorDetails,
            FlashPayload::structured("newPasswordConfirm", "Passwords do not match"),
        );
        return redirect_with_session(store, &session, FORM_PATH);
    }

    let password_hash = match password::hash(&form.new_password) {
        Ok(hash) => hash,
        Err(err) => {
            error!("Failed to hash password: {err}");
            session.flash(
                FlashKind::Error,
                FlashPayload::plain("Something went wrong, try again"),
            );
            return redirect_with_session(store, &session, FORM_PATH);
        }
    };

    if let Err(err) = storage::update_password(&pool, user.id, &password_hash).await {
        error!("Failed to update password: {err}");
        session.flash_storage_failure("ChangePasswordError", "password update failed");
        return redirect_with_session(store, &session, FORM_PATH);
    }

    info!(user_id = %user.id, pending, "password changed");
    session.set(KEY_USER_ID, user.id.to_string());
    session.unset(KEY_PENDING_USER_ID);
    session.flash(FlashKind::Success, FlashPayload::plain("Password updated"));

    let target = session
        .take(KEY_RETURN_TO)
        .filter(|target| super::guard::is_safe_return_target(target))
        .unwrap_or_else(|| "/".to_string());
    redirect_with_session(store, &session, &target)
}
