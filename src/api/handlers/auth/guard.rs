//! Session guard for routes that require an authenticated user.

use axum::{
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use sqlx::PgPool;
use tracing::{error, warn};
use uuid::Uuid;

use super::session::{redirect_with_session, Session, KEY_RETURN_TO, KEY_USER_ID};
use super::state::AuthState;
use super::storage::{self, UserRecord};

/// Resolve the session's user or produce the redirect that sends the browser
/// to `/login`, remembering where it was headed so login can return there.
///
/// Self-healing: a session naming a user id that no longer resolves (deleted
/// account, restored database) is treated like an anonymous one, after
/// scrubbing the stale id from the cookie.
pub(crate) async fn require_user(
    state: &AuthState,
    pool: &PgPool,
    headers: &HeaderMap,
    requested_path: &str,
) -> Result<(Session, UserRecord), Response> {
    let mut session = state.sessions().load(headers);

    let Some(user_id) = session.get(KEY_USER_ID).map(str::to_string) else {
        return Err(login_redirect(state, session, requested_path));
    };

    let Ok(user_id) = Uuid::parse_str(&user_id) else {
        warn!("session carried a malformed user id, scrubbing");
        session.unset(KEY_USER_ID);
        return Err(login_redirect(state, session, requested_path));
    };

    let user = match storage::find_user_by_id(pool, user_id).await {
        Ok(user) => user,
        Err(err) => {
            error!("Failed to resolve session user: {err}");
            return Err(StatusCode::INTERNAL_SERVER_ERROR.into_response());
        }
    };

    match user {
        Some(user) => Ok((session, user)),
        None => {
            warn!(%user_id, "session user no longer exists, scrubbing");
            session.unset(KEY_USER_ID);
            Err(login_redirect(state, session, requested_path))
        }
    }
}

fn login_redirect(state: &AuthState, mut session: Session, requested_path: &str) -> Response {
    if is_safe_return_target(requested_path) {
        session.set(KEY_RETURN_TO, requested_path);
    }
    redirect_with_session(state.sessions(), &session, "/login")
}

/// Only same-site absolute paths may be remembered; anything else could send
/// the browser off-site after login.
pub(super) fn is_safe_return_target(path: &str) -> bool {
    path.starts_with('/') && !path.starts_with("//") && !path.starts_with("/\\")
}
