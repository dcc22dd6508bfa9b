//! Landing page data: the signed-in user plus any pending flashes.

use axum::{
    extract::Extension,
    http::{header::SET_COOKIE, HeaderMap},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::error;

use super::auth::flash::FlashMessage;
use super::auth::{guard, state::AuthState};

#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "Signed-in user and pending flashes"),
        (status = 303, description = "No session, redirect to /login")
    ),
    tag = "app"
)]
pub async fn index(
    auth_state: Extension<Arc<AuthState>>,
    pool: Extension<PgPool>,
    headers: HeaderMap,
) -> Response {
    let (mut session, user) = match guard::require_user(&auth_state, &pool, &headers, "/").await {
        Ok(resolved) => resolved,
        Err(redirect) => return redirect,
    };

    let flashes: Vec<_> = session.take_flashes().iter().map(FlashMessage::view).collect();

    let mut response = Json(json!({
        "user": {
            "id": user.id,
            "email": user.email,
            "username": user.username,
            "name": user.name,
        },
        "flashes": flashes,
    }))
    .into_response();

    match auth_state.sessions().commit(&session) {
        Ok(cookie) => {
            response.headers_mut().insert(SET_COOKIE, cookie);
        }
        Err(err) => error!("Failed to commit session: {err}"),
    }
    response
}
