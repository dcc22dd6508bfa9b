//! Read API for feature channels and their flags.
//!
//! `/api/channels` is the signed-in listing; `/api/channel/:channelId` is the
//! external read surface and also accepts a team access token as a Bearer
//! header.

use anyhow::{Context, Result};
use axum::{
    extract::{Extension, Path, Query},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tracing::{error, warn, Instrument};
use utoipa::ToSchema;
use uuid::Uuid;

use super::auth::{guard, state::AuthState};

/// Typed flag value; `kind` in storage decides the variant.
#[derive(Clone, Debug, PartialEq)]
pub enum FlagValue {
    Boolean(bool),
    Number(f64),
    Text(String),
}

impl FlagValue {
    /// Decode a stored `(kind, value)` pair. Unknown kinds and unparseable
    /// values yield `None`; callers skip the row instead of failing the
    /// request.
    #[must_use]
    pub fn parse(kind: &str, raw: &str) -> Option<Self> {
        match kind {
            "boolean" => match raw {
                "true" => Some(Self::Boolean(true)),
                "false" => Some(Self::Boolean(false)),
                _ => None,
            },
            "number" => raw.parse().ok().map(Self::Number),
            "text" => Some(Self::Text(raw.to_string())),
            _ => None,
        }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Boolean(_) => "boolean",
            Self::Number(_) => "number",
            Self::Text(_) => "text",
        }
    }

    /// Storage encoding, the inverse of [`parse`](Self::parse).
    #[must_use]
    pub fn format(&self) -> String {
        match self {
            Self::Boolean(value) => value.to_string(),
            Self::Number(value) => value.to_string(),
            Self::Text(value) => value.clone(),
        }
    }

    fn to_json(&self) -> Value {
        match self {
            Self::Boolean(value) => json!(value),
            Self::Number(value) => json!(value),
            Self::Text(value) => json!(value),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ChannelRecord {
    pub id: Uuid,
    pub team_id: Uuid,
    pub name: String,
    pub slug: String,
}

#[derive(Clone, Debug)]
pub struct FlagRecord {
    pub feature: String,
    pub value: FlagValue,
}

#[derive(Debug, Serialize, ToSchema)]
struct FlagView {
    feature: String,
    kind: String,
    value: Value,
}

impl FlagView {
    fn from_record(record: &FlagRecord) -> Self {
        Self {
            feature: record.feature.clone(),
            kind: record.value.kind().to_string(),
            value: record.value.to_json(),
        }
    }
}

/// Collapse flags into the `{feature: value}` object served by default.
fn flags_object(flags: &[FlagRecord]) -> Value {
    let mut object = Map::new();
    for flag in flags {
        object.insert(flag.feature.clone(), flag.value.to_json());
    }
    Value::Object(object)
}

async fn channels_for_user(pool: &PgPool, user_id: Uuid) -> Result<Vec<ChannelRecord>> {
    let query = r"
        SELECT fc.id, fc.team_id, fc.name, fc.slug
        FROM feature_channels fc
        JOIN team_members tm ON tm.team_id = fc.team_id
        WHERE tm.user_id = $1
        ORDER BY fc.name
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let rows = sqlx::query(query)
        .bind(user_id)
        .fetch_all(pool)
        .instrument(span)
        .await
        .context("failed to list channels")?;
    Ok(rows
        .into_iter()
        .map(|row| ChannelRecord {
            id: row.get("id"),
            team_id: row.get("team_id"),
            name: row.get("name"),
            slug: row.get("slug"),
        })
        .collect())
}

async fn channel_by_id(pool: &PgPool, channel_id: Uuid) -> Result<Option<ChannelRecord>> {
    let query = r"
        SELECT id, team_id, name, slug
        FROM feature_channels
        WHERE id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(channel_id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup channel")?;
    Ok(row.map(|row| ChannelRecord {
        id: row.get("id"),
        team_id: row.get("team_id"),
        name: row.get("name"),
        slug: row.get("slug"),
    }))
}

async fn flags_for_channel(pool: &PgPool, channel_id: Uuid) -> Result<Vec<FlagRecord>> {
    let query = r"
        SELECT feature, kind, value
        FROM flags
        WHERE channel_id = $1
        ORDER BY feature
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let rows = sqlx::query(query)
        .bind(channel_id)
        .fetch_all(pool)
        .instrument(span)
        .await
        .context("failed to list flags")?;

    Ok(rows
        .into_iter()
        .filter_map(|row| {
            let feature: String = row.get("feature");
            let kind: String = row.get("kind");
            let raw: String = row.get("value");
            match FlagValue::parse(&kind, &raw) {
                Some(value) => Some(FlagRecord { feature, value }),
                None => {
                    warn!(feature, kind, "skipping flag with undecodable value");
                    None
                }
            }
        })
        .collect())
}

async fn user_in_team(pool: &PgPool, user_id: Uuid, team_id: Uuid) -> Result<bool> {
    let query = r"
        SELECT 1 AS present
        FROM team_members
        WHERE user_id = $1 AND team_id = $2
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(user_id)
        .bind(team_id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to check membership")?;
    Ok(row.is_some())
}

async fn token_grants_team(pool: &PgPool, token: &str, team_id: Uuid) -> Result<bool> {
    let query = r"
        SELECT 1 AS present
        FROM teams
        WHERE id = $1 AND access_token = $2
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(team_id)
        .bind(token)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to check access token")?;
    Ok(row.is_some())
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "message": "Unauthorized" })),
    )
        .into_response()
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "message": "Channel not found" })),
    )
        .into_response()
}

fn internal_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "message": "Something went wrong" })),
    )
        .into_response()
}

/// All channels of the caller's teams, flags included as typed arrays.
#[utoipa::path(
    get,
    path = "/api/channels",
    responses(
        (status = 200, description = "Channels with typed flag arrays"),
        (status = 303, description = "No session, redirect to /login")
    ),
    tag = "channels"
)]
pub async fn list(
    auth_state: Extension<Arc<AuthState>>,
    pool: Extension<PgPool>,
    headers: HeaderMap,
) -> Response {
    let (_session, user) =
        match guard::require_user(&auth_state, &pool, &headers, "/api/channels").await {
            Ok(resolved) => resolved,
            Err(redirect) => return redirect,
        };

    let channels = match channels_for_user(&pool, user.id).await {
        Ok(channels) => channels,
        Err(err) => {
            error!("Failed to list channels: {err}");
            return internal_error();
        }
    };

    let mut body = Vec::with_capacity(channels.len());
    for channel in channels {
        let flags = match flags_for_channel(&pool, channel.id).await {
            Ok(flags) => flags,
            Err(err) => {
                error!("Failed to list flags: {err}");
                return internal_error();
            }
        };
        body.push(json!({
            "id": channel.id,
            "teamId": channel.team_id,
            "name": channel.name,
            "slug": channel.slug,
            "flags": flags.iter().map(FlagView::from_record).collect::<Vec<_>>(),
        }));
    }

    Json(json!({ "channels": body })).into_response()
}

#[derive(Debug, Deserialize)]
pub struct ChannelQuery {
    #[serde(default)]
    raw: Option<String>,
}

impl ChannelQuery {
    fn raw_requested(&self) -> bool {
        matches!(self.raw.as_deref(), Some("true" | "1"))
    }
}

/// One channel's flags, for the app or for SDKs holding a team access token.
#[utoipa::path(
    get,
    path = "/api/channel/{channelId}",
    params(
        ("channelId" = String, Path, description = "Channel id"),
        ("raw" = Option<String>, Query, description = "Return the typed flag array instead of the collapsed object")
    ),
    responses(
        (status = 200, description = "Channel flags"),
        (status = 401, description = "No session and no valid access token"),
        (status = 404, description = "Unknown channel")
    ),
    tag = "channels"
)]
pub async fn show(
    auth_state: Extension<Arc<AuthState>>,
    pool: Extension<PgPool>,
    headers: HeaderMap,
    Path(channel_id): Path<Uuid>,
    Query(query): Query<ChannelQuery>,
) -> Response {
    let channel = match channel_by_id(&pool, channel_id).await {
        Ok(Some(channel)) => channel,
        Ok(None) => return not_found(),
        Err(err) => {
            error!("Failed to lookup channel: {err}");
            return internal_error();
        }
    };

    let authorized = match authorize_channel(&auth_state, &pool, &headers, &channel).await {
        Ok(authorized) => authorized,
        Err(err) => {
            error!("Failed to authorize channel read: {err}");
            return internal_error();
        }
    };
    if !authorized {
        return unauthorized();
    }

    let flags = match flags_for_channel(&pool, channel.id).await {
        Ok(flags) => flags,
        Err(err) => {
            error!("Failed to list flags: {err}");
            return internal_error();
        }
    };

    let flags_body = if query.raw_requested() {
        json!(flags.iter().map(FlagView::from_record).collect::<Vec<_>>())
    } else {
        flags_object(&flags)
    };

    Json(json!({
        "id": channel.id,
        "name": channel.name,
        "slug": channel.slug,
        "flags": flags_body,
    }))
    .into_response()
}

/// Bearer token first, session membership second.
async fn authorize_channel(
    auth_state: &AuthState,
    pool: &PgPool,
    headers: &HeaderMap,
    channel: &ChannelRecord,
) -> Result<bool> {
    if let Some(token) = bearer_token(headers) {
        if token_grants_team(pool, token, channel.team_id).await? {
            return Ok(true);
        }
    }

    let session = auth_state.sessions().load(headers);
    let Some(user_id) = session
        .get(super::auth::session::KEY_USER_ID)
        .and_then(|raw| Uuid::parse_str(raw).ok())
    else {
        return Ok(false);
    };
    user_in_team(pool, user_id, channel.team_id).await
}
