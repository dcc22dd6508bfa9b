//! Database helpers for users, teams, and reset tokens.

use anyhow::{Context, Result};
use serde_json::json;
use sqlx::{PgPool, Row};
use tracing::Instrument;
use uuid::Uuid;

use super::state::AuthConfig;
use super::utils::{
    build_reset_url, generate_reset_token, hash_reset_token, is_unique_violation,
    violated_constraint,
};

/// Canonical user projection; every consumer works from this shape instead of
/// re-deriving columns per call site.
#[derive(Clone, Debug)]
pub struct UserRecord {
    pub id: Uuid,
    pub email: String,
    pub username: String,
    pub name: String,
    pub password_hash: String,
}

/// Field a join conflict maps back to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum ConflictField {
    Email,
    Username,
}

impl ConflictField {
    pub(super) const fn message(self) -> &'static str {
        match self {
            Self::Email => "A user with this email already exists",
            Self::Username => "A user with this username already exists",
        }
    }
}

/// Outcome when attempting to create a new user plus their owning team.
#[derive(Debug)]
pub(super) enum SignupOutcome {
    Created(Uuid),
    Conflict(ConflictField),
}

#[derive(Debug)]
pub(super) struct NewUser {
    pub(super) email: String,
    pub(super) username: String,
    pub(super) name: String,
    pub(super) password_hash: String,
}

const USER_COLUMNS: &str = "id, email, username, name, password_hash";

fn user_from_row(row: &sqlx::postgres::PgRow) -> UserRecord {
    UserRecord {
        id: row.get("id"),
        email: row.get("email"),
        username: row.get("username"),
        name: row.get("name"),
        password_hash: row.get("password_hash"),
    }
}

pub(crate) async fn find_user_by_email(pool: &PgPool, email: &str) -> Result<Option<UserRecord>> {
    let query = format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1");
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query.as_str()
    );
    let row = sqlx::query(&query)
        .bind(email)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup user by email")?;
    Ok(row.as_ref().map(user_from_row))
}

pub(crate) async fn find_user_by_id(pool: &PgPool, user_id: Uuid) -> Result<Option<UserRecord>> {
    let query = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query.as_str()
    );
    let row = sqlx::query(&query)
        .bind(user_id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup user by id")?;
    Ok(row.as_ref().map(user_from_row))
}

/// Create the user, their owning team, the membership row, and a starter
/// feature channel in one transaction.
pub(super) async fn insert_user_with_team(
    pool: &PgPool,
    new_user: &NewUser,
) -> Result<SignupOutcome> {
    let mut tx = pool.begin().await.context("begin join transaction")?;

    let query = r"
        INSERT INTO users (email, username, name, password_hash)
        VALUES ($1, $2, $3, $4)
        RETURNING id
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(&new_user.email)
        .bind(&new_user.username)
        .bind(&new_user.name)
        .bind(&new_user.password_hash)
        .fetch_one(&mut *tx)
        .instrument(span)
        .await;

    let user_id: Uuid = match row {
        Ok(row) => row.get("id"),
        Err(err) => {
            if is_unique_violation(&err) {
                let field = violated_constraint(&err)
                    .filter(|constraint| constraint.contains("email"))
                    .map_or(ConflictField::Username, |_| ConflictField::Email);
                let _ = tx.rollback().await;
                return Ok(SignupOutcome::Conflict(field));
            }
            return Err(err).context("failed to insert user");
        }
    };

    let query = r"
        INSERT INTO teams (name)
        VALUES ($1)
        RETURNING id
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(format!("{}'s team", new_user.username))
        .fetch_one(&mut *tx)
        .instrument(span)
        .await
        .context("failed to insert team")?;
    let team_id: Uuid = row.get("id");

    let query = r"
        INSERT INTO team_members (team_id, user_id)
        VALUES ($1, $2)
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(team_id)
        .bind(user_id)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to insert team membership")?;

    let query = r"
        INSERT INTO feature_channels (team_id, name, slug)
        VALUES ($1, $2, $3)
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(team_id)
        .bind("My first feature channel!")
        .bind("my-first-feature-channel")
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to insert starter channel")?;

    tx.commit().await.context("commit join transaction")?;

    Ok(SignupOutcome::Created(user_id))
}

pub(super) async fn update_password(
    pool: &PgPool,
    user_id: Uuid,
    password_hash: &str,
) -> Result<()> {
    let query = r"
        UPDATE users
        SET password_hash = $2,
            updated_at = NOW()
        WHERE id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(password_hash)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to update password")?;
    Ok(())
}

/// Issue a reset token for the given email, enqueuing the mail in the same
/// transaction. Silently no-ops on unknown addresses so responses stay
/// identical either way. Returns the raw token when one was issued; it is
/// never persisted, only its hash is.
pub(super) async fn issue_reset_token(
    pool: &PgPool,
    email: &str,
    config: &AuthConfig,
) -> Result<Option<String>> {
    let mut tx = pool.begin().await.context("begin reset transaction")?;

    let token = generate_reset_token()?;
    let token_hash = hash_reset_token(&token);

    let query = r"
        UPDATE users
        SET reset_token_hash = $2,
            reset_token_expires_at = NOW() + ($3 * INTERVAL '1 second'),
            updated_at = NOW()
        WHERE email = $1
        RETURNING id
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(email)
        .bind(token_hash)
        .bind(config.reset_token_ttl_seconds())
        .fetch_optional(&mut *tx)
        .instrument(span)
        .await
        .context("failed to set reset token")?;

    if row.is_none() {
        tx.commit().await.context("commit reset noop")?;
        return Ok(None);
    }

    let reset_url = build_reset_url(config.base_url(), &token);
    let payload_text = serde_json::to_string(&json!({
        "email": email,
        "reset_url": reset_url,
    }))
    .context("failed to serialize reset email payload")?;

    let query = r"
        INSERT INTO email_outbox (to_email, template, payload_json)
        VALUES ($1, $2, $3::jsonb)
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(email)
        .bind(crate::api::email::TEMPLATE_RESET_PASSWORD)
        .bind(payload_text)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to insert email outbox row")?;

    tx.commit().await.context("commit reset transaction")?;
    Ok(Some(token))
}

/// Look up the user holding an unexpired reset token.
pub(super) async fn find_user_id_by_reset_token(
    pool: &PgPool,
    token_hash: &[u8],
) -> Result<Option<Uuid>> {
    let query = r"
        SELECT id
        FROM users
        WHERE reset_token_hash = $1
          AND reset_token_expires_at > NOW()
        LIMIT 1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(token_hash)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup reset token")?;
    Ok(row.map(|row| row.get("id")))
}

/// Atomic compare-and-clear: install the new password and null the token
/// columns in one statement, so two concurrent completions cannot both win.
/// Returns the user id when this call consumed the token.
pub(super) async fn consume_reset_token(
    pool: &PgPool,
    token_hash: &[u8],
    new_password_hash: &str,
) -> Result<Option<Uuid>> {
    let query = r"
        UPDATE users
        SET password_hash = $2,
            reset_token_hash = NULL,
            reset_token_expires_at = NULL,
            updated_at = NOW()
        WHERE reset_token_hash = $1
          AND reset_token_expires_at > NOW()
        RETURNING id
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(token_hash)
        .bind(new_password_hash)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to consume reset token")?;
    Ok(row.map(|row| row.get("id")))
}
