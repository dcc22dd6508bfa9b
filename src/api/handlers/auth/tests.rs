//! Flow-level session scenarios spanning more than one request, plus
//! container-backed coverage for the reset-token lifecycle.

use anyhow::{anyhow, Context, Result};
use axum::http::{header::COOKIE, HeaderMap, HeaderValue};
use secrecy::SecretString;
use sqlx::{postgres::PgPoolOptions, Connection, PgConnection, PgPool};
use uuid::Uuid;

use crate::test_support::{postgres::PostgresContainer, runtime};

use super::flash::{FlashKind, FlashPayload};
use super::password;
use super::session::{Session, SessionStore, KEY_PENDING_USER_ID, KEY_RETURN_TO, KEY_USER_ID};
use super::state::AuthConfig;
use super::storage::{self, NewUser, SignupOutcome};
use super::utils::hash_reset_token;

const TOGGLE_SCHEMA_SQL: &str =
    include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/sql/schema.sql"));

fn store() -> SessionStore {
    SessionStore::new(
        vec![SecretString::from("flow-secret".to_string())],
        false,
        1_209_600,
    )
    .expect("store should build")
}

fn next_request(cookie: &HeaderValue) -> HeaderMap {
    let pair = cookie
        .to_str()
        .expect("ascii")
        .split(';')
        .next()
        .expect("name=value")
        .to_string();
    let mut headers = HeaderMap::new();
    headers.insert(COOKIE, HeaderValue::from_str(&pair).expect("header"));
    headers
}

#[test]
fn guard_capture_then_login_consumes_return_to() {
    let store = store();

    // Anonymous request to a protected page: the guard remembers the target.
    let mut session = store.load(&HeaderMap::new());
    assert!(session.get(KEY_USER_ID).is_none());
    session.set(KEY_RETURN_TO, "/api/channels");
    let cookie = store.commit(&session).expect("commit");

    // Login request: userId set, returnTo consumed for the redirect.
    let mut session = store.load(&next_request(&cookie));
    session.set(KEY_USER_ID, "2a4c9d6e-0000-0000-0000-000000000000");
    let target = session.take(KEY_RETURN_TO).expect("remembered target");
    assert_eq!(target, "/api/channels");
    let cookie = store.commit(&session).expect("commit");

    // Follow-up request carries the user but no leftover returnTo.
    let session = store.load(&next_request(&cookie));
    assert!(session.get(KEY_USER_ID).is_some());
    assert_eq!(session.get(KEY_RETURN_TO), None);
}

#[test]
fn failed_login_flash_shows_once_on_next_page() {
    let store = store();

    let mut session = Session::default();
    session.flash(FlashKind::Error, FlashPayload::plain("Invalid credentials"));
    let cookie = store.commit(&session).expect("commit");

    // The login page render drains the flash and recommits.
    let mut session = store.load(&next_request(&cookie));
    let flashes = session.take_flashes();
    assert_eq!(flashes.len(), 1);
    assert_eq!(flashes[0].payload.message(), "Invalid credentials");
    let cookie = store.commit(&session).expect("commit");

    // A reload shows nothing.
    let mut session = store.load(&next_request(&cookie));
    assert!(session.take_flashes().is_empty());
}

#[test]
fn pending_user_promotion_replaces_the_key() {
    let store = store();

    // Sentinel login: only the pending marker is set.
    let mut session = Session::default();
    session.set(KEY_PENDING_USER_ID, "user-1");
    let cookie = store.commit(&session).expect("commit");

    // Password change promotes it.
    let mut session = store.load(&next_request(&cookie));
    let pending = session.get(KEY_PENDING_USER_ID).expect("pending").to_string();
    session.set(KEY_USER_ID, pending);
    session.unset(KEY_PENDING_USER_ID);
    let cookie = store.commit(&session).expect("commit");

    let session = store.load(&next_request(&cookie));
    assert_eq!(session.get(KEY_USER_ID), Some("user-1"));
    assert_eq!(session.get(KEY_PENDING_USER_ID), None);
}

#[test]
fn logout_cookie_is_ignored_by_the_next_load() {
    let store = store();

    let mut session = Session::default();
    session.set(KEY_USER_ID, "user-1");
    let _signed_in = store.commit(&session).expect("commit");

    // The browser replaces the cookie with the destroyed one.
    let destroyed = store.destroy().expect("destroy");
    let session = store.load(&next_request(&destroyed));
    assert!(session.is_empty());
}

struct TestDb {
    _postgres: PostgresContainer,
    pool: PgPool,
}

impl TestDb {
    async fn new() -> Result<Self> {
        if let Err(err) = runtime::ensure_container_runtime() {
            eprintln!("Skipping integration test: {err}");
            return Err(err);
        }

        let postgres = PostgresContainer::start().await?;
        postgres.wait_until_ready().await?;
        apply_schema(&postgres).await?;

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&postgres.dsn())
            .await
            .context("failed to connect test pool")?;

        Ok(Self {
            _postgres: postgres,
            pool,
        })
    }
}

async fn apply_schema(postgres: &PostgresContainer) -> Result<()> {
    let mut connection = PgConnection::connect(&postgres.dsn())
        .await
        .context("failed to connect for schema setup")?;

    for (index, statement) in split_sql_statements(TOGGLE_SCHEMA_SQL).iter().enumerate() {
        sqlx::query(statement)
            .execute(&mut connection)
            .await
            .with_context(|| format!("failed to execute schema statement {}", index + 1))?;
    }

    Ok(())
}

fn split_sql_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();

    for line in sql.lines() {
        current.push_str(line);
        current.push('\n');

        if line.trim_end().ends_with(';') {
            let statement = current.trim();
            if !statement.is_empty() {
                statements.push(statement.to_string());
            }
            current.clear();
        }
    }

    let leftover = current.trim();
    if !leftover.is_empty() {
        statements.push(leftover.to_string());
    }

    statements
}

fn db_auth_config() -> AuthConfig {
    AuthConfig::new("http://localhost:3000".to_string())
}

async fn create_user(pool: &PgPool, email: &str, username: &str) -> Result<Uuid> {
    let new_user = NewUser {
        email: email.to_string(),
        username: username.to_string(),
        name: "Test User".to_string(),
        password_hash: password::hash("original-battery-staple")?,
    };

    match storage::insert_user_with_team(pool, &new_user).await? {
        SignupOutcome::Created(user_id) => Ok(user_id),
        SignupOutcome::Conflict(_) => Err(anyhow!("unexpected signup conflict")),
    }
}

#[tokio::test]
async fn reset_token_consumed_once_then_replay_rejected() -> Result<()> {
    let Ok(db) = TestDb::new().await else {
        return Ok(());
    };

    let config = db_auth_config();
    let user_id = create_user(&db.pool, "erin@example.com", "erin").await?;

    // Unknown addresses are a silent no-op.
    let missing = storage::issue_reset_token(&db.pool, "nobody@example.com", &config).await?;
    assert!(missing.is_none());

    let token = storage::issue_reset_token(&db.pool, "erin@example.com", &config)
        .await?
        .context("token should be issued for a known address")?;
    let queued: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM email_outbox WHERE to_email = $1")
            .bind("erin@example.com")
            .fetch_one(&db.pool)
            .await?;
    assert_eq!(queued, 1);

    let token_hash = hash_reset_token(&token);
    let new_hash = password::hash("a-brand-new-password")?;
    let consumed = storage::consume_reset_token(&db.pool, &token_hash, &new_hash).await?;
    assert_eq!(consumed, Some(user_id));

    let user = storage::find_user_by_id(&db.pool, user_id)
        .await?
        .context("user should still exist")?;
    assert_eq!(user.password_hash, new_hash);

    // The link is dead after the first completion.
    let replay = storage::consume_reset_token(&db.pool, &token_hash, &new_hash).await?;
    assert_eq!(replay, None);

    Ok(())
}

#[tokio::test]
async fn reset_token_expired_rejected() -> Result<()> {
    let Ok(db) = TestDb::new().await else {
        return Ok(());
    };

    let config = db_auth_config();
    create_user(&db.pool, "frank@example.com", "frank").await?;
    let token = storage::issue_reset_token(&db.pool, "frank@example.com", &config)
        .await?
        .context("token should be issued")?;
    let token_hash = hash_reset_token(&token);

    sqlx::query(
        "UPDATE users SET reset_token_expires_at = NOW() - INTERVAL '1 minute' WHERE reset_token_hash = $1",
    )
    .bind(token_hash.as_slice())
    .execute(&db.pool)
    .await
    .context("failed to expire token")?;

    assert_eq!(
        storage::find_user_id_by_reset_token(&db.pool, &token_hash).await?,
        None
    );
    let new_hash = password::hash("a-brand-new-password")?;
    assert_eq!(
        storage::consume_reset_token(&db.pool, &token_hash, &new_hash).await?,
        None
    );

    Ok(())
}

#[tokio::test]
async fn reset_token_still_valid_near_expiry() -> Result<()> {
    let Ok(db) = TestDb::new().await else {
        return Ok(());
    };

    let config = db_auth_config();
    let user_id = create_user(&db.pool, "grace@example.com", "grace").await?;
    let token = storage::issue_reset_token(&db.pool, "grace@example.com", &config)
        .await?
        .context("token should be issued")?;
    let token_hash = hash_reset_token(&token);

    // One minute left of the hour-long window.
    sqlx::query(
        "UPDATE users SET reset_token_expires_at = NOW() + INTERVAL '1 minute' WHERE reset_token_hash = $1",
    )
    .bind(token_hash.as_slice())
    .execute(&db.pool)
    .await
    .context("failed to shrink token window")?;

    let new_hash = password::hash("a-brand-new-password")?;
    let consumed = storage::consume_reset_token(&db.pool, &token_hash, &new_hash).await?;
    assert_eq!(consumed, Some(user_id));

    Ok(())
}
