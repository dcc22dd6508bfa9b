use crate::api::{
    self,
    email::OutboxWorkerConfig,
    handlers::auth::{AuthConfig, SessionStore},
};
use anyhow::{Context, Result};
use secrecy::SecretString;

/// Fully resolved server arguments produced by the dispatch layer.
#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: String,
    pub session_secrets: Vec<SecretString>,
    pub base_url: String,
    pub session_ttl_seconds: i64,
    pub reset_token_ttl_seconds: i64,
    pub min_password_length: usize,
    pub outbox_poll_seconds: u64,
    pub outbox_batch_size: usize,
    pub outbox_max_attempts: u32,
}

/// Execute the server action.
///
/// # Errors
///
/// Returns an error if the session store cannot be built from the configured
/// secrets or the server fails to start.
pub async fn handle(args: Args) -> Result<()> {
    let auth_config = AuthConfig::new(args.base_url)
        .with_session_ttl_seconds(args.session_ttl_seconds)
        .with_reset_token_ttl_seconds(args.reset_token_ttl_seconds)
        .with_min_password_length(args.min_password_length);

    // Secret misconfiguration is fatal at startup, never a per-request error.
    let sessions = SessionStore::new(
        args.session_secrets,
        auth_config.session_cookie_secure(),
        auth_config.session_ttl_seconds(),
    )
    .context("Invalid session secret configuration")?;

    let outbox_config = OutboxWorkerConfig::new()
        .with_poll_interval_seconds(args.outbox_poll_seconds)
        .with_batch_size(args.outbox_batch_size)
        .with_max_attempts(args.outbox_max_attempts);

    api::new(args.port, args.dsn, auth_config, sessions, outbox_config).await?;

    Ok(())
}
