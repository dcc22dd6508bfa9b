//! Command-line argument dispatch and server initialization.
//!
//! This module maps validated CLI arguments to the appropriate action, such
//! as starting the API server with its full configuration state.

use crate::cli::{
    actions::{server::Args, Action},
    commands,
};
use anyhow::{anyhow, Context, Result};
use secrecy::SecretString;

/// Map validated CLI matches to a server action.
///
/// # Errors
///
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches
        .get_one::<u16>(commands::ARG_PORT)
        .copied()
        .unwrap_or(8080);
    let dsn = matches
        .get_one::<String>(commands::ARG_DSN)
        .cloned()
        .context("missing required argument: --dsn")?;

    let session_secrets = matches
        .get_one::<String>(commands::ARG_SESSION_SECRETS)
        .map(|raw| parse_secrets(raw))
        .context("missing required argument: --session-secrets")?;
    if session_secrets.is_empty() {
        return Err(anyhow!("--session-secrets must contain at least one non-empty secret"));
    }

    let base_url = matches
        .get_one::<String>(commands::ARG_BASE_URL)
        .cloned()
        .unwrap_or_else(|| "http://localhost:3000".to_string());

    Ok(Action::Server(Args {
        port,
        dsn,
        session_secrets,
        base_url,
        session_ttl_seconds: matches
            .get_one::<i64>(commands::ARG_SESSION_TTL)
            .copied()
            .unwrap_or(60 * 60 * 24 * 14),
        reset_token_ttl_seconds: matches
            .get_one::<i64>(commands::ARG_RESET_TOKEN_TTL)
            .copied()
            .unwrap_or(60 * 60),
        min_password_length: matches
            .get_one::<usize>(commands::ARG_MIN_PASSWORD_LENGTH)
            .copied()
            .unwrap_or(12),
        outbox_poll_seconds: matches
            .get_one::<u64>(commands::ARG_OUTBOX_POLL)
            .copied()
            .unwrap_or(5),
        outbox_batch_size: matches
            .get_one::<usize>(commands::ARG_OUTBOX_BATCH)
            .copied()
            .unwrap_or(10),
        outbox_max_attempts: matches
            .get_one::<u32>(commands::ARG_OUTBOX_ATTEMPTS)
            .copied()
            .unwrap_or(5),
    }))
}

/// Split the comma-separated secret list, newest first.
fn parse_secrets(raw: &str) -> Vec<SecretString> {
    raw.split(',')
        .map(str::trim)
        .filter(|secret| !secret.is_empty())
        .map(|secret| SecretString::from(secret.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::actions::Action;

    #[test]
    fn session_secrets_required() {
        temp_env::with_vars(
            [
                ("TOGGLE_SESSION_SECRETS", None::<&str>),
                ("TOGGLE_DSN", Some("postgres://user@localhost:5432/toggle")),
            ],
            || {
                let command = crate::cli::commands::new();
                let result = command.try_get_matches_from(vec!["toggle"]);
                assert!(result.is_err());
            },
        );
    }

    #[test]
    fn blank_session_secrets_rejected() {
        temp_env::with_vars(
            [
                ("TOGGLE_SESSION_SECRETS", Some(" , ,")),
                ("TOGGLE_DSN", Some("postgres://user@localhost:5432/toggle")),
            ],
            || {
                let command = crate::cli::commands::new();
                let matches = command.get_matches_from(vec!["toggle"]);
                let result = handler(&matches);
                assert!(result.is_err());
                if let Err(err) = result {
                    assert!(err.to_string().contains("at least one non-empty secret"));
                }
            },
        );
    }

    #[test]
    fn secrets_parse_in_order() {
        let secrets = parse_secrets("new-secret, old-secret,");
        assert_eq!(secrets.len(), 2);
    }

    #[test]
    fn server_action_defaults() {
        temp_env::with_vars(
            [
                ("TOGGLE_SESSION_SECRETS", Some("s3kret")),
                ("TOGGLE_DSN", Some("postgres://user@localhost:5432/toggle")),
                ("TOGGLE_PORT", None::<&str>),
            ],
            || {
                let command = crate::cli::commands::new();
                let matches = command.get_matches_from(vec!["toggle"]);
                let action = handler(&matches).expect("handler should succeed");
                let Action::Server(args) = action;
                assert_eq!(args.port, 8080);
                assert_eq!(args.session_ttl_seconds, 1_209_600);
                assert_eq!(args.reset_token_ttl_seconds, 3600);
                assert_eq!(args.min_password_length, 12);
                assert_eq!(args.outbox_poll_seconds, 5);
                assert_eq!(args.outbox_batch_size, 10);
                assert_eq!(args.outbox_max_attempts, 5);
            },
        );
    }
}
