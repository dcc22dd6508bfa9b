//! Transactional email outbox.
//!
//! The reset flow enqueues a `reset_password` row in `email_outbox` inside
//! the same transaction that stores the token hash, so a mail is never
//! promised without a token (or vice versa). A background task polls the
//! table, claims a batch with `FOR UPDATE SKIP LOCKED`, and hands each row
//! to an [`EmailSender`]. Failures are retried with exponential backoff and
//! jitter until `max_attempts`, then parked as `failed`.
//!
//! The default sender is [`LogEmailSender`], which logs the payload instead
//! of delivering; real SMTP or API delivery plugs in behind the trait.

use anyhow::{Context, Result};
use rand::Rng;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

/// Template name for password reset mail; its payload carries
/// `{email, reset_url}`.
pub const TEMPLATE_RESET_PASSWORD: &str = "reset_password";

#[derive(Clone, Debug)]
pub struct EmailMessage {
    pub to: String,
    pub template: String,
    pub payload: String,
}

/// Delivery abstraction used by the outbox worker.
pub trait EmailSender: Send + Sync {
    /// Deliver a message or return an error to schedule a retry.
    fn send(&self, message: &EmailMessage) -> Result<()>;
}

/// Local dev sender: logs the payload and reports success.
#[derive(Clone, Debug)]
pub struct LogEmailSender;

impl EmailSender for LogEmailSender {
    fn send(&self, message: &EmailMessage) -> Result<()> {
        info!(
            to = %message.to,
            template = %message.template,
            payload = %message.payload,
            "email outbox send stub"
        );
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct OutboxWorkerConfig {
    poll_interval: Duration,
    batch_size: usize,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl OutboxWorkerConfig {
    /// Defaults: 5s poll, 10 rows per batch, 5 attempts, 5s->5m backoff.
    #[must_use]
    pub fn new() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 10,
            max_attempts: 5,
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
        }
    }

    #[must_use]
    pub fn with_poll_interval_seconds(mut self, seconds: u64) -> Self {
        self.poll_interval = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_backoff_base_seconds(mut self, seconds: u64) -> Self {
        self.backoff_base = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn with_backoff_max_seconds(mut self, seconds: u64) -> Self {
        self.backoff_max = Duration::from_secs(seconds);
        self
    }

    /// Clamp zero or inverted settings into something the loop can run with.
    #[must_use]
    pub fn normalize(self) -> Self {
        let poll_interval = if self.poll_interval.is_zero() {
            Duration::from_secs(1)
        } else {
            self.poll_interval
        };
        let backoff_base = if self.backoff_base.is_zero() {
            Duration::from_secs(1)
        } else {
            self.backoff_base
        };
        Self {
            poll_interval,
            batch_size: self.batch_size.max(1),
            max_attempts: self.max_attempts.max(1),
            backoff_base,
            backoff_max: self.backoff_max.max(backoff_base),
        }
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub fn backoff_base(&self) -> Duration {
        self.backoff_base
    }

    #[must_use]
    pub fn backoff_max(&self) -> Duration {
        self.backoff_max
    }
}

impl Default for OutboxWorkerConfig {
    fn default() -> Self {
        Self::new()
    }
}

struct OutboxRow {
    id: Uuid,
    attempts: u32,
    message: EmailMessage,
}

/// Spawn the background task that drains the outbox.
pub fn spawn_outbox_worker(
    pool: PgPool,
    sender: Arc<dyn EmailSender>,
    config: OutboxWorkerConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let config = config.normalize();
        loop {
            if let Err(err) = process_outbox_batch(&pool, sender.as_ref(), &config).await {
                error!("email outbox batch failed: {err}");
            }
            sleep(config.poll_interval()).await;
        }
    })
}

async fn process_outbox_batch(
    pool: &PgPool,
    sender: &dyn EmailSender,
    config: &OutboxWorkerConfig,
) -> Result<usize> {
    let mut tx = pool.begin().await.context("begin outbox transaction")?;

    let rows = claim_batch(&mut tx, config.batch_size()).await?;
    if rows.is_empty() {
        tx.commit().await.context("commit empty outbox batch")?;
        return Ok(0);
    }

    let count = rows.len();
    for row in rows {
        match sender.send(&row.message) {
            Ok(()) => mark_sent(&mut tx, &row).await?,
            Err(err) => schedule_retry(&mut tx, &row, &err.to_string(), config).await?,
        }
    }

    tx.commit().await.context("commit outbox batch")?;
    Ok(count)
}

/// Lock a batch of due rows; concurrent workers skip each other's claims.
async fn claim_batch(
    tx: &mut Transaction<'_, Postgres>,
    batch_size: usize,
) -> Result<Vec<OutboxRow>> {
    let query = r"
        SELECT id, to_email, template, payload_json::text AS payload, attempts
        FROM email_outbox
        WHERE status = 'pending'
          AND next_attempt_at <= NOW()
        ORDER BY next_attempt_at ASC, created_at ASC
        LIMIT $1
        FOR UPDATE SKIP LOCKED
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let rows = sqlx::query(query)
        .bind(i64::try_from(batch_size).unwrap_or(1))
        .fetch_all(&mut **tx)
        .instrument(span)
        .await
        .context("failed to claim outbox batch")?;

    Ok(rows
        .into_iter()
        .map(|row| {
            let attempts: i32 = row.get("attempts");
            OutboxRow {
                id: row.get("id"),
                attempts: u32::try_from(attempts).unwrap_or(0),
                message: EmailMessage {
                    to: row.get("to_email"),
                    template: row.get("template"),
                    payload: row.get("payload"),
                },
            }
        })
        .collect())
}

async fn mark_sent(tx: &mut Transaction<'_, Postgres>, row: &OutboxRow) -> Result<()> {
    let query = r"
        UPDATE email_outbox
        SET status = 'sent',
            attempts = $2,
            last_error = NULL,
            sent_at = NOW(),
            next_attempt_at = NOW()
        WHERE id = $1
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(row.id)
        .bind(attempts_column(row.attempts))
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to mark outbox row sent")?;
    Ok(())
}

async fn schedule_retry(
    tx: &mut Transaction<'_, Postgres>,
    row: &OutboxRow,
    last_error: &str,
    config: &OutboxWorkerConfig,
) -> Result<()> {
    let attempt = row.attempts.saturating_add(1);

    if attempt >= config.max_attempts() {
        let query = r"
            UPDATE email_outbox
            SET status = 'failed',
                attempts = $2,
                last_error = $3,
                next_attempt_at = NOW()
            WHERE id = $1
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(row.id)
            .bind(attempts_column(row.attempts))
            .bind(last_error)
            .execute(&mut **tx)
            .instrument(span)
            .await
            .context("failed to park outbox row as failed")?;
        return Ok(());
    }

    let delay = backoff_delay(attempt, config.backoff_base(), config.backoff_max());
    let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
    let query = r"
        UPDATE email_outbox
        SET status = 'pending',
            attempts = $2,
            last_error = $3,
            next_attempt_at = NOW() + ($4 * INTERVAL '1 millisecond')
        WHERE id = $1
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(row.id)
        .bind(attempts_column(row.attempts))
        .bind(last_error)
        .bind(delay_ms)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to reschedule outbox row")?;
    Ok(())
}

fn attempts_column(attempts: u32) -> i32 {
    i32::try_from(attempts.saturating_add(1)).unwrap_or(i32::MAX)
}

fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(31);
    let delay = base.checked_mul(1u32 << shift).unwrap_or(max);
    jitter_delay(delay.min(max))
}

/// Spread concurrent retries over [half, full] of the nominal delay.
fn jitter_delay(delay: Duration) -> Duration {
    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    if delay_ms < 2 {
        return delay;
    }
    let half = delay_ms / 2;
    let jitter = rand::thread_rng().gen_range(0..=half);
    Duration::from_millis(half + jitter)
}

#[cfg(test)]
mod tests {
    use super::{
        backoff_delay, EmailMessage, EmailSender, LogEmailSender, OutboxWorkerConfig,
        TEMPLATE_RESET_PASSWORD,
    };
    use std::time::Duration;

    #[test]
    fn defaults_are_sane() {
        let config = OutboxWorkerConfig::new();
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.batch_size(), 10);
        assert_eq!(config.max_attempts(), 5);
    }

    #[test]
    fn builders_override_defaults() {
        let config = OutboxWorkerConfig::new()
            .with_poll_interval_seconds(1)
            .with_batch_size(50)
            .with_max_attempts(2)
            .with_backoff_base_seconds(2)
            .with_backoff_max_seconds(60);
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.batch_size(), 50);
        assert_eq!(config.max_attempts(), 2);
        assert_eq!(config.backoff_base(), Duration::from_secs(2));
        assert_eq!(config.backoff_max(), Duration::from_secs(60));
    }

    #[test]
    fn normalize_clamps_degenerate_settings() {
        let config = OutboxWorkerConfig::new()
            .with_poll_interval_seconds(0)
            .with_batch_size(0)
            .with_max_attempts(0)
            .with_backoff_base_seconds(0)
            .with_backoff_max_seconds(0)
            .normalize();
        assert!(!config.poll_interval().is_zero());
        assert!(config.batch_size() >= 1);
        assert!(config.max_attempts() >= 1);
        assert!(config.backoff_max() >= config.backoff_base());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let base = Duration::from_secs(5);
        let max = Duration::from_secs(300);

        // Jitter keeps each delay within [half, full] of the nominal value.
        let first = backoff_delay(1, base, max);
        assert!(first >= base / 2 && first <= base);

        let third_nominal = base * 4;
        let third = backoff_delay(3, base, max);
        assert!(third >= third_nominal / 2 && third <= third_nominal);

        let huge = backoff_delay(31, base, max);
        assert!(huge <= max);
    }

    #[test]
    fn log_sender_always_succeeds() {
        let message = EmailMessage {
            to: "user@example.com".to_string(),
            template: TEMPLATE_RESET_PASSWORD.to_string(),
            payload: r#"{"email":"user@example.com","reset_url":"http://localhost:3000/reset/abc"}"#.to_string(),
        };
        assert!(LogEmailSender.send(&message).is_ok());
    }
}
