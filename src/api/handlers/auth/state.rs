//! Auth configuration and shared state.

use std::sync::Arc;

use super::rate_limit::RateLimiter;
use super::session::SessionStore;

const DEFAULT_SESSION_TTL_SECONDS: i64 = 60 * 60 * 24 * 14;
const DEFAULT_RESET_TOKEN_TTL_SECONDS: i64 = 60 * 60;
const DEFAULT_MIN_PASSWORD_LENGTH: usize = 12;

#[derive(Clone, Debug)]
pub struct AuthConfig {
    base_url: String,
    session_ttl_seconds: i64,
    reset_token_ttl_seconds: i64,
    min_password_length: usize,
}

impl AuthConfig {
    #[must_use]
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            session_ttl_seconds: DEFAULT_SESSION_TTL_SECONDS,
            reset_token_ttl_seconds: DEFAULT_RESET_TOKEN_TTL_SECONDS,
            min_password_length: DEFAULT_MIN_PASSWORD_LENGTH,
        }
    }

    #[must_use]
    pub fn with_session_ttl_seconds(mut self, seconds: i64) -> Self {
        self.session_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_reset_token_ttl_seconds(mut self, seconds: i64) -> Self {
        self.reset_token_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_min_password_length(mut self, length: usize) -> Self {
        self.min_password_length = length;
        self
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[must_use]
    pub fn session_ttl_seconds(&self) -> i64 {
        self.session_ttl_seconds
    }

    #[must_use]
    pub fn reset_token_ttl_seconds(&self) -> i64 {
        self.reset_token_ttl_seconds
    }

    #[must_use]
    pub fn min_password_length(&self) -> usize {
        self.min_password_length
    }

    /// Only mark cookies secure when the app is served over HTTPS.
    #[must_use]
    pub fn session_cookie_secure(&self) -> bool {
        self.base_url.starts_with("https://")
    }
}

pub struct AuthState {
    config: AuthConfig,
    sessions: SessionStore,
    rate_limiter: Arc<dyn RateLimiter>,
}

impl AuthState {
    pub fn new(
        config: AuthConfig,
        sessions: SessionStore,
        rate_limiter: Arc<dyn RateLimiter>,
    ) -> Self {
        Self {
            config,
            sessions,
            rate_limiter,
        }
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub(super) fn rate_limiter(&self) -> &dyn RateLimiter {
        self.rate_limiter.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::super::rate_limit::NoopRateLimiter;
    use super::super::session::SessionStore;
    use super::*;
    use secrecy::SecretString;

    #[test]
    fn auth_config_defaults_and_overrides() {
        let config = AuthConfig::new("https://toggle.dev".to_string());

        assert_eq!(config.base_url(), "https://toggle.dev");
        assert_eq!(config.session_ttl_seconds(), DEFAULT_SESSION_TTL_SECONDS);
        assert_eq!(
            config.reset_token_ttl_seconds(),
            DEFAULT_RESET_TOKEN_TTL_SECONDS
        );
        assert_eq!(config.min_password_length(), DEFAULT_MIN_PASSWORD_LENGTH);
        assert!(config.session_cookie_secure());

        let config = config
            .with_session_ttl_seconds(60)
            .with_reset_token_ttl_seconds(120)
            .with_min_password_length(16);

        assert_eq!(config.session_ttl_seconds(), 60);
        assert_eq!(config.reset_token_ttl_seconds(), 120);
        assert_eq!(config.min_password_length(), 16);
    }

    #[test]
    fn plain_http_is_not_secure() {
        let config = AuthConfig::new("http://localhost:3000".to_string());
        assert!(!config.session_cookie_secure());
    }

    #[test]
    fn auth_state_constructs_with_noop_rate_limiter() {
        let config = AuthConfig::new("http://localhost:3000".to_string());
        let sessions = SessionStore::new(
            vec![SecretString::from("s3kret".to_string())],
            config.session_cookie_secure(),
            config.session_ttl_seconds(),
        )
        .expect("store");
        let state = AuthState::new(config, sessions, Arc::new(NoopRateLimiter));
        assert_eq!(state.config().base_url(), "http://localhost:3000");
    }
}
