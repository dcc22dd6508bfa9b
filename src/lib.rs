//! # Toggle (Feature Flag Service)
//!
//! `toggle` is a multi-tenant feature flag service: users join teams, teams
//! own feature channels, and each channel holds typed flags that downstream
//! consumers read over a small JSON API.
//!
//! ## Sessions
//!
//! Browser state lives in a signed `__session` cookie: an opaque key/value
//! bag carrying the authenticated `userId`, a post-login `returnTo` target,
//! and read-once flash messages. The cookie is re-signed with a sliding
//! 14-day expiry on every response that touched the session. Signing secrets
//! are an ordered list so they can be rotated: new cookies are signed with
//! the first secret, inbound cookies verify against any of them.
//!
//! ## Authentication
//!
//! Passwords are hashed with Argon2id; stored hashes carrying outdated
//! parameters are upgraded opportunistically on the next successful login.
//! Password resets use single-use, hour-bounded tokens whose SHA-256 hash is
//! the only thing stored server-side. Reset mail goes through a transactional
//! outbox drained by a background worker.

pub mod api;
pub mod cli;

#[cfg(test)]
mod test_support;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
