//! Authentication and session lifecycle: password hashing, signed-cookie
//! sessions with flash messaging, and the login/join/reset/logout flows.

pub mod flash;
pub mod guard;
pub mod join;
pub mod login;
pub mod password;
pub mod profile;
pub mod rate_limit;
pub mod reset;
pub mod session;
pub mod state;
pub mod storage;
pub mod types;
mod utils;

#[cfg(test)]
mod tests;

pub use rate_limit::{FixedWindowRateLimiter, NoopRateLimiter, RateLimiter};
pub use session::{Session, SessionStore};
pub use state::{AuthConfig, AuthState};
pub use storage::UserRecord;
