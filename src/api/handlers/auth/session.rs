//! Signed cookie sessions with read-once flash semantics.
//!
//! The whole session lives client-side in the `__session` cookie: a base64
//! JSON payload plus an HMAC-SHA256 signature, `payload.signature`. Secrets
//! are an ordered list so they can be rotated: sign with the first, verify
//! against any. A missing, malformed, or tampered cookie degrades to an
//! anonymous session; it is never a request error.

use axum::{
    extract::Extension,
    http::{
        header::{InvalidHeaderValue, COOKIE, LOCATION, SET_COOKIE},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;
use ulid::Ulid;

use super::flash::{FlashKind, FlashMessage, FlashPayload};
use super::state::AuthState;

pub const SESSION_COOKIE_NAME: &str = "__session";

/// Durable session keys.
pub const KEY_USER_ID: &str = "userId";
pub const KEY_RETURN_TO: &str = "returnTo";
pub const KEY_PENDING_USER_ID: &str = "pendingUserId";

/// Per-browser key/value bag decoded from (and committed back into) the
/// session cookie.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    #[serde(default)]
    values: BTreeMap<String, String>,
    #[serde(default)]
    flash: BTreeMap<String, FlashPayload>,
}

impl Session {
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn unset(&mut self, key: &str) {
        self.values.remove(key);
    }

    /// Read and remove in one step (`returnTo` consumption).
    pub fn take(&mut self, key: &str) -> Option<String> {
        self.values.remove(key)
    }

    /// Queue a flash under its message type; one entry per type.
    pub fn flash(&mut self, kind: FlashKind, payload: FlashPayload) {
        self.flash.insert(kind.key().to_string(), payload);
    }

    /// Storage failures surface the same way everywhere: a generic error the
    /// page always renders plus a named detail entry.
    pub fn flash_storage_failure(&mut self, name: &str, detail: &str) {
        self.flash(
            FlashKind::Error,
            FlashPayload::plain("Something went wrong, try again"),
        );
        self.flash(FlashKind::ErrorDetails, FlashPayload::structured(name, detail));
    }

    /// Consuming read: materialize every queued flash with a fresh id and
    /// drop them from the session, so a second read yields nothing.
    pub fn take_flashes(&mut self) -> Vec<FlashMessage> {
        std::mem::take(&mut self.flash)
            .into_iter()
            .filter_map(|(key, payload)| {
                FlashKind::from_key(&key).map(|kind| FlashMessage {
                    kind,
                    payload,
                    id: Ulid::new(),
                })
            })
            .collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.flash.is_empty()
    }
}

/// Encodes, signs, and decodes session cookies.
pub struct SessionStore {
    secrets: Vec<SecretString>,
    secure: bool,
    max_age_seconds: i64,
}

impl SessionStore {
    /// # Errors
    ///
    /// Returns an error when no signing secret is configured; this is a
    /// startup failure, not a per-request condition.
    pub fn new(
        secrets: Vec<SecretString>,
        secure: bool,
        max_age_seconds: i64,
    ) -> anyhow::Result<Self> {
        if secrets.iter().all(|s| s.expose_secret().is_empty()) {
            return Err(anyhow::anyhow!("session store requires at least one secret"));
        }
        Ok(Self {
            secrets,
            secure,
            max_age_seconds,
        })
    }

    /// Decode the request's session cookie into a `Session`.
    ///
    /// Any decode or signature failure degrades to an anonymous session.
    #[must_use]
    pub fn load(&self, headers: &HeaderMap) -> Session {
        let Some(raw) = extract_cookie(headers, SESSION_COOKIE_NAME) else {
            return Session::default();
        };
        self.decode(&raw).unwrap_or_else(|| {
            debug!("discarding undecodable session cookie");
            Session::default()
        })
    }

    fn decode(&self, raw: &str) -> Option<Session> {
        let (payload_b64, signature_b64) = raw.split_once('.')?;
        let payload = URL_SAFE_NO_PAD.decode(payload_b64).ok()?;
        let signature = URL_SAFE_NO_PAD.decode(signature_b64).ok()?;

        // Verify against every configured secret so old cookies stay valid
        // across a rotation. verify_slice is constant-time.
        let verified = self.secrets.iter().any(|secret| {
            sign(secret, &payload)
                .map(|mac| mac.verify_slice(&signature).is_ok())
                .unwrap_or(false)
        });
        if !verified {
            return None;
        }

        serde_json::from_slice(&payload).ok()
    }

    /// Re-sign the session and emit the `Set-Cookie` value with a refreshed
    /// sliding expiry. Must run after all mutations for the request.
    ///
    /// # Errors
    ///
    /// Returns an error if the session fails to serialize or the cookie value
    /// is not a valid header.
    pub fn commit(&self, session: &Session) -> anyhow::Result<HeaderValue> {
        let payload = serde_json::to_vec(session)?;
        let secret = self
            .secrets
            .first()
            .ok_or_else(|| anyhow::anyhow!("session store has no signing secret"))?;
        let signature = sign(secret, &payload)?.finalize().into_bytes();

        let value = format!(
            "{SESSION_COOKIE_NAME}={}.{}; Path=/; HttpOnly; SameSite=Strict; Max-Age={}{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(signature),
            self.max_age_seconds,
            if self.secure { "; Secure" } else { "" },
        );
        HeaderValue::from_str(&value).map_err(Into::into)
    }

    /// Emit a cookie that invalidates the session immediately (logout).
    ///
    /// # Errors
    ///
    /// Returns an error if the cookie value is not a valid header.
    pub fn destroy(&self) -> Result<HeaderValue, InvalidHeaderValue> {
        let value = format!(
            "{SESSION_COOKIE_NAME}=; Path=/; HttpOnly; SameSite=Strict; Max-Age=0{}",
            if self.secure { "; Secure" } else { "" },
        );
        HeaderValue::from_str(&value)
    }
}

type HmacSha256 = Hmac<Sha256>;

fn sign(secret: &SecretString, payload: &[u8]) -> anyhow::Result<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret.expose_secret().as_bytes())
        .map_err(|err| anyhow::anyhow!("invalid hmac key: {err}"))?;
    mac.update(payload);
    Ok(mac)
}

fn extract_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let header = headers.get(COOKIE)?;
    let value = header.to_str().ok()?;
    for pair in value.split(';') {
        let trimmed = pair.trim();
        let mut parts = trimmed.splitn(2, '=');
        let key = parts.next()?.trim();
        let val = parts.next()?.trim();
        if key == name {
            return Some(val.to_string());
        }
    }
    None
}

/// Redirect carrying the committed session cookie. Every auth flow ends here,
/// so the Set-Cookie always reflects the final session state.
pub(crate) fn redirect_with_session(
    store: &SessionStore,
    session: &Session,
    location: &str,
) -> Response {
    let mut headers = HeaderMap::new();
    match HeaderValue::from_str(location) {
        Ok(value) => {
            headers.insert(LOCATION, value);
        }
        Err(_) => {
            headers.insert(LOCATION, HeaderValue::from_static("/"));
        }
    }
    match store.commit(session) {
        Ok(cookie) => {
            headers.insert(SET_COOKIE, cookie);
        }
        Err(err) => {
            // The redirect still goes out; the browser just keeps its old
            // cookie state.
            tracing::error!("Failed to commit session: {err}");
        }
    }
    (StatusCode::SEE_OTHER, headers).into_response()
}

/// Log out by clearing the cookie and sending the browser back to the login
/// page. Idempotent: no precondition on the current auth state.
#[utoipa::path(
    get,
    path = "/logout",
    responses(
        (status = 303, description = "Session destroyed, redirect to /login")
    ),
    tag = "auth"
)]
pub async fn logout(auth_state: Extension<Arc<AuthState>>) -> impl IntoResponse {
    let mut headers = HeaderMap::new();
    headers.insert(LOCATION, HeaderValue::from_static("/login"));
    if let Ok(cookie) = auth_state.sessions().destroy() {
        headers.insert(SET_COOKIE, cookie);
    }
    (StatusCode::SEE_OTHER, headers).into_response()
}
