//! Read-once flash messages carried in the session cookie.

use serde::{Deserialize, Serialize};
use ulid::Ulid;
use utoipa::ToSchema;

/// Message types a page render knows how to display.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FlashKind {
    Error,
    ErrorDetails,
    Success,
    Info,
}

impl FlashKind {
    /// Key used in the serialized cookie payload.
    #[must_use]
    pub const fn key(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::ErrorDetails => "errorDetails",
            Self::Success => "success",
            Self::Info => "info",
        }
    }

    #[must_use]
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "error" => Some(Self::Error),
            "errorDetails" => Some(Self::ErrorDetails),
            "success" => Some(Self::Success),
            "info" => Some(Self::Info),
            _ => None,
        }
    }
}

/// Flash payloads stay typed inside the process; serde only kicks in at the
/// cookie boundary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum FlashPayload {
    Plain { text: String },
    Structured { name: String, message: String },
}

impl FlashPayload {
    #[must_use]
    pub fn plain(text: impl Into<String>) -> Self {
        Self::Plain { text: text.into() }
    }

    #[must_use]
    pub fn structured(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Structured {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Human-readable text for rendering.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::Plain { text } => text.clone(),
            Self::Structured { name, message } => format!("{name}: {message}"),
        }
    }
}

/// A materialized flash, produced by a consuming read of the session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlashMessage {
    pub kind: FlashKind,
    pub payload: FlashPayload,
    /// Fresh per read; client-side keying and animation only.
    pub id: Ulid,
}

impl FlashMessage {
    #[must_use]
    pub fn view(&self) -> FlashView {
        FlashView {
            r#type: self.kind.key().to_string(),
            message: self.payload.message(),
            id: self.id.to_string(),
        }
    }
}

/// Wire shape surfaced to page renders.
#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct FlashView {
    pub r#type: String,
    pub message: String,
    pub id: String,
}
