//! Shared helpers for tests that need real infrastructure.

pub mod postgres;
pub mod runtime;
