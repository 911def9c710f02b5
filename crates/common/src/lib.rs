//! Common utilities and types shared across the app-worker crates.

#![warn(clippy::pedantic)]

/// Module for identifier types (socket ids, token ids, auth ids)
pub mod types;

/// Module for secret types that prevent accidental logging
pub mod secret;

/// Module for signing and verifying client-held tokens
pub mod jwt;
