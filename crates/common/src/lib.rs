//! Common identifiers and helpers shared across the calls workspace.

#![warn(clippy::pedantic)]

/// Module for cluster, call, session and user identifiers
pub mod types;

/// Module for secret types that prevent accidental logging
pub mod secret;
