//! Ignite Gym core library.
//!
//! This crate keeps a gym app's user signed in:
//! - `api`: REST client, transport seam and error mapping
//! - `auth`: session manager, persisted session and single-flight token refresh
//! - `store`: credential storage backends (file, keychain, memory, sealed)
//! - `models`: user, token and history types shared with the UI
//! - `config`: JSON configuration and store construction

pub mod api;
pub mod auth;
pub mod config;
pub mod models;
pub mod store;

#[cfg(test)]
mod test_support;

pub use api::{ApiClient, ApiError};
pub use auth::{SessionError, SessionEvent, SessionManager, SessionStatus, SessionStore, SignOutReason};
pub use config::Config;
