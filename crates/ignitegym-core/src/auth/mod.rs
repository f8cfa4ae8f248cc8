//! Authentication module for managing the signed-in session.
//!
//! This module provides:
//! - `SessionManager`: sign-in, sign-out, profile updates and startup restore
//! - `SessionStore`: the persisted user + token pair, kept both-or-neither
//! - `RefreshInterceptor`: single-flight token refresh and request replay
//!
//! The session manager registers itself with the API client as its
//! `TokenManager`, so expired tokens are refreshed without the caller noticing.

pub mod credentials;
pub mod error;
pub mod interceptor;
pub mod session;

pub use credentials::{SessionStore, TOKEN_KEY, USER_KEY};
pub use error::SessionError;
pub use interceptor::{
    ForcedSignOut, RefreshInterceptor, RefreshOutcome, RefreshPolicy, RefreshTicket, Registration, TokenManager,
};
pub use session::{Session, SessionEvent, SessionManager, SessionStatus, SignOutReason};
