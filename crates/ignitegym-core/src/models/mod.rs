//! Data models for Ignite Gym entities.
//!
//! This module contains the data structures exchanged with the backend and
//! persisted by the session layer:
//!
//! - `UserProfile`, `UserId`: the signed-in user
//! - `TokenPair`: access + refresh token as stored on disk
//! - `HistoryByDay`, `HistoryEntry`: exercise history grouped by day
//! - Request bodies: `ProfileUpdate`, `SignUp`, `AvatarUpload`

pub mod history;
pub mod token;
pub mod user;

pub use history::{HistoryByDay, HistoryEntry};
pub use token::TokenPair;
pub use user::{AvatarUpload, ProfileUpdate, SignUp, UserId, UserProfile};
