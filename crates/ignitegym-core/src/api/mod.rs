//! REST API client module for the Ignite Gym backend.
//!
//! This module provides the `ApiClient` for talking to the gym API
//! (sessions, users, history) and the `Transport` seam it sends through.
//!
//! Requests carry the current access token as a bearer `Authorization`
//! header. A 401 caused by an expired token is handed to the refresh
//! interceptor in `auth::interceptor` instead of being returned directly.

pub mod client;
pub mod error;
pub mod transport;

pub use client::{ApiClient, AvatarUpdated, RefreshResponse, SessionResponse};
pub use error::{ApiError, UnauthorizedReason};
pub use transport::{ApiRequest, ApiResponse, HeaderBag, Method, ReqwestTransport, RequestBody, Transport};
