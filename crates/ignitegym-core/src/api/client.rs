//! API client for communicating with the Ignite Gym REST API.
//!
//! This module provides the `ApiClient` struct. It owns the default header
//! bag, sends requests through a `Transport`, and routes expired-token
//! failures to the `RefreshInterceptor`.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use crate::auth::interceptor::{RefreshInterceptor, RefreshPolicy, Registration, TokenManager};
use crate::config::Config;
use crate::models::{AvatarUpload, HistoryByDay, ProfileUpdate, SignUp, UserProfile};

use super::transport::{ApiRequest, ApiResponse, HeaderBag, Method, ReqwestTransport, Transport};
use super::ApiError;

// ============================================================================
// Endpoints
// ============================================================================

const SESSIONS_PATH: &str = "/sessions";
const REFRESH_TOKEN_PATH: &str = "/sessions/refresh-token";
const USERS_PATH: &str = "/users";
const AVATAR_PATH: &str = "/users/avatar";
const HISTORY_PATH: &str = "/history";

/// Multipart field name the backend expects for avatar uploads.
const AVATAR_FIELD: &str = "avatar";

/// Response of `POST /sessions`. Fields are optional because the backend has
/// been seen to omit them on partial failures; the session layer validates.
#[derive(Debug, Deserialize)]
pub struct SessionResponse {
    pub user: Option<UserProfile>,
    pub token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// Response of `POST /sessions/refresh-token`.
#[derive(Deserialize)]
pub struct RefreshResponse {
    pub token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// Response of `PATCH /users/avatar`.
#[derive(Debug, Deserialize)]
pub struct AvatarUpdated {
    pub avatar: String,
}

#[derive(Serialize)]
struct Credentials<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

struct ClientInner {
    transport: Arc<dyn Transport>,
    headers: RwLock<HeaderBag>,
    interceptor: RefreshInterceptor,
}

/// API client for the gym backend.
/// Clone is cheap - all clones share the transport, headers and refresh state.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ClientInner>,
}

impl ApiClient {
    pub fn new(transport: Arc<dyn Transport>, policy: RefreshPolicy) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                transport,
                headers: RwLock::new(HeaderBag::new()),
                interceptor: RefreshInterceptor::new(policy),
            }),
        }
    }

    /// Client with the default refresh policy.
    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        Self::new(transport, RefreshPolicy::default())
    }

    /// Create a client that talks to the configured backend over HTTP.
    pub fn from_config(config: &Config) -> Result<Self, ApiError> {
        let transport = ReqwestTransport::new(&config.api_url, config.request_timeout())?;
        Ok(Self::new(Arc::new(transport), config.refresh_policy()))
    }

    fn headers_read(&self) -> RwLockReadGuard<'_, HeaderBag> {
        self.inner.headers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn headers_write(&self) -> RwLockWriteGuard<'_, HeaderBag> {
        self.inner.headers.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the default headers.
    pub fn headers(&self) -> HeaderBag {
        self.headers_read().clone()
    }

    /// Set a default header. `Authorization` is owned by the session layer
    /// and is refused here.
    pub fn set_default_header(&self, name: &str, value: impl Into<String>) {
        if name.eq_ignore_ascii_case("authorization") {
            warn!("Refusing to set Authorization as a plain default header");
            return;
        }
        self.headers_write().insert(name, value);
    }

    /// Access token currently attached to requests.
    pub fn access_token(&self) -> Option<String> {
        self.headers_read().bearer_token().map(str::to_owned)
    }

    pub(crate) fn set_access_token(&self, token: Option<&str>) {
        let mut headers = self.headers_write();
        match token {
            Some(token) => headers.set_bearer(token),
            None => headers.clear_bearer(),
        }
    }

    pub fn interceptor(&self) -> &RefreshInterceptor {
        &self.inner.interceptor
    }

    /// Install the handlers the refresh path calls back into. Dropping the
    /// returned guard revokes them.
    pub fn register_token_manager(&self, manager: Weak<dyn TokenManager>) -> Registration {
        self.inner.interceptor.register(manager)
    }

    /// Send with explicit headers, mapping non-2xx statuses to errors.
    /// Never enters the refresh path.
    pub(crate) async fn send_with_headers(
        &self,
        request: &ApiRequest,
        headers: &HeaderBag,
    ) -> Result<ApiResponse, ApiError> {
        self.inner
            .transport
            .send(request, headers)
            .await?
            .error_for_status()
    }

    /// Send a request with the default headers.
    ///
    /// An expired-token 401 on an interceptable request waits for the shared
    /// refresh and is replayed once with the new token.
    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let headers = self.headers();
        match self.send_with_headers(&request, &headers).await {
            Err(ApiError::Unauthorized(reason)) if request.intercept => {
                debug!(method = request.method.as_str(), path = %request.path, %reason, "Request unauthorized");
                self.inner
                    .interceptor
                    .handle_unauthorized(self, request, headers, reason)
                    .await
            }
            result => result,
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.execute(ApiRequest::new(Method::Get, path)).await?.json()
    }

    pub async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        self.execute(ApiRequest::new(Method::Post, path).json(body)?)
            .await?
            .json()
    }

    pub async fn put<B: Serialize>(&self, path: &str, body: &B) -> Result<ApiResponse, ApiError> {
        self.execute(ApiRequest::new(Method::Put, path).json(body)?).await
    }

    pub async fn patch<B: Serialize>(&self, path: &str, body: &B) -> Result<ApiResponse, ApiError> {
        self.execute(ApiRequest::new(Method::Patch, path).json(body)?).await
    }

    // ===== Sessions =====

    /// Exchange e-mail and password for a user profile and token pair.
    pub async fn create_session(&self, email: &str, password: &str) -> Result<SessionResponse, ApiError> {
        let request = ApiRequest::new(Method::Post, SESSIONS_PATH)
            .json(&Credentials { email, password })?
            .without_intercept();
        self.execute(request).await?.json()
    }

    /// Exchange a refresh token for a new token pair.
    pub async fn refresh_session(&self, refresh_token: &str) -> Result<RefreshResponse, ApiError> {
        let request = ApiRequest::new(Method::Post, REFRESH_TOKEN_PATH)
            .json(&RefreshRequest { refresh_token })?
            .without_intercept();
        self.execute(request).await?.json()
    }

    // ===== Users =====

    /// Register a new account. Does not sign in.
    pub async fn create_user(&self, sign_up: &SignUp) -> Result<(), ApiError> {
        let request = ApiRequest::new(Method::Post, USERS_PATH)
            .json(sign_up)?
            .without_intercept();
        self.execute(request).await?;
        Ok(())
    }

    pub async fn update_user(&self, update: &ProfileUpdate) -> Result<(), ApiError> {
        self.put(USERS_PATH, update).await?;
        Ok(())
    }

    pub async fn update_avatar(&self, upload: AvatarUpload) -> Result<AvatarUpdated, ApiError> {
        let request = ApiRequest::new(Method::Patch, AVATAR_PATH).multipart(AVATAR_FIELD, upload);
        self.execute(request).await?.json()
    }

    // ===== History =====

    pub async fn fetch_history(&self) -> Result<Vec<HistoryByDay>, ApiError> {
        self.get(HISTORY_PATH).await
    }
}
