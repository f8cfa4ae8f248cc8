//! Scripted backend and storage doubles shared by the unit tests.

use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{self, BoxFuture, FutureExt};
use serde_json::{json, Value};

use crate::api::{ApiClient, ApiError, ApiRequest, ApiResponse, HeaderBag, Method, RequestBody, Transport};
use crate::auth::{ForcedSignOut, RefreshOutcome, RefreshTicket, TokenManager};
use crate::models::TokenPair;
use crate::store::{CredentialStore, MemoryStore, StorageError};

const PASSWORD: &str = "secret";

struct BackendState {
    issued: u32,
    access_token: Option<String>,
    refresh_token: String,
    session_delay: Duration,
    refresh_delay: Duration,
    refresh_fails: bool,
    refresh_unavailable: bool,
    revoked: bool,
    omit_user: bool,
    history_bearers: Vec<String>,
    writes: Vec<RecordedWrite>,
}

/// A `PUT /users` or `PATCH /users/avatar` as the backend received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RecordedWrite {
    pub path: String,
    pub bearer: Option<String>,
    pub payload: String,
}

/// In-process stand-in for the gym API.
///
/// Starts in the state right after a successful sign-in: `access-1` is valid
/// and `refresh-1` can be exchanged. Each refresh issues `access-N` and
/// `refresh-N` with N counting up.
pub(crate) struct FakeBackend {
    state: Mutex<BackendState>,
    total_calls: AtomicUsize,
    session_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    history_calls: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BackendState {
                issued: 1,
                access_token: Some("access-1".to_string()),
                refresh_token: "refresh-1".to_string(),
                session_delay: Duration::ZERO,
                refresh_delay: Duration::ZERO,
                refresh_fails: false,
                refresh_unavailable: false,
                revoked: false,
                omit_user: false,
                history_bearers: Vec::new(),
                writes: Vec::new(),
            }),
            total_calls: AtomicUsize::new(0),
            session_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            history_calls: AtomicUsize::new(0),
        })
    }

    fn state(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn expire_access_token(&self) {
        self.state().access_token = None;
    }

    pub fn set_session_delay(&self, delay: Duration) {
        self.state().session_delay = delay;
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        self.state().refresh_delay = delay;
    }

    /// Reject every refresh token with `token.invalid`.
    pub fn set_refresh_fails(&self, fails: bool) {
        self.state().refresh_fails = fails;
    }

    /// Answer refreshes with 503.
    pub fn set_refresh_unavailable(&self, unavailable: bool) {
        self.state().refresh_unavailable = unavailable;
    }

    /// Reject authenticated requests with a non-token 401.
    pub fn set_revoked(&self, revoked: bool) {
        self.state().revoked = revoked;
    }

    pub fn set_omit_user(&self, omit: bool) {
        self.state().omit_user = omit;
    }

    pub fn total_calls(&self) -> usize {
        self.total_calls.load(Ordering::SeqCst)
    }

    pub fn session_calls(&self) -> usize {
        self.session_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn history_calls(&self) -> usize {
        self.history_calls.load(Ordering::SeqCst)
    }

    /// Bearer tokens `GET /history` was called with, in arrival order.
    pub fn history_bearers(&self) -> Vec<String> {
        self.state().history_bearers.clone()
    }

    /// Profile and avatar writes in arrival order, rejected attempts included.
    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.state().writes.clone()
    }

    fn record_write(&self, request: &ApiRequest, headers: &HeaderBag) {
        let payload = match &request.body {
            RequestBody::Empty => String::new(),
            RequestBody::Json(value) => value.to_string(),
            RequestBody::Multipart { field, file } => format!(
                "{}; {}; {}; {:?}",
                field, file.file_name, file.mime_type, file.bytes
            ),
        };
        self.state().writes.push(RecordedWrite {
            path: request.path.clone(),
            bearer: headers.bearer_token().map(str::to_owned),
            payload,
        });
    }

    fn issue(state: &mut BackendState) -> (String, String) {
        state.issued += 1;
        let access = format!("access-{}", state.issued);
        let refresh = format!("refresh-{}", state.issued);
        state.access_token = Some(access.clone());
        state.refresh_token = refresh.clone();
        (access, refresh)
    }

    fn authorize(&self, headers: &HeaderBag) -> Result<(), ApiResponse> {
        let state = self.state();
        if state.revoked {
            return Err(error(401, "user.blocked"));
        }
        match (headers.bearer_token(), state.access_token.as_deref()) {
            (Some(sent), Some(valid)) if sent == valid => Ok(()),
            _ => Err(error(401, "token.expired")),
        }
    }

    async fn create_session(&self, request: &ApiRequest) -> ApiResponse {
        self.session_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.state().session_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if body_field(request, "password").as_deref() != Some(PASSWORD) {
            return error(401, "E-mail e/ou senha incorreta.");
        }

        let mut state = self.state();
        state.issued = 1;
        state.access_token = Some("access-1".to_string());
        state.refresh_token = "refresh-1".to_string();
        let user = if state.omit_user {
            Value::Null
        } else {
            json!({
                "id": "u-1",
                "name": "Ana",
                "email": body_field(request, "email").unwrap_or_default(),
                "avatar": null,
            })
        };
        ok(json!({ "user": user, "token": "access-1", "refresh_token": "refresh-1" }))
    }

    async fn refresh(&self, request: &ApiRequest) -> ApiResponse {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.state().refresh_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if state.refresh_unavailable {
            return ApiResponse::new(503, "");
        }
        if state.refresh_fails || body_field(request, "refresh_token").as_deref() != Some(state.refresh_token.as_str()) {
            return error(401, "token.invalid");
        }
        let (access, refresh) = Self::issue(&mut state);
        ok(json!({ "token": access, "refresh_token": refresh }))
    }

    async fn route(&self, request: &ApiRequest, headers: &HeaderBag) -> ApiResponse {
        self.total_calls.fetch_add(1, Ordering::SeqCst);
        match (request.method, request.path.as_str()) {
            (Method::Post, "/sessions") => self.create_session(request).await,
            (Method::Post, "/sessions/refresh-token") => self.refresh(request).await,
            (Method::Post, "/users") => ApiResponse::new(201, "{}"),
            (Method::Get, "/history") => {
                self.history_calls.fetch_add(1, Ordering::SeqCst);
                if let Some(bearer) = headers.bearer_token() {
                    self.state().history_bearers.push(bearer.to_string());
                }
                self.authorize(headers).map_or_else(|e| e, |_| ok(json!([])))
            }
            (Method::Put, "/users") => {
                self.record_write(request, headers);
                self.authorize(headers).map_or_else(|e| e, |_| ok(json!({})))
            }
            (Method::Patch, "/users/avatar") => {
                self.record_write(request, headers);
                self.authorize(headers)
                    .map_or_else(|e| e, |_| ok(json!({ "avatar": "avatar-u-1.png" })))
            }
            (_, "/boom") => ApiResponse::new(500, "Internal Server Error"),
            _ => ApiResponse::new(404, ""),
        }
    }
}

impl Transport for FakeBackend {
    fn send<'a>(
        &'a self,
        request: &'a ApiRequest,
        headers: &'a HeaderBag,
    ) -> BoxFuture<'a, Result<ApiResponse, ApiError>> {
        async move { Ok(self.route(request, headers).await) }.boxed()
    }
}

fn ok(body: Value) -> ApiResponse {
    ApiResponse::new(200, body.to_string())
}

fn error(status: u16, message: &str) -> ApiResponse {
    ApiResponse::new(status, json!({ "status": "error", "message": message }).to_string())
}

fn body_field(request: &ApiRequest, field: &str) -> Option<String> {
    match &request.body {
        RequestBody::Json(value) => value.get(field).and_then(Value::as_str).map(str::to_owned),
        _ => None,
    }
}

/// Token manager with a fixed refresh token that records what it was asked to do.
pub(crate) struct StaticManager {
    api: ApiClient,
    refresh_token: Option<String>,
    applied: AtomicUsize,
    forced: Mutex<Vec<ForcedSignOut>>,
}

impl StaticManager {
    pub fn new(api: ApiClient, refresh_token: &str) -> Self {
        Self {
            api,
            refresh_token: Some(refresh_token.to_string()),
            applied: AtomicUsize::new(0),
            forced: Mutex::new(Vec::new()),
        }
    }

    pub fn without_refresh_token(api: ApiClient) -> Self {
        Self {
            refresh_token: None,
            ..Self::new(api, "")
        }
    }

    pub fn applied(&self) -> usize {
        self.applied.load(Ordering::SeqCst)
    }

    pub fn forced(&self) -> Vec<ForcedSignOut> {
        self.forced.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl TokenManager for StaticManager {
    fn refresh_ticket(&self) -> Option<RefreshTicket> {
        Some(RefreshTicket {
            generation: 1,
            refresh_token: self.refresh_token.clone(),
        })
    }

    fn refreshed_token_updated(
        &self,
        _generation: u64,
        tokens: TokenPair,
    ) -> BoxFuture<'_, Result<RefreshOutcome, StorageError>> {
        self.api.set_access_token(Some(&tokens.access_token));
        self.applied.fetch_add(1, Ordering::SeqCst);
        future::ready(Ok(RefreshOutcome::Applied)).boxed()
    }

    fn force_sign_out(&self, _generation: u64, reason: ForcedSignOut) -> BoxFuture<'_, ()> {
        self.api.set_access_token(None);
        self.forced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(reason);
        future::ready(()).boxed()
    }
}

/// Memory store whose writes or removals can be made to fail per key.
#[derive(Default)]
pub(crate) struct FailingStore {
    inner: MemoryStore,
    failing_saves: Mutex<HashSet<String>>,
    failing_removes: Mutex<HashSet<String>>,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_saves_to(&self, key: &str) {
        self.failing_saves
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string());
    }

    pub fn fail_removes_of(&self, key: &str) {
        self.failing_removes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.contains(key)
    }

    fn fails(set: &Mutex<HashSet<String>>, key: &str) -> bool {
        set.lock().unwrap_or_else(PoisonError::into_inner).contains(key)
    }

    fn injected(key: &str) -> StorageError {
        StorageError::io(key, io::Error::new(io::ErrorKind::Other, "disk full"))
    }
}

impl CredentialStore for FailingStore {
    fn save<'a>(&'a self, key: &'a str, value: &'a [u8]) -> BoxFuture<'a, Result<(), StorageError>> {
        if Self::fails(&self.failing_saves, key) {
            return future::ready(Err(Self::injected(key))).boxed();
        }
        self.inner.save(key, value)
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>, StorageError>> {
        self.inner.get(key)
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), StorageError>> {
        if Self::fails(&self.failing_removes, key) {
            return future::ready(Err(Self::injected(key))).boxed();
        }
        self.inner.remove(key)
    }
}
