use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::api::ApiClient;
use crate::models::{AvatarUpload, ProfileUpdate, TokenPair, UserProfile};
use crate::store::StorageError;

use super::credentials::SessionStore;
use super::error::SessionError;
use super::interceptor::{ForcedSignOut, RefreshOutcome, RefreshTicket, Registration, TokenManager};

/// Buffered session events per subscriber before the slowest one lags.
const EVENT_CAPACITY: usize = 32;

/// The signed-in user together with the tokens that authorize them.
#[derive(Debug, Clone)]
pub struct Session {
    pub user: UserProfile,
    pub tokens: TokenPair,
    pub signed_in_at: DateTime<Utc>,
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(user: UserProfile, tokens: TokenPair) -> Self {
        Self {
            user,
            tokens,
            signed_in_at: Utc::now(),
            refreshed_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum SessionStatus {
    /// Startup, before the stored session has been read.
    Unknown,
    Authenticated,
    /// Authenticated while a token refresh is in flight.
    RefreshingToken,
    Unauthenticated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignOutReason {
    User,
    Forced(ForcedSignOut),
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    SignedIn(UserProfile),
    SignedOut { reason: SignOutReason },
    ProfileUpdated(UserProfile),
    TokenRefreshed { version: u64 },
}

impl SessionEvent {
    /// Whether this event should be shown to the user as "session expired".
    pub fn is_session_expired(&self) -> bool {
        matches!(
            self,
            SessionEvent::SignedOut {
                reason: SignOutReason::Forced(_)
            }
        )
    }
}

enum SessionState {
    Unknown,
    Authenticated { session: Session, generation: u64 },
    Unauthenticated,
}

impl SessionState {
    fn generation(&self) -> Option<u64> {
        match self {
            SessionState::Authenticated { generation, .. } => Some(*generation),
            _ => None,
        }
    }
}

/// Sets the loading flag for as long as it lives.
struct LoadingGuard<'a>(&'a AtomicBool);

impl<'a> LoadingGuard<'a> {
    fn new(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Owns the signed-in session.
///
/// The manager is the only writer of the persisted session and of the
/// client's `Authorization` header. Sign-in, sign-out, profile updates and
/// refreshed-token installs are serialized through one transition lock, and
/// every change reaches storage before it reaches memory.
pub struct SessionManager {
    api: ApiClient,
    store: SessionStore,
    state: RwLock<SessionState>,
    transition: tokio::sync::Mutex<()>,
    generation: AtomicU64,
    loading: AtomicBool,
    refreshed_token: watch::Sender<u64>,
    events: broadcast::Sender<SessionEvent>,
    registration: Mutex<Option<Registration>>,
}

impl SessionManager {
    /// Create a manager and register it as the client's token manager.
    /// The registration ends when the manager is dropped.
    pub fn new(api: ApiClient, store: SessionStore) -> Arc<Self> {
        let (refreshed_token, _) = watch::channel(0);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let manager = Arc::new(Self {
            api,
            store,
            state: RwLock::new(SessionState::Unknown),
            transition: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            loading: AtomicBool::new(true),
            refreshed_token,
            events,
            registration: Mutex::new(None),
        });

        let weak: Weak<SessionManager> = Arc::downgrade(&manager);
        let registration = manager.api.register_token_manager(weak);
        *manager
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(registration);
        manager
    }

    fn state_read(&self) -> RwLockReadGuard<'_, SessionState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_write(&self) -> RwLockWriteGuard<'_, SessionState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn status(&self) -> SessionStatus {
        match &*self.state_read() {
            SessionState::Unknown => SessionStatus::Unknown,
            SessionState::Authenticated { .. } if self.api.interceptor().is_refreshing() => {
                SessionStatus::RefreshingToken
            }
            SessionState::Authenticated { .. } => SessionStatus::Authenticated,
            SessionState::Unauthenticated => SessionStatus::Unauthenticated,
        }
    }

    pub fn user(&self) -> Option<UserProfile> {
        self.session().map(|s| s.user)
    }

    pub fn session(&self) -> Option<Session> {
        match &*self.state_read() {
            SessionState::Authenticated { session, .. } => Some(session.clone()),
            _ => None,
        }
    }

    pub fn is_loading_session_data(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    /// Incremented each time a refreshed token is installed. Screens watch it
    /// to re-fetch data after a silent refresh.
    pub fn refreshed_token(&self) -> u64 {
        *self.refreshed_token.borrow()
    }

    pub fn watch_refreshed_token(&self) -> watch::Receiver<u64> {
        self.refreshed_token.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Restore the persisted session at startup. Reads storage only.
    ///
    /// Storage failures and incomplete sessions resolve to `Unauthenticated`.
    /// Has no effect once the session has left `Unknown`.
    pub async fn restore(&self) -> SessionStatus {
        let _transition = self.transition.lock().await;
        if !matches!(*self.state_read(), SessionState::Unknown) {
            return self.status();
        }
        let _loading = LoadingGuard::new(&self.loading);

        let loaded = match self.store.load().await {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!(error = %e, "Failed to read stored session");
                None
            }
        };

        match loaded {
            Some((user, tokens)) => {
                let generation = self.next_generation();
                self.api.set_access_token(Some(&tokens.access_token));
                info!(user_id = %user.id, "Session restored");
                *self.state_write() = SessionState::Authenticated {
                    session: Session::new(user, tokens),
                    generation,
                };
                SessionStatus::Authenticated
            }
            None => {
                debug!("No stored session");
                *self.state_write() = SessionState::Unauthenticated;
                SessionStatus::Unauthenticated
            }
        }
    }

    /// Sign in with e-mail and password, replacing any current session.
    ///
    /// Fails with `TransitionInProgress` while another sign-in or sign-out runs.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<UserProfile, SessionError> {
        let _transition = self
            .transition
            .try_lock()
            .map_err(|_| SessionError::TransitionInProgress)?;

        let response = self.api.create_session(email, password).await?;
        let (user, token) = match (response.user, response.token) {
            (Some(user), Some(token)) if !token.is_empty() => (user, token),
            _ => {
                return Err(SessionError::InvalidResponse(
                    "missing user or token".to_string(),
                ))
            }
        };
        let tokens = TokenPair::new(token, response.refresh_token);
        if !tokens.can_refresh() {
            warn!("Sign-in response carried no refresh token");
        }

        {
            let _loading = LoadingGuard::new(&self.loading);
            self.store.save_session(&user, &tokens).await?;
        }

        let generation = self.next_generation();
        self.api.set_access_token(Some(&tokens.access_token));
        *self.state_write() = SessionState::Authenticated {
            session: Session::new(user.clone(), tokens),
            generation,
        };
        info!(user_id = %user.id, generation, "Signed in");
        self.emit(SessionEvent::SignedIn(user.clone()));
        Ok(user)
    }

    /// Sign out at the user's request.
    ///
    /// Memory and the `Authorization` header are cleared even when storage
    /// fails; the storage error is still returned.
    pub async fn sign_out(&self) -> Result<(), SessionError> {
        let _transition = self.transition.lock().await;
        self.teardown(SignOutReason::User).await?;
        Ok(())
    }

    async fn teardown(&self, reason: SignOutReason) -> Result<(), StorageError> {
        let cleared = {
            let _loading = LoadingGuard::new(&self.loading);
            self.store.clear().await
        };
        if let Err(e) = &cleared {
            warn!(error = %e, "Failed to clear stored session");
        }

        self.next_generation();
        self.api.set_access_token(None);
        let was_authenticated = {
            let mut state = self.state_write();
            let was = matches!(*state, SessionState::Authenticated { .. });
            *state = SessionState::Unauthenticated;
            was
        };

        if was_authenticated {
            match reason {
                SignOutReason::User => info!("Signed out"),
                SignOutReason::Forced(code) => warn!(reason = %code, "Session ended"),
            }
            self.emit(SessionEvent::SignedOut { reason });
        }
        cleared
    }

    /// Replace the stored and in-memory profile of the signed-in user.
    pub async fn update_user_profile(&self, user: UserProfile) -> Result<(), SessionError> {
        let _transition = self.transition.lock().await;
        let expected = match &*self.state_read() {
            SessionState::Authenticated { session, .. } => session.user.id.clone(),
            _ => return Err(SessionError::NotAuthenticated),
        };
        if user.id != expected {
            return Err(SessionError::IdentityMismatch {
                expected,
                found: user.id,
            });
        }

        self.store.save_user(&user).await?;
        if let SessionState::Authenticated { session, .. } = &mut *self.state_write() {
            session.user = user.clone();
        }
        debug!(user_id = %user.id, "Profile updated");
        self.emit(SessionEvent::ProfileUpdated(user));
        Ok(())
    }

    /// Send `update` to the backend, then apply it to the session profile.
    pub async fn save_profile(&self, update: &ProfileUpdate) -> Result<UserProfile, SessionError> {
        let mut user = self.user().ok_or(SessionError::NotAuthenticated)?;
        self.api.update_user(update).await?;
        user.name = update.name.clone();
        self.update_user_profile(user.clone()).await?;
        Ok(user)
    }

    /// Upload a new avatar and record its reference on the session profile.
    pub async fn change_avatar(&self, upload: AvatarUpload) -> Result<UserProfile, SessionError> {
        let mut user = self.user().ok_or(SessionError::NotAuthenticated)?;
        let updated = self.api.update_avatar(upload).await?;
        user.avatar = Some(updated.avatar);
        self.update_user_profile(user.clone()).await?;
        Ok(user)
    }

    async fn install_refreshed(&self, generation: u64, tokens: TokenPair) -> Result<RefreshOutcome, StorageError> {
        let _transition = self.transition.lock().await;
        if self.state_read().generation() != Some(generation) {
            debug!(generation, "Refreshed tokens belong to an ended session");
            return Ok(RefreshOutcome::Superseded);
        }

        self.store.save_tokens(&tokens).await?;
        self.api.set_access_token(Some(&tokens.access_token));
        if let SessionState::Authenticated { session, .. } = &mut *self.state_write() {
            session.tokens = tokens;
            session.refreshed_at = Some(Utc::now());
        }

        self.refreshed_token.send_modify(|version| *version += 1);
        let version = self.refreshed_token();
        info!(version, "Refreshed token installed");
        self.emit(SessionEvent::TokenRefreshed { version });
        Ok(RefreshOutcome::Applied)
    }

    async fn forced_teardown(&self, generation: u64, reason: ForcedSignOut) {
        let _transition = self.transition.lock().await;
        if self.state_read().generation() != Some(generation) {
            debug!(generation, %reason, "Ignoring sign-out for an ended session");
            return;
        }
        if let Err(e) = self.teardown(SignOutReason::Forced(reason)).await {
            warn!(error = %e, %reason, "Forced sign-out left stored data behind");
        }
    }
}

impl TokenManager for SessionManager {
    fn refresh_ticket(&self) -> Option<RefreshTicket> {
        match &*self.state_read() {
            SessionState::Authenticated { session, generation } => Some(RefreshTicket {
                generation: *generation,
                refresh_token: session.tokens.refresh_token.clone(),
            }),
            _ => None,
        }
    }

    fn refreshed_token_updated(
        &self,
        generation: u64,
        tokens: TokenPair,
    ) -> BoxFuture<'_, Result<RefreshOutcome, StorageError>> {
        self.install_refreshed(generation, tokens).boxed()
    }

    fn force_sign_out(&self, generation: u64, reason: ForcedSignOut) -> BoxFuture<'_, ()> {
        self.forced_teardown(generation, reason).boxed()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::future::join_all;

    use super::*;
    use crate::api::{ApiError, ApiRequest, HeaderBag, Method, UnauthorizedReason};
    use crate::auth::credentials::{TOKEN_KEY, USER_KEY};
    use crate::auth::interceptor::RefreshPolicy;
    use crate::models::UserId;
    use crate::store::MemoryStore;
    use crate::test_support::{FailingStore, FakeBackend};

    struct Fixture {
        backend: Arc<FakeBackend>,
        storage: Arc<MemoryStore>,
        manager: Arc<SessionManager>,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_policy(RefreshPolicy::default())
        }

        fn with_policy(policy: RefreshPolicy) -> Self {
            let backend = FakeBackend::new();
            let storage = Arc::new(MemoryStore::new());
            let api = ApiClient::new(backend.clone(), policy);
            let manager = SessionManager::new(api, SessionStore::new(storage.clone()));
            Self {
                backend,
                storage,
                manager,
            }
        }

        async fn signed_in(self) -> Self {
            self.manager.restore().await;
            self.manager
                .sign_in("ana@gym.dev", "secret")
                .await
                .expect("sign in");
            self
        }
    }

    #[tokio::test]
    async fn test_sign_in_persists_before_authenticating() {
        let fx = Fixture::new();
        assert!(fx.manager.is_loading_session_data());
        assert_eq!(fx.manager.restore().await, SessionStatus::Unauthenticated);
        assert!(!fx.manager.is_loading_session_data());

        let mut events = fx.manager.subscribe();
        let user = fx
            .manager
            .sign_in("ana@gym.dev", "secret")
            .await
            .expect("sign in");

        assert_eq!(fx.manager.status(), SessionStatus::Authenticated);
        assert_eq!(fx.manager.user(), Some(user.clone()));
        assert_eq!(fx.manager.api().access_token().as_deref(), Some("access-1"));
        assert!(!fx.manager.is_loading_session_data());

        let (stored_user, stored_tokens) = fx
            .manager
            .store()
            .load()
            .await
            .expect("load")
            .expect("stored session");
        assert_eq!(stored_user, user);
        assert_eq!(stored_tokens.access_token, "access-1");
        assert_eq!(stored_tokens.refresh_token.as_deref(), Some("refresh-1"));

        assert!(matches!(events.try_recv(), Ok(SessionEvent::SignedIn(_))));
    }

    #[tokio::test]
    async fn test_sign_in_with_wrong_password_keeps_store_empty() {
        let fx = Fixture::new();
        fx.manager.restore().await;

        let err = fx
            .manager
            .sign_in("ana@gym.dev", "nope")
            .await
            .expect_err("wrong password");
        assert!(matches!(err, SessionError::Api(ApiError::Unauthorized(UnauthorizedReason::Other(_)))));
        assert!(fx.storage.is_empty());
        assert_eq!(fx.manager.status(), SessionStatus::Unauthenticated);
        assert_eq!(fx.backend.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn test_sign_in_rejects_incomplete_response() {
        let fx = Fixture::new();
        fx.backend.set_omit_user(true);

        let err = fx
            .manager
            .sign_in("ana@gym.dev", "secret")
            .await
            .expect_err("no user");
        assert!(matches!(err, SessionError::InvalidResponse(_)));
        assert!(fx.storage.is_empty());
        assert_eq!(fx.manager.api().access_token(), None);
    }

    #[tokio::test]
    async fn test_concurrent_sign_in_is_rejected() {
        let fx = Fixture::new();
        fx.manager.restore().await;
        fx.backend.set_session_delay(Duration::from_millis(30));

        let (first, second) = tokio::join!(
            fx.manager.sign_in("ana@gym.dev", "secret"),
            fx.manager.sign_in("ana@gym.dev", "secret"),
        );
        assert!(first.is_ok());
        assert!(matches!(second, Err(SessionError::TransitionInProgress)));
        assert_eq!(fx.backend.session_calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_expiry_refreshes_once() {
        let fx = Fixture::new().signed_in().await;
        let version = fx.manager.watch_refreshed_token();
        fx.backend.expire_access_token();
        fx.backend.set_refresh_delay(Duration::from_millis(20));

        let api = fx.manager.api();
        let results = join_all((0..5).map(|_| api.fetch_history())).await;

        for result in results {
            assert!(result.expect("replayed").is_empty());
        }
        assert_eq!(fx.backend.refresh_calls(), 1);
        // five rejected attempts plus exactly one replay each
        assert_eq!(fx.backend.history_calls(), 10);
        let bearers = fx.backend.history_bearers();
        assert!(bearers[..5].iter().all(|b| b == "access-1"));
        assert!(bearers[5..].iter().all(|b| b == "access-2"));

        assert_eq!(api.access_token().as_deref(), Some("access-2"));
        assert_eq!(fx.manager.refreshed_token(), 1);
        assert!(version.has_changed().expect("sender alive"));
        assert!(fx.manager.session().expect("session").refreshed_at.is_some());

        let stored = fx.manager.store().load_tokens().await.expect("load").expect("tokens");
        assert_eq!(stored.access_token, "access-2");
        assert_eq!(stored.refresh_token.as_deref(), Some("refresh-2"));
        assert_eq!(fx.manager.status(), SessionStatus::Authenticated);
    }

    #[tokio::test]
    async fn test_rejected_refresh_signs_out_before_rejecting_callers() {
        let fx = Fixture::new().signed_in().await;
        let mut events = fx.manager.subscribe();
        fx.backend.expire_access_token();
        fx.backend.set_refresh_fails(true);

        let api = fx.manager.api().clone();
        let calls = (0..5).map(|_| {
            let api = api.clone();
            async move {
                let result = api.fetch_history().await;
                (result, api.access_token())
            }
        });

        for (result, header_after) in join_all(calls).await {
            let err = result.expect_err("refresh rejected");
            assert!(matches!(err, ApiError::Unauthorized(UnauthorizedReason::TokenExpired)));
            assert_eq!(header_after, None);
        }
        assert_eq!(fx.backend.refresh_calls(), 1);
        assert_eq!(fx.manager.status(), SessionStatus::Unauthenticated);
        assert!(!fx.storage.contains(USER_KEY));
        assert!(!fx.storage.contains(TOKEN_KEY));

        let event = events.try_recv().expect("signed out event");
        assert!(event.is_session_expired());
        assert!(matches!(
            event,
            SessionEvent::SignedOut {
                reason: SignOutReason::Forced(ForcedSignOut::RefreshRejected)
            }
        ));
    }

    #[tokio::test]
    async fn test_restore_without_network() {
        let fx = Fixture::new();
        let user = UserProfile::new(UserId::Number(7), "Ana", "ana@gym.dev");
        let tokens = TokenPair::new("stored-access", Some("stored-refresh".into()));
        fx.manager
            .store()
            .save_session(&user, &tokens)
            .await
            .expect("seed");

        assert_eq!(fx.manager.status(), SessionStatus::Unknown);
        assert_eq!(fx.manager.restore().await, SessionStatus::Authenticated);
        assert_eq!(fx.backend.total_calls(), 0);
        assert_eq!(fx.manager.user(), Some(user));
        assert_eq!(fx.manager.api().access_token().as_deref(), Some("stored-access"));
        assert!(!fx.manager.is_loading_session_data());
    }

    #[tokio::test]
    async fn test_restore_with_orphan_token() {
        let fx = Fixture::new();
        fx.manager
            .store()
            .save_tokens(&TokenPair::new("stored-access", None))
            .await
            .expect("seed");

        assert_eq!(fx.manager.restore().await, SessionStatus::Unauthenticated);
        assert!(fx.storage.is_empty());
        assert_eq!(fx.manager.api().access_token(), None);
    }

    #[tokio::test]
    async fn test_queue_overflow() {
        let policy = RefreshPolicy {
            max_pending: 2,
            ..RefreshPolicy::default()
        };
        let fx = Fixture::with_policy(policy).signed_in().await;
        fx.backend.expire_access_token();
        fx.backend.set_refresh_delay(Duration::from_millis(20));

        let api = fx.manager.api();
        let results = join_all((0..4).map(|_| api.fetch_history())).await;

        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        for result in &results[2..] {
            assert!(matches!(result, Err(ApiError::QueueOverflow { limit: 2 })));
        }
        assert_eq!(fx.backend.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn test_sign_out_discards_in_flight_refresh() {
        let fx = Fixture::new().signed_in().await;
        let mut events = fx.manager.subscribe();
        fx.backend.expire_access_token();
        fx.backend.set_refresh_delay(Duration::from_millis(50));

        let api = fx.manager.api().clone();
        let request = tokio::spawn(async move { api.fetch_history().await });
        while !fx.manager.api().interceptor().is_refreshing() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(fx.manager.status(), SessionStatus::RefreshingToken);

        fx.manager.sign_out().await.expect("sign out");
        let err = request.await.expect("join").expect_err("superseded");
        assert!(matches!(err, ApiError::Unauthorized(_)));

        assert_eq!(fx.backend.refresh_calls(), 1);
        assert_eq!(fx.manager.api().access_token(), None);
        assert!(fx.storage.is_empty());
        assert_eq!(fx.manager.refreshed_token(), 0);
        assert!(matches!(
            events.try_recv(),
            Ok(SessionEvent::SignedOut {
                reason: SignOutReason::User
            })
        ));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stale_request_replays_with_current_token() {
        let fx = Fixture::new().signed_in().await;
        fx.backend.expire_access_token();
        fx.manager.api().fetch_history().await.expect("refreshed");
        assert_eq!(fx.backend.refresh_calls(), 1);

        // A response for a request that was sent before the refresh finished.
        let api = fx.manager.api();
        let response = api
            .interceptor()
            .handle_unauthorized(
                api,
                ApiRequest::new(Method::Get, "/history"),
                HeaderBag::new().with_bearer("access-1"),
                UnauthorizedReason::TokenExpired,
            )
            .await
            .expect("replayed");
        assert_eq!(response.status, 200);
        assert_eq!(fx.backend.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn test_transient_refresh_failure_keeps_session() {
        let fx = Fixture::new().signed_in().await;
        fx.backend.expire_access_token();
        fx.backend.set_refresh_unavailable(true);

        let err = fx.manager.api().fetch_history().await.expect_err("unavailable");
        assert!(matches!(err, ApiError::Unauthorized(_)));
        assert!(!err.user_message().contains("sign in"));
        assert_eq!(fx.manager.status(), SessionStatus::Authenticated);
        assert!(fx.storage.contains(TOKEN_KEY));

        fx.backend.set_refresh_unavailable(false);
        fx.manager.api().fetch_history().await.expect("recovered");
        assert_eq!(fx.backend.refresh_calls(), 2);
    }

    #[tokio::test]
    async fn test_refresh_timeout_keeps_session() {
        let policy = RefreshPolicy {
            refresh_timeout: Duration::from_millis(10),
            ..RefreshPolicy::default()
        };
        let fx = Fixture::with_policy(policy).signed_in().await;
        fx.backend.expire_access_token();
        fx.backend.set_refresh_delay(Duration::from_millis(200));

        let err = fx.manager.api().fetch_history().await.expect_err("timed out");
        assert!(matches!(err, ApiError::Unauthorized(_)));
        assert_eq!(fx.manager.status(), SessionStatus::Authenticated);
        assert!(!fx.manager.api().interceptor().is_refreshing());
    }

    #[tokio::test]
    async fn test_refresh_persist_failure_forces_sign_out() {
        let backend = FakeBackend::new();
        let storage = Arc::new(FailingStore::new());
        let manager = SessionManager::new(
            ApiClient::with_transport(backend.clone()),
            SessionStore::new(storage.clone()),
        );
        manager.restore().await;
        manager.sign_in("ana@gym.dev", "secret").await.expect("sign in");
        let mut events = manager.subscribe();

        storage.fail_saves_to(TOKEN_KEY);
        backend.expire_access_token();
        manager.api().fetch_history().await.expect_err("not persisted");

        assert_eq!(manager.status(), SessionStatus::Unauthenticated);
        assert_eq!(manager.api().access_token(), None);
        assert!(!storage.contains(USER_KEY));
        assert!(matches!(
            events.try_recv(),
            Ok(SessionEvent::SignedOut {
                reason: SignOutReason::Forced(ForcedSignOut::PersistFailed)
            })
        ));
    }

    #[tokio::test]
    async fn test_non_expiry_unauthorized_forces_sign_out() {
        let fx = Fixture::new().signed_in().await;
        fx.backend.set_revoked(true);

        let err = fx.manager.api().fetch_history().await.expect_err("revoked");
        assert!(matches!(err, ApiError::Unauthorized(UnauthorizedReason::Other(_))));
        assert_eq!(fx.backend.refresh_calls(), 0);
        assert_eq!(fx.manager.status(), SessionStatus::Unauthenticated);
        assert!(fx.storage.is_empty());
    }

    #[tokio::test]
    async fn test_sign_out_clears_memory_when_storage_fails() {
        let backend = FakeBackend::new();
        let storage = Arc::new(FailingStore::new());
        let manager = SessionManager::new(
            ApiClient::with_transport(backend.clone()),
            SessionStore::new(storage.clone()),
        );
        manager.restore().await;
        manager.sign_in("ana@gym.dev", "secret").await.expect("sign in");

        storage.fail_removes_of(USER_KEY);
        let err = manager.sign_out().await.expect_err("storage failure");
        assert!(matches!(err, SessionError::Storage(_)));
        assert_eq!(manager.status(), SessionStatus::Unauthenticated);
        assert_eq!(manager.api().access_token(), None);
        assert!(!manager.is_loading_session_data());
    }

    #[tokio::test]
    async fn test_update_user_profile() {
        let fx = Fixture::new();
        fx.manager.restore().await;
        let stranger = UserProfile::new(UserId::Number(99), "Bo", "bo@gym.dev");
        assert!(matches!(
            fx.manager.update_user_profile(stranger.clone()).await,
            Err(SessionError::NotAuthenticated)
        ));

        let fx = fx.signed_in().await;
        assert!(matches!(
            fx.manager.update_user_profile(stranger).await,
            Err(SessionError::IdentityMismatch { .. })
        ));

        let mut events = fx.manager.subscribe();
        let mut user = fx.manager.user().expect("user");
        user.name = "Ana Maria".to_string();
        fx.manager
            .update_user_profile(user.clone())
            .await
            .expect("update");

        assert_eq!(fx.manager.user(), Some(user.clone()));
        let stored = fx.manager.store().load_user().await.expect("load").expect("user");
        assert_eq!(stored, user);
        assert!(matches!(events.try_recv(), Ok(SessionEvent::ProfileUpdated(_))));
    }

    #[tokio::test]
    async fn test_save_profile_and_avatar() {
        let fx = Fixture::new().signed_in().await;

        let user = fx
            .manager
            .save_profile(&ProfileUpdate::rename("Ana Maria"))
            .await
            .expect("rename");
        assert_eq!(user.name, "Ana Maria");

        let upload = AvatarUpload::from_file_name("me.png", vec![1, 2, 3]);
        let user = fx.manager.change_avatar(upload).await.expect("avatar");
        assert_eq!(user.avatar.as_deref(), Some("avatar-u-1.png"));
        assert_eq!(fx.manager.user(), Some(user));
    }

    #[tokio::test]
    async fn test_replayed_writes_keep_their_payload() {
        let fx = Fixture::new().signed_in().await;

        fx.backend.expire_access_token();
        fx.manager
            .save_profile(&ProfileUpdate::rename("Ana Maria"))
            .await
            .expect("rename after refresh");

        fx.backend.expire_access_token();
        let upload = AvatarUpload::from_file_name("me.png", vec![1, 2, 3]);
        fx.manager.change_avatar(upload).await.expect("avatar after refresh");

        assert_eq!(fx.backend.refresh_calls(), 2);
        let writes = fx.backend.writes();
        assert_eq!(writes.len(), 4);
        let bearers: Vec<_> = writes.iter().map(|w| w.bearer.as_deref()).collect();
        assert_eq!(
            bearers,
            [Some("access-1"), Some("access-2"), Some("access-2"), Some("access-3")]
        );
        for pair in writes.chunks(2) {
            assert_eq!(pair[0].path, pair[1].path);
            assert_eq!(pair[0].payload, pair[1].payload);
        }
        assert!(writes[0].payload.contains("Ana Maria"));
        assert!(writes[2].payload.contains("me.png; image/png; [1, 2, 3]"));
    }

    #[tokio::test]
    async fn test_sign_in_replaces_current_session() {
        let fx = Fixture::new().signed_in().await;
        let first_generation = fx.manager.state_read().generation().expect("signed in");

        fx.backend.expire_access_token();
        fx.backend.set_refresh_delay(Duration::from_millis(50));
        let api = fx.manager.api().clone();
        let request = tokio::spawn(async move { api.fetch_history().await });
        while !fx.manager.api().interceptor().is_refreshing() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let user = fx
            .manager
            .sign_in("bo@gym.dev", "secret")
            .await
            .expect("second sign in");
        assert_eq!(user.email, "bo@gym.dev");
        assert_ne!(fx.manager.state_read().generation(), Some(first_generation));

        // The first session's refresh finishes after the switch and is dropped.
        request.await.expect("join").expect_err("superseded");
        assert_eq!(fx.backend.refresh_calls(), 1);
        assert_eq!(fx.manager.refreshed_token(), 0);
        assert_eq!(fx.manager.api().access_token().as_deref(), Some("access-1"));

        let late = fx
            .manager
            .refreshed_token_updated(first_generation, TokenPair::new("late", None))
            .await
            .expect("no storage involved");
        assert_eq!(late, RefreshOutcome::Superseded);

        let (stored_user, stored_tokens) = fx
            .manager
            .store()
            .load()
            .await
            .expect("load")
            .expect("stored session");
        assert_eq!(Some(stored_user), fx.manager.user());
        assert_eq!(stored_tokens.access_token, "access-1");
        assert_eq!(fx.manager.status(), SessionStatus::Authenticated);
    }

    #[tokio::test]
    async fn test_failed_sign_in_keeps_previous_session_stored() {
        let backend = FakeBackend::new();
        let storage = Arc::new(FailingStore::new());
        let manager = SessionManager::new(
            ApiClient::with_transport(backend.clone()),
            SessionStore::new(storage.clone()),
        );
        manager.restore().await;
        manager.sign_in("ana@gym.dev", "secret").await.expect("sign in");

        storage.fail_saves_to(TOKEN_KEY);
        let err = manager
            .sign_in("bo@gym.dev", "secret")
            .await
            .expect_err("token write fails");
        assert!(matches!(err, SessionError::Storage(_)));

        assert_eq!(manager.status(), SessionStatus::Authenticated);
        let current = manager.user().expect("previous user");
        assert_eq!(current.email, "ana@gym.dev");
        let (stored_user, stored_tokens) = manager
            .store()
            .load()
            .await
            .expect("load")
            .expect("previous session still stored");
        assert_eq!(stored_user, current);
        assert_eq!(
            Some(stored_tokens.access_token),
            manager.api().access_token()
        );
        assert!(!manager.is_loading_session_data());
    }

    #[tokio::test]
    async fn test_registration_ends_with_manager() {
        let fx = Fixture::new();
        let api = fx.manager.api().clone();
        assert!(api.interceptor().has_token_manager());

        drop(fx);
        assert!(!api.interceptor().has_token_manager());
    }
}
