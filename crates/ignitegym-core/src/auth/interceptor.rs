//! Single-flight token refresh for requests rejected with an expired token.
//!
//! When any number of requests fail with an expired access token at the same
//! time, exactly one of them starts a refresh exchange. The rest wait in a
//! FIFO queue. When the exchange succeeds the whole queue is sent again with
//! the new token. When it fails the queue is rejected with the original
//! unauthorized error and, if the refresh token itself was refused, the
//! session is torn down.
//!
//! The interceptor does not own session state. It calls back into whatever
//! `TokenManager` is registered (the `SessionManager` in practice).

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::api::{ApiClient, ApiError, ApiRequest, ApiResponse, HeaderBag, UnauthorizedReason};
use crate::models::TokenPair;
use crate::store::StorageError;

/// Maximum number of requests (including the one that started the refresh)
/// that may wait for a refresh before new arrivals are refused.
pub const DEFAULT_MAX_PENDING: usize = 64;

/// Upper bound on a single refresh exchange in seconds.
/// Queued requests are released (one way or the other) within this window.
pub const DEFAULT_REFRESH_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPolicy {
    pub max_pending: usize,
    pub refresh_timeout: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            max_pending: DEFAULT_MAX_PENDING,
            refresh_timeout: Duration::from_secs(DEFAULT_REFRESH_TIMEOUT_SECS),
        }
    }
}

/// Why the system, rather than the user, ended a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForcedSignOut {
    /// The refresh exchange was refused or returned garbage.
    RefreshRejected,
    /// The session has no refresh token to exchange.
    RefreshTokenMissing,
    /// The backend rejected the access token for a reason a refresh cannot fix.
    TokenRevoked,
    /// New tokens were issued but could not be persisted.
    PersistFailed,
}

impl fmt::Display for ForcedSignOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ForcedSignOut::RefreshRejected => "refresh rejected",
            ForcedSignOut::RefreshTokenMissing => "no refresh token",
            ForcedSignOut::TokenRevoked => "token revoked",
            ForcedSignOut::PersistFailed => "could not persist refreshed tokens",
        };
        f.write_str(text)
    }
}

/// Snapshot of what a refresh would exchange, tagged with the session
/// generation it belongs to.
#[derive(Clone)]
pub struct RefreshTicket {
    pub generation: u64,
    pub refresh_token: Option<String>,
}

impl fmt::Debug for RefreshTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshTicket")
            .field("generation", &self.generation)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Tokens persisted and installed on the client.
    Applied,
    /// The session the refresh started from is gone; tokens were discarded.
    Superseded,
}

/// Session-side handlers the refresh path calls back into.
pub trait TokenManager: Send + Sync {
    /// Current generation and refresh token, or `None` when signed out.
    fn refresh_ticket(&self) -> Option<RefreshTicket>;

    /// Persist `tokens` and install them on the client, unless the session of
    /// `generation` has been replaced in the meantime.
    fn refreshed_token_updated(
        &self,
        generation: u64,
        tokens: TokenPair,
    ) -> BoxFuture<'_, Result<RefreshOutcome, StorageError>>;

    /// Tear down the session of `generation`. A no-op for any other generation.
    fn force_sign_out(&self, generation: u64, reason: ForcedSignOut) -> BoxFuture<'_, ()>;
}

/// A request parked until the refresh finishes.
struct PendingRequest {
    request: ApiRequest,
    headers: HeaderBag,
    reason: UnauthorizedReason,
    reply: oneshot::Sender<Result<ApiResponse, ApiError>>,
}

#[derive(Default)]
struct RefreshState {
    in_flight: bool,
    pending: VecDeque<PendingRequest>,
}

struct Registered {
    id: u64,
    manager: Weak<dyn TokenManager>,
}

struct Shared {
    policy: RefreshPolicy,
    state: Mutex<RefreshState>,
    manager: Mutex<Option<Registered>>,
    next_registration: AtomicU64,
    refresh_count: AtomicU64,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn registered(&self) -> MutexGuard<'_, Option<Registered>> {
        self.manager.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clear the in-flight flag and hand back everything that was waiting.
    fn finish(&self) -> VecDeque<PendingRequest> {
        let mut state = self.state();
        state.in_flight = false;
        std::mem::take(&mut state.pending)
    }

    fn revoke(&self, id: u64) {
        {
            let mut registered = self.registered();
            if registered.as_ref().map(|r| r.id) != Some(id) {
                return;
            }
            *registered = None;
        }
        // Dropping the senders releases every waiter with the original error.
        let abandoned = std::mem::take(&mut self.state().pending);
        debug!(abandoned = abandoned.len(), "Token manager unregistered");
    }
}

/// Handle returned by `ApiClient::register_token_manager`.
/// Dropping it (or calling `unsubscribe`) revokes the registration.
pub struct Registration {
    id: u64,
    shared: Weak<Shared>,
}

impl Registration {
    /// Consumes the handle; `Drop` does the revoking.
    pub fn unsubscribe(self) {}
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.revoke(self.id);
        }
    }
}

enum Admission {
    Wait {
        reply: oneshot::Receiver<Result<ApiResponse, ApiError>>,
        start_refresh: bool,
    },
    /// A refresh already finished after this request was sent.
    Replay {
        request: ApiRequest,
        headers: HeaderBag,
        token: String,
    },
    Reject(UnauthorizedReason),
    Overflow,
}

enum RefreshFailure {
    /// Nobody to refresh for (signed out, or manager dropped).
    NoSession,
    Transient(ApiError),
    Forced {
        generation: u64,
        reason: ForcedSignOut,
        detail: String,
    },
    Superseded,
}

fn enqueue(
    state: &mut RefreshState,
    request: ApiRequest,
    headers: HeaderBag,
    reason: UnauthorizedReason,
) -> oneshot::Receiver<Result<ApiResponse, ApiError>> {
    let (reply, rx) = oneshot::channel();
    state.pending.push_back(PendingRequest {
        request,
        headers,
        reason,
        reply,
    });
    rx
}

/// Coordinates refreshes for one `ApiClient`. Clone shares the same state.
#[derive(Clone)]
pub struct RefreshInterceptor {
    shared: Arc<Shared>,
}

impl RefreshInterceptor {
    pub fn new(policy: RefreshPolicy) -> Self {
        Self {
            shared: Arc::new(Shared {
                policy,
                state: Mutex::new(RefreshState::default()),
                manager: Mutex::new(None),
                next_registration: AtomicU64::new(1),
                refresh_count: AtomicU64::new(0),
            }),
        }
    }

    pub fn policy(&self) -> RefreshPolicy {
        self.shared.policy
    }

    pub(crate) fn register(&self, manager: Weak<dyn TokenManager>) -> Registration {
        let id = self.shared.next_registration.fetch_add(1, Ordering::SeqCst);
        let replaced = self
            .shared
            .registered()
            .replace(Registered { id, manager })
            .is_some();
        debug!(id, replaced, "Token manager registered");
        Registration {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn has_token_manager(&self) -> bool {
        self.manager().is_some()
    }

    pub fn is_refreshing(&self) -> bool {
        self.shared.state().in_flight
    }

    /// Requests currently parked behind a refresh.
    pub fn pending_len(&self) -> usize {
        self.shared.state().pending.len()
    }

    /// Number of refresh exchanges sent since creation.
    pub fn refresh_count(&self) -> u64 {
        self.shared.refresh_count.load(Ordering::SeqCst)
    }

    fn manager(&self) -> Option<Arc<dyn TokenManager>> {
        self.shared
            .registered()
            .as_ref()
            .and_then(|r| r.manager.upgrade())
    }

    /// Resolve a request that came back 401 after being sent with `headers`.
    pub(crate) async fn handle_unauthorized(
        &self,
        client: &ApiClient,
        request: ApiRequest,
        headers: HeaderBag,
        reason: UnauthorizedReason,
    ) -> Result<ApiResponse, ApiError> {
        let Some(sent_with) = headers.bearer_token().map(str::to_owned) else {
            return Err(ApiError::Unauthorized(reason));
        };
        let Some(manager) = self.manager() else {
            return Err(ApiError::Unauthorized(reason));
        };

        if !reason.is_token_failure() {
            if let Some(ticket) = manager.refresh_ticket() {
                warn!(%reason, "Access token rejected, signing out");
                manager
                    .force_sign_out(ticket.generation, ForcedSignOut::TokenRevoked)
                    .await;
            }
            return Err(ApiError::Unauthorized(reason));
        }
        drop(manager);

        let fallback = reason.clone();
        let limit = self.shared.policy.max_pending;
        let admission = {
            let mut state = self.shared.state();
            if state.in_flight && state.pending.len() >= limit {
                Admission::Overflow
            } else if state.in_flight {
                Admission::Wait {
                    reply: enqueue(&mut state, request, headers, reason),
                    start_refresh: false,
                }
            } else {
                match client.access_token() {
                    Some(current) if current == sent_with => {
                        state.in_flight = true;
                        Admission::Wait {
                            reply: enqueue(&mut state, request, headers, reason),
                            start_refresh: true,
                        }
                    }
                    Some(current) => Admission::Replay {
                        request,
                        headers,
                        token: current,
                    },
                    None => Admission::Reject(reason),
                }
            }
        };

        match admission {
            Admission::Wait { reply, start_refresh } => {
                if start_refresh {
                    self.spawn_refresh(client.clone());
                }
                reply
                    .await
                    .unwrap_or_else(|_| Err(ApiError::Unauthorized(fallback)))
            }
            Admission::Replay {
                request,
                headers,
                token,
            } => {
                debug!(path = %request.path, "Token already refreshed, replaying request");
                client
                    .send_with_headers(&request, &headers.with_bearer(&token))
                    .await
            }
            Admission::Reject(reason) => Err(ApiError::Unauthorized(reason)),
            Admission::Overflow => {
                warn!(limit, "Refresh queue full, refusing request");
                Err(ApiError::QueueOverflow { limit })
            }
        }
    }

    // The refresh runs detached so a caller that gives up cannot leave the
    // in-flight flag set.
    fn spawn_refresh(&self, client: ApiClient) {
        let interceptor = self.clone();
        tokio::spawn(async move { interceptor.run_refresh(client).await });
    }

    async fn run_refresh(self, client: ApiClient) {
        let manager = self.manager();
        let result = match &manager {
            Some(manager) => self.exchange(&client, manager.as_ref()).await,
            None => Err(RefreshFailure::NoSession),
        };

        match result {
            Ok(access_token) => {
                let batch = self.shared.finish();
                info!(replayed = batch.len(), "Session refreshed, replaying queued requests");
                // join_all polls in order, so replays are sent in queue order.
                let replays = batch.into_iter().map(|entry| {
                    let client = &client;
                    let token = access_token.as_str();
                    async move {
                        let headers = entry.headers.with_bearer(token);
                        let result = client.send_with_headers(&entry.request, &headers).await;
                        let _ = entry.reply.send(result);
                    }
                });
                join_all(replays).await;
            }
            Err(failure) => {
                match &failure {
                    RefreshFailure::Forced {
                        generation,
                        reason,
                        detail,
                    } => {
                        let error = ApiError::RefreshFailed(detail.clone());
                        warn!(error = %error, %reason, "Session refresh failed, signing out");
                        if let Some(manager) = &manager {
                            manager.force_sign_out(*generation, *reason).await;
                        }
                    }
                    RefreshFailure::Transient(error) => {
                        warn!(error = %error, "Session refresh failed, keeping session for a later retry");
                    }
                    RefreshFailure::Superseded => {
                        debug!("Session changed during refresh, discarding result");
                    }
                    RefreshFailure::NoSession => {
                        debug!("No session to refresh");
                    }
                }

                let batch = self.shared.finish();
                for entry in batch {
                    let _ = entry.reply.send(Err(ApiError::Unauthorized(entry.reason)));
                }
            }
        }
    }

    async fn exchange(&self, client: &ApiClient, manager: &dyn TokenManager) -> Result<String, RefreshFailure> {
        let ticket = manager.refresh_ticket().ok_or(RefreshFailure::NoSession)?;
        let generation = ticket.generation;
        let Some(refresh_token) = ticket.refresh_token.filter(|t| !t.is_empty()) else {
            return Err(RefreshFailure::Forced {
                generation,
                reason: ForcedSignOut::RefreshTokenMissing,
                detail: "session has no refresh token".to_string(),
            });
        };

        self.shared.refresh_count.fetch_add(1, Ordering::SeqCst);
        info!(generation, "Access token expired, refreshing session");

        let exchanged = tokio::time::timeout(
            self.shared.policy.refresh_timeout,
            client.refresh_session(&refresh_token),
        )
        .await;
        let response = match exchanged {
            Err(_) => {
                return Err(RefreshFailure::Transient(ApiError::Timeout(
                    "session refresh".to_string(),
                )))
            }
            Ok(Err(e)) if e.is_transient() => return Err(RefreshFailure::Transient(e)),
            Ok(Err(e)) => {
                return Err(RefreshFailure::Forced {
                    generation,
                    reason: ForcedSignOut::RefreshRejected,
                    detail: e.to_string(),
                })
            }
            Ok(Ok(response)) => response,
        };

        // The backend may keep the refresh token unchanged and omit it.
        let tokens = TokenPair::new(
            response.token,
            response.refresh_token.or(Some(refresh_token)),
        );
        let access_token = tokens.access_token.clone();

        match manager.refreshed_token_updated(generation, tokens).await {
            Ok(RefreshOutcome::Applied) => Ok(access_token),
            Ok(RefreshOutcome::Superseded) => Err(RefreshFailure::Superseded),
            Err(e) => Err(RefreshFailure::Forced {
                generation,
                reason: ForcedSignOut::PersistFailed,
                detail: e.to_string(),
            }),
        }
    }
}
