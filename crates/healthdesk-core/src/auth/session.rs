//! Session state machine.
//!
//! `SessionManager` owns the single session state and is the only component
//! that talks to the identity service. Every operation runs with the state
//! lock held for its whole duration, so operations never interleave; the
//! identity calls are the only await points and each one is bounded by the
//! request timeout. Observers read `SessionSnapshot`s from a watch channel
//! and never block on the lock.
//!
//! Every failure to restore or renew a session ends in `Unauthenticated`
//! with storage cleared. A token that cannot be decoded is handled exactly
//! like a token the server revoked.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use super::credential::{Clock, Credential, CredentialCodec, SystemClock};
use super::guard::{RouteAccess, RouteGuard, Verdict};
use super::store::{TokenKey, TokenStore};
use super::AuthError;
use crate::api::{ApiError, IdentityService, Registration, RequestAuthorizer};

/// Default bound on a single identity service call.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum Phase {
    Initializing,
    Unauthenticated,
    Authenticated,
    Refreshing,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Initializing => write!(f, "Initializing"),
            Phase::Unauthenticated => write!(f, "Unauthenticated"),
            Phase::Authenticated => write!(f, "Authenticated"),
            Phase::Refreshing => write!(f, "Refreshing"),
        }
    }
}

/// Read-only view of the session handed to the view layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub phase: Phase,
    pub credential: Option<Credential>,
    /// The startup check has completed.
    pub initialized: bool,
}

impl SessionSnapshot {
    pub fn initial() -> Self {
        Self {
            phase: Phase::Initializing,
            credential: None,
            initialized: false,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.phase == Phase::Authenticated
    }

    pub fn is_privileged_actor(&self) -> bool {
        self.credential
            .as_ref()
            .map(Credential::is_privileged_actor)
            .unwrap_or(false)
    }
}

/// `active` is present iff `phase` is `Authenticated`, and `access_raw` is
/// present iff `active` is.
struct SessionState {
    phase: Phase,
    access_raw: Option<String>,
    refresh_raw: Option<String>,
    active: Option<Credential>,
    initialized: bool,
}

impl SessionState {
    fn new() -> Self {
        Self {
            phase: Phase::Initializing,
            access_raw: None,
            refresh_raw: None,
            active: None,
            initialized: false,
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            phase: self.phase,
            credential: self.active.clone(),
            initialized: self.initialized,
        }
    }
}

pub struct SessionManager {
    identity: Arc<dyn IdentityService>,
    store: Arc<dyn TokenStore>,
    authorizer: Arc<dyn RequestAuthorizer>,
    clock: Arc<dyn Clock>,
    codec: CredentialCodec,
    request_timeout: Duration,
    state: Mutex<SessionState>,
    snapshot: watch::Sender<SessionSnapshot>,
}

impl SessionManager {
    pub fn new(
        identity: Arc<dyn IdentityService>,
        store: Arc<dyn TokenStore>,
        authorizer: Arc<dyn RequestAuthorizer>,
    ) -> Self {
        let (snapshot, _) = watch::channel(SessionSnapshot::initial());
        Self {
            identity,
            store,
            authorizer,
            clock: Arc::new(SystemClock),
            codec: CredentialCodec::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            state: Mutex::new(SessionState::new()),
            snapshot,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    // ===== Observation =====

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver that is notified on every phase change.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn route_verdict(&self, access: RouteAccess) -> Verdict {
        RouteGuard::check(&self.snapshot(), access)
    }

    // ===== Operations =====

    /// Restore the persisted session. Runs once; later calls, including ones
    /// that queued behind the first, return the settled phase untouched.
    pub async fn initialize(&self) -> Phase {
        let mut state = self.state.lock().await;
        if state.initialized {
            debug!(phase = %state.phase, "Session already initialized");
            return state.phase;
        }

        self.restore(&mut state).await;
        state.initialized = true;
        self.publish(&state);
        info!(phase = %state.phase, "Session initialized");
        state.phase
    }

    /// Single login attempt. Nothing changes unless the service issues a
    /// decodable credential pair.
    pub async fn login(&self, identifier: &str, secret: &str) -> Result<Credential, AuthError> {
        let mut state = self
            .state
            .try_lock()
            .map_err(|_| AuthError::SessionOperationInProgress)?;

        let pair = self
            .call_identity(self.identity.login(identifier, secret))
            .await
            .inspect_err(|e| warn!(error = %e, "Login failed"))?;

        let credential = self
            .codec
            .decode(&pair.access_token)
            .inspect_err(|e| warn!(error = %e, "Login returned an undecodable access credential"))?;

        self.persist(TokenKey::Access, &pair.access_token);
        self.persist(TokenKey::Refresh, &pair.refresh_token);

        state.refresh_raw = Some(pair.refresh_token);
        state.initialized = true;
        self.activate(&mut state, pair.access_token, credential.clone());

        info!(subject = %credential.subject_id(), "Login successful");
        Ok(credential)
    }

    /// Drop the session everywhere. Cannot fail.
    pub async fn logout(&self) {
        let mut state = self.state.lock().await;
        state.initialized = true;
        self.clear_session(&mut state);
        info!("Logged out");
    }

    /// Trade the refresh credential for a new access credential. Any failure
    /// ends the session; the error is returned for diagnostics only.
    ///
    /// Like `login`, this settles the startup check if it has not run yet.
    pub async fn refresh(&self) -> Result<(), AuthError> {
        let mut state = self.state.lock().await;
        state.initialized = true;
        self.refresh_locked(&mut state).await
    }

    /// Reaction to a 401 from the API. `rejected` is the credential the
    /// failed request carried; if the session has already moved on to a
    /// different credential no second refresh is made.
    ///
    /// Returns whether the session is authenticated afterwards.
    pub async fn handle_unauthorized(&self, rejected: &str) -> bool {
        let mut state = self.state.lock().await;
        state.initialized = true;
        if state.phase == Phase::Authenticated && state.access_raw.as_deref() != Some(rejected) {
            debug!("Credential already renewed, skipping refresh");
            return true;
        }
        match self.refresh_locked(&mut state).await {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "Reactive refresh failed");
                false
            }
        }
    }

    /// Create an account. Session state is not touched; the new user still
    /// has to log in.
    pub async fn register(&self, registration: &Registration) -> Result<(), AuthError> {
        registration
            .validate()
            .map_err(AuthError::InvalidRegistration)?;

        self.call_identity(self.identity.register(registration))
            .await
            .inspect_err(|e| warn!(error = %e, "Registration failed"))
    }

    // ===== Transitions (state lock held) =====

    async fn restore(&self, state: &mut SessionState) {
        let access = self.read_stored(TokenKey::Access);
        let Some(access) = access else {
            debug!("No stored access credential");
            state.phase = Phase::Unauthenticated;
            self.authorizer.set_default_credential(None);
            return;
        };
        state.refresh_raw = self.read_stored(TokenKey::Refresh);

        match self.codec.decode(&access) {
            Err(e) => {
                warn!(error = %e, "Stored access credential is unreadable, clearing session");
                self.clear_session(state);
            }
            Ok(credential) if !self.codec.is_expired(&credential, self.clock.now()) => {
                debug!(expires_at = credential.expires_at(), "Stored access credential is valid");
                self.activate(state, access, credential);
            }
            Ok(_) => {
                info!("Stored access credential expired, attempting refresh");
                if let Err(e) = self.refresh_locked(state).await {
                    info!(error = %e, "Could not renew stored session");
                }
            }
        }
    }

    async fn refresh_locked(&self, state: &mut SessionState) -> Result<(), AuthError> {
        let refresh_token = match self.store.get(TokenKey::Refresh) {
            Ok(stored) => stored.or_else(|| state.refresh_raw.clone()),
            Err(e) => {
                warn!(error = %e, "Token storage unavailable, using in-memory refresh credential");
                state.refresh_raw.clone()
            }
        };

        let Some(refresh_token) = refresh_token else {
            info!("No refresh credential, ending session");
            self.clear_session(state);
            return Err(AuthError::NoRefreshCredential);
        };

        state.phase = Phase::Refreshing;
        state.active = None;
        state.access_raw = None;
        self.authorizer.set_default_credential(None);
        self.publish(state);

        let renewed = match self.call_identity(self.identity.refresh(&refresh_token)).await {
            Ok(renewed) => renewed,
            Err(e) => {
                warn!(error = %e, "Refresh failed, ending session");
                self.clear_session(state);
                return Err(e);
            }
        };

        let credential = match self.codec.decode(&renewed.access_token) {
            Ok(credential) => credential,
            Err(e) => {
                warn!(error = %e, "Refresh returned an undecodable access credential, ending session");
                self.clear_session(state);
                return Err(e);
            }
        };

        self.persist(TokenKey::Access, &renewed.access_token);
        if let Some(ref rotated) = renewed.refresh_token {
            self.persist(TokenKey::Refresh, rotated);
        }

        state.refresh_raw = Some(renewed.refresh_token.unwrap_or(refresh_token));
        self.activate(state, renewed.access_token, credential);
        info!("Access credential refreshed");
        Ok(())
    }

    fn activate(&self, state: &mut SessionState, access_raw: String, credential: Credential) {
        self.authorizer.set_default_credential(Some(&access_raw));
        state.access_raw = Some(access_raw);
        state.active = Some(credential);
        state.phase = Phase::Authenticated;
        self.publish(state);
    }

    fn clear_session(&self, state: &mut SessionState) {
        for key in [TokenKey::Access, TokenKey::Refresh] {
            if let Err(e) = self.store.remove(key) {
                warn!(error = %e, %key, "Failed to remove stored token");
            }
        }
        state.access_raw = None;
        state.refresh_raw = None;
        state.active = None;
        state.phase = Phase::Unauthenticated;
        self.authorizer.set_default_credential(None);
        self.publish(state);
    }

    fn publish(&self, state: &SessionState) {
        self.snapshot.send_replace(state.snapshot());
    }

    // ===== Collaborators =====

    fn read_stored(&self, key: TokenKey) -> Option<String> {
        match self.store.get(key) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, %key, "Failed to read stored token");
                None
            }
        }
    }

    /// Storage failures never block the in-memory session; the session just
    /// won't survive a restart.
    fn persist(&self, key: TokenKey, value: &str) {
        if let Err(e) = self.store.set(key, value) {
            warn!(error = %e, %key, "Failed to persist token, session will not survive a restart");
        }
    }

    async fn call_identity<T, F>(&self, request: F) -> Result<T, AuthError>
    where
        F: Future<Output = Result<T, ApiError>>,
    {
        match tokio::time::timeout(self.request_timeout, request).await {
            Ok(result) => result.map_err(AuthError::from),
            Err(_) => Err(AuthError::Timeout(self.request_timeout.as_secs())),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use super::*;
    use crate::api::{RefreshedTokens, TokenPair};
    use crate::auth::credential::tests::token_expiring_at;
    use crate::auth::store::MemoryTokenStore;

    const NOW: i64 = 1_750_000_000;

    struct FixedClock(AtomicI64);

    impl Clock for FixedClock {
        fn now(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    /// Identity service that answers from canned responses. `None` means reject.
    #[derive(Default)]
    struct FakeIdentity {
        login_pair: StdMutex<Option<TokenPair>>,
        refreshed: StdMutex<Option<RefreshedTokens>>,
        stall: AtomicBool,
        login_calls: AtomicUsize,
        refresh_calls: AtomicUsize,
        register_calls: AtomicUsize,
    }

    impl FakeIdentity {
        fn issuing(access: &str, refresh: &str) -> Self {
            let fake = Self::default();
            *fake.login_pair.lock().unwrap() = Some(TokenPair {
                access_token: access.to_string(),
                refresh_token: refresh.to_string(),
            });
            fake
        }

        fn refreshing_to(self, access: &str, refresh: Option<&str>) -> Self {
            *self.refreshed.lock().unwrap() = Some(RefreshedTokens {
                access_token: access.to_string(),
                refresh_token: refresh.map(str::to_string),
            });
            self
        }

        async fn maybe_stall(&self) {
            if self.stall.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
        }
    }

    #[async_trait]
    impl IdentityService for FakeIdentity {
        async fn login(&self, _identifier: &str, _secret: &str) -> Result<TokenPair, ApiError> {
            self.login_calls.fetch_add(1, Ordering::SeqCst);
            self.maybe_stall().await;
            self.login_pair
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| ApiError::Rejected("bad credentials".into()))
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<RefreshedTokens, ApiError> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            self.maybe_stall().await;
            self.refreshed
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| ApiError::Rejected("token_not_valid".into()))
        }

        async fn register(&self, _registration: &Registration) -> Result<(), ApiError> {
            self.register_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingAuthorizer {
        current: StdMutex<Option<String>>,
    }

    impl RecordingAuthorizer {
        fn current(&self) -> Option<String> {
            self.current.lock().unwrap().clone()
        }
    }

    impl RequestAuthorizer for RecordingAuthorizer {
        fn set_default_credential(&self, raw: Option<&str>) {
            *self.current.lock().unwrap() = raw.map(str::to_string);
        }
    }

    struct Harness {
        manager: Arc<SessionManager>,
        identity: Arc<FakeIdentity>,
        store: Arc<MemoryTokenStore>,
        authorizer: Arc<RecordingAuthorizer>,
    }

    fn harness(identity: FakeIdentity, store: MemoryTokenStore) -> Harness {
        let identity = Arc::new(identity);
        let store = Arc::new(store);
        let authorizer = Arc::new(RecordingAuthorizer::default());
        let manager = SessionManager::new(identity.clone(), store.clone(), authorizer.clone())
            .with_clock(Arc::new(FixedClock(AtomicI64::new(NOW))));
        Harness {
            manager: Arc::new(manager),
            identity,
            store,
            authorizer,
        }
    }

    fn store_with(access: Option<&str>, refresh: Option<&str>) -> MemoryTokenStore {
        let store = MemoryTokenStore::new();
        if let Some(access) = access {
            store.set(TokenKey::Access, access).unwrap();
        }
        if let Some(refresh) = refresh {
            store.set(TokenKey::Refresh, refresh).unwrap();
        }
        store
    }

    fn stored(store: &MemoryTokenStore, key: TokenKey) -> Option<String> {
        store.get(key).unwrap()
    }

    #[tokio::test]
    async fn test_initialize_with_empty_storage() {
        let h = harness(FakeIdentity::default(), MemoryTokenStore::new());

        assert_eq!(h.manager.snapshot(), SessionSnapshot::initial());
        assert_eq!(h.manager.initialize().await, Phase::Unauthenticated);

        let snapshot = h.manager.snapshot();
        assert!(snapshot.initialized);
        assert!(snapshot.credential.is_none());
        assert_eq!(h.identity.refresh_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.manager.route_verdict(RouteAccess::Protected), Verdict::DenyRedirectToLogin);
    }

    #[tokio::test]
    async fn test_initialize_with_valid_credential() {
        let access = token_expiring_at(NOW + 600);
        let h = harness(FakeIdentity::default(), store_with(Some(&access), Some("R")));

        assert_eq!(h.manager.initialize().await, Phase::Authenticated);

        let snapshot = h.manager.snapshot();
        assert_eq!(snapshot.credential.as_ref().unwrap().email(), "house@ppth.org");
        assert!(snapshot.is_privileged_actor());
        assert_eq!(h.authorizer.current(), Some(access));
        assert_eq!(h.identity.refresh_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.manager.route_verdict(RouteAccess::Protected), Verdict::Allow);
    }

    #[tokio::test]
    async fn test_initialize_expired_then_refresh_succeeds() {
        let expired = token_expiring_at(NOW - 1);
        let renewed = token_expiring_at(NOW + 300);
        let identity = FakeIdentity::default().refreshing_to(&renewed, None);
        let h = harness(identity, store_with(Some(&expired), Some("R")));

        assert_eq!(h.manager.initialize().await, Phase::Authenticated);
        assert_eq!(stored(&h.store, TokenKey::Access), Some(renewed.clone()));
        assert_eq!(stored(&h.store, TokenKey::Refresh).as_deref(), Some("R"));
        assert_eq!(h.authorizer.current(), Some(renewed));
        assert_eq!(h.identity.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_initialize_expired_at_exact_boundary_refreshes() {
        let expired = token_expiring_at(NOW);
        let h = harness(FakeIdentity::default(), store_with(Some(&expired), Some("R")));

        assert_eq!(h.manager.initialize().await, Phase::Unauthenticated);
        assert_eq!(h.identity.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_initialize_expired_then_refresh_rejected() {
        let expired = token_expiring_at(NOW - 1);
        let h = harness(FakeIdentity::default(), store_with(Some(&expired), Some("R")));

        assert_eq!(h.manager.initialize().await, Phase::Unauthenticated);
        assert_eq!(stored(&h.store, TokenKey::Access), None);
        assert_eq!(stored(&h.store, TokenKey::Refresh), None);
        assert_eq!(h.authorizer.current(), None);
    }

    #[tokio::test]
    async fn test_initialize_with_corrupt_credential_clears_storage() {
        let h = harness(
            FakeIdentity::default(),
            store_with(Some("definitely-not-a-jwt"), Some("R")),
        );

        assert_eq!(h.manager.initialize().await, Phase::Unauthenticated);
        assert_eq!(stored(&h.store, TokenKey::Access), None);
        assert_eq!(stored(&h.store, TokenKey::Refresh), None);
        assert_eq!(h.identity.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_initialize_twice_is_noop() {
        let expired = token_expiring_at(NOW - 1);
        let renewed = token_expiring_at(NOW + 300);
        let identity = FakeIdentity::default().refreshing_to(&renewed, None);
        let h = harness(identity, store_with(Some(&expired), Some("R")));

        assert_eq!(h.manager.initialize().await, Phase::Authenticated);
        assert_eq!(h.manager.initialize().await, Phase::Authenticated);
        assert_eq!(h.identity.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_initialize_runs_network_step_once() {
        let expired = token_expiring_at(NOW - 1);
        let renewed = token_expiring_at(NOW + 300);
        let identity = FakeIdentity::default().refreshing_to(&renewed, None);
        let h = harness(identity, store_with(Some(&expired), Some("R")));

        let (a, b) = tokio::join!(h.manager.initialize(), h.manager.initialize());
        assert_eq!(a, Phase::Authenticated);
        assert_eq!(b, Phase::Authenticated);
        assert_eq!(h.identity.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_login_then_logout() {
        let access = token_expiring_at(NOW + 600);
        let h = harness(FakeIdentity::issuing(&access, "R"), MemoryTokenStore::new());
        h.manager.initialize().await;

        let credential = h.manager.login("house@ppth.org", "vicodin").await.unwrap();
        assert_eq!(credential.subject_id(), "42");
        assert_eq!(h.manager.snapshot().phase, Phase::Authenticated);
        assert_eq!(stored(&h.store, TokenKey::Access), Some(access.clone()));
        assert_eq!(stored(&h.store, TokenKey::Refresh).as_deref(), Some("R"));
        assert_eq!(h.authorizer.current(), Some(access));

        h.manager.logout().await;
        assert_eq!(h.manager.snapshot().phase, Phase::Unauthenticated);
        assert!(h.manager.snapshot().credential.is_none());
        assert_eq!(stored(&h.store, TokenKey::Access), None);
        assert_eq!(stored(&h.store, TokenKey::Refresh), None);
        assert_eq!(h.authorizer.current(), None);
    }

    #[tokio::test]
    async fn test_rejected_login_changes_nothing() {
        let h = harness(FakeIdentity::default(), MemoryTokenStore::new());
        h.manager.initialize().await;

        let err = h.manager.login("a@b.com", "wrong").await.unwrap_err();
        assert!(matches!(err, AuthError::Rejected(_)));
        assert_eq!(err.user_message(), "Invalid email or password");
        assert_eq!(h.manager.snapshot().phase, Phase::Unauthenticated);
        assert_eq!(stored(&h.store, TokenKey::Access), None);
        assert_eq!(stored(&h.store, TokenKey::Refresh), None);
        assert_eq!(h.identity.login_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_login_with_undecodable_access_changes_nothing() {
        let h = harness(FakeIdentity::issuing("garbage", "R"), MemoryTokenStore::new());
        h.manager.initialize().await;

        let err = h.manager.login("a@b.com", "pw").await.unwrap_err();
        assert!(matches!(err, AuthError::MalformedCredential(_)));
        assert_eq!(h.manager.snapshot().phase, Phase::Unauthenticated);
        assert_eq!(stored(&h.store, TokenKey::Refresh), None);
    }

    #[tokio::test]
    async fn test_login_before_initialize_settles_startup() {
        let access = token_expiring_at(NOW + 600);
        let h = harness(FakeIdentity::issuing(&access, "R"), MemoryTokenStore::new());

        h.manager.login("a@b.com", "pw").await.unwrap();
        assert_eq!(h.manager.initialize().await, Phase::Authenticated);
        assert!(h.manager.snapshot().initialized);
    }

    #[tokio::test]
    async fn test_refresh_without_refresh_credential_logs_out() {
        let access = token_expiring_at(NOW + 600);
        let h = harness(FakeIdentity::default(), store_with(Some(&access), None));
        h.manager.initialize().await;
        assert_eq!(h.manager.snapshot().phase, Phase::Authenticated);

        let err = h.manager.refresh().await.unwrap_err();
        assert!(matches!(err, AuthError::NoRefreshCredential));
        assert_eq!(h.manager.snapshot().phase, Phase::Unauthenticated);
        assert_eq!(stored(&h.store, TokenKey::Access), None);
        assert_eq!(h.identity.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_refresh_persists_rotated_refresh_credential() {
        let access = token_expiring_at(NOW + 10);
        let renewed = token_expiring_at(NOW + 600);
        let identity = FakeIdentity::default().refreshing_to(&renewed, Some("R2"));
        let h = harness(identity, store_with(Some(&access), Some("R1")));
        h.manager.initialize().await;

        h.manager.refresh().await.unwrap();
        assert_eq!(h.manager.snapshot().phase, Phase::Authenticated);
        assert_eq!(stored(&h.store, TokenKey::Access), Some(renewed));
        assert_eq!(stored(&h.store, TokenKey::Refresh).as_deref(), Some("R2"));
    }

    #[tokio::test]
    async fn test_refresh_publishes_refreshing_then_settles() {
        let access = token_expiring_at(NOW + 10);
        let renewed = token_expiring_at(NOW + 600);
        let identity = FakeIdentity::default().refreshing_to(&renewed, None);
        let h = harness(identity, store_with(Some(&access), Some("R")));
        h.manager.initialize().await;

        let mut rx = h.manager.subscribe();
        rx.borrow_and_update();

        let manager = h.manager.clone();
        let observer = tokio::spawn(async move {
            let mut seen = Vec::new();
            while rx.changed().await.is_ok() {
                let phase = rx.borrow_and_update().phase;
                seen.push(phase);
                if phase != Phase::Refreshing {
                    break;
                }
            }
            seen
        });

        manager.refresh().await.unwrap();
        let seen = observer.await.unwrap();
        assert_eq!(seen.last(), Some(&Phase::Authenticated));
        assert!(seen.iter().all(|p| *p != Phase::Unauthenticated));
    }

    #[tokio::test]
    async fn test_refresh_with_undecodable_access_ends_session() {
        let access = token_expiring_at(NOW + 10);
        let identity = FakeIdentity::default().refreshing_to("garbage", None);
        let h = harness(identity, store_with(Some(&access), Some("R")));
        assert_eq!(h.manager.initialize().await, Phase::Authenticated);

        let err = h.manager.refresh().await.unwrap_err();
        assert!(matches!(err, AuthError::MalformedCredential(_)));
        assert_eq!(h.manager.snapshot().phase, Phase::Unauthenticated);
        assert!(h.manager.snapshot().credential.is_none());
        assert_eq!(stored(&h.store, TokenKey::Access), None);
        assert_eq!(stored(&h.store, TokenKey::Refresh), None);
        assert_eq!(h.authorizer.current(), None);
    }

    #[tokio::test]
    async fn test_initialize_expired_then_undecodable_refresh() {
        let expired = token_expiring_at(NOW - 1);
        let identity = FakeIdentity::default().refreshing_to("garbage", Some("R2"));
        let h = harness(identity, store_with(Some(&expired), Some("R")));

        assert_eq!(h.manager.initialize().await, Phase::Unauthenticated);
        assert!(h.manager.snapshot().initialized);
        assert_eq!(stored(&h.store, TokenKey::Access), None);
        assert_eq!(stored(&h.store, TokenKey::Refresh), None);
        assert_eq!(h.authorizer.current(), None);
        assert_eq!(h.identity.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_before_initialize_settles_startup() {
        let renewed = token_expiring_at(NOW + 600);
        let identity = FakeIdentity::default().refreshing_to(&renewed, None);
        let h = harness(identity, store_with(None, Some("R")));

        h.manager.refresh().await.unwrap();
        let snapshot = h.manager.snapshot();
        assert_eq!(snapshot.phase, Phase::Authenticated);
        assert!(snapshot.initialized);
        assert_eq!(h.manager.route_verdict(RouteAccess::Protected), Verdict::Allow);

        assert_eq!(h.manager.initialize().await, Phase::Authenticated);
        assert_eq!(h.identity.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handle_unauthorized_before_initialize_settles_startup() {
        let h = harness(FakeIdentity::default(), MemoryTokenStore::new());

        assert!(!h.manager.handle_unauthorized("stale").await);
        assert!(h.manager.snapshot().initialized);
        assert_eq!(
            h.manager.route_verdict(RouteAccess::Protected),
            Verdict::DenyRedirectToLogin
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_refresh_times_out_to_unauthenticated() {
        let expired = token_expiring_at(NOW - 1);
        let identity = FakeIdentity::default().refreshing_to(&token_expiring_at(NOW + 60), None);
        identity.stall.store(true, Ordering::SeqCst);
        let h = harness(identity, store_with(Some(&expired), Some("R")));

        assert_eq!(h.manager.initialize().await, Phase::Unauthenticated);
        assert_eq!(stored(&h.store, TokenKey::Refresh), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_login_times_out() {
        let identity = FakeIdentity::issuing(&token_expiring_at(NOW + 60), "R");
        identity.stall.store(true, Ordering::SeqCst);
        let h = harness(identity, MemoryTokenStore::new());
        h.manager.initialize().await;

        let err = h.manager.login("a@b.com", "pw").await.unwrap_err();
        assert!(matches!(err, AuthError::Timeout(15)));
        assert_eq!(h.manager.snapshot().phase, Phase::Unauthenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_rejected_while_operation_in_flight() {
        let expired = token_expiring_at(NOW - 1);
        let identity = FakeIdentity::issuing(&token_expiring_at(NOW + 60), "R");
        identity.stall.store(true, Ordering::SeqCst);
        let h = harness(identity, store_with(Some(&expired), Some("R")));

        let manager = h.manager.clone();
        let init = tokio::spawn(async move { manager.initialize().await });

        // Let initialize take the lock and reach the stalled refresh.
        while h.identity.refresh_calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(h.manager.snapshot().phase, Phase::Refreshing);
        assert_eq!(
            h.manager.route_verdict(RouteAccess::Protected),
            Verdict::PendingShowLoadingIndicator
        );

        let err = h.manager.login("a@b.com", "pw").await.unwrap_err();
        assert!(matches!(err, AuthError::SessionOperationInProgress));
        assert_eq!(h.identity.login_calls.load(Ordering::SeqCst), 0);

        assert_eq!(init.await.unwrap(), Phase::Unauthenticated);
    }

    #[tokio::test]
    async fn test_storage_unavailable_keeps_in_memory_session() {
        let access = token_expiring_at(NOW + 600);
        let store = MemoryTokenStore::new();
        store.set_available(false);
        let h = harness(FakeIdentity::issuing(&access, "R"), store);
        h.manager.initialize().await;

        h.manager.login("a@b.com", "pw").await.unwrap();
        assert_eq!(h.manager.snapshot().phase, Phase::Authenticated);
        assert_eq!(h.authorizer.current(), Some(access));

        h.store.set_available(true);
        assert_eq!(stored(&h.store, TokenKey::Access), None);
    }

    #[tokio::test]
    async fn test_refresh_uses_in_memory_credential_when_storage_unavailable() {
        let access = token_expiring_at(NOW + 600);
        let renewed = token_expiring_at(NOW + 900);
        let identity = FakeIdentity::issuing(&access, "R").refreshing_to(&renewed, None);
        let h = harness(identity, MemoryTokenStore::new());
        h.manager.initialize().await;
        h.manager.login("a@b.com", "pw").await.unwrap();

        h.store.set_available(false);
        h.manager.refresh().await.unwrap();
        assert_eq!(h.authorizer.current(), Some(renewed));
    }

    #[tokio::test]
    async fn test_handle_unauthorized_skips_when_already_renewed() {
        let access = token_expiring_at(NOW + 10);
        let renewed = token_expiring_at(NOW + 600);
        let identity = FakeIdentity::default().refreshing_to(&renewed, None);
        let h = harness(identity, store_with(Some(&access), Some("R")));
        h.manager.initialize().await;

        assert!(h.manager.handle_unauthorized(&access).await);
        assert!(h.manager.handle_unauthorized(&access).await);
        assert_eq!(h.identity.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handle_unauthorized_failure_logs_out() {
        let access = token_expiring_at(NOW + 10);
        let h = harness(FakeIdentity::default(), store_with(Some(&access), Some("R")));
        h.manager.initialize().await;

        assert!(!h.manager.handle_unauthorized(&access).await);
        assert_eq!(h.manager.snapshot().phase, Phase::Unauthenticated);
    }

    #[tokio::test]
    async fn test_register_validates_before_calling_service() {
        let h = harness(FakeIdentity::default(), MemoryTokenStore::new());

        let bad = Registration::new("Lisa", "Cuddy", "cuddy@ppth.org", "a", "b");
        let err = h.manager.register(&bad).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidRegistration(ref m) if m == "Passwords do not match"));
        assert_eq!(h.identity.register_calls.load(Ordering::SeqCst), 0);

        let good = Registration::new("Lisa", "Cuddy", "cuddy@ppth.org", "a", "a");
        h.manager.register(&good).await.unwrap();
        assert_eq!(h.identity.register_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.manager.snapshot().phase, Phase::Initializing);
    }
}
