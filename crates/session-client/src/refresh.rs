//! Single-flight access token refresh
//!
//! The coordinator owns the only path that turns a refresh token into a new
//! access token. State is `Idle` or `Refreshing`, and the transition out of
//! `Idle` is claimed under one mutex, so two callers that see a 401 at the
//! same moment cannot both start an exchange. The second caller gets a clone
//! of the watch receiver the first one installed and waits for the same
//! outcome.
//!
//! The exchange itself runs on a spawned task. A caller that stops polling
//! its future does not cancel the refresh for everyone else, and the task
//! always returns the state to `Idle` before publishing the outcome.
//!
//! Ordering on success: the store is updated, then the state returns to
//! `Idle`, then waiters are woken. Any waiter that reads the store after
//! waking sees the new token.
//!
//! The store's session generation is captured when a refresh is claimed. If
//! a logout or login lands while the exchange is running, the result is
//! dropped: waiters get `SessionTerminated` after a logout and the new
//! credential after a login.

use std::sync::Arc;
use std::time::Duration;

use session_auth::{Credential, CredentialStore};
use tokio::sync::{Mutex, broadcast, watch};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::metrics;

/// Outcome shared with every caller attached to one refresh.
/// `Err` holds the termination reason.
type SharedOutcome = std::result::Result<Credential, String>;

enum RefreshState {
    Idle,
    Refreshing(watch::Receiver<Option<SharedOutcome>>),
}

/// Session lifecycle notifications for the consuming layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A refresh produced a new access token
    Refreshed,
    /// A refresh failed; credentials were cleared and the user must log in again
    Terminated { reason: String },
    /// Credentials were cleared on request
    LoggedOut,
}

struct Inner {
    store: Arc<CredentialStore>,
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
    state: Mutex<RefreshState>,
    events: broadcast::Sender<SessionEvent>,
}

/// Serializes refresh exchanges for one session.
///
/// Cloning is cheap and every clone shares the same state.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    /// `endpoint` is the absolute refresh URL; `timeout` bounds one exchange.
    pub fn new(
        store: Arc<CredentialStore>,
        client: reqwest::Client,
        endpoint: String,
        timeout: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(Inner {
                store,
                client,
                endpoint,
                timeout,
                state: Mutex::new(RefreshState::Idle),
                events,
            }),
        }
    }

    /// Obtain a new access token, joining an in-flight refresh if there is one.
    ///
    /// On failure the store has been cleared and the error is
    /// `Error::SessionTerminated`. Nothing is retried.
    pub async fn refresh(&self) -> Result<Credential> {
        self.join_or_start(None).await
    }

    /// Refresh on behalf of a request that was rejected while carrying
    /// `rejected` (or no token at all).
    ///
    /// If no refresh is running and the store already holds a different
    /// token, some other caller finished a refresh (or a login happened)
    /// after this request was sent; that token is returned without another
    /// exchange.
    pub async fn refresh_stale(&self, rejected: Option<&str>) -> Result<Credential> {
        self.join_or_start(Some(rejected)).await
    }

    /// Clear the session on request (logout).
    pub async fn logout(&self) -> Result<()> {
        self.inner
            .store
            .clear()
            .await
            .map_err(|e| Error::Storage(format!("clearing credentials: {e}")))?;
        let _ = self.inner.events.send(SessionEvent::LoggedOut);
        Ok(())
    }

    /// Subscribe to session lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Whether a refresh exchange is outstanding right now.
    pub async fn is_refreshing(&self) -> bool {
        matches!(
            &*self.inner.state.lock().await,
            RefreshState::Refreshing(rx) if rx.has_changed().is_ok()
        )
    }

    /// The credential store this coordinator writes to.
    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.inner.store
    }

    async fn join_or_start(&self, rejected: Option<Option<&str>>) -> Result<Credential> {
        let mut rx = {
            let mut state = self.inner.state.lock().await;
            // A closed channel means the refresh task died without
            // publishing; treat the slot as free.
            let in_flight = match &*state {
                RefreshState::Refreshing(rx) if rx.has_changed().is_ok() => Some(rx.clone()),
                _ => None,
            };

            match in_flight {
                Some(rx) => {
                    debug!("refresh in flight, waiting on it");
                    metrics::record_coalesced();
                    rx
                }
                None => {
                    if let Some(rejected) = rejected {
                        let current = self.inner.store.get();
                        if let Some(token) = &current.access_token
                            && !rejected.is_some_and(|r| token.matches(r))
                        {
                            debug!("credential replaced since the request was sent, reusing it");
                            metrics::record_coalesced();
                            return Ok(current);
                        }
                    }

                    let generation = self.inner.store.generation();
                    let (tx, rx) = watch::channel(None);
                    *state = RefreshState::Refreshing(rx.clone());
                    tokio::spawn(run_refresh(self.inner.clone(), tx, generation));
                    rx
                }
            }
        };

        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::SessionTerminated("refresh ended without an outcome".into()))?
            .clone();

        match outcome {
            Some(Ok(credential)) => Ok(credential),
            Some(Err(reason)) => Err(Error::SessionTerminated(reason)),
            None => Err(Error::SessionTerminated(
                "refresh ended without an outcome".into(),
            )),
        }
    }
}

/// Perform one exchange, settle the store, then wake every waiter.
///
/// `generation` is the store generation the refresh was claimed under.
async fn run_refresh(
    inner: Arc<Inner>,
    tx: watch::Sender<Option<SharedOutcome>>,
    generation: u64,
) {
    let (outcome, event) = match exchange(&inner).await {
        Ok(refreshed) => match inner
            .store
            .set_if_generation(generation, refreshed.access_token, refreshed.refresh_token)
            .await
        {
            Ok(false) => superseded(&inner),
            applied => {
                if let Err(e) = applied {
                    warn!(error = %e, "failed to persist refreshed token");
                }
                info!("access token refreshed");
                metrics::record_refresh("success");
                (Ok(inner.store.get()), Some(SessionEvent::Refreshed))
            }
        },
        Err(reason) => match inner.store.clear_if_generation(generation).await {
            Ok(false) => superseded(&inner),
            cleared => {
                warn!(error = %reason, "refresh failed, terminating session");
                if let Err(e) = cleared {
                    warn!(error = %e, "failed to persist cleared credentials");
                }
                metrics::record_refresh("terminated");
                let event = SessionEvent::Terminated {
                    reason: reason.clone(),
                };
                (Err(reason), Some(event))
            }
        },
    };

    {
        let mut state = inner.state.lock().await;
        *state = RefreshState::Idle;
        tx.send_replace(Some(outcome));
    }

    if let Some(event) = event {
        let _ = inner.events.send(event);
    }
}

/// Settle a refresh whose session was logged out or replaced mid-exchange.
///
/// The exchange result is discarded. No event is sent; the logout or login
/// already announced itself.
fn superseded(inner: &Inner) -> (SharedOutcome, Option<SessionEvent>) {
    metrics::record_refresh("superseded");
    let current = inner.store.get();
    if current.is_authenticated() {
        info!("session replaced during refresh, keeping the new login");
        (Ok(current), None)
    } else {
        info!("session ended during refresh, discarding the result");
        (
            Err("session ended while the refresh was in flight".to_string()),
            None,
        )
    }
}

async fn exchange(inner: &Inner) -> std::result::Result<session_auth::RefreshedToken, String> {
    let credential = inner.store.get();
    let refresh = credential
        .refresh_token()
        .ok_or_else(|| session_auth::Error::MissingRefreshToken.to_string())?;

    tokio::time::timeout(
        inner.timeout,
        session_auth::refresh_access_token(&inner.client, &inner.endpoint, refresh, inner.timeout),
    )
    .await
    .map_err(|_| format!("refresh timed out after {}ms", inner.timeout.as_millis()))?
    .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn logged_in_store() -> Arc<CredentialStore> {
        let store = CredentialStore::in_memory();
        store
            .login(
                "at_1".into(),
                Some("rt_1".into()),
                Some(serde_json::json!({"id": 1})),
            )
            .await
            .unwrap();
        Arc::new(store)
    }

    fn coordinator(server: &MockServer, store: Arc<CredentialStore>) -> RefreshCoordinator {
        RefreshCoordinator::new(
            store,
            reqwest::Client::new(),
            format!("{}/auth/refresh", server.uri()),
            Duration::from_secs(5),
        )
    }

    async fn mount_refresh(server: &MockServer, token: &str, delay: Duration, calls: u64) {
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(delay)
                    .set_body_json(serde_json::json!({"data": {"token": token}})),
            )
            .expect(calls)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn refresh_updates_store_before_returning() {
        let server = MockServer::start().await;
        mount_refresh(&server, "at_2", Duration::ZERO, 1).await;
        let store = logged_in_store().await;
        let coordinator = coordinator(&server, store.clone());

        let credential = coordinator.refresh().await.unwrap();

        assert_eq!(credential.access_token(), Some("at_2"));
        assert_eq!(store.get().access_token(), Some("at_2"));
        // Refresh token and user profile survive a refresh
        assert_eq!(store.get().refresh_token(), Some("rt_1"));
        assert!(store.get().user.is_some());
        assert!(!coordinator.is_refreshing().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_exchange() {
        let server = MockServer::start().await;
        mount_refresh(&server, "at_2", Duration::from_millis(200), 1).await;
        let coordinator = coordinator(&server, logged_in_store().await);

        let mut handles = vec![];
        for _ in 0..8 {
            let coordinator = coordinator.clone();
            handles.push(tokio::spawn(async move { coordinator.refresh().await }));
        }

        for h in handles {
            let credential = h.await.unwrap().unwrap();
            assert_eq!(credential.access_token(), Some("at_2"));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn failed_refresh_terminates_every_waiter() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_delay(Duration::from_millis(200))
                    .set_body_string("refresh token expired"),
            )
            .expect(1)
            .mount(&server)
            .await;
        let store = logged_in_store().await;
        let coordinator = coordinator(&server, store.clone());

        let mut handles = vec![];
        for _ in 0..4 {
            let coordinator = coordinator.clone();
            handles.push(tokio::spawn(async move { coordinator.refresh().await }));
        }

        for h in handles {
            let err = h.await.unwrap().unwrap_err();
            assert!(err.is_session_terminated(), "got {err:?}");
        }
        let cred = store.get();
        assert!(cred.access_token.is_none());
        assert!(cred.refresh_token.is_none());
        assert!(cred.user.is_none());
    }

    #[tokio::test]
    async fn missing_refresh_token_terminates_without_network() {
        let server = MockServer::start().await;
        mount_refresh(&server, "at_2", Duration::ZERO, 0).await;
        let store = Arc::new(CredentialStore::in_memory());
        store.login("at_1".into(), None, None).await.unwrap();
        let coordinator = coordinator(&server, store.clone());

        let err = coordinator.refresh().await.unwrap_err();

        assert!(err.to_string().contains("no refresh token"), "got {err}");
        assert!(!store.get().is_authenticated());
    }

    #[tokio::test]
    async fn stale_rejection_reuses_newer_token() {
        let server = MockServer::start().await;
        mount_refresh(&server, "at_3", Duration::ZERO, 0).await;
        let store = logged_in_store().await;
        store.set("at_2".into(), None).await.unwrap();
        let coordinator = coordinator(&server, store);

        let credential = coordinator.refresh_stale(Some("at_1")).await.unwrap();
        assert_eq!(credential.access_token(), Some("at_2"));
    }

    #[tokio::test]
    async fn stale_rejection_with_current_token_refreshes() {
        let server = MockServer::start().await;
        mount_refresh(&server, "at_2", Duration::ZERO, 1).await;
        let coordinator = coordinator(&server, logged_in_store().await);

        let credential = coordinator.refresh_stale(Some("at_1")).await.unwrap();
        assert_eq!(credential.access_token(), Some("at_2"));
    }

    #[tokio::test]
    async fn timeout_terminates_and_frees_the_slot() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_secs(2))
                    .set_body_json(serde_json::json!({"data": {"token": "late"}})),
            )
            .mount(&server)
            .await;
        let store = logged_in_store().await;
        let coordinator = RefreshCoordinator::new(
            store.clone(),
            reqwest::Client::new(),
            format!("{}/auth/refresh", server.uri()),
            Duration::from_millis(100),
        );

        let err = coordinator.refresh().await.unwrap_err();
        assert!(err.is_session_terminated());
        assert!(!coordinator.is_refreshing().await);
        assert!(!store.get().is_authenticated());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn abandoned_caller_does_not_strand_waiters() {
        let server = MockServer::start().await;
        mount_refresh(&server, "at_2", Duration::from_millis(300), 1).await;
        let coordinator = coordinator(&server, logged_in_store().await);

        let leader = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.refresh().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(coordinator.is_refreshing().await);
        leader.abort();

        let credential = coordinator.refresh().await.unwrap();
        assert_eq!(credential.access_token(), Some("at_2"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn logout_during_refresh_stays_logged_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        let server = MockServer::start().await;
        mount_refresh(&server, "at_2", Duration::from_millis(300), 1).await;
        let store = Arc::new(CredentialStore::load(path.clone()).await.unwrap());
        store
            .login("at_1".into(), Some("rt_1".into()), None)
            .await
            .unwrap();
        let coordinator = coordinator(&server, store.clone());
        let mut events = coordinator.subscribe();

        let refreshing = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.refresh().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        coordinator.logout().await.unwrap();

        let err = refreshing.await.unwrap().unwrap_err();
        assert!(err.is_session_terminated(), "got {err:?}");
        assert!(!store.get().is_authenticated());
        assert!(store.get().refresh_token().is_none());

        let reloaded = CredentialStore::load(path).await.unwrap();
        assert!(!reloaded.get().is_authenticated());

        assert_eq!(events.recv().await.unwrap(), SessionEvent::LoggedOut);
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn login_during_failed_refresh_keeps_new_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_delay(Duration::from_millis(300))
                    .set_body_string("refresh token expired"),
            )
            .expect(1)
            .mount(&server)
            .await;
        let store = logged_in_store().await;
        let coordinator = coordinator(&server, store.clone());
        let mut events = coordinator.subscribe();

        let refreshing = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.refresh().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        store
            .login("at_new".into(), Some("rt_new".into()), None)
            .await
            .unwrap();

        let credential = refreshing.await.unwrap().unwrap();
        assert_eq!(credential.access_token(), Some("at_new"));
        assert_eq!(store.get().access_token(), Some("at_new"));
        assert_eq!(store.get().refresh_token(), Some("rt_new"));
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn login_during_successful_refresh_is_not_overwritten() {
        let server = MockServer::start().await;
        mount_refresh(&server, "at_2", Duration::from_millis(300), 1).await;
        let store = logged_in_store().await;
        let coordinator = coordinator(&server, store.clone());

        let refreshing = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.refresh().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        store
            .login("at_new".into(), Some("rt_new".into()), None)
            .await
            .unwrap();

        let credential = refreshing.await.unwrap().unwrap();
        assert_eq!(credential.access_token(), Some("at_new"));
        assert_eq!(store.get().access_token(), Some("at_new"));
    }

    #[tokio::test]
    async fn logout_persist_failure_is_a_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let store_dir = dir.path().join("state");
        tokio::fs::create_dir(&store_dir).await.unwrap();
        let store = Arc::new(
            CredentialStore::load(store_dir.join("session.json"))
                .await
                .unwrap(),
        );
        store
            .login("at_1".into(), Some("rt_1".into()), None)
            .await
            .unwrap();
        tokio::fs::remove_dir_all(&store_dir).await.unwrap();
        let coordinator = RefreshCoordinator::new(
            store.clone(),
            reqwest::Client::new(),
            "http://unused/auth/refresh".into(),
            Duration::from_secs(1),
        );

        let err = coordinator.logout().await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)), "got {err:?}");
        assert!(!store.get().is_authenticated());
    }

    #[tokio::test]
    async fn events_report_refresh_and_termination() {
        let server = MockServer::start().await;
        mount_refresh(&server, "at_2", Duration::ZERO, 1).await;
        let store = logged_in_store().await;
        let coordinator = coordinator(&server, store.clone());
        let mut events = coordinator.subscribe();

        coordinator.refresh().await.unwrap();
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Refreshed);

        // Drop the refresh token so the next refresh fails locally
        store.clear().await.unwrap();
        store.login("at_3".into(), None, None).await.unwrap();
        coordinator.refresh().await.unwrap_err();
        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::Terminated { .. }
        ));

        coordinator.logout().await.unwrap();
        assert_eq!(events.recv().await.unwrap(), SessionEvent::LoggedOut);
    }
}
