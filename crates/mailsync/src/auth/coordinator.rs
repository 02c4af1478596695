//! Single-flight OAuth token refresh
//!
//! Sync, the outbox and the queues can all discover an expired token at
//! the same moment. Only one refresh per account may be in flight; everyone
//! else waits for and shares its outcome.

use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use super::{CredentialStore, TokenRefresher};
use crate::gmail::ApiError;
use crate::models::{Account, OAuthCredential};

type Outcome = Result<Account, ApiError>;

/// A refresh in progress. Waiters block on `ready` until `outcome` is set.
#[derive(Default)]
struct Flight {
    outcome: Mutex<Option<Outcome>>,
    ready: Condvar,
}

impl Flight {
    fn wait(&self) -> Outcome {
        let mut slot = lock(&self.outcome);
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            slot = self.ready.wait(slot).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct TokenRefreshCoordinator {
    refresher: Arc<dyn TokenRefresher>,
    credentials: Option<Arc<dyn CredentialStore>>,
    in_flight: Mutex<HashMap<i64, Arc<Flight>>>,
    /// Most recent credential obtained per account
    latest: Mutex<HashMap<i64, OAuthCredential>>,
}

impl TokenRefreshCoordinator {
    pub fn new(refresher: Arc<dyn TokenRefresher>) -> Self {
        Self {
            refresher,
            credentials: None,
            in_flight: Mutex::new(HashMap::new()),
            latest: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_credential_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(store);
        self
    }

    /// Return an account whose token is not expired, refreshing if needed.
    ///
    /// An expired account without a refresh token is returned unchanged;
    /// the request made with it will surface the auth failure.
    pub fn ensure_fresh_token(&self, account: &Account) -> Result<Account, ApiError> {
        let account = self.with_latest_credential(account);
        if !account.is_expired() || account.credential.refresh_token.is_none() {
            return Ok(account);
        }
        self.refresh_single_flight(&account)
    }

    /// Refresh after the server rejected `account`'s access token.
    pub fn force_refresh(&self, account: &Account) -> Result<Account, ApiError> {
        if account.credential.refresh_token.is_none() {
            return Err(ApiError::ReauthRequired);
        }

        // Another caller may already have replaced the rejected token
        if let Some(cached) = lock(&self.latest).get(&account.id)
            && cached.access_token != account.credential.access_token
            && !cached.is_expired()
        {
            return Ok(account.with_credential(cached.clone()));
        }

        self.refresh_single_flight(account).map_err(|e| match e {
            ApiError::Unauthenticated => ApiError::ReauthRequired,
            other => other,
        })
    }

    /// Run `op` with a fresh token. A 401 triggers one refresh and one
    /// retry; a second 401 means the user has to sign in again.
    pub fn call_with_auth<T>(
        &self,
        account: &Account,
        op: impl Fn(&Account) -> Result<T, ApiError>,
    ) -> Result<T, ApiError> {
        let current = self.ensure_fresh_token(account)?;
        match op(&current) {
            Err(ApiError::Unauthenticated) => {
                debug!("[AUTH] Token rejected for {}, refreshing", account.email);
                let refreshed = self.force_refresh(&current)?;
                match op(&refreshed) {
                    Err(ApiError::Unauthenticated) => {
                        warn!("[AUTH] Token still rejected after refresh for {}", account.email);
                        Err(ApiError::ReauthRequired)
                    }
                    other => other,
                }
            }
            other => other,
        }
    }

    fn with_latest_credential(&self, account: &Account) -> Account {
        match lock(&self.latest).get(&account.id) {
            Some(cached) if !cached.is_expired() => account.with_credential(cached.clone()),
            _ => account.clone(),
        }
    }

    fn refresh_single_flight(&self, account: &Account) -> Outcome {
        let (flight, is_leader) = {
            let mut in_flight = lock(&self.in_flight);
            match in_flight.get(&account.id) {
                Some(flight) => (flight.clone(), false),
                None => {
                    // A refresh may have landed since the caller last looked
                    if let Some(cached) = lock(&self.latest).get(&account.id)
                        && cached.access_token != account.credential.access_token
                        && !cached.is_expired()
                    {
                        return Ok(account.with_credential(cached.clone()));
                    }
                    let flight = Arc::new(Flight::default());
                    in_flight.insert(account.id, flight.clone());
                    (flight, true)
                }
            }
        };

        if !is_leader {
            debug!("[AUTH] Joining refresh in flight for {}", account.email);
            return flight.wait();
        }

        let mut leader = Leader {
            coordinator: self,
            account_id: account.id,
            flight,
            published: false,
        };

        let outcome = self
            .refresher
            .refresh(account)
            .map(|credential| account.with_credential(credential));

        if let Ok(fresh) = &outcome {
            lock(&self.latest).insert(account.id, fresh.credential.clone());
            if let Some(store) = &self.credentials
                && let Err(e) = store.save_credential(account.id, &fresh.credential)
            {
                warn!("[AUTH] Failed to persist credential for {}: {:#}", account.email, e);
            }
            info!("[AUTH] Token refreshed for {}", account.email);
        }

        leader.publish(outcome.clone());
        outcome
    }

    #[cfg(test)]
    fn in_flight_count(&self) -> usize {
        lock(&self.in_flight).len()
    }
}

/// Publishes the leader's outcome. Dropping without publishing (a panic in
/// the refresher) still releases the waiters.
struct Leader<'a> {
    coordinator: &'a TokenRefreshCoordinator,
    account_id: i64,
    flight: Arc<Flight>,
    published: bool,
}

impl Leader<'_> {
    fn publish(&mut self, outcome: Outcome) {
        // Deregister before waking waiters so a late caller starts a new flight
        lock(&self.coordinator.in_flight).remove(&self.account_id);
        *lock(&self.flight.outcome) = Some(outcome);
        self.flight.ready.notify_all();
        self.published = true;
    }
}

impl Drop for Leader<'_> {
    fn drop(&mut self) {
        if !self.published {
            self.publish(Err(ApiError::Other("token refresh aborted".to_string())));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AccountDirectory, InMemoryAccounts};
    use chrono::{Duration, Utc};
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    struct CountingRefresher {
        calls: AtomicUsize,
        delay: std::time::Duration,
        result: Result<(), ApiError>,
    }

    impl CountingRefresher {
        fn ok(delay_ms: u64) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: std::time::Duration::from_millis(delay_ms),
                result: Ok(()),
            }
        }

        fn failing(err: ApiError) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: std::time::Duration::ZERO,
                result: Err(err),
            }
        }
    }

    impl TokenRefresher for CountingRefresher {
        fn refresh(&self, account: &Account) -> Result<OAuthCredential, ApiError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            thread::sleep(self.delay);
            self.result.clone()?;
            Ok(OAuthCredential {
                access_token: format!("fresh-{n}"),
                refresh_token: account.credential.refresh_token.clone(),
                expires_at: Some(Utc::now() + Duration::hours(1)),
            })
        }
    }

    fn expired_account() -> Account {
        let cred = OAuthCredential::new("stale")
            .with_refresh_token("r")
            .with_expires_at(Utc::now() - Duration::minutes(1));
        Account::new(1, "me@example.com", cred)
    }

    #[test]
    fn test_valid_token_is_returned_unchanged() {
        let refresher = Arc::new(CountingRefresher::ok(0));
        let coordinator = TokenRefreshCoordinator::new(refresher.clone());
        let account = Account::new(
            1,
            "me@example.com",
            OAuthCredential::new("good").with_expires_at(Utc::now() + Duration::hours(1)),
        );

        let result = coordinator.ensure_fresh_token(&account).unwrap();
        assert_eq!(result, account);
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_expired_without_refresh_token_is_returned_unchanged() {
        let refresher = Arc::new(CountingRefresher::ok(0));
        let coordinator = TokenRefreshCoordinator::new(refresher.clone());
        let mut account = expired_account();
        account.credential.refresh_token = None;

        let result = coordinator.ensure_fresh_token(&account).unwrap();
        assert_eq!(result.access_token(), "stale");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_concurrent_callers_share_one_refresh() {
        const CALLERS: usize = 8;
        let refresher = Arc::new(CountingRefresher::ok(100));
        let coordinator = Arc::new(TokenRefreshCoordinator::new(refresher.clone()));
        let barrier = Arc::new(Barrier::new(CALLERS));

        let handles: Vec<_> = (0..CALLERS)
            .map(|_| {
                let coordinator = coordinator.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    coordinator.ensure_fresh_token(&expired_account())
                })
            })
            .collect();

        for handle in handles {
            let account = handle.join().unwrap().unwrap();
            assert_eq!(account.access_token(), "fresh-1");
        }
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.in_flight_count(), 0);
    }

    #[test]
    fn test_failure_is_shared_and_slot_released() {
        let refresher = Arc::new(CountingRefresher::failing(ApiError::Timeout));
        let coordinator = TokenRefreshCoordinator::new(refresher.clone());

        assert_eq!(
            coordinator.ensure_fresh_token(&expired_account()).unwrap_err(),
            ApiError::Timeout
        );
        assert_eq!(coordinator.in_flight_count(), 0);

        // A later caller starts a new flight
        let _ = coordinator.ensure_fresh_token(&expired_account());
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_refreshed_credential_is_persisted_and_reused() {
        let refresher = Arc::new(CountingRefresher::ok(0));
        let accounts = Arc::new(InMemoryAccounts::new());
        accounts.upsert(expired_account());
        let coordinator =
            TokenRefreshCoordinator::new(refresher.clone()).with_credential_store(accounts.clone());

        coordinator.ensure_fresh_token(&expired_account()).unwrap();
        let again = coordinator.ensure_fresh_token(&expired_account()).unwrap();

        assert_eq!(again.access_token(), "fresh-1");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            accounts.account(1).map(|a| a.credential.access_token),
            Some("fresh-1".to_string())
        );
    }

    #[test]
    fn test_call_with_auth_retries_once_after_401() {
        let refresher = Arc::new(CountingRefresher::ok(0));
        let coordinator = TokenRefreshCoordinator::new(refresher.clone());
        let account = Account::new(
            1,
            "me@example.com",
            OAuthCredential::new("revoked").with_refresh_token("r"),
        );

        let result = coordinator.call_with_auth(&account, |a| {
            if a.access_token() == "revoked" {
                Err(ApiError::Unauthenticated)
            } else {
                Ok(a.access_token().to_string())
            }
        });
        assert_eq!(result.unwrap(), "fresh-1");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_call_with_auth_second_401_requires_reauth() {
        let refresher = Arc::new(CountingRefresher::ok(0));
        let coordinator = TokenRefreshCoordinator::new(refresher.clone());
        let account = Account::new(
            1,
            "me@example.com",
            OAuthCredential::new("revoked").with_refresh_token("r"),
        );

        let result: Result<(), _> =
            coordinator.call_with_auth(&account, |_| Err(ApiError::Unauthenticated));
        assert_eq!(result.unwrap_err(), ApiError::ReauthRequired);
    }

    #[test]
    fn test_call_with_auth_without_refresh_token_requires_reauth() {
        let refresher = Arc::new(CountingRefresher::ok(0));
        let coordinator = TokenRefreshCoordinator::new(refresher.clone());
        let account = Account::new(1, "me@example.com", OAuthCredential::new("revoked"));

        let result: Result<(), _> =
            coordinator.call_with_auth(&account, |_| Err(ApiError::Unauthenticated));
        assert_eq!(result.unwrap_err(), ApiError::ReauthRequired);
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
    }
}
