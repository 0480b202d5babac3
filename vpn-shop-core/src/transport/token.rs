//! Single-flight token cache.
//!
//! Each client instance owns one [`TokenCache`]. When the token is missing,
//! exactly one caller runs the refresh while every other caller parks on a
//! [`Notify`] and then reuses the leader's outcome, failure included.
//!
//! The leader holds a [`RefreshGuard`]. If the leader's future is dropped
//! mid-refresh, the guard clears the in-progress flag and wakes the waiters,
//! one of which then becomes the new leader.

use std::{future::Future, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{Result, ShopError};

#[derive(Debug, Default)]
struct TokenState {
    token: Option<Arc<str>>,
    refreshing: bool,
    /// Bumped every time a refresh finishes, successfully or not.
    epoch: u64,
    /// Outcome of the latest finished refresh when it failed.
    last_failure: Option<ShopError>,
}

/// Current bearer token plus the machinery to refresh it once.
#[derive(Debug, Default)]
pub struct TokenCache {
    state: Mutex<TokenState>,
    notify: Notify,
}

impl TokenCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached token, if any.
    #[must_use]
    pub fn current(&self) -> Option<Arc<str>> {
        self.state.lock().token.clone()
    }

    /// Stores a token obtained out of band.
    pub fn seed(&self, token: impl Into<Arc<str>>) {
        let mut state = self.state.lock();
        state.token = Some(token.into());
        state.last_failure = None;
    }

    /// Clears the token only if it is still the one the caller used.
    ///
    /// Returns `true` when the token was cleared.
    pub fn invalidate(&self, used: &str) -> bool {
        let mut state = self.state.lock();
        if state.token.as_deref() == Some(used) {
            state.token = None;
            true
        } else {
            false
        }
    }

    /// Returns the cached token or runs `refresh` single-flight.
    ///
    /// # Errors
    ///
    /// Returns the refresh error. Callers that waited on another caller's
    /// refresh receive a clone of that caller's error.
    pub async fn get_or_refresh<F, Fut>(&self, refresh: F) -> Result<Arc<str>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before inspecting the state so a wake-up between the
            // check and the await cannot be lost.
            notified.as_mut().enable();

            let observed_epoch = {
                let mut state = self.state.lock();
                if let Some(token) = &state.token {
                    return Ok(Arc::clone(token));
                }
                if !state.refreshing {
                    state.refreshing = true;
                    break;
                }
                state.epoch
            };

            notified.await;

            let state = self.state.lock();
            if state.epoch != observed_epoch {
                if let Some(token) = &state.token {
                    return Ok(Arc::clone(token));
                }
                if let Some(failure) = &state.last_failure {
                    return Err(failure.clone());
                }
            }
            // Leader was cancelled, or the fresh token was already
            // invalidated. Go around and possibly lead.
        }

        let guard = RefreshGuard { cache: self, finished: false };
        let outcome = refresh().await;
        guard.finish(outcome)
    }

    #[cfg(test)]
    fn is_refreshing(&self) -> bool {
        self.state.lock().refreshing
    }
}

/// Releases the in-progress flag when the leader finishes or is dropped.
struct RefreshGuard<'a> {
    cache: &'a TokenCache,
    finished: bool,
}

impl RefreshGuard<'_> {
    fn finish(mut self, outcome: Result<String>) -> Result<Arc<str>> {
        self.finished = true;
        let result = {
            let mut state = self.cache.state.lock();
            state.refreshing = false;
            state.epoch = state.epoch.wrapping_add(1);
            match outcome {
                Ok(token) => {
                    let token: Arc<str> = token.into();
                    state.token = Some(Arc::clone(&token));
                    state.last_failure = None;
                    Ok(token)
                }
                Err(error) => {
                    state.last_failure = Some(error.clone());
                    Err(error)
                }
            }
        };
        self.cache.notify.notify_waiters();
        result
    }
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.cache.state.lock().refreshing = false;
        self.cache.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicU32, Ordering},
        time::Duration,
    };

    use super::*;

    #[tokio::test]
    async fn test_cached_token_skips_refresh() {
        let cache = TokenCache::new();
        cache.seed("seeded");

        let token = cache
            .get_or_refresh(|| async {
                Err(ShopError::InvalidInput("refresh must not run".to_owned()))
            })
            .await
            .unwrap();
        assert_eq!(&*token, "seeded");
    }

    #[tokio::test]
    async fn test_concurrent_callers_refresh_once() {
        let cache = Arc::new(TokenCache::new());
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_refresh(|| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok("fresh".to_owned())
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(&*handle.await.unwrap().unwrap(), "fresh");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_waiters_share_failure() {
        let cache = Arc::new(TokenCache::new());
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_refresh(|| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err(ShopError::Authentication {
                            service: "tax",
                            message: "bad password".to_owned(),
                        })
                    })
                    .await
            }));
        }

        for handle in handles {
            assert!(matches!(handle.await.unwrap(), Err(ShopError::Authentication { .. })));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!cache.is_refreshing());
    }

    #[tokio::test]
    async fn test_failure_does_not_stick() {
        let cache = TokenCache::new();
        let first = cache
            .get_or_refresh(|| async {
                Err(ShopError::RetryableTransport {
                    service: "tax",
                    status: Some(503),
                    message: String::new(),
                })
            })
            .await;
        assert!(first.is_err());

        let second = cache.get_or_refresh(|| async { Ok("recovered".to_owned()) }).await;
        assert_eq!(&*second.unwrap(), "recovered");
    }

    #[tokio::test]
    async fn test_cancelled_leader_releases_waiters() {
        let cache = Arc::new(TokenCache::new());

        let leader = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .get_or_refresh(|| async {
                        std::future::pending::<()>().await;
                        Ok("never".to_owned())
                    })
                    .await
            })
        };
        while !cache.is_refreshing() {
            tokio::task::yield_now().await;
        }

        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache.get_or_refresh(|| async { Ok("second".to_owned()) }).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        leader.abort();

        let token = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter must not hang")
            .unwrap()
            .unwrap();
        assert_eq!(&*token, "second");
        assert!(!cache.is_refreshing());
    }

    #[test]
    fn test_invalidate_is_compare_and_clear() {
        let cache = TokenCache::new();
        cache.seed("current");

        assert!(!cache.invalidate("stale"));
        assert_eq!(cache.current().as_deref(), Some("current"));

        assert!(cache.invalidate("current"));
        assert!(cache.current().is_none());
    }
}
