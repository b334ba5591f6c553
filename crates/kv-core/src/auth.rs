//! Credential bridge: resolves credentials to bearer tokens, caches them per
//! credential identity and coalesces concurrent acquisitions.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use time::Duration;
use tracing::{debug, info};

use crate::credential::{AccessToken, Credential, CredentialId};
use crate::error::VaultResult;
use crate::retry::RetryPolicy;
use crate::service::TokenSource;

enum CacheEntry {
    Ready(Arc<AccessToken>),
    Pending(Arc<Flight>),
}

/// One in-flight token acquisition that late arrivals wait on.
struct Flight {
    outcome: Mutex<Option<VaultResult<Arc<AccessToken>>>>,
    done: Condvar,
}

impl Flight {
    fn new() -> Self {
        Self {
            outcome: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    fn complete(&self, outcome: VaultResult<Arc<AccessToken>>) {
        *self.outcome.lock() = Some(outcome);
        self.done.notify_all();
    }

    fn wait(&self) -> VaultResult<Arc<AccessToken>> {
        let mut outcome = self.outcome.lock();
        loop {
            if let Some(result) = outcome.as_ref() {
                return result.clone();
            }
            self.done.wait(&mut outcome);
        }
    }
}

/// Shared token cache in front of a [`TokenSource`].
///
/// The cache is independent of sessions: logging out of one session leaves
/// the token in place for every other session using the same credential.
pub struct CredentialBridge {
    source: Arc<dyn TokenSource>,
    retry: RetryPolicy,
    refresh_margin: Duration,
    entries: Mutex<HashMap<CredentialId, CacheEntry>>,
}

impl CredentialBridge {
    pub fn new(source: Arc<dyn TokenSource>, retry: RetryPolicy, refresh_margin: Duration) -> Self {
        Self {
            source,
            retry,
            refresh_margin,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return a fresh token for `credential`, acquiring one if needed.
    ///
    /// Only one acquisition per credential identity is ever in flight;
    /// concurrent callers wait for it and share its outcome.
    pub fn resolve(&self, credential: &Credential) -> VaultResult<Arc<AccessToken>> {
        let id = credential.id();
        let flight = {
            let mut entries = self.entries.lock();
            match entries.get(&id) {
                Some(CacheEntry::Ready(token)) if token.is_fresh(self.refresh_margin) => {
                    return Ok(Arc::clone(token));
                }
                Some(CacheEntry::Pending(flight)) => {
                    let flight = Arc::clone(flight);
                    drop(entries);
                    debug!("waiting for in-flight token acquisition for {:?}", id);
                    return flight.wait();
                }
                _ => {
                    let flight = Arc::new(Flight::new());
                    entries.insert(id.clone(), CacheEntry::Pending(Arc::clone(&flight)));
                    flight
                }
            }
        };

        let outcome = self
            .retry
            .run("token acquisition", || self.source.acquire(credential))
            .map(Arc::new);

        {
            let mut entries = self.entries.lock();
            let still_ours = matches!(
                entries.get(&id),
                Some(CacheEntry::Pending(pending)) if Arc::ptr_eq(pending, &flight)
            );
            if still_ours {
                match &outcome {
                    Ok(token) => {
                        entries.insert(id.clone(), CacheEntry::Ready(Arc::clone(token)));
                    }
                    Err(_) => {
                        entries.remove(&id);
                    }
                }
            }
        }
        if outcome.is_ok() {
            info!("acquired access token for {:?}", id);
        }
        flight.complete(outcome.clone());
        outcome
    }

    /// Drop `stale` from the cache so the next resolve fetches a new token.
    ///
    /// A token that has already been replaced is left alone.
    pub fn invalidate(&self, credential: &Credential, stale: &Arc<AccessToken>) {
        let id = credential.id();
        let mut entries = self.entries.lock();
        if let Some(CacheEntry::Ready(token)) = entries.get(&id) {
            if Arc::ptr_eq(token, stale) {
                debug!("invalidating cached token for {:?}", id);
                entries.remove(&id);
            }
        }
    }

    /// Forget every cached token.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn cached_len(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|entry| matches!(entry, CacheEntry::Ready(_)))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VaultError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        calls: AtomicUsize,
        lifetime: Duration,
    }

    impl TokenSource for CountingSource {
        fn acquire(&self, credential: &Credential) -> VaultResult<AccessToken> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            match credential {
                Credential::ManagedIdentity => {
                    Ok(AccessToken::expires_in(format!("token-{n}"), self.lifetime))
                }
                Credential::ClientSecret { .. } => Err(VaultError::Unauthorized("bad".into())),
            }
        }
    }

    fn bridge(lifetime: Duration) -> (Arc<CountingSource>, CredentialBridge) {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
            lifetime,
        });
        let bridge = CredentialBridge::new(
            source.clone(),
            RetryPolicy::none(),
            Duration::minutes(5),
        );
        (source, bridge)
    }

    #[test]
    fn tokens_are_cached() {
        let (source, bridge) = bridge(Duration::hours(1));
        let first = bridge.resolve(&Credential::ManagedIdentity).unwrap();
        let second = bridge.resolve(&Credential::ManagedIdentity).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn tokens_inside_refresh_margin_are_replaced() {
        let (source, bridge) = bridge(Duration::minutes(1));
        let first = bridge.resolve(&Credential::ManagedIdentity).unwrap();
        let second = bridge.resolve(&Credential::ManagedIdentity).unwrap();
        assert_ne!(first.secret(), second.secret());
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn invalidate_only_drops_the_stale_token() {
        let (source, bridge) = bridge(Duration::hours(1));
        let first = bridge.resolve(&Credential::ManagedIdentity).unwrap();
        bridge.invalidate(&Credential::ManagedIdentity, &first);
        let second = bridge.resolve(&Credential::ManagedIdentity).unwrap();
        bridge.invalidate(&Credential::ManagedIdentity, &first);
        let third = bridge.resolve(&Credential::ManagedIdentity).unwrap();
        assert!(Arc::ptr_eq(&second, &third));
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failures_are_not_cached() {
        let (source, bridge) = bridge(Duration::hours(1));
        let credential = Credential::from_pin(b"clientid=a;secret=b").unwrap();
        assert!(bridge.resolve(&credential).is_err());
        assert!(bridge.resolve(&credential).is_err());
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert_eq!(bridge.cached_len(), 0);
    }

    #[test]
    fn clear_forgets_everything() {
        let (_, bridge) = bridge(Duration::hours(1));
        bridge.resolve(&Credential::ManagedIdentity).unwrap();
        assert_eq!(bridge.cached_len(), 1);
        bridge.clear();
        assert_eq!(bridge.cached_len(), 0);
    }
}
