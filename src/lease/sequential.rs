//! The sequential lease: a cluster-wide singleton role.
//!
//! At most one queue instance holds the lease at a time. The holder runs
//! work that must not happen concurrently across nodes (the lease-set sweep).
//! The lease is acquired or renewed on every tick; a holder that misses its
//! renewals loses the role once the embedded expiry passes, and any other
//! instance can take it over on its next tick.
//!
//! Shutdown does not release the lease. It lapses on its own, which keeps a
//! restarting node from flapping the role.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{now_ms, Lease, LeaseManager, SEQUENTIAL_RESOURCE};
use crate::error::LeaseError;

/// What this instance knows about the sequential lease.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SequentialState {
    /// This instance does not hold the lease.
    #[default]
    Unclaimed,
    /// This instance holds the lease, valid until its expiry.
    Held(Lease),
}

impl SequentialState {
    /// Returns the lease if it is held and still valid at `now_ms`.
    pub fn valid_at(&self, now_ms: i64) -> Option<&Lease> {
        match self {
            SequentialState::Held(lease) if lease.is_valid_at(now_ms) => Some(lease),
            _ => None,
        }
    }
}

/// Acquires and renews the sequential lease for one queue instance.
pub struct SequentialLease {
    manager: LeaseManager,
    duration: Duration,
    state: watch::Sender<SequentialState>,
}

impl SequentialLease {
    pub fn new(manager: LeaseManager, duration: Duration) -> Self {
        let (state, _) = watch::channel(SequentialState::Unclaimed);
        Self {
            manager,
            duration,
            state,
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Subscribes to state changes.
    pub fn subscribe(&self) -> watch::Receiver<SequentialState> {
        self.state.subscribe()
    }

    /// Returns the held lease if it is still valid.
    pub fn current(&self) -> Option<Lease> {
        self.state.borrow().valid_at(now_ms()).cloned()
    }

    pub fn is_held(&self) -> bool {
        self.current().is_some()
    }

    /// Acquires the lease if unclaimed, renews it if held.
    ///
    /// Returns whether this instance holds the lease afterwards. Store
    /// failures leave the state untouched; a held lease then simply runs
    /// out if the store stays unreachable.
    pub async fn tick(&self) -> Result<bool, LeaseError> {
        let held = self.current();
        let next = match held {
            Some(lease) => self.manager.renew(&lease, self.duration).await,
            None => self.manager.acquire(SEQUENTIAL_RESOURCE, self.duration).await,
        };

        match next {
            Ok(lease) => {
                if !self.is_held() {
                    info!(
                        holder = %lease.holder,
                        expires_at = %lease.expires_at(),
                        "Acquired sequential lease"
                    );
                }
                self.state.send_replace(SequentialState::Held(lease));
                Ok(true)
            }
            Err(LeaseError::LeaseLost(_)) => {
                warn!("Lost sequential lease");
                self.state.send_replace(SequentialState::Unclaimed);
                Ok(false)
            }
            Err(err) if err.is_contention() => {
                debug!("Sequential lease is held elsewhere");
                self.state.send_replace(SequentialState::Unclaimed);
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Forgets the lease locally without touching the store.
    pub fn clear(&self) {
        self.state.send_replace(SequentialState::Unclaimed);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::store::MemoryStore;

    fn lease(holder: &str, store: Arc<MemoryStore>, duration: Duration) -> SequentialLease {
        SequentialLease::new(LeaseManager::new(store, holder), duration)
    }

    #[tokio::test]
    async fn test_only_one_holder() {
        let store = Arc::new(MemoryStore::new());
        let a = lease("a", store.clone(), Duration::from_secs(10));
        let b = lease("b", store.clone(), Duration::from_secs(10));

        assert!(a.tick().await.expect("tick a"));
        assert!(!b.tick().await.expect("tick b"));
        assert!(a.is_held());
        assert!(!b.is_held());

        let first = a.current().expect("held");
        assert!(a.tick().await.expect("renew"));
        let renewed = a.current().expect("still held");
        assert_eq!(first.id, renewed.id);
        assert!(renewed.expires_at_ms >= first.expires_at_ms);
    }

    #[tokio::test]
    async fn test_handover_after_expiry() {
        let store = Arc::new(MemoryStore::new());
        let a = lease("a", store.clone(), Duration::from_millis(50));
        let b = lease("b", store.clone(), Duration::from_secs(10));

        assert!(a.tick().await.expect("tick a"));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!a.is_held());

        assert!(b.tick().await.expect("takeover"));
        assert!(!a.tick().await.expect("a contends"));
        assert_eq!(b.current().expect("held").holder, "b");
    }

    #[tokio::test]
    async fn test_watch_and_clear() {
        let store = Arc::new(MemoryStore::new());
        let a = lease("a", store, Duration::from_secs(10));
        let mut rx = a.subscribe();

        a.tick().await.expect("tick");
        rx.changed().await.expect("state change");
        assert!(matches!(*rx.borrow(), SequentialState::Held(_)));

        a.clear();
        assert!(!a.is_held());
        assert_eq!(*rx.borrow_and_update(), SequentialState::Unclaimed);
    }
}
