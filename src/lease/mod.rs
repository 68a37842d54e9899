//! Time-boxed exclusive claims over store resources.
//!
//! A lease is an opaque token stored under the resource's lease key. The
//! token embeds its own expiry, so validity is always decided by comparing
//! that timestamp against the current time. Nothing sweeps expired leases:
//! an expired token is simply overwritten by the next acquirer.
//!
//! Two lease domains share this machinery:
//!
//! - item leases (`item:<id>`), held by an executor while a handler runs
//! - the sequential lease, a cluster-wide singleton role (see [`sequential`])

pub mod sequential;

pub use sequential::{SequentialLease, SequentialState};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::error::{LeaseError, StoreError};
use crate::queue::item::millis_to_datetime;
use crate::store::{LeaseOutcome, QueueStore};

/// Resource name of the cluster-wide sequential role.
pub const SEQUENTIAL_RESOURCE: &str = "sequential";

/// Returns the current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Returns the lease resource name for an item.
pub fn item_resource(item_id: &str) -> String {
    format!("item:{item_id}")
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// A lease token bound to a resource, a holder and an expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Resource the lease covers.
    pub resource: String,
    /// Unique ID of this claim. Kept across renewals.
    pub id: Uuid,
    /// Identity of the holder (node or executor).
    pub holder: String,
    /// Expiry, in epoch milliseconds.
    pub expires_at_ms: i64,
}

impl Lease {
    /// Creates a new claim expiring `duration` after `now_ms`.
    pub fn new(
        resource: impl Into<String>,
        holder: impl Into<String>,
        now_ms: i64,
        duration: Duration,
    ) -> Self {
        Self {
            resource: resource.into(),
            id: Uuid::new_v4(),
            holder: holder.into(),
            expires_at_ms: now_ms.saturating_add(duration_ms(duration)),
        }
    }

    /// Returns the same claim with a new expiry.
    pub fn renewed(&self, now_ms: i64, duration: Duration) -> Self {
        Self {
            expires_at_ms: now_ms.saturating_add(duration_ms(duration)),
            ..self.clone()
        }
    }

    /// Encodes the lease as the token stored in the backend:
    /// `<expires_ms>.<uuid>.<holder>`.
    pub fn token(&self) -> String {
        format!("{}.{}.{}", self.expires_at_ms, self.id, self.holder)
    }

    /// Decodes a stored token.
    pub fn parse(resource: impl Into<String>, token: &str) -> Result<Self, StoreError> {
        let malformed = || StoreError::MalformedLease(token.to_string());
        let mut parts = token.splitn(3, '.');
        let expires_at_ms = parts
            .next()
            .and_then(|p| p.parse::<i64>().ok())
            .ok_or_else(malformed)?;
        let id = parts
            .next()
            .and_then(|p| Uuid::parse_str(p).ok())
            .ok_or_else(malformed)?;
        let holder = parts.next().ok_or_else(malformed)?.to_string();

        Ok(Self {
            resource: resource.into(),
            id,
            holder,
            expires_at_ms,
        })
    }

    /// Returns whether the lease is still valid at `now_ms`.
    pub fn is_valid_at(&self, now_ms: i64) -> bool {
        self.expires_at_ms > now_ms
    }

    /// Returns the expiry as a timestamp.
    pub fn expires_at(&self) -> DateTime<Utc> {
        millis_to_datetime(self.expires_at_ms)
    }

    /// Returns the time left before expiry at `now_ms`.
    pub fn remaining(&self, now_ms: i64) -> Duration {
        Duration::from_millis(u64::try_from(self.expires_at_ms - now_ms).unwrap_or(0))
    }
}

/// Acquires, renews and releases leases through a store.
#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn QueueStore>,
    holder: String,
}

impl LeaseManager {
    /// Creates a lease manager acting as `holder`.
    pub fn new(store: Arc<dyn QueueStore>, holder: impl Into<String>) -> Self {
        Self {
            store,
            holder: holder.into(),
        }
    }

    /// Returns the holder identity written into tokens.
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Acquires a lease on `resource` if nobody holds a valid one.
    pub async fn acquire(&self, resource: &str, duration: Duration) -> Result<Lease, LeaseError> {
        let now = now_ms();
        let lease = Lease::new(resource, self.holder.as_str(), now, duration);
        if self.store.acquire_lease(&lease, now).await? {
            Ok(lease)
        } else {
            Err(LeaseError::AlreadyHeld(resource.to_string()))
        }
    }

    /// Extends a held lease. Fails with `LeaseLost` if the stored token no
    /// longer matches or has already expired.
    pub async fn renew(&self, lease: &Lease, duration: Duration) -> Result<Lease, LeaseError> {
        let now = now_ms();
        let next = lease.renewed(now, duration);
        if self.store.renew_lease(lease, &next, now).await? {
            Ok(next)
        } else {
            Err(LeaseError::LeaseLost(lease.resource.clone()))
        }
    }

    /// Releases a lease. Idempotent: releasing a lost lease is not an error.
    pub async fn release(&self, lease: &Lease) -> Result<(), LeaseError> {
        let released = self.store.release_lease(lease).await?;
        if !released {
            debug!(resource = %lease.resource, "Lease was already gone on release");
        }
        Ok(())
    }

    /// Returns the currently valid lease on `resource`, if any.
    pub async fn current(&self, resource: &str) -> Result<Option<Lease>, LeaseError> {
        let now = now_ms();
        let lease = self.store.current_lease(resource).await?;
        Ok(lease.filter(|l| l.is_valid_at(now)))
    }

    /// Returns whether `lease` is still the valid lease on its resource.
    pub async fn is_valid(&self, lease: &Lease) -> Result<bool, LeaseError> {
        Ok(self
            .current(&lease.resource)
            .await?
            .is_some_and(|current| current.token() == lease.token()))
    }

    /// Leases a queued item for processing.
    ///
    /// Fails with `AlreadyHeld` when another executor holds a valid lease and
    /// with `NotFound` when the item was removed in the meantime. Both are
    /// contention outcomes the dispatch loop skips over.
    pub async fn lease_item(&self, item_id: &str, duration: Duration) -> Result<Lease, LeaseError> {
        let now = now_ms();
        let lease = Lease::new(item_resource(item_id), self.holder.as_str(), now, duration);
        match self.store.lease_item(item_id, &lease, now).await? {
            LeaseOutcome::Acquired => Ok(lease),
            LeaseOutcome::Contended => Err(LeaseError::AlreadyHeld(lease.resource)),
            LeaseOutcome::Missing => Err(LeaseError::NotFound(lease.resource)),
        }
    }

    /// Extends an item lease while its handler runs.
    pub async fn extend_item(
        &self,
        item_id: &str,
        lease: &Lease,
        duration: Duration,
    ) -> Result<Lease, LeaseError> {
        let now = now_ms();
        let next = lease.renewed(now, duration);
        if self.store.extend_item(item_id, lease, &next, now).await? {
            Ok(next)
        } else {
            Err(LeaseError::LeaseLost(lease.resource.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn manager(holder: &str, store: Arc<MemoryStore>) -> LeaseManager {
        LeaseManager::new(store, holder)
    }

    #[test]
    fn test_token_roundtrip() {
        let lease = Lease::new("sequential", "node.a", 1_000, Duration::from_secs(10));
        let token = lease.token();
        assert!(token.starts_with("11000."));

        let parsed = Lease::parse("sequential", &token).expect("parse token");
        assert_eq!(parsed, lease);
        assert_eq!(parsed.holder, "node.a");
    }

    #[test]
    fn test_parse_malformed_token() {
        assert!(Lease::parse("r", "garbage").is_err());
        assert!(Lease::parse("r", "123.not-a-uuid.holder").is_err());
        assert!(Lease::parse("r", &format!("123.{}", Uuid::new_v4())).is_err());
    }

    #[test]
    fn test_validity_and_renewal() {
        let lease = Lease::new("r", "h", 1_000, Duration::from_millis(500));
        assert!(lease.is_valid_at(1_499));
        assert!(!lease.is_valid_at(1_500));
        assert_eq!(lease.remaining(1_200), Duration::from_millis(300));
        assert_eq!(lease.remaining(2_000), Duration::ZERO);

        let renewed = lease.renewed(1_400, Duration::from_millis(500));
        assert_eq!(renewed.id, lease.id);
        assert_eq!(renewed.expires_at_ms, 1_900);
        assert_ne!(renewed.token(), lease.token());
    }

    #[tokio::test]
    async fn test_acquire_is_exclusive() {
        let store = Arc::new(MemoryStore::new());
        let a = manager("a", store.clone());
        let b = manager("b", store.clone());

        let lease = a
            .acquire("resource", Duration::from_secs(5))
            .await
            .expect("first acquire");
        let err = b
            .acquire("resource", Duration::from_secs(5))
            .await
            .expect_err("second acquire must fail");
        assert!(err.is_contention());

        assert!(a.is_valid(&lease).await.expect("validity"));
        let current = b.current("resource").await.expect("current").expect("held");
        assert_eq!(current.holder, "a");
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let store = Arc::new(MemoryStore::new());
        let a = manager("a", store.clone());
        let b = manager("b", store.clone());

        let old = a
            .acquire("resource", Duration::from_millis(30))
            .await
            .expect("acquire");
        tokio::time::sleep(Duration::from_millis(60)).await;

        let new = b
            .acquire("resource", Duration::from_secs(5))
            .await
            .expect("takeover after expiry");
        assert_eq!(new.holder, "b");

        let err = a
            .renew(&old, Duration::from_secs(5))
            .await
            .expect_err("renewing a lost lease fails");
        assert!(matches!(err, LeaseError::LeaseLost(_)));
    }

    #[tokio::test]
    async fn test_renew_and_release() {
        let store = Arc::new(MemoryStore::new());
        let a = manager("a", store.clone());

        let lease = a
            .acquire("resource", Duration::from_millis(200))
            .await
            .expect("acquire");
        let renewed = a
            .renew(&lease, Duration::from_secs(5))
            .await
            .expect("renew");
        assert!(renewed.expires_at_ms > lease.expires_at_ms);
        assert!(!a.is_valid(&lease).await.expect("old token"));
        assert!(a.is_valid(&renewed).await.expect("new token"));

        a.release(&renewed).await.expect("release");
        a.release(&renewed).await.expect("release is idempotent");
        assert!(a.current("resource").await.expect("current").is_none());
    }
}
