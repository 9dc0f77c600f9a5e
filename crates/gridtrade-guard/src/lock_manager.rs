//! Lease-based resource locks.
//!
//! A lease is an exclusive, TTL-bound claim over a [`LockKey`]. The holder
//! gets a [`LeaseGuard`] that releases the lease when dropped, so a failing
//! operation cannot leak it. A holder that crashes without dropping (or
//! simply overruns) loses the lease once its TTL passes and the next
//! acquirer takes it over.
//!
//! ```text
//!   acquire ──▶ free? ──yes──▶ lease(token, expires_at) ──▶ guard
//!                 │                                         │ drop
//!                 no                                        ▼
//!                 │                                  remove + notify
//!                 ▼
//!     expired? ──yes──▶ take over
//!                 │
//!                 no ──▶ wait (notify | retry interval) until timeout
//!                                         └──▶ LockContention
//! ```
//!
//! There are two lock domains, per-order and per-trade. No code path holds
//! one of each at the same time.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use gridtrade_types::{GridError, LockConfig, OrderId, Result, TradeId};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Which family of resources a lock protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockDomain {
    /// Serialises confirm / cancel / complete on one order.
    Order,
    /// Serialises settlement transitions on one trade.
    Trade,
}

impl std::fmt::Display for LockDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Order => write!(f, "order"),
            Self::Trade => write!(f, "trade"),
        }
    }
}

/// A lockable resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub domain: LockDomain,
    pub id: String,
}

impl LockKey {
    #[must_use]
    pub fn order(order_id: OrderId) -> Self {
        Self {
            domain: LockDomain::Order,
            id: order_id.to_string(),
        }
    }

    #[must_use]
    pub fn trade(trade_id: &TradeId) -> Self {
        Self {
            domain: LockDomain::Trade,
            id: trade_id.to_string(),
        }
    }
}

impl std::fmt::Display for LockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.domain, self.id)
    }
}

#[derive(Debug)]
struct Lease {
    token: u64,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct LeaseTable {
    leases: Mutex<HashMap<LockKey, Lease>>,
    released: Notify,
    next_token: AtomicU64,
}

impl LeaseTable {
    fn leases(&self) -> MutexGuard<'_, HashMap<LockKey, Lease>> {
        self.leases.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Grant the lease if the key is free or its lease has expired.
    fn try_grant(&self, key: &LockKey, ttl: Duration) -> Option<u64> {
        let now = Instant::now();
        let mut leases = self.leases();
        if let Some(existing) = leases.get(key) {
            if existing.expires_at > now {
                return None;
            }
            warn!(key = %key, token = existing.token, "Taking over expired lease");
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed) + 1;
        leases.insert(
            key.clone(),
            Lease {
                token,
                expires_at: now + ttl,
            },
        );
        Some(token)
    }

    fn release(&self, key: &LockKey, token: u64) {
        let removed = {
            let mut leases = self.leases();
            match leases.get(key) {
                Some(lease) if lease.token == token => leases.remove(key).is_some(),
                _ => false,
            }
        };
        if removed {
            self.released.notify_waiters();
        }
    }
}

/// Grants exclusive, expiring leases over [`LockKey`]s.
///
/// Cloning shares the underlying lease table.
#[derive(Debug, Clone)]
pub struct LockManager {
    table: Arc<LeaseTable>,
    ttl: Duration,
    acquire_timeout: Duration,
    retry_interval: Duration,
}

impl LockManager {
    #[must_use]
    pub fn new(config: &LockConfig) -> Self {
        Self {
            table: Arc::new(LeaseTable::default()),
            ttl: config.lease_ttl(),
            acquire_timeout: config.acquire_timeout(),
            retry_interval: config.retry_interval(),
        }
    }

    /// Acquire without waiting.
    #[must_use]
    pub fn try_acquire(&self, key: &LockKey) -> Option<LeaseGuard> {
        self.table.try_grant(key, self.ttl).map(|token| LeaseGuard {
            table: Arc::clone(&self.table),
            key: key.clone(),
            token,
            ttl: self.ttl,
        })
    }

    /// Acquire, waiting at most the configured timeout.
    ///
    /// # Errors
    /// [`GridError::LockContention`] if the lease is still held when the
    /// wait runs out.
    pub async fn acquire(&self, key: &LockKey) -> Result<LeaseGuard> {
        let started = Instant::now();
        let deadline = started + self.acquire_timeout;
        loop {
            let notified = self.table.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(guard) = self.try_acquire(key) {
                return Ok(guard);
            }

            let now = Instant::now();
            if now >= deadline {
                let waited_ms = u64::try_from(now.duration_since(started).as_millis()).unwrap_or(u64::MAX);
                debug!(key = %key, waited_ms, "Lease acquisition timed out");
                return Err(GridError::LockContention {
                    key: key.to_string(),
                    waited_ms,
                });
            }

            let pause = self.retry_interval.min(deadline - now);
            tokio::select! {
                () = &mut notified => {}
                () = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// Run `f` while holding the lease on `key`.
    ///
    /// The lease is released when `f` completes, whether it succeeded or not.
    pub async fn with_lock<F, Fut, T>(&self, key: &LockKey, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.acquire(key).await?;
        let out = f().await;
        drop(guard);
        out
    }

    /// Whether a live (unexpired) lease exists on `key`.
    #[must_use]
    pub fn is_locked(&self, key: &LockKey) -> bool {
        let now = Instant::now();
        self.table
            .leases()
            .get(key)
            .is_some_and(|lease| lease.expires_at > now)
    }

    /// Number of live leases.
    #[must_use]
    pub fn held_count(&self) -> usize {
        let now = Instant::now();
        self.table
            .leases()
            .values()
            .filter(|lease| lease.expires_at > now)
            .count()
    }
}

/// Proof of a held lease. Dropping it releases the lease.
#[derive(Debug)]
pub struct LeaseGuard {
    table: Arc<LeaseTable>,
    key: LockKey,
    token: u64,
    ttl: Duration,
}

impl LeaseGuard {
    #[must_use]
    pub fn key(&self) -> &LockKey {
        &self.key
    }

    /// Extend the lease by a full TTL from now.
    ///
    /// # Errors
    /// [`GridError::LeaseLost`] if the lease already expired or was taken
    /// over by another holder.
    pub fn renew(&self) -> Result<()> {
        let now = Instant::now();
        let mut leases = self.table.leases();
        match leases.get_mut(&self.key) {
            Some(lease) if lease.token == self.token && lease.expires_at > now => {
                lease.expires_at = now + self.ttl;
                Ok(())
            }
            _ => Err(GridError::LeaseLost {
                key: self.key.to_string(),
            }),
        }
    }

    /// Whether this guard still owns a live lease.
    #[must_use]
    pub fn is_held(&self) -> bool {
        let now = Instant::now();
        self.table
            .leases()
            .get(&self.key)
            .is_some_and(|lease| lease.token == self.token && lease.expires_at > now)
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.table.release(&self.key, self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn config(ttl_ms: u64, timeout_ms: u64) -> LockConfig {
        LockConfig {
            lease_ttl_ms: ttl_ms,
            acquire_timeout_ms: timeout_ms,
            retry_interval_ms: 5,
        }
    }

    #[tokio::test]
    async fn drop_releases_lease() {
        let locks = LockManager::new(&config(1_000, 100));
        let key = LockKey::order(OrderId::new());
        {
            let guard = locks.acquire(&key).await.unwrap();
            assert!(guard.is_held());
            assert!(locks.is_locked(&key));
            assert!(locks.try_acquire(&key).is_none());
        }
        assert!(!locks.is_locked(&key));
        assert!(locks.try_acquire(&key).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn contended_acquire_times_out() {
        let locks = LockManager::new(&config(60_000, 50));
        let key = LockKey::trade(&TradeId::new("trade-1"));
        let _held = locks.acquire(&key).await.unwrap();

        let err = locks.acquire(&key).await.unwrap_err();
        assert!(matches!(err, GridError::LockContention { waited_ms, .. } if waited_ms >= 50));
        assert!(err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_is_taken_over() {
        let locks = LockManager::new(&config(100, 10));
        let key = LockKey::order(OrderId::new());
        let stale = locks.acquire(&key).await.unwrap();

        tokio::time::advance(Duration::from_millis(150)).await;
        let fresh = locks.acquire(&key).await.unwrap();
        assert!(fresh.is_held());
        assert!(!stale.is_held());
        assert!(matches!(stale.renew(), Err(GridError::LeaseLost { .. })));

        // Dropping the stale guard must not release the new holder's lease.
        drop(stale);
        assert!(locks.is_locked(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn renew_extends_lease() {
        let locks = LockManager::new(&config(100, 10));
        let key = LockKey::order(OrderId::new());
        let guard = locks.acquire(&key).await.unwrap();

        tokio::time::advance(Duration::from_millis(80)).await;
        guard.renew().unwrap();
        tokio::time::advance(Duration::from_millis(80)).await;
        assert!(guard.is_held());
        assert!(locks.try_acquire(&key).is_none());
    }

    #[tokio::test]
    async fn waiter_wakes_on_release() {
        let locks = LockManager::new(&config(10_000, 2_000));
        let key = LockKey::order(OrderId::new());
        let guard = locks.acquire(&key).await.unwrap();

        let waiter = {
            let locks = locks.clone();
            let key = key.clone();
            tokio::spawn(async move { locks.acquire(&key).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn with_lock_serialises_critical_sections() {
        let locks = LockManager::new(&config(10_000, 5_000));
        let key = LockKey::order(OrderId::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let key = key.clone();
            let inside = Arc::clone(&inside);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                locks
                    .with_lock(&key, || async {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(locks.held_count(), 0);
    }

    #[tokio::test]
    async fn with_lock_releases_on_error() {
        let locks = LockManager::new(&config(10_000, 100));
        let key = LockKey::order(OrderId::new());
        let out: Result<()> = locks
            .with_lock(&key, || async { Err(GridError::Internal("boom".into())) })
            .await;
        assert!(out.is_err());
        assert!(!locks.is_locked(&key));
    }

    #[test]
    fn domains_do_not_collide() {
        let order = OrderId::new();
        let as_order = LockKey::order(order);
        let as_trade = LockKey::trade(&TradeId::from(order));
        assert_ne!(as_order, as_trade);
        assert!(as_order.to_string().starts_with("order:"));
        assert!(as_trade.to_string().starts_with("trade:"));
    }
}
