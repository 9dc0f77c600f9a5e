//! Idempotency guard: at most one execution per key.
//!
//! The first caller to [`IdempotencyGuard::begin_processing`] a key claims it
//! atomically (the check and the claim happen under one lock) and becomes
//! responsible for [`IdempotencyGuard::store_result`]. Everyone else sees
//! either the cached response or an in-flight claim they can wait on.
//!
//! ```text
//!             begin_processing           store_result
//!   (absent) ─────────────────▶ PROCESSING ──────────▶ COMPLETED(response)
//!       ▲                          │    │                     │
//!       │           abandon        │    │ lease expires       │ ttl expires
//!       └──────────────────────────┘    └─────▶ claimable ◀───┘
//! ```
//!
//! Client keys also carry a request fingerprint, so reusing a key for a
//! different request body is rejected instead of silently replaying.
//! Capacity is bounded; the oldest keys are evicted first, except live
//! processing claims. A store holding nothing but live claims refuses new
//! keys with a retryable error.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use gridtrade_types::{Clock, GridError, IdempotencyConfig, MessageId, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// What a request is deduplicated by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IdempotencyKey {
    /// Inbound protocol message.
    Message(MessageId),
    /// Client-supplied key, scoped to the endpoint it was sent to.
    Client { endpoint: String, key: String },
}

impl IdempotencyKey {
    #[must_use]
    pub fn client(endpoint: impl Into<String>, key: impl Into<String>) -> Self {
        Self::Client {
            endpoint: endpoint.into(),
            key: key.into(),
        }
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Message(id) => write!(f, "msg:{id}"),
            Self::Client { endpoint, key } => write!(f, "client:{endpoint}:{key}"),
        }
    }
}

/// Result of [`IdempotencyGuard::check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyStatus<R> {
    Absent,
    Processing,
    Completed(R),
}

impl<R> IdempotencyStatus<R> {
    #[must_use]
    pub fn found(&self) -> bool {
        !matches!(self, Self::Absent)
    }

    #[must_use]
    pub fn is_processing(&self) -> bool {
        matches!(self, Self::Processing)
    }

    #[must_use]
    pub fn cached(&self) -> Option<&R> {
        match self {
            Self::Completed(response) => Some(response),
            _ => None,
        }
    }
}

/// Result of [`IdempotencyGuard::begin_processing`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim<R> {
    /// The caller owns the key and must store a result or abandon it.
    Accepted,
    /// A previous execution completed; replay this response.
    Completed(R),
    /// Another caller holds a live claim.
    InFlight,
}

#[derive(Debug, Clone)]
enum EntryState<R> {
    Processing { lease_expires_at: DateTime<Utc> },
    Completed { response: R, expires_at: DateTime<Utc> },
}

#[derive(Debug, Clone)]
struct Entry<R> {
    state: EntryState<R>,
    fingerprint: Option<String>,
    seq: u64,
}

impl<R> Entry<R> {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        match &self.state {
            EntryState::Processing { lease_expires_at } => *lease_expires_at > now,
            EntryState::Completed { expires_at, .. } => *expires_at > now,
        }
    }
}

#[derive(Debug)]
struct Table<R> {
    entries: HashMap<IdempotencyKey, Entry<R>>,
    /// Insertion order for eviction (front = oldest).
    order: VecDeque<(u64, IdempotencyKey)>,
    next_seq: u64,
}

impl<R> Table<R> {
    /// Evict oldest-first until a new key fits. Live processing claims are
    /// never evicted. Returns `false` if only live claims remain.
    fn evict_to(&mut self, max_entries: usize, now: DateTime<Utc>) -> bool {
        let mut claimed = VecDeque::new();
        while self.entries.len() >= max_entries {
            let Some((seq, key)) = self.order.pop_front() else {
                break;
            };
            let Some(entry) = self.entries.get(&key).filter(|entry| entry.seq == seq) else {
                continue;
            };
            if matches!(entry.state, EntryState::Processing { .. }) && entry.is_live(now) {
                claimed.push_back((seq, key));
                continue;
            }
            self.entries.remove(&key);
            debug!(key = %key, "Evicted idempotency record");
        }
        while let Some(kept) = claimed.pop_back() {
            self.order.push_front(kept);
        }
        self.entries.len() < max_entries
    }
}

/// Deduplicates protocol messages and client requests, caching responses of type `R`.
#[derive(Debug)]
pub struct IdempotencyGuard<R> {
    table: Mutex<Table<R>>,
    settled: Notify,
    clock: Arc<dyn Clock>,
    record_ttl: chrono::Duration,
    processing_lease: chrono::Duration,
    max_entries: usize,
}

impl<R: Clone> IdempotencyGuard<R> {
    #[must_use]
    pub fn new(config: &IdempotencyConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            table: Mutex::new(Table {
                entries: HashMap::new(),
                order: VecDeque::new(),
                next_seq: 0,
            }),
            settled: Notify::new(),
            clock,
            record_ttl: config.record_ttl(),
            processing_lease: config.processing_lease(),
            max_entries: config.max_entries.max(1),
        }
    }

    fn table(&self) -> MutexGuard<'_, Table<R>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up a key without claiming it.
    pub fn check(&self, key: &IdempotencyKey) -> IdempotencyStatus<R> {
        let now = self.clock.now();
        match self.table().entries.get(key) {
            Some(entry) if entry.is_live(now) => match &entry.state {
                EntryState::Processing { .. } => IdempotencyStatus::Processing,
                EntryState::Completed { response, .. } => {
                    IdempotencyStatus::Completed(response.clone())
                }
            },
            _ => IdempotencyStatus::Absent,
        }
    }

    /// Atomically claim `key` for first-time processing.
    ///
    /// A key is claimable when it is unknown, its processing lease lapsed
    /// (the previous holder crashed) or its completed record expired.
    ///
    /// # Errors
    /// [`GridError::IdempotencyKeyReuse`] if a live client key was recorded
    /// with a different `fingerprint`, [`GridError::IdempotencyStoreFull`]
    /// if every slot holds a live claim.
    pub fn begin_processing(
        &self,
        key: &IdempotencyKey,
        fingerprint: Option<&str>,
    ) -> Result<Claim<R>> {
        self.begin_processing_with_lease(key, fingerprint, None)
    }

    /// [`begin_processing`](Self::begin_processing) with the claim held for
    /// `lease` instead of the configured processing lease.
    ///
    /// # Errors
    /// As [`begin_processing`](Self::begin_processing).
    pub fn begin_processing_with_lease(
        &self,
        key: &IdempotencyKey,
        fingerprint: Option<&str>,
        lease: Option<chrono::Duration>,
    ) -> Result<Claim<R>> {
        let now = self.clock.now();
        let mut table = self.table();

        if let Some(entry) = table.entries.get(key).filter(|entry| entry.is_live(now)) {
            if let (Some(recorded), Some(offered)) = (entry.fingerprint.as_deref(), fingerprint) {
                if recorded != offered {
                    if let IdempotencyKey::Client { endpoint, key } = key {
                        return Err(GridError::IdempotencyKeyReuse {
                            endpoint: endpoint.clone(),
                            key: key.clone(),
                        });
                    }
                }
            }
            return Ok(match &entry.state {
                EntryState::Processing { .. } => Claim::InFlight,
                EntryState::Completed { response, .. } => Claim::Completed(response.clone()),
            });
        }

        if !table.entries.contains_key(key) && !table.evict_to(self.max_entries, now) {
            warn!(key = %key, capacity = self.max_entries, "Idempotency store full of live claims");
            return Err(GridError::IdempotencyStoreFull {
                capacity: self.max_entries,
            });
        }
        table.next_seq += 1;
        let seq = table.next_seq;
        table.entries.insert(
            key.clone(),
            Entry {
                state: EntryState::Processing {
                    lease_expires_at: now + lease.unwrap_or(self.processing_lease),
                },
                fingerprint: fingerprint.map(str::to_string),
                seq,
            },
        );
        table.order.push_back((seq, key.clone()));
        Ok(Claim::Accepted)
    }

    /// Cache the terminal response for `key` so replays short-circuit.
    pub fn store_result(&self, key: &IdempotencyKey, response: R) {
        let expires_at = self.clock.now() + self.record_ttl;
        {
            let mut table = self.table();
            if let Some(entry) = table.entries.get_mut(key) {
                entry.state = EntryState::Completed {
                    response,
                    expires_at,
                };
            } else if !table.evict_to(self.max_entries, self.clock.now()) {
                debug!(key = %key, "No room to cache response");
            } else {
                table.next_seq += 1;
                let seq = table.next_seq;
                table.entries.insert(
                    key.clone(),
                    Entry {
                        state: EntryState::Completed {
                            response,
                            expires_at,
                        },
                        fingerprint: None,
                        seq,
                    },
                );
                table.order.push_back((seq, key.clone()));
            }
        }
        self.settled.notify_waiters();
    }

    /// Drop an in-flight claim so the request can be retried.
    pub fn abandon(&self, key: &IdempotencyKey) {
        let removed = {
            let mut table = self.table();
            match table.entries.get(key) {
                Some(Entry {
                    state: EntryState::Processing { .. },
                    ..
                }) => table.entries.remove(key).is_some(),
                _ => false,
            }
        };
        if removed {
            debug!(key = %key, "Abandoned idempotency claim");
            self.settled.notify_waiters();
        }
    }

    /// Wait for a concurrent duplicate's response.
    ///
    /// Returns `Ok(None)` if the claim was abandoned or its lease lapsed,
    /// in which case the caller may claim the key itself.
    ///
    /// # Errors
    /// [`GridError::RequestInFlight`] if the other request is still
    /// processing when `timeout` elapses.
    pub async fn wait_for_result(&self, key: &IdempotencyKey, timeout: Duration) -> Result<Option<R>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.check(key) {
                IdempotencyStatus::Completed(response) => return Ok(Some(response)),
                IdempotencyStatus::Absent => return Ok(None),
                IdempotencyStatus::Processing => {}
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return match self.check(key) {
                    IdempotencyStatus::Completed(response) => Ok(Some(response)),
                    IdempotencyStatus::Absent => Ok(None),
                    IdempotencyStatus::Processing => Err(GridError::RequestInFlight {
                        key: key.to_string(),
                    }),
                };
            }
        }
    }

    /// Remove expired records and lapsed claims. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut table = self.table();
        let before = table.entries.len();
        table.entries.retain(|_, entry| entry.is_live(now));
        let Table { entries, order, .. } = &mut *table;
        order.retain(|(seq, key)| entries.get(key).is_some_and(|entry| entry.seq == *seq));
        let purged = before - table.entries.len();
        if purged > 0 {
            info!(purged, "Purged expired idempotency records");
        }
        purged
    }

    /// Number of tracked keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table().entries.is_empty()
    }
}

/// SHA-256 fingerprint of a request body, scoped to its endpoint.
pub fn fingerprint<T: Serialize>(endpoint: &str, body: &T) -> Result<String> {
    let bytes = serde_json::to_vec(body)?;
    let mut hasher = Sha256::new();
    hasher.update(endpoint.as_bytes());
    hasher.update([0u8]);
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}
