//! Callback delivery with retry, backoff and a dead-letter queue.
//!
//! ```text
//!   dispatch ─▶ spawn task ─▶ attempt 1 ─ok──▶ delivered
//!                               │ err
//!                               ▼
//!                     sleep(backoff(n) + jitter) ─▶ attempt n+1 ...
//!                               │ max_attempts exhausted
//!                               ▼
//!                          dead letters ─redrive─▶ dispatch
//! ```
//!
//! Each callback gets its own task, so a slow callback address never delays
//! callbacks to other callers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use gridtrade_types::{Callback, CallbackConfig, Clock};
use rand::Rng;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::transport::CallbackTransport;

/// A callback that could not be delivered.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub callback: Callback,
    /// `None` when the request carried no callback address.
    pub uri: Option<String>,
    pub attempts: u32,
    pub last_error: String,
    pub failed_at: DateTime<Utc>,
}

/// Delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub scheduled: u64,
    pub delivered: u64,
    pub retried: u64,
    pub dead_lettered: u64,
}

#[derive(Debug)]
struct Inner {
    transport: Arc<dyn CallbackTransport>,
    config: CallbackConfig,
    clock: Arc<dyn Clock>,
    dead_letters: Mutex<Vec<DeadLetter>>,
    stats: Mutex<DispatchStats>,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl Inner {
    fn stats(&self) -> MutexGuard<'_, DispatchStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bury(&self, callback: Callback, uri: Option<String>, attempts: u32, last_error: String) {
        error!(
            action = %callback.context.action,
            transaction_id = %callback.context.transaction_id,
            message_id = %callback.context.message_id,
            uri = uri.as_deref().unwrap_or("<none>"),
            attempts,
            error = %last_error,
            "Callback dead-lettered"
        );
        self.stats().dead_lettered += 1;
        self.dead_letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(DeadLetter {
                callback,
                uri,
                attempts,
                last_error,
                failed_at: self.clock.now(),
            });
    }

    async fn deliver(&self, uri: String, callback: Callback) {
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            match self.transport.deliver(&uri, &callback).await {
                Ok(()) => {
                    debug!(
                        action = %callback.context.action,
                        message_id = %callback.context.message_id,
                        attempt,
                        "Callback accepted"
                    );
                    self.stats().delivered += 1;
                    return;
                }
                Err(err) => {
                    last_error = err.to_string();
                    if attempt == max_attempts {
                        break;
                    }
                    let delay = jittered(self.config.backoff(attempt));
                    warn!(
                        action = %callback.context.action,
                        message_id = %callback.context.message_id,
                        uri = %uri,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "Callback delivery failed, retrying"
                    );
                    self.stats().retried += 1;
                    tokio::time::sleep(delay).await;
                }
            }
        }
        self.bury(callback, Some(uri), max_attempts, last_error);
    }
}

/// Add up to 25 % random jitter so retries to one address spread out.
fn jittered(delay: Duration) -> Duration {
    let spread = u64::try_from(delay.as_millis() / 4).unwrap_or(0);
    if spread == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

/// Decrements the in-flight count when a delivery task ends, however it ends.
struct InFlight(Arc<Inner>);

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Schedules `on_*` callbacks as independent delivery tasks.
#[derive(Debug, Clone)]
pub struct CallbackDispatcher {
    inner: Arc<Inner>,
}

impl CallbackDispatcher {
    #[must_use]
    pub fn new(
        transport: Arc<dyn CallbackTransport>,
        config: &CallbackConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                config: config.clone(),
                clock,
                dead_letters: Mutex::new(Vec::new()),
                stats: Mutex::new(DispatchStats::default()),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Schedule delivery of `callback` to its context's callback address.
    ///
    /// Returns immediately. A callback without an address, or scheduled
    /// outside a tokio runtime, goes straight to the dead letters.
    pub fn dispatch(&self, callback: Callback) {
        self.inner.stats().scheduled += 1;
        let Some(uri) = callback.context.callback_uri.clone() else {
            self.inner
                .bury(callback, None, 0, "no callback address".to_string());
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.inner
                .bury(callback, Some(uri), 0, "no async runtime".to_string());
            return;
        };
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlight(Arc::clone(&self.inner));
        runtime.spawn(async move {
            guard.0.deliver(uri, callback).await;
            drop(guard);
        });
    }

    /// Callbacks whose delivery was given up.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner
            .dead_letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drain the dead letters and schedule each again. Returns how many
    /// were re-scheduled.
    pub fn redrive_dead_letters(&self) -> usize {
        let letters: Vec<DeadLetter> = std::mem::take(
            &mut *self
                .inner
                .dead_letters
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let count = letters.len();
        for letter in letters {
            let mut callback = letter.callback;
            if callback.context.callback_uri.is_none() {
                callback.context.callback_uri = letter.uri;
            }
            self.dispatch(callback);
        }
        if count > 0 {
            info!(count, "Dead letters redriven");
        }
        count
    }

    #[must_use]
    pub fn stats(&self) -> DispatchStats {
        *self.inner.stats()
    }

    /// Deliveries still running (including backoff sleeps).
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until no delivery is running. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let idle = async {
            loop {
                let notified = self.inner.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.in_flight() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, idle).await.is_ok()
    }
}
