//! Outbound seam for `on_*` callbacks.

use async_trait::async_trait;
use gridtrade_types::{Callback, Result};
use tracing::info;

/// Delivers one callback to the caller's callback address.
///
/// An `Err` means the delivery should be retried; the dispatcher owns the
/// retry schedule.
#[async_trait]
pub trait CallbackTransport: Send + Sync + std::fmt::Debug {
    async fn deliver(&self, uri: &str, callback: &Callback) -> Result<()>;
}

/// Writes each callback to the log as JSON and reports success.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingTransport;

#[async_trait]
impl CallbackTransport for LoggingTransport {
    async fn deliver(&self, uri: &str, callback: &Callback) -> Result<()> {
        let body = serde_json::to_string(callback)?;
        info!(
            uri,
            action = %callback.context.action,
            transaction_id = %callback.context.transaction_id,
            message_id = %callback.context.message_id,
            body = %body,
            "Callback delivered"
        );
        Ok(())
    }
}

/// Keeps every delivered callback; the first `failures` attempts fail.
/// **Never use in production.**
#[cfg(any(test, feature = "test-helpers"))]
#[derive(Debug, Default)]
pub struct RecordingTransport {
    delivered: std::sync::Mutex<Vec<(String, Callback)>>,
    failures: std::sync::atomic::AtomicU32,
    attempts: std::sync::atomic::AtomicU32,
}

#[cfg(any(test, feature = "test-helpers"))]
impl RecordingTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `failures` attempts before delivering.
    #[must_use]
    pub fn failing_first(failures: u32) -> Self {
        Self {
            failures: std::sync::atomic::AtomicU32::new(failures),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn delivered(&self) -> Vec<(String, Callback)> {
        self.delivered
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Attempts made, successful or not.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(any(test, feature = "test-helpers"))]
#[async_trait]
impl CallbackTransport for RecordingTransport {
    async fn deliver(&self, uri: &str, callback: &Callback) -> Result<()> {
        use std::sync::atomic::Ordering;

        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return Err(gridtrade_types::GridError::CallbackDelivery {
                uri: uri.to_string(),
                reason: "503 Service Unavailable".into(),
            });
        }
        self.delivered
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((uri.to_string(), callback.clone()));
        Ok(())
    }
}
