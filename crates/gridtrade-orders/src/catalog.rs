//! Outbound seam to the external catalog.

use async_trait::async_trait;
use gridtrade_types::{OfferId, Result};

/// Receives live availability after order transitions.
#[async_trait]
pub trait CatalogPublisher: Send + Sync + std::fmt::Debug {
    async fn publish_availability(&self, offer_id: OfferId, available: u64) -> Result<()>;
}

/// Discards every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPublisher;

#[async_trait]
impl CatalogPublisher for NoopPublisher {
    async fn publish_availability(&self, _offer_id: OfferId, _available: u64) -> Result<()> {
        Ok(())
    }
}

/// Records every update. **Never use in production.**
#[cfg(any(test, feature = "test-helpers"))]
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    published: std::sync::Mutex<Vec<(OfferId, u64)>>,
}

#[cfg(any(test, feature = "test-helpers"))]
impl RecordingPublisher {
    #[must_use]
    pub fn published(&self) -> Vec<(OfferId, u64)> {
        self.published
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Last availability published for `offer_id`.
    #[must_use]
    pub fn last_for(&self, offer_id: OfferId) -> Option<u64> {
        self.published()
            .iter()
            .rev()
            .find(|(id, _)| *id == offer_id)
            .map(|(_, available)| *available)
    }
}

#[cfg(any(test, feature = "test-helpers"))]
#[async_trait]
impl CatalogPublisher for RecordingPublisher {
    async fn publish_availability(&self, offer_id: OfferId, available: u64) -> Result<()> {
        self.published
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((offer_id, available));
        Ok(())
    }
}

/// Fails every update. **Never use in production.**
#[cfg(any(test, feature = "test-helpers"))]
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingPublisher;

#[cfg(any(test, feature = "test-helpers"))]
#[async_trait]
impl CatalogPublisher for FailingPublisher {
    async fn publish_availability(&self, _offer_id: OfferId, _available: u64) -> Result<()> {
        Err(gridtrade_types::GridError::CatalogUnavailable {
            reason: "catalog offline".into(),
        })
    }
}
