//! Offer discovery.
//!
//! The orchestrator reads offers through [`OfferCatalog`]. In production the
//! primary source may be an external discovery service; [`FallbackCatalog`]
//! falls back to a secondary (normally the in-process [`LedgerCatalog`])
//! whenever the primary errors.

use std::sync::Arc;

use async_trait::async_trait;
use gridtrade_ledger::BlockLedger;
use gridtrade_types::{Offer, OfferId, Result};
use tracing::warn;

/// Read-only view of published offers and their live availability.
#[async_trait]
pub trait OfferCatalog: Send + Sync + std::fmt::Debug {
    async fn offer(&self, offer_id: OfferId) -> Result<Offer>;

    /// AVAILABLE blocks right now.
    async fn available(&self, offer_id: OfferId) -> Result<u64>;
}

/// Catalog backed directly by the block ledger.
#[derive(Debug, Clone)]
pub struct LedgerCatalog {
    blocks: Arc<BlockLedger>,
}

impl LedgerCatalog {
    #[must_use]
    pub fn new(blocks: Arc<BlockLedger>) -> Self {
        Self { blocks }
    }
}

#[async_trait]
impl OfferCatalog for LedgerCatalog {
    async fn offer(&self, offer_id: OfferId) -> Result<Offer> {
        self.blocks.offer(offer_id)
    }

    async fn available(&self, offer_id: OfferId) -> Result<u64> {
        self.blocks.available_count(offer_id)
    }
}

/// Primary catalog with a secondary used whenever the primary fails.
#[derive(Debug, Clone)]
pub struct FallbackCatalog {
    primary: Arc<dyn OfferCatalog>,
    secondary: Arc<dyn OfferCatalog>,
}

impl FallbackCatalog {
    #[must_use]
    pub fn new(primary: Arc<dyn OfferCatalog>, secondary: Arc<dyn OfferCatalog>) -> Self {
        Self { primary, secondary }
    }
}

#[async_trait]
impl OfferCatalog for FallbackCatalog {
    async fn offer(&self, offer_id: OfferId) -> Result<Offer> {
        match self.primary.offer(offer_id).await {
            Ok(offer) => Ok(offer),
            Err(err) => {
                warn!(offer_id = %offer_id, error = %err, "Primary catalog failed, using secondary");
                self.secondary.offer(offer_id).await
            }
        }
    }

    async fn available(&self, offer_id: OfferId) -> Result<u64> {
        match self.primary.available(offer_id).await {
            Ok(available) => Ok(available),
            Err(err) => {
                warn!(offer_id = %offer_id, error = %err, "Primary catalog failed, using secondary");
                self.secondary.available(offer_id).await
            }
        }
    }
}
