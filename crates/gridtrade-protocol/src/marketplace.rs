//! Wiring of every component behind one handle.

use std::sync::Arc;

use gridtrade_guard::{IdempotencyGuard, LockManager};
use gridtrade_ledger::{AccountLedger, BlockLedger};
use gridtrade_orders::{CatalogPublisher, NoopPublisher, OrderLifecycle, SettlementGate};
use gridtrade_settlement::SettlementEngine;
use gridtrade_types::{Clock, MarketplaceConfig, Offer, Result, SystemClock};
use tracing::info;

use crate::catalog::{FallbackCatalog, LedgerCatalog, OfferCatalog};
use crate::dispatcher::CallbackDispatcher;
use crate::orchestrator::Orchestrator;
use crate::reconciler::Reconciler;
use crate::settlement_api::SettlementApi;
use crate::transport::CallbackTransport;

/// Optional collaborators; the defaults keep everything in-process.
#[derive(Debug, Default)]
pub struct MarketplaceParts {
    /// Defaults to [`SystemClock`].
    pub clock: Option<Arc<dyn Clock>>,
    /// Defaults to [`NoopPublisher`].
    pub publisher: Option<Arc<dyn CatalogPublisher>>,
    /// External discovery, tried before the in-process catalog.
    pub primary_catalog: Option<Arc<dyn OfferCatalog>>,
}

/// A fully wired marketplace.
#[derive(Debug, Clone)]
pub struct Marketplace {
    pub blocks: Arc<BlockLedger>,
    pub accounts: Arc<AccountLedger>,
    pub orders: Arc<OrderLifecycle>,
    pub settlements: Arc<SettlementEngine>,
    pub orchestrator: Orchestrator,
    pub settlement_api: SettlementApi,
    pub dispatcher: CallbackDispatcher,
    pub reconciler: Reconciler,
}

impl Marketplace {
    /// Validate `config` and wire the components.
    pub fn build(
        config: &MarketplaceConfig,
        transport: Arc<dyn CallbackTransport>,
        parts: MarketplaceParts,
    ) -> Result<Self> {
        config.validate()?;
        let clock = parts.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let publisher = parts
            .publisher
            .unwrap_or_else(|| Arc::new(NoopPublisher));

        let locks = LockManager::new(&config.locks);
        let blocks = Arc::new(BlockLedger::new(Arc::clone(&clock)));
        let accounts = Arc::new(AccountLedger::new(Arc::clone(&clock)));
        let settlements = Arc::new(SettlementEngine::new(
            config,
            Arc::clone(&accounts),
            locks.clone(),
            Arc::clone(&clock),
        ));
        let orders = Arc::new(
            OrderLifecycle::new(
                config,
                Arc::clone(&blocks),
                Arc::clone(&accounts),
                locks,
                publisher,
                Arc::clone(&clock),
            )
            .with_settlement_gate(Arc::clone(&settlements) as Arc<dyn SettlementGate>),
        );

        let local: Arc<dyn OfferCatalog> = Arc::new(LedgerCatalog::new(Arc::clone(&blocks)));
        let catalog: Arc<dyn OfferCatalog> = match parts.primary_catalog {
            Some(primary) => Arc::new(FallbackCatalog::new(primary, local)),
            None => local,
        };

        let dispatcher = CallbackDispatcher::new(transport, &config.callbacks, Arc::clone(&clock));
        let acks = Arc::new(IdempotencyGuard::new(&config.idempotency, Arc::clone(&clock)));
        let responses = Arc::new(IdempotencyGuard::new(&config.idempotency, Arc::clone(&clock)));

        let orchestrator = Orchestrator::new(
            catalog,
            Arc::clone(&orders),
            Arc::clone(&settlements),
            dispatcher.clone(),
            Arc::clone(&acks),
            Arc::clone(&clock),
        );
        let settlement_api = SettlementApi::new(
            Arc::clone(&settlements),
            Arc::clone(&orders),
            Arc::clone(&responses),
        );
        let reconciler = Reconciler::new(
            config,
            Arc::clone(&orders),
            Arc::clone(&settlements),
            acks,
            responses,
            clock,
        );

        info!(currency = %config.currency.code, "Marketplace wired");
        Ok(Self {
            blocks,
            accounts,
            orders,
            settlements,
            orchestrator,
            settlement_api,
            dispatcher,
            reconciler,
        })
    }

    /// Publish an offer: mint its blocks in the ledger.
    pub fn publish_offer(&self, offer: Offer) -> Result<()> {
        let (id, units) = (offer.id, offer.total_units);
        self.blocks.register_offer(offer)?;
        info!(offer_id = %id, units, "Offer published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoggingTransport;
    use gridtrade_types::UserId;

    #[test]
    fn rejects_invalid_config() {
        let mut config = MarketplaceConfig::default();
        config.locks.lease_ttl_ms = 0;
        let err = Marketplace::build(&config, Arc::new(LoggingTransport), MarketplaceParts::default())
            .unwrap_err();
        assert_eq!(err.wire_code(), "CONFIGURATION_ERROR");
    }

    #[test]
    fn publishes_offers() {
        let market = Marketplace::build(
            &MarketplaceConfig::default(),
            Arc::new(LoggingTransport),
            MarketplaceParts::default(),
        )
        .unwrap();
        let offer = Offer::dummy(UserId::new(), 8, chrono::Duration::hours(1));
        market.publish_offer(offer.clone()).unwrap();
        assert_eq!(market.blocks.available_count(offer.id).unwrap(), 8);
        assert!(market.publish_offer(offer).is_err());
    }
}
