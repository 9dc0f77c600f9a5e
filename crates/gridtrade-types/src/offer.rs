//! Offer types: a seller's advertised quantity of energy for a future window.
//!
//! An offer is immutable after creation except for being withdrawn. Its
//! remaining availability is never stored on the offer; it is derived from
//! the block ledger.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{GridError, ItemId, OfferId, Result, UserId};

/// Publication state of an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OfferStatus {
    Published,
    Withdrawn,
}

impl std::fmt::Display for OfferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Published => write!(f, "PUBLISHED"),
            Self::Withdrawn => write!(f, "WITHDRAWN"),
        }
    }
}

/// The delivery window of an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DeliveryWindow {
    /// Build a window, rejecting empty or inverted ranges.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start >= end {
            return Err(GridError::InvalidRequest {
                reason: format!("delivery window start {start} must precede end {end}"),
            });
        }
        Ok(Self { start, end })
    }

    #[must_use]
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}

/// An advertised quantity of energy at a unit price for a fixed window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    pub id: OfferId,
    pub provider_id: UserId,
    pub item_id: ItemId,
    /// Price of one block.
    pub unit_price: Decimal,
    pub currency: String,
    pub window: DeliveryWindow,
    /// Number of blocks minted at creation. Never changes.
    pub total_units: u64,
    pub status: OfferStatus,
    pub created_at: DateTime<Utc>,
}

impl Offer {
    /// Create a published offer after validating its fields.
    pub fn new(
        provider_id: UserId,
        item_id: ItemId,
        unit_price: Decimal,
        currency: impl Into<String>,
        window: DeliveryWindow,
        total_units: u64,
        created_at: DateTime<Utc>,
    ) -> Result<Self> {
        if unit_price <= Decimal::ZERO {
            return Err(GridError::InvalidRequest {
                reason: format!("unit price must be positive, got {unit_price}"),
            });
        }
        if total_units == 0 {
            return Err(GridError::InvalidRequest {
                reason: "an offer needs at least one block".to_string(),
            });
        }
        if item_id.is_blank() {
            return Err(GridError::InvalidRequest {
                reason: "item id is required".to_string(),
            });
        }
        Ok(Self {
            id: OfferId::new(),
            provider_id,
            item_id,
            unit_price,
            currency: currency.into(),
            window,
            total_units,
            status: OfferStatus::Published,
            created_at,
        })
    }

    #[must_use]
    pub fn is_published(&self) -> bool {
        self.status == OfferStatus::Published
    }

    /// Price of `quantity` blocks of this offer.
    #[must_use]
    pub fn price_for(&self, quantity: u64) -> Decimal {
        self.unit_price * Decimal::from(quantity)
    }
}

/// Aggregate price of a selection or order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub total_price: Decimal,
    pub total_quantity: u64,
    pub currency: String,
}

impl Quote {
    #[must_use]
    pub fn empty(currency: impl Into<String>) -> Self {
        Self {
            total_price: Decimal::ZERO,
            total_quantity: 0,
            currency: currency.into(),
        }
    }

    /// Add a line of `quantity` blocks at `unit_price`.
    pub fn add_line(&mut self, unit_price: Decimal, quantity: u64) {
        self.total_price += unit_price * Decimal::from(quantity);
        self.total_quantity += quantity;
    }
}

/// Dummy offer for testing. **Never use in production.**
#[cfg(any(test, feature = "test-helpers"))]
impl Offer {
    /// A published offer of `total_units` blocks at 5.00 per block,
    /// delivering from `starts_in` from now for one hour.
    pub fn dummy(provider_id: UserId, total_units: u64, starts_in: chrono::Duration) -> Self {
        let start = Utc::now() + starts_in;
        Self {
            id: OfferId::new(),
            provider_id,
            item_id: ItemId::new("solar-kwh"),
            unit_price: Decimal::new(500, 2),
            currency: crate::constants::DEFAULT_CURRENCY.to_string(),
            window: DeliveryWindow {
                start,
                end: start + chrono::Duration::hours(1),
            },
            total_units,
            status: OfferStatus::Published,
            created_at: Utc::now(),
        }
    }
}
