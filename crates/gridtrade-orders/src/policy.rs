//! Cancellation penalty arithmetic.
//!
//! | initiator | buyer refund | provider compensation | platform | provider penalty |
//! |-----------|--------------|-----------------------|----------|------------------|
//! | buyer     | 90 % escrow  | 5 % escrow            | rest     | none             |
//! | provider  | 100 % escrow | none                  | none     | 10 % principal   |
//! | system    | 100 % escrow | none                  | none     | none             |
//!
//! Percentages are the defaults of [`CancellationPolicy`]. An order that
//! never reached escrow splits nothing.

use gridtrade_types::{CancellationPolicy, CancelledBy, EscrowAmounts, Payee, PenaltySplit, UserId};
use rust_decimal::Decimal;

/// Divide an escrow according to who cancelled.
#[must_use]
pub fn penalty_split(
    policy: &CancellationPolicy,
    by: CancelledBy,
    escrow: Option<&EscrowAmounts>,
) -> PenaltySplit {
    let Some(escrow) = escrow else {
        return PenaltySplit::default();
    };
    let terms = match by {
        CancelledBy::Buyer => &policy.buyer,
        CancelledBy::Provider => &policy.provider,
        CancelledBy::System => {
            return PenaltySplit {
                buyer_refund: escrow.total,
                ..PenaltySplit::default()
            };
        }
    };
    let buyer_refund = escrow.total * terms.refund_rate;
    let seller_compensation = escrow.total * terms.compensation_rate;
    PenaltySplit {
        buyer_refund,
        seller_compensation,
        platform_fee: escrow.total - buyer_refund - seller_compensation,
        seller_penalty: escrow.principal * terms.penalty_rate,
    }
}

/// Spread `amount` over providers in proportion to their principal shares.
///
/// The last provider absorbs any rounding remainder so the parts always sum
/// to `amount`.
#[must_use]
pub fn allocate_pro_rata(amount: Decimal, shares: &[(UserId, Decimal)]) -> Vec<Payee> {
    let whole: Decimal = shares.iter().map(|(_, share)| *share).sum();
    if amount.is_zero() || shares.is_empty() || whole.is_zero() {
        return Vec::new();
    }
    let mut remaining = amount;
    let mut payees = Vec::with_capacity(shares.len());
    for (i, (account, share)) in shares.iter().enumerate() {
        let part = if i + 1 == shares.len() {
            remaining
        } else {
            (amount * *share / whole).round_dp(2)
        };
        remaining -= part;
        payees.push(Payee {
            account: *account,
            amount: part,
        });
    }
    payees
}

#[cfg(test)]
mod tests {
    use super::*;

    fn escrow(principal: i64, fee: i64) -> EscrowAmounts {
        EscrowAmounts {
            principal: Decimal::new(principal, 0),
            fee: Decimal::new(fee, 0),
            total: Decimal::new(principal + fee, 0),
        }
    }

    #[test]
    fn buyer_cancellation_split() {
        let split = penalty_split(&CancellationPolicy::default(), CancelledBy::Buyer, Some(&escrow(100, 0)));
        assert_eq!(split.buyer_refund, Decimal::new(90, 0));
        assert_eq!(split.seller_compensation, Decimal::new(5, 0));
        assert_eq!(split.platform_fee, Decimal::new(5, 0));
        assert_eq!(split.seller_penalty, Decimal::ZERO);
        assert_eq!(split.escrow_distributed(), Decimal::new(100, 0));
    }

    #[test]
    fn provider_cancellation_is_stricter() {
        let split = penalty_split(
            &CancellationPolicy::default(),
            CancelledBy::Provider,
            Some(&escrow(200, 5)),
        );
        assert_eq!(split.buyer_refund, Decimal::new(205, 0));
        assert_eq!(split.platform_fee, Decimal::ZERO);
        assert_eq!(split.seller_penalty, Decimal::new(20, 0));
    }

    #[test]
    fn system_cancellation_refunds_everything() {
        let split = penalty_split(&CancellationPolicy::default(), CancelledBy::System, Some(&escrow(50, 1)));
        assert_eq!(split.buyer_refund, Decimal::new(51, 0));
        assert_eq!(split.escrow_distributed(), Decimal::new(51, 0));
        assert_eq!(split.seller_penalty, Decimal::ZERO);
    }

    #[test]
    fn nothing_escrowed_splits_nothing() {
        let split = penalty_split(&CancellationPolicy::default(), CancelledBy::Buyer, None);
        assert_eq!(split, PenaltySplit::default());
    }

    #[test]
    fn pro_rata_sums_exactly() {
        let a = UserId::new();
        let b = UserId::new();
        let c = UserId::new();
        let shares = [
            (a, Decimal::ONE),
            (b, Decimal::ONE),
            (c, Decimal::ONE),
        ];
        let payees = allocate_pro_rata(Decimal::new(10, 0), &shares);
        assert_eq!(payees.len(), 3);
        assert_eq!(payees[0].amount, Decimal::new(333, 2));
        let total: Decimal = payees.iter().map(|p| p.amount).sum();
        assert_eq!(total, Decimal::new(10, 0));
    }

    #[test]
    fn pro_rata_of_zero_is_empty() {
        assert!(allocate_pro_rata(Decimal::ZERO, &[(UserId::new(), Decimal::ONE)]).is_empty());
    }
}
