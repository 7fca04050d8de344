//! Subscription records.
//!
//! Activity is evaluated lazily: a record stays `active` in storage after its
//! end date and is simply not counted by [`SubscriptionRecord::is_active_at`].

use crate::types::{Amount, CorrelationId, PlanId, SubscriptionId, Timestamp, TxId, UserId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub id: SubscriptionId,
    pub subscriber: UserId,
    pub plan: PlanId,
    /// Copied from the plan at purchase so later plan edits do not change entitlements.
    pub grants_trader: bool,
    pub price: Amount,
    /// Platform's cut of `price`. Equal to `price` for upgrade plans.
    pub commission: Amount,
    pub start: Timestamp,
    pub end: Timestamp,
    pub active: bool,
    pub payment_tx: TxId,
    /// This purchase moved the subscriber from customer to trader.
    pub promoted: bool,
    pub correlation: CorrelationId,
    pub reference: String,
    pub revoked_at: Option<Timestamp>,
}

impl SubscriptionRecord {
    pub fn is_active_at(&self, now: Timestamp) -> bool {
        self.active && now < self.end
    }

    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        now >= self.end
    }

    pub fn revoke(&mut self, timestamp: Timestamp) {
        self.active = false;
        self.revoked_at = Some(timestamp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MILLIS_PER_DAY;

    fn record() -> SubscriptionRecord {
        let start = Timestamp::from_millis(0);
        SubscriptionRecord {
            id: SubscriptionId(1),
            subscriber: UserId(1),
            plan: PlanId(1),
            grants_trader: false,
            price: Amount::new(rust_decimal_macros::dec!(100)),
            commission: Amount::new(rust_decimal_macros::dec!(20)),
            start,
            end: start.plus_days(30),
            active: true,
            payment_tx: TxId(1),
            promoted: false,
            correlation: CorrelationId(1),
            reference: "sub-1".into(),
            revoked_at: None,
        }
    }

    #[test]
    fn expires_lazily_at_end_date() {
        let sub = record();
        assert!(sub.is_active_at(Timestamp::from_millis(29 * MILLIS_PER_DAY)));
        assert!(!sub.is_active_at(sub.end));
        assert!(sub.is_expired_at(sub.end));
        // storage flag untouched
        assert!(sub.active);
    }

    #[test]
    fn revoked_is_inactive_before_end() {
        let mut sub = record();
        sub.revoke(Timestamp::from_millis(10));
        assert!(!sub.is_active_at(Timestamp::from_millis(11)));
        assert_eq!(sub.revoked_at, Some(Timestamp::from_millis(10)));
    }
}
