//! Settlement: multi-party money movement for plan purchases.

use super::core::{require_user, Engine};
use super::results::EngineError;
use crate::events::{EventPayload, SettlementEvent};
use crate::ledger::{internal_reference, Delta, TxLink};
use crate::plan::Plan;
use crate::settlement::{
    is_balanced, settlement_legs, split_commission, CommissionSplit, LegRole, SettlementResult, Split,
};
use crate::store::{State, UnitOfWork};
use crate::types::{Amount, PlanId, Timestamp, UserId};
use tracing::{debug, info};

impl Engine {
    /// How a plan's price is divided. Upgrade plans go to the platform whole.
    pub(super) fn split_for(&self, plan: &Plan) -> Split {
        match plan.commission() {
            Some(rate) => Split::Commission { recipient: plan.owner, rate },
            None => Split::PlatformOnly,
        }
    }

    /// Every precondition, checked before the ledger is touched.
    pub(super) fn check_settlement(
        &self,
        state: &State,
        payer: UserId,
        plan: &Plan,
        now: Timestamp,
    ) -> Result<(), EngineError> {
        require_user(state, payer)?;

        if !plan.active {
            return Err(EngineError::PlanInactive(plan.id));
        }

        if plan.owner == payer {
            return Err(EngineError::SelfSubscriptionForbidden(payer));
        }

        // one active upgrade at a time, whichever upgrade plan it was bought through
        let already_held = state.subscriptions.values().any(|s| {
            s.subscriber == payer && s.is_active_at(now) && (s.plan == plan.id || (plan.grants_trader() && s.grants_trader))
        });
        if already_held {
            return Err(EngineError::AlreadySubscribed { subscriber: payer, plan: plan.id });
        }

        // wallets open on first credit, so a payer without one simply holds nothing
        let available = state.ledger.balance(payer);
        if available < plan.price {
            return Err(EngineError::InsufficientFunds { wallet: payer, requested: plan.price, available });
        }

        Ok(())
    }

    // 12.2: payer debit, platform credit, recipient credit. all inside the caller's
    // unit of work so the subscription record and any role change commit with them.
    pub(super) fn settle_in(
        &self,
        uow: &mut UnitOfWork<'_>,
        payer: UserId,
        plan: &Plan,
        reference: &str,
        link: Option<TxLink>,
    ) -> Result<SettlementResult, EngineError> {
        let now = uow.now();
        if let Err(err) = self.check_settlement(uow.state(), payer, plan, now) {
            debug!(%payer, plan = %plan.id, %err, "settlement rejected");
            return Err(err);
        }

        let (split, legs) = settlement_legs(
            payer,
            self.config.platform_account,
            plan.price,
            self.split_for(plan),
            self.config.money_scale,
            self.config.rounding,
        );
        debug_assert!(is_balanced(&legs));

        let correlation = uow.next_correlation();
        let mut records = Vec::with_capacity(legs.len());
        // scoped by payer: the platform and recipient wallets see legs from many payers
        let scope = format!("{payer}/{reference}");

        for leg in &legs {
            let suffix = match leg.role {
                LegRole::Payer => "payer",
                LegRole::Platform => "platform",
                LegRole::Recipient => "recipient",
            };
            let mut delta = Delta::new(leg.party, leg.amount, leg.kind, internal_reference(&scope, suffix), correlation);
            if let Some(link) = link {
                delta = delta.linked(link);
            }

            let applied = uow.apply_delta(&delta)?;
            if applied.replayed {
                // a settlement reference is single use, a replay here means it leaked into another request
                return Err(EngineError::InvalidInput(format!("reference {reference:?} was already settled")));
            }
            records.push(applied.record);
        }

        uow.emit(EventPayload::SettlementCompleted(SettlementEvent {
            correlation,
            plan: plan.id,
            payer,
            price: split.price,
            commission: split.commission,
            recipient_share: split.recipient_share,
        }));

        info!(
            %payer,
            plan = %plan.id,
            price = %split.price,
            commission = %split.commission,
            recipient_share = %split.recipient_share,
            %correlation,
            "settlement committed"
        );

        Ok(SettlementResult {
            correlation,
            plan: plan.id,
            payer,
            split,
            records,
            settled_at: now,
        })
    }

    /// What buying `plan_id` would cost and who would receive what.
    pub fn preview_settlement(&self, plan_id: PlanId) -> Result<CommissionSplit, EngineError> {
        let plan = self.get_plan(plan_id)?;
        Ok(match self.split_for(&plan) {
            Split::PlatformOnly => CommissionSplit {
                price: plan.price,
                commission: plan.price,
                recipient_share: Amount::zero(),
            },
            Split::Commission { rate, .. } => {
                split_commission(plan.price, rate, self.config.money_scale, self.config.rounding)
            }
        })
    }
}
