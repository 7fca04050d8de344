// 4.0: plan catalog. one Plan type with shared fields and a tagged kind:
// trader-authored plans pay the author minus a platform commission,
// upgrade plans are sold by the platform and can grant trader privileges.
// 4.1 has the draft/update types used by the catalog operations.

use crate::types::{Amount, Percent, PlanId, Timestamp, UserId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlanKind {
    Trader { commission: Percent },
    Upgrade { grants_trader: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub owner: UserId,
    pub name: String,
    pub price: Amount,
    pub duration_days: u32,
    pub active: bool,
    pub kind: PlanKind,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Plan {
    pub fn from_draft(id: PlanId, owner: UserId, draft: PlanDraft, timestamp: Timestamp) -> Self {
        Self {
            id,
            owner,
            name: draft.name,
            price: draft.price,
            duration_days: draft.duration_days,
            active: draft.active,
            kind: draft.kind,
            created_at: timestamp,
            updated_at: timestamp,
        }
    }

    pub fn is_upgrade(&self) -> bool {
        matches!(self.kind, PlanKind::Upgrade { .. })
    }

    pub fn grants_trader(&self) -> bool {
        matches!(self.kind, PlanKind::Upgrade { grants_trader: true })
    }

    /// Platform cut for trader plans. Upgrade plans are not split.
    pub fn commission(&self) -> Option<Percent> {
        match self.kind {
            PlanKind::Trader { commission } => Some(commission),
            PlanKind::Upgrade { .. } => None,
        }
    }

    pub fn end_date(&self, start: Timestamp) -> Timestamp {
        start.plus_days(self.duration_days)
    }
}

// 4.1: what a plan owner submits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanDraft {
    pub name: String,
    pub price: Amount,
    pub duration_days: u32,
    pub kind: PlanKind,
    pub active: bool,
}

impl PlanDraft {
    pub fn trader(name: impl Into<String>, price: Amount, duration_days: u32, commission: Percent) -> Self {
        Self {
            name: name.into(),
            price,
            duration_days,
            kind: PlanKind::Trader { commission },
            active: true,
        }
    }

    pub fn upgrade(name: impl Into<String>, price: Amount, duration_days: u32) -> Self {
        Self {
            name: name.into(),
            price,
            duration_days,
            kind: PlanKind::Upgrade { grants_trader: true },
            active: true,
        }
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    pub fn validate(&self) -> Result<(), PlanError> {
        validate_terms(self.price, self.duration_days)
    }
}

/// Partial edit. `None` leaves the field as it is.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanUpdate {
    pub name: Option<String>,
    pub price: Option<Amount>,
    pub duration_days: Option<u32>,
    pub active: Option<bool>,
    pub commission: Option<Percent>,
}

impl PlanUpdate {
    pub fn apply(&self, plan: &mut Plan, timestamp: Timestamp) -> Result<(), PlanError> {
        let price = self.price.unwrap_or(plan.price);
        let duration_days = self.duration_days.unwrap_or(plan.duration_days);
        validate_terms(price, duration_days)?;

        if let Some(commission) = self.commission {
            match &mut plan.kind {
                PlanKind::Trader { commission: current } => *current = commission,
                PlanKind::Upgrade { .. } => return Err(PlanError::CommissionOnUpgradePlan),
            }
        }

        if let Some(name) = &self.name {
            plan.name = name.clone();
        }
        if let Some(active) = self.active {
            plan.active = active;
        }
        plan.price = price;
        plan.duration_days = duration_days;
        plan.updated_at = timestamp;
        Ok(())
    }
}

fn validate_terms(price: Amount, duration_days: u32) -> Result<(), PlanError> {
    if !price.is_positive() {
        return Err(PlanError::NonPositivePrice(price));
    }
    if duration_days == 0 {
        return Err(PlanError::ZeroDuration);
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("Plan price must be positive, got {0}")]
    NonPositivePrice(Amount),

    #[error("Plan duration must be at least one day")]
    ZeroDuration,

    #[error("Upgrade plans do not carry a commission")]
    CommissionOnUpgradePlan,
}
