//! Plan catalog.
//!
//! A [`Plan`] is one version of a commercial product: its prices and the
//! features it includes. Plan instances reference a plan by id and version;
//! a migration moves instances between versions of the same plan id.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::calendar::{Cadence, CycleCalendar};
use crate::error::{PlanFailure, Result};
use crate::grant::{Grant, ResetSchedule};
use crate::ids::{CustomerId, EntityId, FeatureId, GroupId, InstanceId, PlanId};
use crate::pricing::{PriceKind, PriceTerm, UsageModel};

/// Carry unused granted quantity into a separate grant at reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloverPolicy {
    /// Upper bound on the quantity carried per reset; `None` carries everything.
    pub max: Option<Decimal>,
    /// How many reset cycles a rollover grant lives.
    pub duration_cycles: u32,
}

/// A feature included in a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureItem {
    /// The feature.
    pub feature: FeatureId,
    /// Quantity granted each reset cycle (or once, for lifetime grants).
    pub included: Decimal,
    /// Reset cadence; `None` is a lifetime grant.
    pub reset: Option<Cadence>,
    /// Whether usage may run past the granted quantity and be billed.
    pub overage_allowed: bool,
    /// Cap on total usage for overage-allowed grants.
    pub usage_limit: Option<Decimal>,
    /// Grant the quantity to each entity rather than once to the customer.
    pub entity_scoped: bool,
    /// Rollover of unused quantity at reset.
    pub rollover: Option<RolloverPolicy>,
}

impl FeatureItem {
    /// A customer-level item with no overage and no rollover.
    #[must_use]
    pub const fn new(feature: FeatureId, included: Decimal, reset: Option<Cadence>) -> Self {
        Self {
            feature,
            included,
            reset,
            overage_allowed: false,
            usage_limit: None,
            entity_scoped: false,
            rollover: None,
        }
    }

    /// Allow overage, optionally capped at `usage_limit` total usage.
    #[must_use]
    pub fn with_overage(mut self, usage_limit: Option<Decimal>) -> Self {
        self.overage_allowed = true;
        self.usage_limit = usage_limit;
        self
    }

    /// Grant per entity.
    #[must_use]
    pub fn per_entity(mut self) -> Self {
        self.entity_scoped = true;
        self
    }

    /// Roll unused quantity over.
    #[must_use]
    pub fn with_rollover(mut self, rollover: RolloverPolicy) -> Self {
        self.rollover = Some(rollover);
        self
    }
}

/// Prepaid quantity bought for one feature on attach or update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureQuantity {
    /// The feature.
    pub feature: FeatureId,
    /// Quantity in raw units.
    pub quantity: Decimal,
}

/// One version of a commercial plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    /// Plan id, shared by all versions.
    pub id: PlanId,
    /// Version number.
    pub version: u32,
    /// Mutually-exclusive plan family.
    pub group: GroupId,
    /// Display name.
    pub name: String,
    /// Add-ons stack beside the main plan of their group.
    pub is_add_on: bool,
    /// The fallback plan of its group when a main plan is canceled.
    pub is_default: bool,
    /// ISO currency code.
    pub currency: String,
    /// Price terms.
    pub prices: Vec<PriceTerm>,
    /// Included features.
    pub features: Vec<FeatureItem>,
}

impl Plan {
    /// True when the plan has no price that can charge money.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.prices.iter().all(|price| match &price.kind {
            PriceKind::Fixed { amount, .. } | PriceKind::OneOff { amount } => amount.is_zero(),
            PriceKind::Usage { .. } => false,
        })
    }

    /// True when the plan has prices and none of them recur.
    #[must_use]
    pub fn is_one_off(&self) -> bool {
        !self.prices.is_empty() && self.prices.iter().all(|price| !price.is_recurring())
    }

    /// Main plans take part in group exclusivity.
    #[must_use]
    pub fn is_main(&self) -> bool {
        !self.is_add_on && !self.is_one_off()
    }

    /// Monthly-normalised sum of fixed recurring prices.
    #[must_use]
    pub fn recurring_commitment(&self) -> Decimal {
        self.prices.iter().map(PriceTerm::monthly_amount).sum()
    }

    /// Billing cadence: the cadence of the first recurring price.
    #[must_use]
    pub fn billing_cadence(&self) -> Option<Cadence> {
        self.prices.iter().find_map(PriceTerm::cadence)
    }

    /// The included item for a feature.
    #[must_use]
    pub fn feature(&self, feature: &FeatureId) -> Option<&FeatureItem> {
        self.features.iter().find(|item| &item.feature == feature)
    }

    /// The usage price metering a feature.
    #[must_use]
    pub fn usage_price(&self, feature: &FeatureId) -> Option<&PriceTerm> {
        self.prices
            .iter()
            .find(|price| price.feature() == Some(feature))
    }

    /// Prepaid usage prices, the ones whose quantity is bought up front.
    pub fn prepaid_prices(&self) -> impl Iterator<Item = &PriceTerm> {
        self.prices.iter().filter(|price| {
            matches!(
                price.kind,
                PriceKind::Usage {
                    model: UsageModel::Prepaid,
                    ..
                }
            )
        })
    }

    /// Whether two versions charge the same prices.
    #[must_use]
    pub fn same_prices(&self, other: &Self) -> bool {
        self.prices == other.prices
    }

    /// Check that every overage-enabled feature has a usage price to bill it.
    ///
    /// # Errors
    ///
    /// Returns `PlanFailure::MissingPriceTerm` naming the first unpriced feature.
    pub fn validate(&self) -> std::result::Result<(), PlanFailure> {
        for item in &self.features {
            if item.overage_allowed && self.usage_price(&item.feature).is_none() {
                return Err(PlanFailure::MissingPriceTerm {
                    plan: self.id.clone(),
                    feature: item.feature.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Materialise the grants of a new instance of this plan.
    ///
    /// Entity-scoped items produce one grant per entity in `entities`; other
    /// items produce a single grant at the instance's own scope. Periodic
    /// grants take their reset lattice from `anchor`.
    ///
    /// # Errors
    ///
    /// Returns a calendar error if a reset boundary is not representable.
    #[allow(clippy::too_many_arguments)]
    pub fn grants_for(
        &self,
        customer: CustomerId,
        instance: InstanceId,
        scope_entity: Option<EntityId>,
        entities: &[EntityId],
        prepaid: &[FeatureQuantity],
        anchor: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Grant>> {
        let mut grants = Vec::new();
        for item in &self.features {
            let purchased = prepaid
                .iter()
                .filter(|q| q.feature == item.feature)
                .map(|q| q.quantity)
                .sum::<Decimal>();

            let reset = match item.reset {
                Some(cadence) => {
                    let mut next = CycleCalendar::new(anchor, cadence).cycle_end(now)?;
                    if next <= now {
                        next = crate::calendar::add_intervals(next, cadence, 1)?;
                    }
                    Some(ResetSchedule {
                        cadence,
                        anchor,
                        next_reset: next,
                    })
                }
                None => None,
            };

            let targets: Vec<Option<EntityId>> = if item.entity_scoped && scope_entity.is_none() {
                entities.iter().copied().map(Some).collect()
            } else {
                vec![scope_entity]
            };

            for entity in targets {
                let mut grant = Grant::new(
                    customer,
                    instance,
                    self.id.clone(),
                    item.feature.clone(),
                    item.included,
                    now,
                )
                .with_purchased(purchased);
                if let Some(entity) = entity {
                    grant = grant.with_entity(entity);
                }
                if item.overage_allowed {
                    grant = grant.with_overage(item.usage_limit);
                }
                if let Some(schedule) = reset {
                    grant = grant.with_reset(schedule);
                }
                if let Some(policy) = item.rollover {
                    grant = grant.with_rollover(policy);
                }
                grants.push(grant);
            }
        }
        Ok(grants)
    }
}
