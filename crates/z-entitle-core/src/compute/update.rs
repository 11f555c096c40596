//! In-place updates of an instance's terms and prepaid quantities.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use super::{
    charge_period, finish, regrant_all, remaining_time_charges, unused_time_credits, Catalog,
    CancelContext, CancelPlanComputer, CustomerState,
};
use crate::billing_plan::{BillingPlan, InstancePatch, LineItem, Period};
use crate::calendar::remaining_fraction;
use crate::error::{EntitleError, PlanFailure, Result};
use crate::grant::{Grant, GrantSource};
use crate::ids::InstanceId;
use crate::instance::PlanInstance;
use crate::ledger;
use crate::lifecycle::CancelMode;
use crate::plan::{FeatureQuantity, Plan};
use crate::pricing::{PriceKind, PriceTerm, UsageModel};

/// Intent to change one instance without replacing it.
#[derive(Debug, Clone)]
pub struct UpdateContext<'a> {
    /// The customer's state.
    pub state: &'a CustomerState,
    /// Known plans, for a combined cancel.
    pub catalog: &'a Catalog,
    /// The instance to update.
    pub instance: InstanceId,
    /// New terms; must be a version of the instance's plan.
    pub target: Option<&'a Plan>,
    /// New prepaid quantities, per feature.
    pub quantities: Option<Vec<FeatureQuantity>>,
    /// Cancel the instance as part of the same update.
    pub cancel: Option<CancelMode>,
    /// Evaluation instant.
    pub now: DateTime<Utc>,
}

/// Computes update plans.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdatePlanComputer;

impl UpdatePlanComputer {
    /// Plan the update of `ctx.instance`.
    ///
    /// New terms regrant the instance in place and bill the price difference
    /// for the rest of the cycle. New quantities change the purchased quantity
    /// of the matching grants and bill the prorated difference. A cancel is
    /// planned alongside and the update wins where both touch the same field.
    /// An immediate cancel drops the update's charges and credits; only the
    /// refund of the old terms is billed.
    ///
    /// # Errors
    ///
    /// - `EntitleError::Validation` for a different plan id, an expired
    ///   instance, or a quantity on a feature with no prepaid price
    /// - `PlanFailure::CurrencyMismatch` if the new terms change currency
    pub fn compute(ctx: &UpdateContext<'_>) -> Result<BillingPlan> {
        let instance = ctx.state.instance(ctx.instance)?;
        if instance.state.is_expired() {
            return Err(EntitleError::Validation(format!(
                "instance {} is expired",
                instance.id
            )));
        }

        let mut plan = BillingPlan::default();
        let mut patch = InstancePatch::default();
        let mut grants = instance.grants.clone();
        let mut prices = instance.prices.clone();

        if let Some(target) = ctx.target {
            if target.id != instance.plan {
                return Err(EntitleError::Validation(format!(
                    "cannot update {} to plan {}; switch plans instead",
                    instance.plan, target.id
                )));
            }
            target.validate()?;
            if target.currency != instance.currency {
                return Err(PlanFailure::CurrencyMismatch {
                    expected: instance.currency.clone(),
                    found: target.currency.clone(),
                }
                .into());
            }
            if !instance.state.is_scheduled() {
                grants = regrant_all(instance, target, &ctx.state.entities, ctx.now)?;
            }
            if target.version != instance.version {
                patch.version = Some(target.version);
            }
            if target.prices != instance.prices {
                if instance.state.is_live() {
                    plan.line_items
                        .extend(Self::price_change(instance, target, ctx.now)?);
                }
                prices.clone_from(&target.prices);
                patch.prices = Some(target.prices.clone());
            }
        }

        if let Some(quantities) = &ctx.quantities {
            let merged = Self::quantity_change(
                instance,
                &prices,
                quantities,
                &mut grants,
                &mut plan.line_items,
                ctx.now,
            )?;
            if merged != instance.quantities {
                patch.quantities = Some(merged);
            }
        }

        let cancel = ctx
            .cancel
            .map(|mode| {
                CancelPlanComputer::compute(&CancelContext {
                    state: ctx.state,
                    catalog: ctx.catalog,
                    instance: instance.id,
                    mode,
                    require_default: false,
                    now: ctx.now,
                })
            })
            .transpose()?;
        let ends_now = cancel.as_ref().is_some_and(|c| {
            c.update_for(instance.id)
                .and_then(|p| p.state)
                .is_some_and(|s| s.is_expired())
        });
        if ends_now {
            // The instance ends now: the cancel's refund of the paid terms is
            // the only money movement, and the new grants end with it.
            plan.line_items.clear();
            for grant in grants.iter_mut().filter(|g| !g.is_expired(ctx.now)) {
                ledger::expire(grant, ctx.now);
            }
        }

        if grants != instance.grants {
            patch.grants = Some(grants);
        }
        plan.patch(instance.id, patch);
        if let Some(cancel) = cancel {
            plan = cancel.merge(plan);
        }

        tracing::info!(
            customer_id = %ctx.state.customer,
            instance_id = %instance.id,
            line_items = plan.line_items.len(),
            "update planned"
        );
        finish(ctx.state, plan)
    }

    /// Credit the old fixed prices and charge the new ones for the rest of the cycle.
    fn price_change(
        instance: &PlanInstance,
        target: &Plan,
        now: DateTime<Utc>,
    ) -> Result<Vec<LineItem>> {
        let mut items = unused_time_credits(instance, now)?;
        let updated = PlanInstance {
            prices: target.prices.clone(),
            cadence: target.billing_cadence(),
            ..instance.clone()
        };
        if let Some((start, end)) = charge_period(&updated, now)? {
            items.extend(remaining_time_charges(&updated, start, end, now));
        }
        Ok(items)
    }

    /// Apply new prepaid quantities; returns the merged quantity list.
    fn quantity_change(
        instance: &PlanInstance,
        prices: &[PriceTerm],
        quantities: &[FeatureQuantity],
        grants: &mut [Grant],
        line_items: &mut Vec<LineItem>,
        now: DateTime<Utc>,
    ) -> Result<Vec<FeatureQuantity>> {
        let mut merged = instance.quantities.clone();
        let fraction = match charge_period(instance, now)? {
            Some((start, end)) => remaining_fraction(start, end, now),
            None => Decimal::ONE,
        };

        for wanted in quantities {
            if wanted.quantity < Decimal::ZERO {
                return Err(EntitleError::Validation(format!(
                    "negative quantity for {}",
                    wanted.feature
                )));
            }
            let price = prices
                .iter()
                .find(|p| {
                    matches!(
                        p.kind,
                        PriceKind::Usage {
                            model: UsageModel::Prepaid,
                            ..
                        }
                    ) && p.feature() == Some(&wanted.feature)
                })
                .ok_or_else(|| {
                    EntitleError::Validation(format!(
                        "feature {} has no prepaid price",
                        wanted.feature
                    ))
                })?;

            let held: Decimal = merged
                .iter()
                .filter(|q| q.feature == wanted.feature)
                .map(|q| q.quantity)
                .sum();
            let delta = wanted.quantity - held;
            if delta.is_zero() {
                continue;
            }

            for grant in grants.iter_mut().filter(|g| {
                g.feature() == &wanted.feature
                    && g.source() == GrantSource::Plan
                    && !g.is_expired(now)
            }) {
                ledger::top_up(grant, delta)?;
            }

            let amount = (price.charge_for(wanted.quantity)? - price.charge_for(held)?) * fraction;
            if !amount.is_zero() {
                line_items.push(LineItem::new(
                    instance.id,
                    amount,
                    format!("{} from {held} to {}", price.label, wanted.quantity),
                    Period {
                        start: now,
                        end: now,
                    },
                ));
            }

            merged.retain(|q| q.feature != wanted.feature);
            merged.push(wanted.clone());
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::*;
    use crate::calendar::Cadence;
    use crate::lifecycle::InstanceState;
    use crate::pricing::{TierBehavior, UsageTier};
    use rust_decimal_macros::dec;

    fn with_seats() -> Plan {
        let mut plan = pro();
        plan.prices.push(PriceTerm::usage(
            "Messages pack",
            messages(),
            vec![UsageTier::unbounded(dec!(0.10))],
            TierBehavior::Graduated,
            Decimal::ONE,
            UsageModel::Prepaid,
            Some(Cadence::monthly()),
        ));
        plan
    }

    fn update(
        state: &CustomerState,
        target: Option<&Plan>,
        quantities: Option<Vec<FeatureQuantity>>,
        cancel: Option<CancelMode>,
    ) -> Result<BillingPlan> {
        UpdatePlanComputer::compute(&UpdateContext {
            state,
            catalog: &catalog(),
            instance: state.instances[0].id,
            target,
            quantities,
            cancel,
            now: t(4, 16),
        })
    }

    fn messages_quantity(quantity: Decimal) -> Option<Vec<FeatureQuantity>> {
        Some(vec![FeatureQuantity {
            feature: messages(),
            quantity,
        }])
    }

    #[test]
    fn new_version_regrants_and_bills_difference() {
        let (state, id) = customer_on(&pro(), t(4, 1));
        let mut v2 = pro();
        v2.version = 2;
        v2.prices = vec![PriceTerm::fixed("pro", dec!(30), Cadence::monthly())];
        v2.features[0].included = dec!(800);

        let plan = update(&state, Some(&v2), None, None).unwrap();
        let patch = plan.update_for(id).unwrap();
        assert_eq!(patch.version, Some(2));
        assert_eq!(patch.grants.as_ref().unwrap()[0].granted(), dec!(800));
        // -20 * 0.5 + 30 * 0.5
        assert_eq!(plan.total(), dec!(5));
        assert!(plan.insert.is_empty());
    }

    #[test]
    fn other_plan_is_rejected() {
        let (state, _) = customer_on(&pro(), t(4, 1));
        let premium = premium();
        let err = update(&state, Some(&premium), None, None).unwrap_err();
        assert!(matches!(err, EntitleError::Validation(_)));
    }

    #[test]
    fn quantity_increase_tops_up_and_charges_prorated() {
        let (state, id) = customer_on(&with_seats(), t(4, 1));
        let plan = update(&state, None, messages_quantity(dec!(200)), None).unwrap();

        let patch = plan.update_for(id).unwrap();
        assert_eq!(patch.grants.as_ref().unwrap()[0].purchased(), dec!(200));
        assert_eq!(patch.quantities.as_ref().unwrap()[0].quantity, dec!(200));
        // 200 * 0.10 * 0.5
        assert_eq!(plan.total(), dec!(10));
    }

    #[test]
    fn quantity_without_prepaid_price_is_rejected() {
        let (state, _) = customer_on(&pro(), t(4, 1));
        let err = update(&state, None, messages_quantity(dec!(10)), None).unwrap_err();
        assert!(matches!(err, EntitleError::Validation(_)));
    }

    #[test]
    fn combined_cancel_keeps_cancel_state() {
        let (state, id) = customer_on(&pro(), t(4, 1));
        let mut v2 = pro();
        v2.version = 2;
        let plan = update(&state, Some(&v2), None, Some(CancelMode::EndOfCycle)).unwrap();
        let patch = plan.update_for(id).unwrap();
        assert_eq!(patch.version, Some(2));
        assert!(matches!(patch.state, Some(InstanceState::Canceling { .. })));
        assert_eq!(plan.insert.len(), 1);
    }

    #[test]
    fn immediate_cancel_bills_only_the_refund() {
        let (state, id) = customer_on(&pro(), t(4, 1));
        let mut v2 = pro();
        v2.version = 2;
        v2.prices = vec![PriceTerm::fixed("pro", dec!(30), Cadence::monthly())];
        v2.features[0].included = dec!(800);

        let plan = update(&state, Some(&v2), None, Some(CancelMode::Immediately)).unwrap();

        assert_eq!(plan.line_items.len(), 1);
        // -20 * 0.5, same as cancelling alone
        assert_eq!(plan.total(), dec!(-10));
        let cancel_only = update(&state, None, None, Some(CancelMode::Immediately)).unwrap();
        assert_eq!(plan.total(), cancel_only.total());

        let patch = plan.update_for(id).unwrap();
        assert!(matches!(patch.state, Some(InstanceState::Expired { .. })));
        assert_eq!(patch.version, Some(2));
        let grants = patch.grants.as_ref().unwrap();
        assert_eq!(grants[0].granted(), dec!(800));
        assert!(grants.iter().all(|g| g.is_expired(t(4, 16))));
    }

    #[test]
    fn immediate_cancel_drops_quantity_charges() {
        let (state, _) = customer_on(&with_seats(), t(4, 1));
        let plan = update(
            &state,
            None,
            messages_quantity(dec!(200)),
            Some(CancelMode::Immediately),
        )
        .unwrap();
        assert!(plan.line_items.iter().all(|item| item.amount < Decimal::ZERO));
    }
}
