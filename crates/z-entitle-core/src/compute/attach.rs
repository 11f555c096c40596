//! Attaching a plan to a customer or one of its entities.

use chrono::{DateTime, Utc};

use super::{
    charge_period, ending, finish, move_links, purchase_charges, release_links,
    remaining_time_charges, unused_time_credits, Catalog, CustomerState, SwitchContext,
    SwitchPlanComputer,
};
use crate::billing_plan::{BillingAnchor, BillingPlan, SubscriptionLink};
use crate::calendar::CycleCalendar;
use crate::error::{PlanFailure, Result};
use crate::ids::EntityId;
use crate::instance::PlanInstance;
use crate::lifecycle::{InstanceState, LifecycleEvent};
use crate::plan::{FeatureQuantity, Plan};

/// Intent to attach a plan.
#[derive(Debug, Clone)]
pub struct AttachContext<'a> {
    /// The customer's state.
    pub state: &'a CustomerState,
    /// Known plans.
    pub catalog: &'a Catalog,
    /// The plan to attach.
    pub plan: &'a Plan,
    /// Attach to one entity instead of the customer.
    pub entity: Option<EntityId>,
    /// Prepaid quantities.
    pub quantities: Vec<FeatureQuantity>,
    /// Requested billing anchor; defaults to now.
    pub anchor: Option<DateTime<Utc>>,
    /// How far `now` may sit from the requested lattice and still count as on it.
    pub alignment_tolerance_seconds: i64,
    /// Evaluation instant.
    pub now: DateTime<Utc>,
}

/// Computes attach plans.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttachPlanComputer;

impl AttachPlanComputer {
    /// Plan attaching `ctx.plan`.
    ///
    /// Attaching a main plan to a scope that already has a live main plan in
    /// the group is a switch. A customer-level main plan supersedes the
    /// entity-level main plans of its group.
    ///
    /// # Errors
    ///
    /// - `PlanFailure::SamePlan` if the plan is already attached at this scope
    /// - `PlanFailure::CurrencyMismatch` for a paid plan in another currency
    /// - `PlanFailure::MissingPriceTerm` if the plan is malformed
    pub fn compute(ctx: &AttachContext<'_>) -> Result<BillingPlan> {
        let target = ctx.plan;
        target.validate()?;
        if let Some(currency) = ctx.state.live_currency() {
            if !target.is_free() && currency != target.currency {
                return Err(PlanFailure::CurrencyMismatch {
                    expected: currency.to_string(),
                    found: target.currency.clone(),
                }
                .into());
            }
        }

        if target.is_main() {
            if let Some(live) = ctx.state.live_main(ctx.entity, &target.group) {
                if live.plan == target.id {
                    return Err(PlanFailure::SamePlan {
                        plan: target.id.clone(),
                    }
                    .into());
                }
                return SwitchPlanComputer::compute(&SwitchContext {
                    state: ctx.state,
                    catalog: ctx.catalog,
                    current: live.id,
                    target,
                    quantities: ctx.quantities.clone(),
                    timing: None,
                    now: ctx.now,
                });
            }
        } else if target.is_add_on {
            let duplicate = ctx.state.instances.iter().any(|i| {
                i.plan == target.id && i.entity == ctx.entity && i.state.is_live()
            });
            if duplicate {
                return Err(PlanFailure::SamePlan {
                    plan: target.id.clone(),
                }
                .into());
            }
        }

        let mut plan = BillingPlan {
            anchor: Self::decide_anchor(ctx)?,
            ..BillingPlan::default()
        };
        let instance = PlanInstance::from_plan(
            target,
            ctx.state.customer,
            ctx.entity,
            InstanceState::Active,
            ctx.anchor.unwrap_or(ctx.now),
            &ctx.state.entities,
            ctx.quantities.clone(),
            ctx.now,
        )?;

        if let Some((start, end)) = charge_period(&instance, ctx.now)? {
            plan.line_items
                .extend(remaining_time_charges(&instance, start, end, ctx.now));
        }
        plan.line_items.extend(purchase_charges(&instance, ctx.now)?);

        match ctx.entity {
            None if target.is_main() => Self::supersede_entity_plans(ctx, &instance, &mut plan)?,
            None => {}
            Some(_) => Self::share_customer_subscription(ctx, &instance, &mut plan),
        }

        tracing::info!(
            customer_id = %ctx.state.customer,
            plan_id = %target.id,
            entity_id = ?ctx.entity,
            line_items = plan.line_items.len(),
            "attach planned"
        );
        plan.insert.push(instance);
        finish(ctx.state, plan)
    }

    /// `Natural` when `now` already sits on the requested lattice, else an override.
    fn decide_anchor(ctx: &AttachContext<'_>) -> Result<BillingAnchor> {
        let (Some(requested), Some(cadence)) = (ctx.anchor, ctx.plan.billing_cadence()) else {
            return Ok(BillingAnchor::Natural);
        };
        let aligned = CycleCalendar::new(requested, cadence)
            .is_aligned(ctx.now, ctx.alignment_tolerance_seconds)?;
        Ok(if aligned {
            BillingAnchor::Natural
        } else {
            BillingAnchor::Override { at: requested }
        })
    }

    /// Expire entity-level main plans of the group along with whatever is
    /// scheduled behind them; the first one's subscription carries over to
    /// `instance`.
    fn supersede_entity_plans(
        ctx: &AttachContext<'_>,
        instance: &PlanInstance,
        plan: &mut BillingPlan,
    ) -> Result<()> {
        let superseded: Vec<_> = ctx
            .state
            .instances
            .iter()
            .filter(|i| {
                i.entity.is_some() && i.group == instance.group && i.is_main() && i.state.is_live()
            })
            .collect();

        let mut carried = false;
        for old in superseded {
            plan.patch(
                old.id,
                ending(old, &LifecycleEvent::Expire { at: ctx.now }, ctx.now)?,
            );
            plan.line_items.extend(unused_time_credits(old, ctx.now)?);
            for scheduled in ctx.state.scheduled_in(old.entity, &instance.group) {
                plan.remove(scheduled);
            }
            if !carried && !ctx.state.refs_for(old.id).is_empty() {
                move_links(ctx.state, plan, old.id, instance.id);
                carried = true;
            } else {
                release_links(ctx.state, plan, old.id);
            }
        }
        Ok(())
    }

    /// Put an entity-level instance on the customer-level subscription, if any.
    fn share_customer_subscription(
        ctx: &AttachContext<'_>,
        instance: &PlanInstance,
        plan: &mut BillingPlan,
    ) {
        let shared = ctx
            .state
            .instances
            .iter()
            .filter(|i| i.entity.is_none() && i.state.is_live())
            .find_map(|i| ctx.state.refs_for(i.id).into_iter().next());
        if let Some(external_ref) = shared {
            plan.link.push(SubscriptionLink {
                instance: instance.id,
                external_ref,
            });
        }
    }
}
