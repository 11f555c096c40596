//! Upgrades, downgrades and activation of scheduled switches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    charge_period, ending, finish, move_links, purchase_charges, release_links,
    remaining_time_charges, unused_time_credits, Catalog, CustomerState,
};
use crate::billing_plan::{BillingPlan, InstancePatch, LineItem, Period};
use crate::error::{EntitleError, PlanFailure, Result};
use crate::ids::InstanceId;
use crate::instance::PlanInstance;
use crate::ledger;
use crate::lifecycle::{transition, CancelMode, InstanceState, LifecycleEvent};
use crate::plan::{FeatureQuantity, Plan};

/// When a switch takes effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchTiming {
    /// Replace the current instance now, with proration.
    Immediate,
    /// Keep the current instance until its cycle ends, then activate the target.
    EndOfCycle,
}

/// Intent to move a main instance to another plan in its group.
#[derive(Debug, Clone)]
pub struct SwitchContext<'a> {
    /// The customer's state.
    pub state: &'a CustomerState,
    /// Known plans.
    pub catalog: &'a Catalog,
    /// The live instance being replaced.
    pub current: InstanceId,
    /// The plan to switch to.
    pub target: &'a Plan,
    /// Prepaid quantities for the target.
    pub quantities: Vec<FeatureQuantity>,
    /// Explicit timing; derived from the commitments when `None`.
    pub timing: Option<SwitchTiming>,
    /// Evaluation instant.
    pub now: DateTime<Utc>,
}

/// Intent to activate a scheduled instance whose start has passed.
#[derive(Debug, Clone, Copy)]
pub struct ActivateContext<'a> {
    /// The customer's state.
    pub state: &'a CustomerState,
    /// Known plans.
    pub catalog: &'a Catalog,
    /// The scheduled instance.
    pub scheduled: InstanceId,
    /// Evaluation instant.
    pub now: DateTime<Utc>,
}

/// Computes switch and activation plans.
#[derive(Debug, Clone, Copy, Default)]
pub struct SwitchPlanComputer;

impl SwitchPlanComputer {
    /// Upgrades happen now; downgrades and equal commitments wait for the cycle end.
    ///
    /// An instance with no billing cycle always switches immediately.
    #[must_use]
    pub fn decide_timing(current: &PlanInstance, target: &Plan) -> SwitchTiming {
        if current.cadence.is_none() || target.recurring_commitment() > current.recurring_commitment()
        {
            SwitchTiming::Immediate
        } else {
            SwitchTiming::EndOfCycle
        }
    }

    /// Plan the switch of `ctx.current` to `ctx.target`.
    ///
    /// # Errors
    ///
    /// - `PlanFailure::SamePlan` if the target is the current plan version
    /// - `PlanFailure::SwitchAlreadyScheduled` if the target is already scheduled
    /// - `PlanFailure::CurrencyMismatch` for a paid target in another currency
    /// - `EntitleError::Validation` if the current instance is not live
    pub fn compute(ctx: &SwitchContext<'_>) -> Result<BillingPlan> {
        let current = ctx.state.instance(ctx.current)?;
        let target = ctx.target;
        if !current.state.is_live() {
            return Err(EntitleError::Validation(format!(
                "cannot switch from a {} instance",
                current.state.name()
            )));
        }
        if current.is_plan_version(&target.id, target.version) {
            return Err(PlanFailure::SamePlan {
                plan: target.id.clone(),
            }
            .into());
        }
        target.validate()?;
        if current.is_paid() && !target.is_free() && current.currency != target.currency {
            return Err(PlanFailure::CurrencyMismatch {
                expected: current.currency.clone(),
                found: target.currency.clone(),
            }
            .into());
        }

        let mut plan = BillingPlan::default();
        for scheduled in ctx.state.scheduled_in(current.entity, &current.group) {
            if scheduled.plan == target.id {
                return Err(PlanFailure::SwitchAlreadyScheduled {
                    group: current.group.clone(),
                }
                .into());
            }
            plan.remove(scheduled);
        }

        let timing = ctx
            .timing
            .unwrap_or_else(|| Self::decide_timing(current, target));
        match timing {
            SwitchTiming::Immediate => Self::immediate(ctx, current, &mut plan)?,
            SwitchTiming::EndOfCycle => Self::scheduled(ctx, current, &mut plan)?,
        }

        tracing::info!(
            customer_id = %ctx.state.customer,
            from_plan = %current.plan,
            to_plan = %target.id,
            timing = ?timing,
            "switch planned"
        );
        finish(ctx.state, plan)
    }

    fn immediate(
        ctx: &SwitchContext<'_>,
        current: &PlanInstance,
        plan: &mut BillingPlan,
    ) -> Result<()> {
        let target = ctx.target;
        let keeps_cycle = current.cadence.is_some() && current.cadence == target.billing_cadence();
        let anchor = if keeps_cycle {
            current.billing_anchor
        } else {
            ctx.now
        };

        let mut next = PlanInstance::from_plan(
            target,
            current.customer,
            current.entity,
            InstanceState::Active,
            anchor,
            &ctx.state.entities,
            ctx.quantities.clone(),
            ctx.now,
        )?;
        let open: Vec<_> = current
            .grants
            .iter()
            .filter(|g| !g.is_expired(ctx.now))
            .cloned()
            .collect();
        ledger::carry_usage(&open, &mut next.grants);

        plan.patch(
            current.id,
            ending(current, &LifecycleEvent::Expire { at: ctx.now }, ctx.now)?,
        );
        plan.line_items.extend(unused_time_credits(current, ctx.now)?);
        if let Some((start, end)) = charge_period(&next, ctx.now)? {
            plan.line_items
                .extend(remaining_time_charges(&next, start, end, ctx.now));
        }
        plan.line_items.extend(purchase_charges(&next, ctx.now)?);

        move_links(ctx.state, plan, current.id, next.id);
        plan.insert.push(next);
        Ok(())
    }

    fn scheduled(
        ctx: &SwitchContext<'_>,
        current: &PlanInstance,
        plan: &mut BillingPlan,
    ) -> Result<()> {
        let ends_at = match current.state {
            InstanceState::Canceling { ends_at, .. } => ends_at,
            _ => current.cycle_end(ctx.now)?,
        };
        let canceling = transition(
            &current.state,
            &LifecycleEvent::Cancel {
                mode: CancelMode::EndOfCycle,
                at: ctx.now,
                ends_at,
            },
        )?;
        plan.patch(current.id, InstancePatch::state(canceling));
        plan.insert.push(PlanInstance::from_plan(
            ctx.target,
            current.customer,
            current.entity,
            InstanceState::Scheduled { starts_at: ends_at },
            ends_at,
            &ctx.state.entities,
            ctx.quantities.clone(),
            ctx.now,
        )?);
        Ok(())
    }

    /// Plan the activation of a scheduled instance.
    ///
    /// The outgoing live instance of the group is billed for its arrear
    /// overage, expired at the scheduled start and its processor links move to
    /// the activated instance, which gets fresh grants.
    ///
    /// # Errors
    ///
    /// Returns `EntitleError::Validation` if the instance is not scheduled, not
    /// yet due, or its plan version is unknown.
    pub fn activate_scheduled(ctx: &ActivateContext<'_>) -> Result<BillingPlan> {
        let (scheduled, starts_at, target) = Self::scheduled_target(ctx)?;
        if starts_at > ctx.now {
            return Err(EntitleError::Validation(format!(
                "instance {} starts at {starts_at}",
                scheduled.id
            )));
        }

        let mut plan = BillingPlan::default();
        if let Some(outgoing) = ctx.state.live_main(scheduled.entity, &scheduled.group) {
            plan.line_items
                .extend(Self::arrear_overage(outgoing, starts_at)?);
            plan.patch(
                outgoing.id,
                ending(outgoing, &LifecycleEvent::Expire { at: starts_at }, starts_at)?,
            );
            move_links(ctx.state, &mut plan, outgoing.id, scheduled.id);
        }
        Self::activate(ctx, scheduled, target, plan)
    }

    /// Plan the early activation of the instance scheduled behind one that
    /// ended before its cycle did.
    ///
    /// The outgoing live instance expires at `ctx.now` and releases its
    /// processor subscriptions instead of handing them over; the successor
    /// starts now with fresh grants. Nothing is billed, since whoever ended the
    /// outgoing instance early settles it.
    ///
    /// # Errors
    ///
    /// Returns `EntitleError::Validation` if the instance is not scheduled or
    /// its plan version is unknown.
    pub fn activate_successor(ctx: &ActivateContext<'_>) -> Result<BillingPlan> {
        let (scheduled, _, target) = Self::scheduled_target(ctx)?;

        let mut plan = BillingPlan::default();
        if let Some(outgoing) = ctx.state.live_main(scheduled.entity, &scheduled.group) {
            plan.patch(
                outgoing.id,
                ending(outgoing, &LifecycleEvent::Expire { at: ctx.now }, ctx.now)?,
            );
            release_links(ctx.state, &mut plan, outgoing.id);
        }
        Self::activate(ctx, scheduled, target, plan)
    }

    fn scheduled_target<'a>(
        ctx: &ActivateContext<'a>,
    ) -> Result<(&'a PlanInstance, DateTime<Utc>, &'a Plan)> {
        let scheduled = ctx.state.instance(ctx.scheduled)?;
        let InstanceState::Scheduled { starts_at } = scheduled.state else {
            return Err(EntitleError::Validation(format!(
                "instance {} is {}, not scheduled",
                scheduled.id,
                scheduled.state.name()
            )));
        };
        let target = ctx
            .catalog
            .get(&scheduled.plan, scheduled.version)
            .ok_or_else(|| {
                EntitleError::Validation(format!(
                    "unknown plan {} version {}",
                    scheduled.plan, scheduled.version
                ))
            })?;
        Ok((scheduled, starts_at, target))
    }

    fn activate(
        ctx: &ActivateContext<'_>,
        scheduled: &PlanInstance,
        target: &Plan,
        mut plan: BillingPlan,
    ) -> Result<BillingPlan> {
        let active = transition(&scheduled.state, &LifecycleEvent::Activate { at: ctx.now })?;
        let grants = target.grants_for(
            scheduled.customer,
            scheduled.id,
            scheduled.entity,
            &ctx.state.entities,
            &scheduled.quantities,
            scheduled.billing_anchor,
            ctx.now,
        )?;
        plan.patch(
            scheduled.id,
            InstancePatch {
                state: Some(active),
                grants: Some(grants),
                ..InstancePatch::default()
            },
        );

        tracing::info!(
            customer_id = %ctx.state.customer,
            instance_id = %scheduled.id,
            plan_id = %scheduled.plan,
            "scheduled instance activated"
        );
        finish(ctx.state, plan)
    }

    /// One line item per open grant of `instance` that ran into billable overage.
    fn arrear_overage(instance: &PlanInstance, at: DateTime<Utc>) -> Result<Vec<LineItem>> {
        let period = instance
            .current_period(at)?
            .map_or(Period { start: at, end: at }, |(start, end)| Period { start, end });
        let mut items = Vec::new();
        for grant in instance.grants.iter().filter(|g| !g.is_expired(at)) {
            let overage = grant.overage();
            if overage.is_zero() {
                continue;
            }
            let Some(price) = instance
                .prices
                .iter()
                .find(|p| p.is_arrear() && p.feature() == Some(grant.feature()))
            else {
                continue;
            };
            let amount = price.charge_for(overage)?;
            if !amount.is_zero() {
                items.push(
                    LineItem::new(
                        instance.id,
                        amount,
                        format!("{overage} x {} overage", price.label),
                        period,
                    )
                    .for_grant(grant.id()),
                );
            }
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::*;
    use crate::ledger::{apply_usage_delta, BalanceScope};
    use rust_decimal_macros::dec;

    fn switch(
        state: &CustomerState,
        current: InstanceId,
        target: &Plan,
        now: DateTime<Utc>,
    ) -> Result<BillingPlan> {
        SwitchPlanComputer::compute(&SwitchContext {
            state,
            catalog: &catalog(),
            current,
            target,
            quantities: vec![],
            timing: None,
            now,
        })
    }

    #[test]
    fn upgrade_is_immediate_and_prorated() {
        let (state, id) = customer_on(&pro(), t(4, 1));
        let plan = switch(&state, id, &premium(), t(4, 16)).unwrap();

        assert!(plan.update_for(id).unwrap().state.unwrap().is_expired());
        let next = &plan.insert[0];
        assert_eq!(next.state, InstanceState::Active);
        assert_eq!(next.billing_anchor, t(4, 1));
        // -20 * 0.5 + 50 * 0.5
        assert_eq!(plan.total(), dec!(15));
        assert_eq!(plan.unlink.len(), 1);
        assert_eq!(plan.link[0].instance, next.id);
    }

    #[test]
    fn upgrade_carries_usage() {
        let (mut state, id) = customer_on(&pro(), t(4, 1));
        let scope = BalanceScope::customer(messages());
        apply_usage_delta(&mut state.instances[0].grants, &scope, dec!(120), t(4, 2)).unwrap();

        let plan = switch(&state, id, &premium(), t(4, 16)).unwrap();
        let grant = &plan.insert[0].grants[0];
        assert_eq!(grant.usage(), dec!(120));
        assert_eq!(grant.current_balance(), dec!(1880));
    }

    #[test]
    fn downgrade_waits_for_cycle_end() {
        let (state, id) = customer_on(&premium(), t(4, 1));
        let plan = switch(&state, id, &pro(), t(4, 16)).unwrap();

        assert_eq!(
            plan.update_for(id).unwrap().state,
            Some(InstanceState::Canceling {
                canceled_at: t(4, 16),
                ends_at: t(5, 1),
            })
        );
        assert_eq!(
            plan.insert[0].state,
            InstanceState::Scheduled { starts_at: t(5, 1) }
        );
        assert!(plan.line_items.is_empty());
    }

    #[test]
    fn second_downgrade_replaces_the_first() {
        let (mut state, id) = customer_on(&premium(), t(4, 1));
        let first = switch(&state, id, &pro(), t(4, 16)).unwrap();
        apply(&mut state, &first);

        let err = switch(&state, id, &pro(), t(4, 17)).unwrap_err();
        assert!(matches!(
            err,
            EntitleError::Precondition(PlanFailure::SwitchAlreadyScheduled { .. })
        ));

        let plan = switch(&state, id, &free(), t(4, 17)).unwrap();
        assert_eq!(plan.delete.len(), 1);
        assert_eq!(plan.insert[0].plan.as_str(), "free");
    }

    #[test]
    fn explicit_timing_overrides_commitment() {
        let (state, id) = customer_on(&premium(), t(4, 1));
        let plan = SwitchPlanComputer::compute(&SwitchContext {
            state: &state,
            catalog: &catalog(),
            current: id,
            target: &pro(),
            quantities: vec![],
            timing: Some(SwitchTiming::Immediate),
            now: t(4, 16),
        })
        .unwrap();
        // -50 * 0.5 + 20 * 0.5
        assert_eq!(plan.total(), dec!(-15));
    }

    #[test]
    fn same_plan_is_rejected() {
        let (state, id) = customer_on(&pro(), t(4, 1));
        let err = switch(&state, id, &pro(), t(4, 16)).unwrap_err();
        assert!(matches!(
            err,
            EntitleError::Precondition(PlanFailure::SamePlan { .. })
        ));
    }

    #[test]
    fn activation_bills_arrear_overage_and_moves_links() {
        let (mut state, id) = customer_on(&pro_arrear(), t(4, 1));
        let scope = BalanceScope::customer(messages());
        apply_usage_delta(&mut state.instances[0].grants, &scope, dec!(650), t(4, 5)).unwrap();
        let downgrade = switch(&state, id, &free(), t(4, 16)).unwrap();
        apply(&mut state, &downgrade);
        let scheduled = downgrade.insert[0].id;

        let plan = SwitchPlanComputer::activate_scheduled(&ActivateContext {
            state: &state,
            catalog: &catalog(),
            scheduled,
            now: t(5, 1),
        })
        .unwrap();

        assert_eq!(plan.line_items.len(), 1);
        assert_eq!(plan.line_items[0].amount, dec!(1.50));
        assert!(plan.line_items[0].related_grant.is_some());
        assert_eq!(
            plan.update_for(id).unwrap().state,
            Some(InstanceState::Expired {
                ended_at: t(5, 1),
                canceled_at: Some(t(4, 16)),
            })
        );
        let activated = plan.update_for(scheduled).unwrap();
        assert_eq!(activated.state, Some(InstanceState::Active));
        assert_eq!(activated.grants.as_ref().unwrap().len(), 1);
        assert_eq!(plan.link[0].instance, scheduled);
    }

    #[test]
    fn activation_before_start_is_rejected() {
        let (mut state, id) = customer_on(&premium(), t(4, 1));
        let downgrade = switch(&state, id, &pro(), t(4, 16)).unwrap();
        apply(&mut state, &downgrade);
        let err = SwitchPlanComputer::activate_scheduled(&ActivateContext {
            state: &state,
            catalog: &catalog(),
            scheduled: downgrade.insert[0].id,
            now: t(4, 20),
        })
        .unwrap_err();
        assert!(matches!(err, EntitleError::Validation(_)));
    }

    #[test]
    fn successor_activates_early_when_outgoing_ends_early() {
        let (mut state, id) = customer_on(&premium(), t(4, 1));
        let downgrade = switch(&state, id, &pro(), t(4, 16)).unwrap();
        apply(&mut state, &downgrade);
        let scheduled = downgrade.insert[0].id;

        let plan = SwitchPlanComputer::activate_successor(&ActivateContext {
            state: &state,
            catalog: &catalog(),
            scheduled,
            now: t(4, 20),
        })
        .unwrap();

        assert!(plan.line_items.is_empty());
        assert_eq!(
            plan.update_for(id).unwrap().state,
            Some(InstanceState::Expired {
                ended_at: t(4, 20),
                canceled_at: Some(t(4, 16)),
            })
        );
        assert_eq!(plan.unlink.len(), 1);
        assert!(plan.link.is_empty());

        apply(&mut state, &plan);
        let live = state.live_main(None, &group()).unwrap();
        assert_eq!(live.id, scheduled);
        assert_eq!(live.state, InstanceState::Active);
        assert!(state.refs_for(scheduled).is_empty());
    }
}
