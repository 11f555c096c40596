//! Cancel and uncancel.

use chrono::{DateTime, Utc};

use super::{ending, finish, release_links, unused_time_credits, Catalog, CustomerState};
use crate::billing_plan::{BillingPlan, InstancePatch};
use crate::error::{PlanFailure, Result};
use crate::ids::InstanceId;
use crate::instance::PlanInstance;
use crate::lifecycle::{transition, CancelMode, InstanceState, LifecycleEvent};

/// Intent to cancel one instance.
#[derive(Debug, Clone, Copy)]
pub struct CancelContext<'a> {
    /// The customer's state.
    pub state: &'a CustomerState,
    /// Known plans, for the default fallback.
    pub catalog: &'a Catalog,
    /// The instance to cancel.
    pub instance: InstanceId,
    /// Immediately or at the end of the current cycle.
    pub mode: CancelMode,
    /// Fail with `NoDefaultPlan` when the group has no default to fall back to.
    pub require_default: bool,
    /// Evaluation instant.
    pub now: DateTime<Utc>,
}

/// Intent to take back an end-of-cycle cancel.
#[derive(Debug, Clone, Copy)]
pub struct UncancelContext<'a> {
    /// The customer's state.
    pub state: &'a CustomerState,
    /// The canceling instance.
    pub instance: InstanceId,
    /// Evaluation instant.
    pub now: DateTime<Utc>,
}

/// Computes cancel and uncancel plans.
#[derive(Debug, Clone, Copy, Default)]
pub struct CancelPlanComputer;

impl CancelPlanComputer {
    /// Plan the cancellation of `ctx.instance`.
    ///
    /// A scheduled instance is deleted outright. A main instance is followed by
    /// the group's default plan: active now for an immediate cancel, scheduled
    /// at the cycle end otherwise. Repeating an end-of-cycle cancel returns an
    /// empty plan.
    ///
    /// # Errors
    ///
    /// - `PlanFailure::InstanceNotFound` if the instance is unknown
    /// - `PlanFailure::NotCancelable` if it already expired
    /// - `PlanFailure::NoDefaultPlan` if a default is required but missing
    pub fn compute(ctx: &CancelContext<'_>) -> Result<BillingPlan> {
        let instance = ctx.state.instance(ctx.instance)?;
        let mut plan = BillingPlan::default();

        match instance.state {
            InstanceState::Expired { .. } => {
                return Err(PlanFailure::NotCancelable {
                    instance: instance.id,
                    reason: "already expired".into(),
                }
                .into());
            }
            InstanceState::Scheduled { .. } => {
                plan.remove(instance);
                return finish(ctx.state, plan);
            }
            InstanceState::Canceling { .. } if ctx.mode == CancelMode::EndOfCycle => {
                tracing::debug!(instance_id = %instance.id, "cancel already pending");
                return Ok(plan);
            }
            InstanceState::Active
            | InstanceState::Canceling { .. }
            | InstanceState::PastDue { .. } => {}
        }

        // Nothing recurs, so there is no cycle to wait for.
        let mode = if instance.cadence.is_none() {
            CancelMode::Immediately
        } else {
            ctx.mode
        };
        let ends_at = match mode {
            CancelMode::Immediately => ctx.now,
            CancelMode::EndOfCycle => instance.cycle_end(ctx.now)?,
        };
        let event = LifecycleEvent::Cancel {
            mode,
            at: ctx.now,
            ends_at,
        };

        match mode {
            CancelMode::Immediately => {
                plan.patch(instance.id, ending(instance, &event, ctx.now)?);
                if !matches!(instance.state, InstanceState::PastDue { .. }) {
                    plan.line_items
                        .extend(unused_time_credits(instance, ctx.now)?);
                }
            }
            CancelMode::EndOfCycle => {
                let next = transition(&instance.state, &event)?;
                plan.patch(instance.id, InstancePatch::state(next));
            }
        }

        for scheduled in ctx.state.scheduled_in(instance.entity, &instance.group) {
            plan.remove(scheduled);
        }

        if instance.is_main() {
            Self::fall_back_to_default(ctx, instance, mode, ends_at, &mut plan)?;
        }

        if mode == CancelMode::Immediately {
            release_links(ctx.state, &mut plan, instance.id);
        }

        tracing::info!(
            customer_id = %ctx.state.customer,
            instance_id = %instance.id,
            mode = ?mode,
            ends_at = %ends_at,
            "cancel planned"
        );
        finish(ctx.state, plan)
    }

    fn fall_back_to_default(
        ctx: &CancelContext<'_>,
        instance: &PlanInstance,
        mode: CancelMode,
        ends_at: DateTime<Utc>,
        plan: &mut BillingPlan,
    ) -> Result<()> {
        let Some(default) = ctx.catalog.default_for(&instance.group) else {
            if ctx.require_default {
                return Err(PlanFailure::NoDefaultPlan {
                    group: instance.group.clone(),
                }
                .into());
            }
            return Ok(());
        };
        if default.id == instance.plan {
            return Ok(());
        }

        let state = match mode {
            CancelMode::Immediately => InstanceState::Active,
            CancelMode::EndOfCycle => InstanceState::Scheduled { starts_at: ends_at },
        };
        plan.insert.push(PlanInstance::from_plan(
            default,
            instance.customer,
            instance.entity,
            state,
            ends_at,
            &ctx.state.entities,
            Vec::new(),
            ctx.now,
        )?);
        Ok(())
    }

    /// Plan taking back a pending end-of-cycle cancel.
    ///
    /// The instance returns to active and the successor scheduled in its group
    /// is deleted.
    ///
    /// # Errors
    ///
    /// Returns `PlanFailure::NotCanceling` unless the instance is canceling.
    pub fn uncancel(ctx: &UncancelContext<'_>) -> Result<BillingPlan> {
        let instance = ctx.state.instance(ctx.instance)?;
        if !instance.state.is_canceling() {
            return Err(PlanFailure::NotCanceling {
                instance: instance.id,
            }
            .into());
        }
        let mut plan = BillingPlan::default();
        let next = transition(&instance.state, &LifecycleEvent::Uncancel)?;
        plan.patch(instance.id, InstancePatch::state(next));
        for scheduled in ctx.state.scheduled_in(instance.entity, &instance.group) {
            plan.remove(scheduled);
        }
        tracing::info!(
            customer_id = %ctx.state.customer,
            instance_id = %instance.id,
            at = %ctx.now,
            "uncancel planned"
        );
        finish(ctx.state, plan)
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::*;
    use crate::error::EntitleError;
    use rust_decimal_macros::dec;

    fn cancel(
        state: &CustomerState,
        instance: InstanceId,
        mode: CancelMode,
        now: DateTime<Utc>,
    ) -> Result<BillingPlan> {
        CancelPlanComputer::compute(&CancelContext {
            state,
            catalog: &catalog(),
            instance,
            mode,
            require_default: true,
            now,
        })
    }

    #[test]
    fn end_of_cycle_cancel_schedules_default() {
        let (state, id) = customer_on(&pro(), t(4, 1));
        let plan = cancel(&state, id, CancelMode::EndOfCycle, t(4, 10)).unwrap();

        assert_eq!(plan.update.len(), 1);
        assert_eq!(
            plan.update_for(id).unwrap().state,
            Some(InstanceState::Canceling {
                canceled_at: t(4, 10),
                ends_at: t(5, 1),
            })
        );
        assert_eq!(plan.insert.len(), 1);
        assert_eq!(plan.insert[0].plan.as_str(), "free");
        assert_eq!(
            plan.insert[0].state,
            InstanceState::Scheduled { starts_at: t(5, 1) }
        );
        assert!(plan.insert[0].grants.is_empty());
        assert!(plan.delete.is_empty());
        assert!(plan.line_items.is_empty());
        assert!(plan.cancel_subscriptions.is_empty());
    }

    #[test]
    fn repeated_end_of_cycle_cancel_is_empty() {
        let (mut state, id) = customer_on(&pro(), t(4, 1));
        let first = cancel(&state, id, CancelMode::EndOfCycle, t(4, 10)).unwrap();
        apply(&mut state, &first);
        let second = cancel(&state, id, CancelMode::EndOfCycle, t(4, 12)).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn immediate_cancel_credits_and_cancels_subscription() {
        let (state, id) = customer_on(&pro(), t(4, 1));
        let plan = cancel(&state, id, CancelMode::Immediately, t(4, 16)).unwrap();

        let patch = plan.update_for(id).unwrap();
        assert!(patch.state.unwrap().is_expired());
        assert!(patch.grants.as_ref().unwrap()[0].is_expired(t(4, 16)));
        assert_eq!(plan.insert[0].state, InstanceState::Active);
        assert_eq!(plan.insert[0].grants.len(), 1);
        assert_eq!(plan.total(), dec!(-10));
        assert_eq!(plan.cancel_subscriptions.len(), 1);
    }

    #[test]
    fn canceling_then_immediate_keeps_canceled_at() {
        let (mut state, id) = customer_on(&pro(), t(4, 1));
        let first = cancel(&state, id, CancelMode::EndOfCycle, t(4, 10)).unwrap();
        apply(&mut state, &first);
        let plan = cancel(&state, id, CancelMode::Immediately, t(4, 16)).unwrap();

        assert_eq!(
            plan.update_for(id).unwrap().state,
            Some(InstanceState::Expired {
                ended_at: t(4, 16),
                canceled_at: Some(t(4, 10)),
            })
        );
        // the scheduled default is replaced by an active one
        assert_eq!(plan.delete.len(), 1);
        assert_eq!(plan.insert[0].state, InstanceState::Active);
    }

    #[test]
    fn expired_instance_is_not_cancelable() {
        let (mut state, id) = customer_on(&pro(), t(4, 1));
        let first = cancel(&state, id, CancelMode::Immediately, t(4, 10)).unwrap();
        apply(&mut state, &first);
        let err = cancel(&state, id, CancelMode::Immediately, t(4, 11)).unwrap_err();
        assert!(matches!(
            err,
            EntitleError::Precondition(PlanFailure::NotCancelable { .. })
        ));
    }

    #[test]
    fn missing_default_fails_only_when_required() {
        let (state, id) = customer_on(&pro(), t(4, 1));
        let catalog = Catalog::new(vec![pro()]);
        let mut ctx = CancelContext {
            state: &state,
            catalog: &catalog,
            instance: id,
            mode: CancelMode::EndOfCycle,
            require_default: true,
            now: t(4, 10),
        };
        assert!(matches!(
            CancelPlanComputer::compute(&ctx),
            Err(EntitleError::Precondition(PlanFailure::NoDefaultPlan { .. }))
        ));
        ctx.require_default = false;
        let plan = CancelPlanComputer::compute(&ctx).unwrap();
        assert!(plan.insert.is_empty());
    }

    #[test]
    fn free_plan_cancels_immediately() {
        let (state, id) = customer_on(&free(), t(4, 1));
        let plan = cancel(&state, id, CancelMode::EndOfCycle, t(4, 10)).unwrap();
        assert!(plan.update_for(id).unwrap().state.unwrap().is_expired());
        assert!(plan.insert.is_empty());
        assert!(plan.line_items.is_empty());
    }

    #[test]
    fn uncancel_restores_and_drops_scheduled() {
        let (mut state, id) = customer_on(&pro(), t(4, 1));
        let first = cancel(&state, id, CancelMode::EndOfCycle, t(4, 10)).unwrap();
        apply(&mut state, &first);

        let plan = CancelPlanComputer::uncancel(&UncancelContext {
            state: &state,
            instance: id,
            now: t(4, 12),
        })
        .unwrap();
        assert_eq!(plan.update_for(id).unwrap().state, Some(InstanceState::Active));
        assert_eq!(plan.delete.len(), 1);
        assert_eq!(plan.delete[0].plan.as_str(), "free");

        apply(&mut state, &plan);
        let err = CancelPlanComputer::uncancel(&UncancelContext {
            state: &state,
            instance: id,
            now: t(4, 13),
        })
        .unwrap_err();
        assert!(matches!(
            err,
            EntitleError::Precondition(PlanFailure::NotCanceling { .. })
        ));
    }
}
