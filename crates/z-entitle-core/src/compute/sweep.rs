//! Time-driven transitions.

use chrono::{DateTime, Utc};

use super::{ending, finish, release_links, ActivateContext, Catalog, CustomerState, SwitchPlanComputer};
use crate::billing_plan::BillingPlan;
use crate::error::Result;
use crate::instance::PlanInstance;
use crate::lifecycle::{grace_end, InstanceState, LifecycleEvent};

/// Evaluate what the passage of time did to one customer.
#[derive(Debug, Clone, Copy)]
pub struct SweepContext<'a> {
    /// The customer's state.
    pub state: &'a CustomerState,
    /// Known plans, for activation and default fallback.
    pub catalog: &'a Catalog,
    /// Days a past-due instance stays live.
    pub grace_days: i64,
    /// Evaluation instant.
    pub now: DateTime<Utc>,
}

/// Computes the plan for transitions that fall due without an intent.
#[derive(Debug, Clone, Copy, Default)]
pub struct LifecycleSweep;

impl LifecycleSweep {
    /// Plan every due transition of the customer.
    ///
    /// - scheduled instances whose start passed are activated, which expires
    ///   and settles the instance they replace
    /// - canceling instances past their end with no successor expire
    /// - past-due instances past the grace period expire and fall back to the
    ///   group's default plan
    ///
    /// # Errors
    ///
    /// Propagates failures of the underlying computers.
    pub fn compute(ctx: &SweepContext<'_>) -> Result<BillingPlan> {
        let mut plan = BillingPlan::default();

        for scheduled in ctx.state.instances.iter().filter(|i| {
            matches!(i.state, InstanceState::Scheduled { starts_at } if starts_at <= ctx.now)
        }) {
            let activation = SwitchPlanComputer::activate_scheduled(&ActivateContext {
                state: ctx.state,
                catalog: ctx.catalog,
                scheduled: scheduled.id,
                now: ctx.now,
            })?;
            plan = plan.merge(activation);
        }

        for instance in &ctx.state.instances {
            if plan.update_for(instance.id).is_some() || plan.deletes(instance.id) {
                continue;
            }
            match instance.state {
                InstanceState::Canceling { ends_at, .. } if ends_at <= ctx.now => {
                    let event = LifecycleEvent::Expire { at: ends_at };
                    plan.patch(instance.id, ending(instance, &event, ends_at)?);
                    release_links(ctx.state, &mut plan, instance.id);
                    tracing::info!(
                        customer_id = %ctx.state.customer,
                        instance_id = %instance.id,
                        "canceling instance reached its end"
                    );
                }
                InstanceState::PastDue { since }
                    if grace_end(since, ctx.grace_days) <= ctx.now =>
                {
                    let event = LifecycleEvent::GraceExhausted {
                        at: ctx.now,
                        grace_days: ctx.grace_days,
                    };
                    plan.patch(instance.id, ending(instance, &event, ctx.now)?);
                    release_links(ctx.state, &mut plan, instance.id);
                    if instance.is_main() {
                        Self::default_after(ctx, instance, &mut plan)?;
                    }
                    tracing::warn!(
                        customer_id = %ctx.state.customer,
                        instance_id = %instance.id,
                        past_due_since = %since,
                        "past-due grace exhausted"
                    );
                }
                _ => {}
            }
        }

        if plan.is_empty() {
            return Ok(plan);
        }
        finish(ctx.state, plan)
    }

    fn default_after(
        ctx: &SweepContext<'_>,
        instance: &PlanInstance,
        plan: &mut BillingPlan,
    ) -> Result<()> {
        let Some(default) = ctx.catalog.default_for(&instance.group) else {
            return Ok(());
        };
        if default.id == instance.plan {
            return Ok(());
        }
        plan.insert.push(PlanInstance::from_plan(
            default,
            instance.customer,
            instance.entity,
            InstanceState::Active,
            ctx.now,
            &ctx.state.entities,
            Vec::new(),
            ctx.now,
        )?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::super::{CancelContext, CancelPlanComputer};
    use super::*;
    use crate::lifecycle::CancelMode;

    fn sweep(state: &CustomerState, now: DateTime<Utc>) -> BillingPlan {
        sweep_with_grace(state, 7, now)
    }

    fn sweep_with_grace(state: &CustomerState, grace_days: i64, now: DateTime<Utc>) -> BillingPlan {
        LifecycleSweep::compute(&SweepContext {
            state,
            catalog: &catalog(),
            grace_days,
            now,
        })
        .unwrap()
    }

    #[test]
    fn nothing_due_is_empty() {
        let (state, _) = customer_on(&pro(), t(4, 1));
        assert!(sweep(&state, t(4, 20)).is_empty());
    }

    #[test]
    fn scheduled_default_takes_over_at_cycle_end() {
        let (mut state, id) = customer_on(&pro(), t(4, 1));
        let cancel = CancelPlanComputer::compute(&CancelContext {
            state: &state,
            catalog: &catalog(),
            instance: id,
            mode: CancelMode::EndOfCycle,
            require_default: true,
            now: t(4, 10),
        })
        .unwrap();
        apply(&mut state, &cancel);

        assert!(sweep(&state, t(4, 20)).is_empty());

        let plan = sweep(&state, t(5, 1));
        apply(&mut state, &plan);
        assert!(state.instance(id).unwrap().state.is_expired());
        let free = state.live_main(None, &group()).unwrap();
        assert_eq!(free.plan.as_str(), "free");
        assert_eq!(free.grants.len(), 1);
        assert_eq!(state.refs_for(free.id).len(), 1);
    }

    #[test]
    fn canceling_without_successor_expires() {
        let (mut state, id) = customer_on(&pro(), t(4, 1));
        let cancel = CancelPlanComputer::compute(&CancelContext {
            state: &state,
            catalog: &crate::compute::Catalog::default(),
            instance: id,
            mode: CancelMode::EndOfCycle,
            require_default: false,
            now: t(4, 10),
        })
        .unwrap();
        apply(&mut state, &cancel);

        let plan = sweep(&state, t(5, 2));
        assert_eq!(plan.cancel_subscriptions.len(), 1);
        apply(&mut state, &plan);
        let InstanceState::Expired { ended_at, .. } = state.instance(id).unwrap().state else {
            panic!("expected expired");
        };
        assert_eq!(ended_at, t(5, 1));
    }

    #[test]
    fn past_due_expires_after_grace() {
        let (mut state, id) = customer_on(&pro(), t(4, 1));
        state.instances[0].state = InstanceState::PastDue { since: t(4, 10) };

        assert!(sweep(&state, t(4, 16)).is_empty());

        let plan = sweep(&state, t(4, 17));
        apply(&mut state, &plan);
        assert!(state.instance(id).unwrap().state.is_expired());
        assert_eq!(
            state.live_main(None, &group()).unwrap().plan.as_str(),
            "free"
        );
        assert!(plan.line_items.is_empty());
    }

    #[test]
    fn zero_grace_expires_past_due_at_once() {
        let (mut state, id) = customer_on(&pro(), t(4, 1));
        state.instances[0].state = InstanceState::PastDue { since: t(4, 10) };

        let plan = sweep_with_grace(&state, 0, t(4, 10));
        apply(&mut state, &plan);
        assert!(state.instance(id).unwrap().state.is_expired());
        assert_eq!(
            state.live_main(None, &group()).unwrap().plan.as_str(),
            "free"
        );
    }

    #[test]
    fn unrepresentable_grace_never_expires() {
        let (mut state, _) = customer_on(&pro(), t(4, 1));
        state.instances[0].state = InstanceState::PastDue { since: t(4, 10) };

        assert!(sweep_with_grace(&state, i64::MAX, t(12, 31)).is_empty());
    }
}
