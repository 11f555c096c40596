//! Plan computers.
//!
//! Every computer is a pure function from the customer's persisted state and
//! an intent to one [`BillingPlan`]. None of them performs I/O. A computer
//! that cannot satisfy a precondition returns a typed failure and no plan;
//! every returned plan has been projected onto the current state and checked
//! for group exclusivity.
//!
//! - [`AttachPlanComputer`]: attach a plan
//! - [`CancelPlanComputer`]: cancel and uncancel
//! - [`UpdatePlanComputer`]: new terms or prepaid quantities for an instance
//! - [`SwitchPlanComputer`]: upgrades, downgrades and scheduled activation
//! - [`MigratePlanComputer`]: move instances to a new plan version, never charging
//! - [`LifecycleSweep`]: transitions that fall due with time

mod attach;
mod cancel;
mod migrate;
mod sweep;
mod switch;
mod update;

pub use attach::{AttachContext, AttachPlanComputer};
pub use cancel::{CancelContext, CancelPlanComputer, UncancelContext};
pub use migrate::{CustomerMigration, MigrateContext, MigratePlanComputer};
pub use sweep::{LifecycleSweep, SweepContext};
pub use switch::{ActivateContext, SwitchContext, SwitchPlanComputer, SwitchTiming};
pub use update::{UpdateContext, UpdatePlanComputer};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::billing_plan::{BillingPlan, InstancePatch, LineItem, Period, SubscriptionLink};
use crate::calendar::{add_intervals, remaining_fraction};
use crate::error::{PlanFailure, Result};
use crate::grant::{Grant, GrantSource};
use crate::ids::{CustomerId, EntityId, ExternalSubscriptionRef, GroupId, InstanceId, PlanId};
use crate::instance::PlanInstance;
use crate::ledger;
use crate::lifecycle::{enforce_group_exclusivity, transition, LifecycleEvent};
use crate::plan::Plan;
use crate::pricing::PriceKind;

// ============================================================================
// Inputs
// ============================================================================

/// Every plan version the engine knows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    plans: Vec<Plan>,
}

impl Catalog {
    /// Build a catalog.
    #[must_use]
    pub const fn new(plans: Vec<Plan>) -> Self {
        Self { plans }
    }

    /// Add or replace a plan version.
    pub fn insert(&mut self, plan: Plan) {
        self.plans
            .retain(|p| !(p.id == plan.id && p.version == plan.version));
        self.plans.push(plan);
    }

    /// One exact version.
    #[must_use]
    pub fn get(&self, id: &PlanId, version: u32) -> Option<&Plan> {
        self.plans
            .iter()
            .find(|p| &p.id == id && p.version == version)
    }

    /// The highest version of a plan.
    #[must_use]
    pub fn latest(&self, id: &PlanId) -> Option<&Plan> {
        self.plans
            .iter()
            .filter(|p| &p.id == id)
            .max_by_key(|p| p.version)
    }

    /// Latest version of the default main plan of a group.
    #[must_use]
    pub fn default_for(&self, group: &GroupId) -> Option<&Plan> {
        self.plans
            .iter()
            .filter(|p| &p.group == group && p.is_default && p.is_main())
            .max_by_key(|p| p.version)
    }

    /// All plan versions.
    #[must_use]
    pub fn plans(&self) -> &[Plan] {
        &self.plans
    }
}

/// The persisted state of one customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerState {
    /// The customer.
    pub customer: CustomerId,
    /// Known entities of the customer.
    pub entities: Vec<EntityId>,
    /// Every plan instance, any state.
    pub instances: Vec<PlanInstance>,
    /// Instance ↔ processor-subscription join.
    pub links: Vec<SubscriptionLink>,
}

impl CustomerState {
    /// An empty customer.
    #[must_use]
    pub const fn new(customer: CustomerId) -> Self {
        Self {
            customer,
            entities: Vec::new(),
            instances: Vec::new(),
            links: Vec::new(),
        }
    }

    /// One instance.
    ///
    /// # Errors
    ///
    /// Returns `PlanFailure::InstanceNotFound` if it is not part of this state.
    pub fn instance(&self, id: InstanceId) -> std::result::Result<&PlanInstance, PlanFailure> {
        self.instances
            .iter()
            .find(|i| i.id == id)
            .ok_or(PlanFailure::InstanceNotFound { instance: id })
    }

    /// The live main instance of a group at one scope.
    #[must_use]
    pub fn live_main(&self, entity: Option<EntityId>, group: &GroupId) -> Option<&PlanInstance> {
        self.instances.iter().find(|i| {
            i.entity == entity && &i.group == group && i.is_main() && i.state.is_live()
        })
    }

    /// Scheduled instances of a group at one scope.
    pub fn scheduled_in<'a>(
        &'a self,
        entity: Option<EntityId>,
        group: &'a GroupId,
    ) -> impl Iterator<Item = &'a PlanInstance> + 'a {
        self.instances
            .iter()
            .filter(move |i| i.entity == entity && &i.group == group && i.state.is_scheduled())
    }

    /// Processor subscriptions linked to an instance.
    #[must_use]
    pub fn refs_for(&self, instance: InstanceId) -> Vec<ExternalSubscriptionRef> {
        self.links
            .iter()
            .filter(|l| l.instance == instance)
            .map(|l| l.external_ref.clone())
            .collect()
    }

    /// Currency of the customer's live paid instances.
    #[must_use]
    pub fn live_currency(&self) -> Option<&str> {
        self.instances
            .iter()
            .find(|i| i.state.is_live() && i.is_paid())
            .map(|i| i.currency.as_str())
    }

    /// Grants of live instances.
    #[must_use]
    pub fn live_grants(&self) -> Vec<Grant> {
        self.instances
            .iter()
            .filter(|i| i.state.is_live())
            .flat_map(|i| i.grants.iter().cloned())
            .collect()
    }
}

// ============================================================================
// Shared steps
// ============================================================================

/// Project `plan` onto `state` and check group exclusivity.
fn finish(state: &CustomerState, plan: BillingPlan) -> Result<BillingPlan> {
    let projected = plan.project(&state.instances)?;
    enforce_group_exclusivity(&projected)?;
    tracing::debug!(
        customer_id = %state.customer,
        inserts = plan.insert.len(),
        updates = plan.update.len(),
        deletes = plan.delete.len(),
        line_items = plan.line_items.len(),
        "billing plan computed"
    );
    Ok(plan)
}

/// `amount` prorated to the part of `[start, end]` remaining at `at`.
fn prorate(amount: Decimal, start: DateTime<Utc>, end: DateTime<Utc>, at: DateTime<Utc>) -> Decimal {
    amount * remaining_fraction(start, end, at)
}

/// Credits for the unused part of the current period of `instance`'s fixed prices.
fn unused_time_credits(instance: &PlanInstance, now: DateTime<Utc>) -> Result<Vec<LineItem>> {
    let Some((start, end)) = instance.current_period(now)? else {
        return Ok(Vec::new());
    };
    let mut items = Vec::new();
    for price in &instance.prices {
        if let PriceKind::Fixed { amount, .. } = price.kind {
            let credit = prorate(amount, start, end, now);
            if !credit.is_zero() {
                items.push(LineItem::new(
                    instance.id,
                    -credit,
                    format!("Unused time on {}", price.label),
                    Period { start: now, end },
                ));
            }
        }
    }
    Ok(items)
}

/// The cycle a new charge at `now` pays for.
///
/// Unlike [`PlanInstance::current_period`], an instant on a lattice point
/// starts the next cycle instead of closing the previous one.
fn charge_period(
    instance: &PlanInstance,
    now: DateTime<Utc>,
) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
    let Some(calendar) = instance.calendar() else {
        return Ok(None);
    };
    let end = calendar.cycle_end(now)?;
    if end == now {
        return Ok(Some((now, add_intervals(now, calendar.cadence, 1)?)));
    }
    Ok(Some((calendar.cycle_start(now)?, end)))
}

/// Charges for `instance`'s fixed prices over the rest of `[start, end]`.
fn remaining_time_charges(
    instance: &PlanInstance,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Vec<LineItem> {
    instance
        .prices
        .iter()
        .filter_map(|price| match price.kind {
            PriceKind::Fixed { amount, .. } => {
                let charge = prorate(amount, start, end, now);
                (!charge.is_zero()).then(|| {
                    LineItem::new(
                        instance.id,
                        charge,
                        format!("Remaining time on {}", price.label),
                        Period { start: now, end },
                    )
                })
            }
            PriceKind::OneOff { .. } | PriceKind::Usage { .. } => None,
        })
        .collect()
}

/// Charges for prepaid quantities and one-off prices bought on attach.
fn purchase_charges(instance: &PlanInstance, now: DateTime<Utc>) -> Result<Vec<LineItem>> {
    let mut items = Vec::new();
    let at = Period {
        start: now,
        end: now,
    };
    for price in &instance.prices {
        match &price.kind {
            PriceKind::OneOff { amount } if !amount.is_zero() => {
                items.push(LineItem::new(instance.id, *amount, price.label.clone(), at));
            }
            PriceKind::Usage {
                feature,
                model: crate::pricing::UsageModel::Prepaid,
                ..
            } => {
                let quantity: Decimal = instance
                    .quantities
                    .iter()
                    .filter(|q| &q.feature == feature)
                    .map(|q| q.quantity)
                    .sum();
                if quantity > Decimal::ZERO {
                    let amount = price.charge_for(quantity)?;
                    items.push(LineItem::new(
                        instance.id,
                        amount,
                        format!("{} x {}", quantity, price.label),
                        at,
                    ));
                }
            }
            _ => {}
        }
    }
    Ok(items)
}

/// Grants of `instance` recomputed from `target`'s items.
///
/// Existing grants keep usage, purchased quantity and reset calendar. Grants
/// whose feature left the plan expire at `now`; features new in `target` get
/// fresh grants on the instance's billing lattice.
fn regrant_all(
    instance: &PlanInstance,
    target: &Plan,
    entities: &[EntityId],
    now: DateTime<Utc>,
) -> Result<Vec<Grant>> {
    let mut grants = instance.grants.clone();
    for grant in grants
        .iter_mut()
        .filter(|g| g.source() == GrantSource::Plan && !g.is_expired(now))
    {
        match target.feature(grant.feature()) {
            Some(item) => {
                ledger::regrant(grant, item);
            }
            None => ledger::expire(grant, now),
        }
    }

    let missing: Vec<_> = target
        .features
        .iter()
        .filter(|item| !instance.grants.iter().any(|g| g.feature() == &item.feature))
        .cloned()
        .collect();
    if !missing.is_empty() {
        let partial = Plan {
            features: missing,
            ..target.clone()
        };
        grants.extend(partial.grants_for(
            instance.customer,
            instance.id,
            instance.entity,
            entities,
            &instance.quantities,
            instance.billing_anchor,
            now,
        )?);
    }
    Ok(grants)
}

/// Move every processor link of `from` onto `to`.
fn move_links(state: &CustomerState, plan: &mut BillingPlan, from: InstanceId, to: InstanceId) {
    for external_ref in state.refs_for(from) {
        plan.unlink.push(SubscriptionLink {
            instance: from,
            external_ref: external_ref.clone(),
        });
        plan.link.push(SubscriptionLink {
            instance: to,
            external_ref,
        });
    }
}

/// Patch ending `instance` with `event`; its open grants expire at `at`.
fn ending(instance: &PlanInstance, event: &LifecycleEvent, at: DateTime<Utc>) -> Result<InstancePatch> {
    let state = transition(&instance.state, event)?;
    let mut grants = instance.grants.clone();
    for grant in grants.iter_mut().filter(|g| !g.is_expired(at)) {
        ledger::expire(grant, at);
    }
    Ok(InstancePatch {
        state: Some(state),
        grants: Some(grants),
        ..InstancePatch::default()
    })
}

/// Drop the processor subscriptions of `instance` that no other live instance uses.
fn release_links(state: &CustomerState, plan: &mut BillingPlan, instance: InstanceId) {
    for external_ref in state.refs_for(instance) {
        let shared = state.links.iter().any(|l| {
            l.external_ref == external_ref
                && l.instance != instance
                && !plan.deletes(l.instance)
                && state
                    .instance(l.instance)
                    .is_ok_and(|other| other.state.is_live())
        });
        plan.unlink.push(SubscriptionLink {
            instance,
            external_ref: external_ref.clone(),
        });
        if !shared && !plan.cancel_subscriptions.contains(&external_ref) {
            plan.cancel_subscriptions.push(external_ref);
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Shared catalog and state builders for the computer tests.

    use super::*;
    use crate::calendar::Cadence;
    use crate::ids::FeatureId;
    use crate::lifecycle::InstanceState;
    use crate::plan::FeatureItem;
    use crate::pricing::{PriceTerm, TierBehavior, UsageModel, UsageTier};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    pub fn t(month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, month, day, 0, 0, 0).unwrap()
    }

    pub fn messages() -> FeatureId {
        FeatureId::new("messages").unwrap()
    }

    pub fn group() -> GroupId {
        GroupId::new("main").unwrap()
    }

    fn plan(id: &str, price: Decimal, included: Decimal) -> Plan {
        let prices = if price.is_zero() {
            vec![]
        } else {
            vec![PriceTerm::fixed(id, price, Cadence::monthly())]
        };
        Plan {
            id: PlanId::new(id).unwrap(),
            version: 1,
            group: group(),
            name: id.to_string(),
            is_add_on: false,
            is_default: false,
            currency: "usd".into(),
            prices,
            features: vec![FeatureItem::new(
                messages(),
                included,
                Some(Cadence::monthly()),
            )],
        }
    }

    pub fn free() -> Plan {
        Plan {
            is_default: true,
            ..plan("free", Decimal::ZERO, dec!(100))
        }
    }

    pub fn pro() -> Plan {
        plan("pro", dec!(20), dec!(500))
    }

    pub fn premium() -> Plan {
        plan("premium", dec!(50), dec!(2000))
    }

    /// Pro with arrear overage on messages at $0.01 each.
    pub fn pro_arrear() -> Plan {
        let mut p = plan("pro-usage", dec!(20), dec!(500));
        p.features[0] = p.features[0].clone().with_overage(None);
        p.prices.push(PriceTerm::usage(
            "Messages",
            messages(),
            vec![UsageTier::unbounded(dec!(0.01))],
            TierBehavior::Graduated,
            Decimal::ONE,
            UsageModel::Arrear,
            Some(Cadence::monthly()),
        ));
        p
    }

    pub fn addon() -> Plan {
        Plan {
            is_add_on: true,
            group: GroupId::new("extras").unwrap(),
            ..plan("extra-seats", dec!(5), dec!(10))
        }
    }

    pub fn catalog() -> Catalog {
        Catalog::new(vec![free(), pro(), premium(), pro_arrear(), addon()])
    }

    /// A customer with `plan` active since `anchor`.
    pub fn customer_on(plan: &Plan, anchor: DateTime<Utc>) -> (CustomerState, InstanceId) {
        let mut state = CustomerState::new(CustomerId::generate());
        let instance = PlanInstance::from_plan(
            plan,
            state.customer,
            None,
            InstanceState::Active,
            anchor,
            &[],
            vec![],
            anchor,
        )
        .unwrap();
        let id = instance.id;
        state.links.push(SubscriptionLink {
            instance: id,
            external_ref: ExternalSubscriptionRef::new("sub_main").unwrap(),
        });
        state.instances.push(instance);
        (state, id)
    }

    /// Apply a plan to the state the way a store would.
    pub fn apply(state: &mut CustomerState, plan: &BillingPlan) {
        state.instances = plan.project(&state.instances).unwrap();
        state.links = plan.project_links(&state.links);
    }
}
