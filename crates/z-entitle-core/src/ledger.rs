//! Balance ledger.
//!
//! Answers "what is the balance of feature F for this customer (or entity)"
//! and applies usage deltas and balance corrections across a set of grants.
//!
//! # Deduction order
//!
//! Grants are consumed strictly in this order:
//!
//! 1. customer-level grants without overage
//! 2. customer-level grants with overage
//! 3. entity-level grants without overage
//! 4. entity-level grants with overage
//!
//! Within a tier rollover grants go first (soonest expiry first), then grants
//! whose reset comes first, lifetime grants last. Creation time and grant id
//! break the remaining ties, so the same total usage is always attributed to
//! the same grants however it is batched.
//!
//! Every operation runs on a working copy and commits only after the result
//! passes the ledger invariants; a failed operation leaves the grants as they
//! were.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::calendar::{add_intervals, CycleCalendar};
use crate::error::{EntitleError, Result};
use crate::grant::{Breakdown, Grant, GrantSource};
use crate::ids::{EntityId, FeatureId, GrantId, InstanceId};
use crate::plan::FeatureItem;

/// Decimal places kept on proportional shares.
pub const QUANTITY_DECIMAL_PLACES: u32 = 6;

// ============================================================================
// Scope and views
// ============================================================================

/// Which grants a balance question is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BalanceScope {
    /// The feature.
    pub feature: FeatureId,
    /// `None` for the customer as a whole (every grant of the feature);
    /// `Some` for one entity (customer-level grants plus that entity's own).
    pub entity: Option<EntityId>,
}

impl BalanceScope {
    /// The whole customer.
    #[must_use]
    pub const fn customer(feature: FeatureId) -> Self {
        Self {
            feature,
            entity: None,
        }
    }

    /// One entity, including customer-level grants.
    #[must_use]
    pub const fn entity(feature: FeatureId, entity: EntityId) -> Self {
        Self {
            feature,
            entity: Some(entity),
        }
    }

    /// Whether `grant` counts towards this scope.
    #[must_use]
    pub fn includes(&self, grant: &Grant) -> bool {
        if grant.feature() != &self.feature {
            return false;
        }
        match self.entity {
            None => true,
            Some(entity) => grant.entity().map_or(true, |own| own == entity),
        }
    }
}

/// Aggregate balance of one scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    /// The feature.
    pub feature: FeatureId,
    /// Sum of granted quantities.
    pub granted: Decimal,
    /// Sum of reported purchased quantities (prepaid plus overage).
    pub purchased: Decimal,
    /// Sum of usage.
    pub usage: Decimal,
    /// Sum of clamped per-grant balances.
    pub current: Decimal,
}

/// How `set_absolute_balance` spreads a correction across grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Redistribution {
    /// Walk the deduction order, like a usage delta.
    SequentialDeduct,
    /// Scale every positive grant by `target / total`.
    ProportionalRedistribute,
}

/// How one grant changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantChange {
    /// The grant.
    pub grant_id: GrantId,
    /// Its plan instance, for billing attribution.
    pub instance_id: InstanceId,
    /// Change of the granted quantity.
    pub granted_delta: Decimal,
    /// Change of usage.
    pub usage_delta: Decimal,
    /// Change of overage (usage beyond granted plus purchased).
    pub overage_delta: Decimal,
    /// Signed balance before.
    pub balance_before: Decimal,
    /// Signed balance after.
    pub balance_after: Decimal,
}

/// Result of a ledger operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerOutcome {
    /// Changed grants in deduction order.
    pub changes: Vec<GrantChange>,
    /// Signed quantity actually applied.
    pub applied: Decimal,
    /// Usage no grant could absorb. The caller decides to reject or allow it.
    pub unbillable: Decimal,
    /// Part of a negative delta that found no usage to give back.
    pub unrestored: Decimal,
}

impl LedgerOutcome {
    /// True when no grant changed.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.changes.is_empty()
    }

    /// The change recorded for one grant.
    #[must_use]
    pub fn change_for(&self, grant: GrantId) -> Option<&GrantChange> {
        self.changes.iter().find(|c| c.grant_id == grant)
    }

    /// Total overage added across grants, per owning instance.
    #[must_use]
    pub fn overage_by_instance(&self) -> Vec<(InstanceId, Decimal)> {
        let mut totals: Vec<(InstanceId, Decimal)> = Vec::new();
        for change in self.changes.iter().filter(|c| !c.overage_delta.is_zero()) {
            match totals.iter_mut().find(|(id, _)| *id == change.instance_id) {
                Some((_, total)) => *total += change.overage_delta,
                None => totals.push((change.instance_id, change.overage_delta)),
            }
        }
        totals
    }
}

/// Outcome of a periodic reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetOutcome {
    /// The boundary the grant now waits for.
    pub next_reset: DateTime<Utc>,
    /// Rollover grant to store alongside, if any quantity carried over.
    pub rollover: Option<Grant>,
}

// ============================================================================
// Ordering
// ============================================================================

const fn tier(grant: &Grant) -> u8 {
    match (grant.is_customer_level(), grant.overage_allowed()) {
        (true, false) => 0,
        (true, true) => 1,
        (false, false) => 2,
        (false, true) => 3,
    }
}

fn cycle_end(grant: &Grant) -> (bool, u8, Option<DateTime<Utc>>) {
    match grant.source() {
        GrantSource::Rollover { .. } => (false, 0, grant.expires_at()),
        GrantSource::Plan => {
            let end = grant.reset().map(|r| r.next_reset).or(grant.expires_at());
            (end.is_none(), 1, end)
        }
    }
}

fn compare(a: &Grant, b: &Grant) -> Ordering {
    tier(a)
        .cmp(&tier(b))
        .then_with(|| {
            let (a_last, a_rank, a_end) = cycle_end(a);
            let (b_last, b_rank, b_end) = cycle_end(b);
            a_rank
                .cmp(&b_rank)
                .then(a_last.cmp(&b_last))
                .then(a_end.cmp(&b_end))
        })
        .then_with(|| a.created_at().cmp(&b.created_at()))
        .then_with(|| a.id().cmp(&b.id()))
}

/// Indices of the live grants in `scope`, in deduction order.
#[must_use]
pub fn deduction_order(grants: &[Grant], scope: &BalanceScope, now: DateTime<Utc>) -> Vec<usize> {
    let mut order: Vec<usize> = grants
        .iter()
        .enumerate()
        .filter(|(_, g)| scope.includes(g) && !g.is_expired(now))
        .map(|(i, _)| i)
        .collect();
    order.sort_by(|&a, &b| compare(&grants[a], &grants[b]));
    order
}

// ============================================================================
// Reads
// ============================================================================

/// Aggregate balance over the live grants of `scope`.
#[must_use]
pub fn compute_balance(grants: &[Grant], scope: &BalanceScope, now: DateTime<Utc>) -> Balance {
    let mut balance = Balance {
        feature: scope.feature.clone(),
        granted: Decimal::ZERO,
        purchased: Decimal::ZERO,
        usage: Decimal::ZERO,
        current: Decimal::ZERO,
    };
    for grant in grants
        .iter()
        .filter(|g| scope.includes(g) && !g.is_expired(now))
    {
        balance.granted += grant.granted();
        balance.purchased += grant.purchased_balance();
        balance.usage += grant.usage();
        balance.current += grant.current_balance();
    }
    balance
}

/// Per-grant views in deduction order.
#[must_use]
pub fn breakdown(grants: &[Grant], scope: &BalanceScope, now: DateTime<Utc>) -> Vec<Breakdown> {
    deduction_order(grants, scope, now)
        .into_iter()
        .map(|i| grants[i].breakdown())
        .collect()
}

// ============================================================================
// Mutations
// ============================================================================

/// Which field absorbs a quantity change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Adjust {
    /// Tracked usage moves `usage`.
    Usage,
    /// Manual balance corrections move `granted` (never `purchased`).
    Granted,
}

fn take(grant: &mut Grant, amount: Decimal, adjust: Adjust) {
    match adjust {
        Adjust::Usage => grant.add_usage(amount),
        Adjust::Granted => {
            let from_granted = amount.min(grant.granted().max(Decimal::ZERO));
            grant.add_granted(-from_granted);
            grant.add_usage(amount - from_granted);
        }
    }
}

fn give(grant: &mut Grant, amount: Decimal, adjust: Adjust) {
    match adjust {
        Adjust::Usage => grant.add_usage(-amount),
        Adjust::Granted => grant.add_granted(amount),
    }
}

/// Consume `amount` through `order`; returns what no grant could absorb.
fn consume(working: &mut [Grant], order: &[usize], amount: Decimal, adjust: Adjust) -> Decimal {
    let mut remaining = amount;

    for &i in order {
        if remaining.is_zero() {
            return remaining;
        }
        let available = working[i].raw_balance().max(Decimal::ZERO);
        let portion = remaining.min(available);
        if portion > Decimal::ZERO {
            take(&mut working[i], portion, adjust);
            remaining -= portion;
        }
    }

    // Balance exhausted: overage-allowed grants go negative.
    for &i in order {
        if remaining.is_zero() {
            break;
        }
        let grant = &working[i];
        if !grant.overage_allowed() {
            continue;
        }
        // Usage caps bound tracked usage; manual corrections ignore them.
        let room = match (adjust, grant.usage_limit()) {
            (Adjust::Usage, Some(limit)) => (limit - grant.usage()).max(Decimal::ZERO),
            _ => remaining,
        };
        let portion = remaining.min(room);
        if portion > Decimal::ZERO {
            take(&mut working[i], portion, adjust);
            remaining -= portion;
        }
    }

    remaining
}

/// Give `amount` back through `order`; returns what could not be placed.
fn restore(working: &mut [Grant], order: &[usize], amount: Decimal, adjust: Adjust) -> Decimal {
    let mut remaining = amount;

    // Clear overage first, latest grants first.
    for &i in order.iter().rev() {
        if remaining.is_zero() {
            return remaining;
        }
        let deficit = (-working[i].raw_balance()).max(Decimal::ZERO);
        let portion = remaining.min(deficit);
        if portion > Decimal::ZERO {
            give(&mut working[i], portion, adjust);
            remaining -= portion;
        }
    }

    match adjust {
        Adjust::Usage => {
            for &i in order.iter().rev() {
                if remaining.is_zero() {
                    break;
                }
                let portion = remaining.min(working[i].usage());
                if portion > Decimal::ZERO {
                    give(&mut working[i], portion, adjust);
                    remaining -= portion;
                }
            }
        }
        Adjust::Granted => {
            if let Some(&first) = order.first() {
                if remaining > Decimal::ZERO {
                    give(&mut working[first], remaining, adjust);
                    remaining = Decimal::ZERO;
                }
            }
        }
    }

    remaining
}

fn violation(grant: &Grant, detail: &str) -> EntitleError {
    tracing::error!(
        grant_id = %grant.id(),
        customer_id = %grant.customer(),
        feature = %grant.feature(),
        granted = %grant.granted(),
        purchased = %grant.purchased(),
        usage = %grant.usage(),
        "ledger invariant violated: {detail}"
    );
    EntitleError::InvariantViolation {
        grant_id: grant.id(),
        detail: detail.to_string(),
    }
}

/// Check the working copy, then swap it into `grants`.
fn commit(
    grants: &mut [Grant],
    mut working: Vec<Grant>,
    order: &[usize],
    mut outcome: LedgerOutcome,
) -> Result<LedgerOutcome> {
    let mut changed = Vec::new();
    for &i in order {
        let (before, after) = (&grants[i], &mut working[i]);
        if before.granted() == after.granted() && before.usage() == after.usage() {
            continue;
        }
        if after.granted().is_sign_negative() && !after.granted().is_zero() {
            return Err(violation(after, "granted quantity went negative"));
        }
        if after.usage().is_sign_negative() && !after.usage().is_zero() {
            return Err(violation(after, "usage went negative"));
        }
        if !after.overage_allowed()
            && after.raw_balance() < Decimal::ZERO
            && after.raw_balance() < before.raw_balance()
        {
            return Err(violation(after, "non-overage grant driven below zero"));
        }
        after.bump_version();
        outcome.changes.push(GrantChange {
            grant_id: after.id(),
            instance_id: after.instance(),
            granted_delta: after.granted() - before.granted(),
            usage_delta: after.usage() - before.usage(),
            overage_delta: after.overage() - before.overage(),
            balance_before: before.raw_balance(),
            balance_after: after.raw_balance(),
        });
        changed.push(i);
    }
    for i in changed {
        std::mem::swap(&mut grants[i], &mut working[i]);
    }
    Ok(outcome)
}

fn apply_signed(
    grants: &mut [Grant],
    scope: &BalanceScope,
    delta: Decimal,
    adjust: Adjust,
    now: DateTime<Utc>,
) -> Result<LedgerOutcome> {
    let order = deduction_order(grants, scope, now);
    let mut working = grants.to_vec();
    let mut outcome = LedgerOutcome::default();

    if delta > Decimal::ZERO {
        let left = consume(&mut working, &order, delta, adjust);
        outcome.applied = delta - left;
        outcome.unbillable = left;
    } else if delta < Decimal::ZERO {
        let left = restore(&mut working, &order, -delta, adjust);
        outcome.applied = delta + left;
        outcome.unrestored = left;
    }

    commit(grants, working, &order, outcome)
}

/// Apply tracked usage. A positive delta consumes, a negative one gives usage back.
///
/// Usage that no grant can absorb is left unapplied and reported as
/// [`LedgerOutcome::unbillable`].
///
/// # Errors
///
/// Returns `EntitleError::InvariantViolation` if the result would break a
/// ledger invariant; `grants` is left untouched in that case.
pub fn apply_usage_delta(
    grants: &mut [Grant],
    scope: &BalanceScope,
    delta: Decimal,
    now: DateTime<Utc>,
) -> Result<LedgerOutcome> {
    let outcome = apply_signed(grants, scope, delta, Adjust::Usage, now)?;
    if outcome.unbillable > Decimal::ZERO {
        tracing::debug!(
            feature = %scope.feature,
            unbillable = %outcome.unbillable,
            "usage exceeded available balance"
        );
    }
    Ok(outcome)
}

/// Set total usage of `scope` to `target` through the usage-delta path.
///
/// # Errors
///
/// See [`apply_usage_delta`].
pub fn set_usage(
    grants: &mut [Grant],
    scope: &BalanceScope,
    target: Decimal,
    now: DateTime<Utc>,
) -> Result<LedgerOutcome> {
    let current = compute_balance(grants, scope, now).usage;
    apply_usage_delta(grants, scope, target - current, now)
}

/// Correct the balance of `scope` to `target`.
///
/// The correction moves granted quantity, never purchased quantity, so a
/// manual correction never implies a refund. Sequential redistribution walks
/// the deduction order with `delta = signed_total - target`; proportional
/// redistribution scales each positive grant and falls back to sequential when
/// the grants cannot be scaled (fewer than two positive grants, an existing
/// overage, or a negative target).
///
/// # Errors
///
/// See [`apply_usage_delta`].
pub fn set_absolute_balance(
    grants: &mut [Grant],
    scope: &BalanceScope,
    target: Decimal,
    strategy: Redistribution,
    now: DateTime<Utc>,
) -> Result<LedgerOutcome> {
    let order = deduction_order(grants, scope, now);
    let signed_total: Decimal = order.iter().map(|&i| grants[i].raw_balance()).sum();
    let delta = signed_total - target;

    if strategy == Redistribution::ProportionalRedistribute {
        if let Some(outcome) = proportional(grants, &order, signed_total, target)? {
            return Ok(outcome);
        }
        tracing::debug!(
            feature = %scope.feature,
            "proportional redistribution not applicable, walking deduction order"
        );
    }

    apply_signed(grants, scope, delta, Adjust::Granted, now)
}

fn proportional(
    grants: &mut [Grant],
    order: &[usize],
    total: Decimal,
    target: Decimal,
) -> Result<Option<LedgerOutcome>> {
    let positive: Vec<usize> = order
        .iter()
        .copied()
        .filter(|&i| grants[i].raw_balance() > Decimal::ZERO)
        .collect();
    let has_overage = order
        .iter()
        .any(|&i| grants[i].raw_balance() < Decimal::ZERO);
    if positive.len() < 2 || has_overage || target < Decimal::ZERO || total <= Decimal::ZERO {
        return Ok(None);
    }

    let mut working = grants.to_vec();
    let mut assigned = Decimal::ZERO;
    for (n, &i) in positive.iter().enumerate() {
        let before = working[i].raw_balance();
        let share = if n + 1 == positive.len() {
            target - assigned
        } else {
            (before * target / total).round_dp(QUANTITY_DECIMAL_PLACES)
        };
        assigned += share;
        let diff = share - before;
        if diff > Decimal::ZERO {
            give(&mut working[i], diff, Adjust::Granted);
        } else if diff < Decimal::ZERO {
            take(&mut working[i], -diff, Adjust::Granted);
        }
    }

    let outcome = LedgerOutcome {
        applied: total - target,
        ..LedgerOutcome::default()
    };
    commit(grants, working, order, outcome).map(Some)
}

/// Recompute a grant's terms from a (possibly new) plan item.
///
/// Usage, purchased quantity and the reset calendar are left exactly as they
/// are. Returns whether anything changed.
pub fn regrant(grant: &mut Grant, item: &FeatureItem) -> bool {
    let unchanged = grant.granted() == item.included
        && grant.overage_allowed() == item.overage_allowed
        && grant.usage_limit() == item.usage_limit
        && grant.rollover() == item.rollover.as_ref();
    if unchanged {
        return false;
    }
    grant.set_granted(item.included);
    grant.set_terms(item.overage_allowed, item.usage_limit, item.rollover);
    grant.bump_version();
    true
}

/// Carry usage from replaced grants onto fresh ones of the same feature and entity.
///
/// The usage of all matching old grants lands on the first matching new grant.
pub fn carry_usage(from: &[Grant], into: &mut [Grant]) {
    let mut carried: Vec<(FeatureId, Option<EntityId>)> = Vec::new();
    for grant in into.iter_mut() {
        let key = (grant.feature().clone(), grant.entity());
        if carried.contains(&key) {
            continue;
        }
        let usage: Decimal = from
            .iter()
            .filter(|old| old.feature() == &key.0 && old.entity() == key.1)
            .map(Grant::usage)
            .sum();
        if usage > Decimal::ZERO {
            grant.set_usage(grant.usage() + usage);
            grant.bump_version();
        }
        carried.push(key);
    }
}

/// Change the prepaid quantity of a grant by `delta`.
///
/// # Errors
///
/// Returns `EntitleError::Validation` if the purchased quantity would drop
/// below zero; the grant is left untouched.
pub fn top_up(grant: &mut Grant, delta: Decimal) -> Result<()> {
    if grant.purchased() + delta < Decimal::ZERO {
        return Err(EntitleError::Validation(format!(
            "cannot remove {} purchased units from grant {} holding {}",
            -delta,
            grant.id(),
            grant.purchased()
        )));
    }
    grant.add_purchased(delta);
    grant.bump_version();
    Ok(())
}

/// Move a grant to another plan instance, keeping its quantities.
pub fn reassign(grant: &mut Grant, instance: InstanceId, plan: crate::ids::PlanId) {
    grant.reassign(instance, plan);
    grant.bump_version();
}

/// Reset a periodic grant once its boundary has passed.
///
/// Usage returns to zero, `granted` is recomputed from `included` and the
/// next boundary is taken from the grant's own lattice. Purchased quantity is
/// untouched. Unused granted quantity is returned as a separate rollover grant
/// when the grant has a rollover policy. Returns `None` when the reset is not
/// due or the grant never resets.
///
/// # Errors
///
/// Returns a calendar error if the next boundary is not representable.
pub fn reset_grant(
    grant: &mut Grant,
    included: Decimal,
    now: DateTime<Utc>,
) -> Result<Option<ResetOutcome>> {
    let Some(schedule) = grant.reset().copied() else {
        return Ok(None);
    };
    if schedule.next_reset > now {
        return Ok(None);
    }

    let mut next_reset = CycleCalendar::new(schedule.anchor, schedule.cadence).cycle_end(now)?;
    if next_reset <= now {
        next_reset = add_intervals(next_reset, schedule.cadence, 1)?;
    }

    let rollover = match grant.rollover().copied() {
        Some(policy) if policy.duration_cycles > 0 => {
            let unused = grant.granted().min(grant.raw_balance()).max(Decimal::ZERO);
            let amount = policy.max.map_or(unused, |max| unused.min(max));
            if amount > Decimal::ZERO {
                let expires = add_intervals(
                    schedule.next_reset,
                    schedule.cadence,
                    i64::from(policy.duration_cycles),
                )?;
                let mut carried = Grant::new(
                    grant.customer(),
                    grant.instance(),
                    grant.plan().clone(),
                    grant.feature().clone(),
                    amount,
                    now,
                )
                .with_source(GrantSource::Rollover { from: grant.id() })
                .with_expiry(expires);
                if let Some(entity) = grant.entity() {
                    carried = carried.with_entity(entity);
                }
                Some(carried)
            } else {
                None
            }
        }
        _ => None,
    };

    grant.set_usage(Decimal::ZERO);
    grant.set_granted(included);
    grant.set_next_reset(next_reset);
    grant.bump_version();

    tracing::debug!(
        grant_id = %grant.id(),
        feature = %grant.feature(),
        next_reset = %next_reset,
        rolled_over = rollover.is_some(),
        "grant reset"
    );

    Ok(Some(ResetOutcome {
        next_reset,
        rollover,
    }))
}

/// Expire a grant at `at` (used when its instance is replaced or expired).
pub fn expire(grant: &mut Grant, at: DateTime<Utc>) {
    grant.set_expiry(Some(at));
    grant.bump_version();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::Cadence;
    use crate::grant::ResetSchedule;
    use crate::ids::{CustomerId, PlanId};
    use crate::plan::RolloverPolicy;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap()
    }

    fn messages() -> FeatureId {
        FeatureId::new("messages").unwrap()
    }

    struct Fixture {
        customer: CustomerId,
        created: DateTime<Utc>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                customer: CustomerId::generate(),
                created: t0(),
            }
        }

        fn grant(&mut self, plan: &str, granted: Decimal) -> Grant {
            // distinct creation times keep the fixture order readable
            self.created += Duration::seconds(1);
            Grant::new(
                self.customer,
                InstanceId::generate(),
                PlanId::new(plan).unwrap(),
                messages(),
                granted,
                self.created,
            )
        }
    }

    fn monthly(next: DateTime<Utc>) -> ResetSchedule {
        ResetSchedule {
            cadence: Cadence::monthly(),
            anchor: t0(),
            next_reset: next,
        }
    }

    fn scope() -> BalanceScope {
        BalanceScope::customer(messages())
    }

    fn assert_conservation(grants: &[Grant], scope: &BalanceScope) {
        let balance = compute_balance(grants, scope, t0());
        let views = breakdown(grants, scope, t0());
        let sum: Decimal = views.iter().map(|b| b.current_balance).sum();
        assert_eq!(sum, balance.current);
        for view in views {
            assert_eq!(
                view.current_balance,
                (view.granted_balance + view.purchased_balance - view.usage).max(Decimal::ZERO)
            );
        }
    }

    #[test]
    fn overage_tracked_as_purchased() {
        let mut f = Fixture::new();
        let mut grants = vec![f.grant("pro", dec!(500)).with_overage(None)];

        let outcome = apply_usage_delta(&mut grants, &scope(), dec!(600), t0()).unwrap();

        assert_eq!(outcome.applied, dec!(600));
        assert_eq!(outcome.unbillable, Decimal::ZERO);
        let view = grants[0].breakdown();
        assert_eq!(view.usage, dec!(600));
        assert_eq!(view.current_balance, Decimal::ZERO);
        assert_eq!(view.purchased_balance, dec!(100));
        assert_eq!(outcome.changes[0].overage_delta, dec!(100));
        assert_conservation(&grants, &scope());
    }

    #[test]
    fn batching_does_not_change_attribution() {
        let mut f = Fixture::new();
        let base = vec![
            f.grant("free", dec!(80)).with_reset(monthly(t0() + Duration::days(10))),
            f.grant("pack", dec!(50)),
            f.grant("pro", dec!(40)).with_overage(None),
        ];

        let mut split = base.clone();
        apply_usage_delta(&mut split, &scope(), dec!(100), t0()).unwrap();
        apply_usage_delta(&mut split, &scope(), dec!(50), t0()).unwrap();

        let mut whole = base;
        apply_usage_delta(&mut whole, &scope(), dec!(150), t0()).unwrap();

        let usages = |gs: &[Grant]| gs.iter().map(Grant::usage).collect::<Vec<_>>();
        assert_eq!(usages(&split), usages(&whole));
        assert_eq!(usages(&whole), vec![dec!(80), dec!(50), dec!(20)]);
    }

    #[test]
    fn order_follows_scope_and_overage_tiers() {
        let mut f = Fixture::new();
        let entity = EntityId::generate();
        let grants = vec![
            f.grant("seat-overage", dec!(1)).with_entity(entity).with_overage(None),
            f.grant("seat", dec!(1)).with_entity(entity),
            f.grant("cust-overage", dec!(1)).with_overage(None),
            f.grant("lifetime", dec!(1)),
            f.grant("monthly", dec!(1)).with_reset(monthly(t0() + Duration::days(3))),
        ];
        let order = deduction_order(&grants, &BalanceScope::entity(messages(), entity), t0());
        let plans: Vec<&str> = order.iter().map(|&i| grants[i].plan().as_str()).collect();
        assert_eq!(
            plans,
            vec!["monthly", "lifetime", "cust-overage", "seat", "seat-overage"]
        );
    }

    #[test]
    fn entity_scope_sees_customer_grants_but_not_other_entities() {
        let mut f = Fixture::new();
        let (mine, theirs) = (EntityId::generate(), EntityId::generate());
        let grants = vec![
            f.grant("shared", dec!(100)),
            f.grant("mine", dec!(10)).with_entity(mine),
            f.grant("theirs", dec!(20)).with_entity(theirs),
        ];
        let own = compute_balance(&grants, &BalanceScope::entity(messages(), mine), t0());
        assert_eq!(own.current, dec!(110));
        let whole = compute_balance(&grants, &scope(), t0());
        assert_eq!(whole.current, dec!(130));
    }

    #[test]
    fn expired_grants_are_ignored() {
        let mut f = Fixture::new();
        let mut grants = vec![
            f.grant("old", dec!(100)).with_expiry(t0()),
            f.grant("new", dec!(10)),
        ];
        assert_eq!(compute_balance(&grants, &scope(), t0()).current, dec!(10));
        apply_usage_delta(&mut grants, &scope(), dec!(5), t0()).unwrap();
        assert_eq!(grants[0].usage(), Decimal::ZERO);
        assert_eq!(grants[1].usage(), dec!(5));
    }

    #[test]
    fn non_overage_grants_floor_at_zero_and_report_unbillable() {
        let mut f = Fixture::new();
        let mut grants = vec![f.grant("free", dec!(100))];
        let outcome = apply_usage_delta(&mut grants, &scope(), dec!(130), t0()).unwrap();
        assert_eq!(grants[0].usage(), dec!(100));
        assert_eq!(grants[0].current_balance(), Decimal::ZERO);
        assert_eq!(outcome.applied, dec!(100));
        assert_eq!(outcome.unbillable, dec!(30));
    }

    #[test]
    fn usage_limit_caps_overage() {
        let mut f = Fixture::new();
        let mut grants = vec![f.grant("pro", dec!(100)).with_overage(Some(dec!(150)))];
        let outcome = apply_usage_delta(&mut grants, &scope(), dec!(200), t0()).unwrap();
        assert_eq!(grants[0].usage(), dec!(150));
        assert_eq!(outcome.unbillable, dec!(50));
    }

    #[test]
    fn negative_delta_clears_overage_then_restores_usage() {
        let mut f = Fixture::new();
        let mut grants = vec![
            f.grant("free", dec!(50)),
            f.grant("pro", dec!(50)).with_overage(None),
        ];
        apply_usage_delta(&mut grants, &scope(), dec!(130), t0()).unwrap();
        assert_eq!(grants[1].overage(), dec!(30));

        let outcome = apply_usage_delta(&mut grants, &scope(), dec!(-60), t0()).unwrap();
        assert_eq!(outcome.applied, dec!(-60));
        assert_eq!(grants[1].usage(), dec!(20));
        assert_eq!(grants[0].usage(), dec!(50));

        let outcome = apply_usage_delta(&mut grants, &scope(), dec!(-100), t0()).unwrap();
        assert_eq!(outcome.unrestored, dec!(30));
        assert!(grants.iter().all(|g| g.usage().is_zero()));
    }

    #[test]
    fn set_usage_is_dual_of_delta() {
        let mut f = Fixture::new();
        let mut grants = vec![f.grant("free", dec!(100))];
        set_usage(&mut grants, &scope(), dec!(40), t0()).unwrap();
        assert_eq!(grants[0].usage(), dec!(40));
        set_usage(&mut grants, &scope(), dec!(10), t0()).unwrap();
        assert_eq!(grants[0].usage(), dec!(10));
    }

    /// Free (10 granted), prepaid (20 purchased) and arrear (15 granted,
    /// overage allowed) start at 45. After tracking 50 the free and prepaid
    /// grants are used up and arrear runs 5 over.
    fn scenario_four() -> Vec<Grant> {
        let mut f = Fixture::new();
        let mut grants = vec![
            f.grant("free", dec!(10)).with_reset(monthly(t0() + Duration::days(30))),
            f.grant("prepaid", Decimal::ZERO).with_purchased(dec!(20)),
            f.grant("arrear", dec!(15))
                .with_overage(None)
                .with_reset(monthly(t0() + Duration::days(30))),
        ];
        assert_eq!(compute_balance(&grants, &scope(), t0()).current, dec!(45));
        apply_usage_delta(&mut grants, &scope(), dec!(50), t0()).unwrap();
        grants
    }

    #[test]
    fn set_balance_walks_order_and_never_refunds_purchased() {
        let mut grants = scenario_four();
        assert_eq!(grants[2].raw_balance(), dec!(-5));

        set_absolute_balance(
            &mut grants,
            &scope(),
            dec!(20),
            Redistribution::SequentialDeduct,
            t0(),
        )
        .unwrap();

        let free = grants[0].breakdown();
        assert_eq!(free.granted_balance, dec!(30));
        assert_eq!(free.usage, dec!(10));
        assert_eq!(free.current_balance, dec!(20));

        let prepaid = grants[1].breakdown();
        assert_eq!(prepaid.purchased_balance, dec!(20));
        assert_eq!(prepaid.current_balance, Decimal::ZERO);

        let arrear = grants[2].breakdown();
        assert_eq!(arrear.granted_balance, dec!(20));
        assert_eq!(arrear.purchased_balance, Decimal::ZERO);
        assert_eq!(arrear.current_balance, Decimal::ZERO);

        assert_eq!(compute_balance(&grants, &scope(), t0()).current, dec!(20));
        assert_conservation(&grants, &scope());
    }

    #[test]
    fn set_balance_below_zero_pushes_overage_grant_negative() {
        let mut grants = scenario_four();
        set_absolute_balance(
            &mut grants,
            &scope(),
            dec!(20),
            Redistribution::SequentialDeduct,
            t0(),
        )
        .unwrap();
        set_absolute_balance(
            &mut grants,
            &scope(),
            dec!(-10),
            Redistribution::SequentialDeduct,
            t0(),
        )
        .unwrap();

        assert_eq!(grants[0].granted(), dec!(10));
        assert_eq!(grants[0].current_balance(), Decimal::ZERO);
        assert_eq!(grants[1].purchased(), dec!(20));
        assert_eq!(grants[2].granted(), dec!(10));
        assert_eq!(grants[2].purchased_balance(), dec!(10));
        assert_eq!(grants[2].current_balance(), Decimal::ZERO);
    }

    #[test]
    fn proportional_scales_positive_grants() {
        let mut f = Fixture::new();
        let entity = EntityId::generate();
        let mut grants = vec![
            f.grant("monthly", dec!(100))
                .with_entity(entity)
                .with_reset(monthly(t0() + Duration::days(30))),
            f.grant("lifetime", dec!(50)).with_entity(entity),
        ];
        let scope = BalanceScope::entity(messages(), entity);
        set_absolute_balance(
            &mut grants,
            &scope,
            dec!(120),
            Redistribution::ProportionalRedistribute,
            t0(),
        )
        .unwrap();
        assert_eq!(grants[0].current_balance(), dec!(80));
        assert_eq!(grants[1].current_balance(), dec!(40));

        // sequential on the same input drains the first grant only
        let mut sequential = vec![
            f.grant("monthly", dec!(100))
                .with_entity(entity)
                .with_reset(monthly(t0() + Duration::days(30))),
            f.grant("lifetime", dec!(50)).with_entity(entity),
        ];
        set_absolute_balance(
            &mut sequential,
            &scope,
            dec!(120),
            Redistribution::SequentialDeduct,
            t0(),
        )
        .unwrap();
        assert_eq!(sequential[0].granted(), dec!(70));
        assert_eq!(sequential[1].granted(), dec!(50));
    }

    #[test]
    fn proportional_falls_back_with_single_grant() {
        let mut f = Fixture::new();
        let mut grants = vec![f.grant("only", dec!(100))];
        set_absolute_balance(
            &mut grants,
            &scope(),
            dec!(30),
            Redistribution::ProportionalRedistribute,
            t0(),
        )
        .unwrap();
        assert_eq!(grants[0].granted(), dec!(30));
    }

    #[test]
    fn every_change_bumps_version() {
        let mut f = Fixture::new();
        let mut grants = vec![f.grant("a", dec!(10)), f.grant("b", dec!(10))];
        apply_usage_delta(&mut grants, &scope(), dec!(5), t0()).unwrap();
        assert_eq!(grants[0].version(), 1);
        assert_eq!(grants[1].version(), 0);
    }

    #[test]
    fn failed_commit_leaves_grants_untouched() {
        let mut f = Fixture::new();
        let mut grants = vec![f.grant("free", dec!(10))];
        let mut working = grants.clone();
        working[0].add_usage(dec!(15));
        let err = commit(&mut grants, working, &[0], LedgerOutcome::default()).unwrap_err();
        assert!(matches!(err, EntitleError::InvariantViolation { .. }));
        assert_eq!(grants[0].usage(), Decimal::ZERO);
        assert_eq!(grants[0].version(), 0);
    }

    #[test]
    fn reset_clears_usage_and_keeps_purchased() {
        let mut f = Fixture::new();
        let boundary = Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap();
        let mut grants = vec![f
            .grant("pro", dec!(100))
            .with_purchased(dec!(5))
            .with_reset(monthly(boundary))];
        apply_usage_delta(&mut grants, &scope(), dec!(70), t0()).unwrap();

        assert!(reset_grant(&mut grants[0], dec!(120), t0()).unwrap().is_none());

        let outcome = reset_grant(&mut grants[0], dec!(120), boundary).unwrap().unwrap();
        assert_eq!(
            outcome.next_reset,
            Utc.with_ymd_and_hms(2025, 5, 1, 0, 0, 0).unwrap()
        );
        assert!(outcome.rollover.is_none());
        assert_eq!(grants[0].usage(), Decimal::ZERO);
        assert_eq!(grants[0].granted(), dec!(120));
        assert_eq!(grants[0].purchased(), dec!(5));
    }

    #[test]
    fn rollover_is_capped_and_consumed_first() {
        let mut f = Fixture::new();
        let boundary = Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap();
        let mut grants = vec![f
            .grant("pro", dec!(100))
            .with_reset(monthly(boundary))
            .with_rollover(RolloverPolicy {
                max: Some(dec!(50)),
                duration_cycles: 2,
            })];
        apply_usage_delta(&mut grants, &scope(), dec!(30), t0()).unwrap();

        let outcome = reset_grant(&mut grants[0], dec!(100), boundary).unwrap().unwrap();
        let rollover = outcome.rollover.unwrap();
        assert_eq!(rollover.granted(), dec!(50));
        assert_eq!(
            rollover.expires_at(),
            Some(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap())
        );
        grants.push(rollover);

        apply_usage_delta(&mut grants, &scope(), dec!(60), boundary).unwrap();
        assert_eq!(grants[1].usage(), dec!(50));
        assert_eq!(grants[0].usage(), dec!(10));
    }

    #[test]
    fn regrant_keeps_usage_and_calendar() {
        let mut f = Fixture::new();
        let boundary = t0() + Duration::days(30);
        let mut grant = f.grant("pro", dec!(100)).with_reset(monthly(boundary));
        let mut grants = vec![grant.clone()];
        apply_usage_delta(&mut grants, &scope(), dec!(40), t0()).unwrap();
        grant = grants.remove(0);

        let item = FeatureItem::new(messages(), dec!(200), Some(Cadence::monthly()));
        assert!(regrant(&mut grant, &item));
        assert_eq!(grant.granted(), dec!(200));
        assert_eq!(grant.usage(), dec!(40));
        assert_eq!(grant.reset().unwrap().next_reset, boundary);
        assert!(!regrant(&mut grant, &item));
    }

    #[test]
    fn top_up_cannot_go_below_zero() {
        let mut f = Fixture::new();
        let mut grant = f.grant("prepaid", Decimal::ZERO).with_purchased(dec!(20));
        top_up(&mut grant, dec!(-5)).unwrap();
        assert_eq!(grant.purchased(), dec!(15));
        assert!(top_up(&mut grant, dec!(-16)).is_err());
        assert_eq!(grant.purchased(), dec!(15));
    }

    #[test]
    fn carry_usage_lands_on_first_matching_grant() {
        let mut f = Fixture::new();
        let old = vec![f.grant("free", dec!(100)).with_usage(dec!(30))];
        let mut fresh = vec![
            f.grant("pro", dec!(500)),
            f.grant("pro-extra", dec!(50)),
        ];
        carry_usage(&old, &mut fresh);
        assert_eq!(fresh[0].usage(), dec!(30));
        assert_eq!(fresh[1].usage(), Decimal::ZERO);
    }
}
