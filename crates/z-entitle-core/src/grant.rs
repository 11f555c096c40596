//! Grants and the breakdown view.
//!
//! A [`Grant`] is one allocation of a feature's quantity to a customer, or to
//! one entity under the customer. Quantities are only changed through the
//! operations in [`crate::ledger`]; the fields are private and every change
//! bumps [`Grant::version`].
//!
//! Internally a grant may run negative (`granted + purchased < usage`) when
//! overage is allowed. The external view clamps `current_balance` at zero and
//! reports the overage as extra purchased quantity.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::calendar::Cadence;
use crate::ids::{CustomerId, EntityId, FeatureId, GrantId, InstanceId, PlanId};
use crate::plan::RolloverPolicy;

/// Periodic reset of a grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetSchedule {
    /// Reset cadence.
    pub cadence: Cadence,
    /// Anchor of the reset lattice.
    pub anchor: DateTime<Utc>,
    /// Next reset boundary.
    pub next_reset: DateTime<Utc>,
}

/// Where a grant's quantity came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GrantSource {
    /// Included usage of a plan item.
    Plan,
    /// Unused quantity carried over from another grant at its reset.
    Rollover {
        /// The grant that rolled over.
        from: GrantId,
    },
}

/// One allocation of a feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    id: GrantId,
    customer: CustomerId,
    instance: InstanceId,
    plan: PlanId,
    feature: FeatureId,
    entity: Option<EntityId>,
    source: GrantSource,
    granted: Decimal,
    purchased: Decimal,
    usage: Decimal,
    overage_allowed: bool,
    usage_limit: Option<Decimal>,
    reset: Option<ResetSchedule>,
    rollover: Option<RolloverPolicy>,
    expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    version: u64,
}

impl Grant {
    /// A customer-level lifetime grant with no purchased quantity and no usage.
    #[must_use]
    pub fn new(
        customer: CustomerId,
        instance: InstanceId,
        plan: PlanId,
        feature: FeatureId,
        granted: Decimal,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: GrantId::generate(),
            customer,
            instance,
            plan,
            feature,
            entity: None,
            source: GrantSource::Plan,
            granted,
            purchased: Decimal::ZERO,
            usage: Decimal::ZERO,
            overage_allowed: false,
            usage_limit: None,
            reset: None,
            rollover: None,
            expires_at: None,
            created_at,
            version: 0,
        }
    }

    /// Scope the grant to one entity.
    #[must_use]
    pub fn with_entity(mut self, entity: EntityId) -> Self {
        self.entity = Some(entity);
        self
    }

    /// Set the purchased quantity.
    #[must_use]
    pub fn with_purchased(mut self, purchased: Decimal) -> Self {
        self.purchased = purchased;
        self
    }

    /// Start with existing usage, e.g. when usage carries over to a replacement grant.
    #[must_use]
    pub fn with_usage(mut self, usage: Decimal) -> Self {
        self.usage = usage;
        self
    }

    /// Allow overage, capped at `usage_limit` total usage when set.
    #[must_use]
    pub fn with_overage(mut self, usage_limit: Option<Decimal>) -> Self {
        self.overage_allowed = true;
        self.usage_limit = usage_limit;
        self
    }

    /// Reset periodically.
    #[must_use]
    pub fn with_reset(mut self, reset: ResetSchedule) -> Self {
        self.reset = Some(reset);
        self
    }

    /// Roll unused quantity over at reset.
    #[must_use]
    pub fn with_rollover(mut self, rollover: RolloverPolicy) -> Self {
        self.rollover = Some(rollover);
        self
    }

    /// Expire at `at`.
    #[must_use]
    pub fn with_expiry(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub(crate) fn with_source(mut self, source: GrantSource) -> Self {
        self.source = source;
        self
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    /// Grant id.
    #[must_use]
    pub const fn id(&self) -> GrantId {
        self.id
    }

    /// Owning customer.
    #[must_use]
    pub const fn customer(&self) -> CustomerId {
        self.customer
    }

    /// Owning plan instance.
    #[must_use]
    pub const fn instance(&self) -> InstanceId {
        self.instance
    }

    /// Plan the grant came from.
    #[must_use]
    pub const fn plan(&self) -> &PlanId {
        &self.plan
    }

    /// Feature.
    #[must_use]
    pub const fn feature(&self) -> &FeatureId {
        &self.feature
    }

    /// Entity scope, `None` for customer-level grants.
    #[must_use]
    pub const fn entity(&self) -> Option<EntityId> {
        self.entity
    }

    /// Source of the quantity.
    #[must_use]
    pub const fn source(&self) -> GrantSource {
        self.source
    }

    /// Granted quantity.
    #[must_use]
    pub const fn granted(&self) -> Decimal {
        self.granted
    }

    /// Purchased (prepaid) quantity, excluding overage.
    #[must_use]
    pub const fn purchased(&self) -> Decimal {
        self.purchased
    }

    /// Consumed usage.
    #[must_use]
    pub const fn usage(&self) -> Decimal {
        self.usage
    }

    /// Whether usage may run past the balance.
    #[must_use]
    pub const fn overage_allowed(&self) -> bool {
        self.overage_allowed
    }

    /// Cap on total usage, if any.
    #[must_use]
    pub const fn usage_limit(&self) -> Option<Decimal> {
        self.usage_limit
    }

    /// Reset schedule, `None` for lifetime grants.
    #[must_use]
    pub const fn reset(&self) -> Option<&ResetSchedule> {
        self.reset.as_ref()
    }

    /// Rollover policy.
    #[must_use]
    pub const fn rollover(&self) -> Option<&RolloverPolicy> {
        self.rollover.as_ref()
    }

    /// Expiry instant.
    #[must_use]
    pub const fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Creation instant.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Optimistic-concurrency version, bumped by every change.
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    // ------------------------------------------------------------------------
    // Derived quantities
    // ------------------------------------------------------------------------

    /// Signed internal balance: `granted + purchased - usage`.
    #[must_use]
    pub fn raw_balance(&self) -> Decimal {
        self.granted + self.purchased - self.usage
    }

    /// Usage beyond granted and purchased quantity.
    #[must_use]
    pub fn overage(&self) -> Decimal {
        (-self.raw_balance()).max(Decimal::ZERO)
    }

    /// Purchased quantity as reported: prepaid plus overage.
    #[must_use]
    pub fn purchased_balance(&self) -> Decimal {
        self.purchased + self.overage()
    }

    /// `max(0, granted + purchased - usage)`.
    #[must_use]
    pub fn current_balance(&self) -> Decimal {
        self.raw_balance().max(Decimal::ZERO)
    }

    /// Whether the grant has expired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Customer-level grants apply to every entity of the customer.
    #[must_use]
    pub const fn is_customer_level(&self) -> bool {
        self.entity.is_none()
    }

    /// Whether the periodic reset is due at `now`.
    #[must_use]
    pub fn reset_due(&self, now: DateTime<Utc>) -> bool {
        self.reset.is_some_and(|r| r.next_reset <= now)
    }

    /// The API-facing view of this grant.
    #[must_use]
    pub fn breakdown(&self) -> Breakdown {
        Breakdown {
            grant_id: self.id,
            instance_id: self.instance,
            plan_id: self.plan.clone(),
            feature: self.feature.clone(),
            entity: self.entity,
            granted_balance: self.granted,
            purchased_balance: self.purchased_balance(),
            usage: self.usage,
            current_balance: self.current_balance(),
            overage_allowed: self.overage_allowed,
            reset_interval: self.reset.map(|r| r.cadence),
            next_reset_at: self.reset.map(|r| r.next_reset),
            expires_at: self.expires_at,
        }
    }

    // ------------------------------------------------------------------------
    // Ledger-only mutation
    // ------------------------------------------------------------------------

    pub(crate) fn add_usage(&mut self, delta: Decimal) {
        self.usage += delta;
    }

    pub(crate) fn add_granted(&mut self, delta: Decimal) {
        self.granted += delta;
    }

    pub(crate) fn add_purchased(&mut self, delta: Decimal) {
        self.purchased += delta;
    }

    pub(crate) fn set_granted(&mut self, granted: Decimal) {
        self.granted = granted;
    }

    pub(crate) fn set_usage(&mut self, usage: Decimal) {
        self.usage = usage;
    }

    pub(crate) fn set_next_reset(&mut self, next_reset: DateTime<Utc>) {
        if let Some(reset) = self.reset.as_mut() {
            reset.next_reset = next_reset;
        }
    }

    pub(crate) fn set_expiry(&mut self, at: Option<DateTime<Utc>>) {
        self.expires_at = at;
    }

    pub(crate) fn reassign(&mut self, instance: InstanceId, plan: PlanId) {
        self.instance = instance;
        self.plan = plan;
    }

    pub(crate) fn set_terms(
        &mut self,
        overage_allowed: bool,
        usage_limit: Option<Decimal>,
        rollover: Option<RolloverPolicy>,
    ) {
        self.overage_allowed = overage_allowed;
        self.usage_limit = usage_limit;
        self.rollover = rollover;
    }

    pub(crate) fn bump_version(&mut self) {
        self.version += 1;
    }
}

/// API-facing view of one grant's contribution to a balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breakdown {
    /// The grant.
    pub grant_id: GrantId,
    /// Owning plan instance.
    pub instance_id: InstanceId,
    /// Plan.
    pub plan_id: PlanId,
    /// Feature.
    pub feature: FeatureId,
    /// Entity scope.
    pub entity: Option<EntityId>,
    /// Granted quantity.
    pub granted_balance: Decimal,
    /// Prepaid plus overage.
    pub purchased_balance: Decimal,
    /// Consumed usage.
    pub usage: Decimal,
    /// Clamped balance.
    pub current_balance: Decimal,
    /// Overage flag.
    pub overage_allowed: bool,
    /// Reset cadence, `None` for lifetime.
    pub reset_interval: Option<Cadence>,
    /// Next reset.
    pub next_reset_at: Option<DateTime<Utc>>,
    /// Expiry.
    pub expires_at: Option<DateTime<Utc>>,
}
