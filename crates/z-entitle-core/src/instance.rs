//! Plan instances ("customer products").

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::calendar::{Cadence, CycleCalendar};
use crate::error::Result;
use crate::grant::Grant;
use crate::ids::{CustomerId, EntityId, GroupId, InstanceId, PlanId};
use crate::lifecycle::{InstanceState, LegacyStatusView};
use crate::plan::{FeatureQuantity, Plan};
use crate::pricing::PriceTerm;

/// One plan attached to a customer, or to one entity of the customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanInstance {
    /// Instance id.
    pub id: InstanceId,
    /// Owning customer.
    pub customer: CustomerId,
    /// Entity scope, `None` for customer-level instances.
    pub entity: Option<EntityId>,
    /// Plan id.
    pub plan: PlanId,
    /// Plan version.
    pub version: u32,
    /// Plan group.
    pub group: GroupId,
    /// Add-on flag, copied from the plan.
    pub is_add_on: bool,
    /// One-off flag, copied from the plan.
    pub is_one_off: bool,
    /// Currency of the prices.
    pub currency: String,
    /// Lifecycle state.
    pub state: InstanceState,
    /// Anchor of the billing cycle lattice.
    pub billing_anchor: DateTime<Utc>,
    /// Billing cadence, `None` for free and one-off plans.
    pub cadence: Option<Cadence>,
    /// Price terms in force for this instance.
    pub prices: Vec<PriceTerm>,
    /// Prepaid quantities bought.
    pub quantities: Vec<FeatureQuantity>,
    /// Grants owned by the instance, in creation order.
    pub grants: Vec<Grant>,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
}

impl PlanInstance {
    /// Create an instance of `plan`.
    ///
    /// Scheduled instances get no grants until they activate.
    ///
    /// # Errors
    ///
    /// Returns a calendar error if a grant reset boundary is not representable.
    #[allow(clippy::too_many_arguments)]
    pub fn from_plan(
        plan: &Plan,
        customer: CustomerId,
        entity: Option<EntityId>,
        state: InstanceState,
        billing_anchor: DateTime<Utc>,
        entities: &[EntityId],
        quantities: Vec<FeatureQuantity>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let id = InstanceId::generate();
        let grants = if state.is_scheduled() {
            Vec::new()
        } else {
            plan.grants_for(customer, id, entity, entities, &quantities, billing_anchor, now)?
        };
        Ok(Self {
            id,
            customer,
            entity,
            plan: plan.id.clone(),
            version: plan.version,
            group: plan.group.clone(),
            is_add_on: plan.is_add_on,
            is_one_off: plan.is_one_off(),
            currency: plan.currency.clone(),
            state,
            billing_anchor,
            cadence: plan.billing_cadence(),
            prices: plan.prices.clone(),
            quantities,
            grants,
            created_at: now,
        })
    }

    /// Main instances take part in group exclusivity.
    #[must_use]
    pub const fn is_main(&self) -> bool {
        !self.is_add_on && !self.is_one_off
    }

    /// Whether this instance is of `plan` at exactly `version`.
    #[must_use]
    pub fn is_plan_version(&self, plan: &PlanId, version: u32) -> bool {
        &self.plan == plan && self.version == version
    }

    /// Same customer and same entity scope.
    #[must_use]
    pub fn same_scope(&self, other: &Self) -> bool {
        self.customer == other.customer && self.entity == other.entity
    }

    /// Whether any price can charge money.
    #[must_use]
    pub fn is_paid(&self) -> bool {
        !self.recurring_commitment().is_zero() || self.prices.iter().any(|p| p.feature().is_some())
    }

    /// Monthly-normalised fixed recurring price.
    #[must_use]
    pub fn recurring_commitment(&self) -> Decimal {
        self.prices.iter().map(PriceTerm::monthly_amount).sum()
    }

    /// Billing calendar, if the instance recurs.
    #[must_use]
    pub fn calendar(&self) -> Option<CycleCalendar> {
        self.cadence
            .map(|cadence| CycleCalendar::new(self.billing_anchor, cadence))
    }

    /// The billing period containing `now`.
    ///
    /// # Errors
    ///
    /// Returns a calendar error if a boundary is not representable.
    pub fn current_period(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        match self.calendar() {
            Some(calendar) => Ok(Some(calendar.current_period(now)?)),
            None => Ok(None),
        }
    }

    /// End of the billing cycle containing `now`; `now` itself when nothing recurs.
    ///
    /// # Errors
    ///
    /// Returns a calendar error if the boundary is not representable.
    pub fn cycle_end(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        match self.calendar() {
            Some(calendar) => Ok(calendar.cycle_end(now)?),
            None => Ok(now),
        }
    }

    /// The flat status view.
    #[must_use]
    pub fn legacy_view(&self) -> LegacyStatusView {
        LegacyStatusView::from(&self.state)
    }
}
