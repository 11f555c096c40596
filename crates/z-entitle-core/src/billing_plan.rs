//! Billing plans: the declarative output of every plan computer.
//!
//! A [`BillingPlan`] lists instance records to insert, update and delete,
//! the money line items to submit to the processor, and changes to the
//! instance ↔ processor-subscription join. It is never persisted. Applying it
//! is all-or-nothing relative to its own fields; [`BillingPlan::project`]
//! computes the post-state without touching the input.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{EntitleError, PlanFailure, Result};
use crate::grant::Grant;
use crate::ids::{ExternalSubscriptionRef, GrantId, InstanceId, LineItemId};
use crate::instance::PlanInstance;
use crate::lifecycle::InstanceState;
use crate::plan::FeatureQuantity;
use crate::pricing::{round_money, PriceTerm};

/// A half-open billing period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    /// Start.
    pub start: DateTime<Utc>,
    /// End.
    pub end: DateTime<Utc>,
}

/// A charge (positive) or credit (negative) for the processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    /// Line-item id; also the idempotency suffix for the processor call.
    pub id: LineItemId,
    /// Instance the amount belongs to.
    pub instance: InstanceId,
    /// Signed amount, rounded to minor units.
    pub amount: Decimal,
    /// Human-readable description.
    pub description: String,
    /// Service period covered.
    pub period: Period,
    /// Grant whose usage produced the amount, for overage charges.
    pub related_grant: Option<GrantId>,
}

impl LineItem {
    /// Create a line item; the amount is rounded to minor units.
    #[must_use]
    pub fn new(
        instance: InstanceId,
        amount: Decimal,
        description: impl Into<String>,
        period: Period,
    ) -> Self {
        Self {
            id: LineItemId::generate(),
            instance,
            amount: round_money(amount),
            description: description.into(),
            period,
            related_grant: None,
        }
    }

    /// Attribute the amount to a grant.
    #[must_use]
    pub fn for_grant(mut self, grant: GrantId) -> Self {
        self.related_grant = Some(grant);
        self
    }

    /// Key the processor uses to drop a retried call.
    #[must_use]
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.instance, self.id)
    }
}

/// One row of the instance ↔ processor-subscription join.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionLink {
    /// The instance.
    pub instance: InstanceId,
    /// The processor subscription.
    pub external_ref: ExternalSubscriptionRef,
}

/// Whether a new subscription needs an explicit billing-cycle anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BillingAnchor {
    /// The processor's natural cycle lines up.
    #[default]
    Natural,
    /// Anchor the processor cycle at `at`.
    Override {
        /// The anchor instant.
        at: DateTime<Utc>,
    },
}

/// Field changes for one instance. `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstancePatch {
    /// New state.
    pub state: Option<InstanceState>,
    /// New plan version.
    pub version: Option<u32>,
    /// New price terms.
    pub prices: Option<Vec<PriceTerm>>,
    /// New prepaid quantities.
    pub quantities: Option<Vec<FeatureQuantity>>,
    /// Replacement grant list.
    pub grants: Option<Vec<Grant>>,
}

impl InstancePatch {
    /// A patch that only changes state.
    #[must_use]
    pub fn state(state: InstanceState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    /// True when nothing changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.is_none()
            && self.version.is_none()
            && self.prices.is_none()
            && self.quantities.is_none()
            && self.grants.is_none()
    }

    /// Combine two patches; fields set in `over` win.
    #[must_use]
    pub fn merge(self, over: Self) -> Self {
        Self {
            state: over.state.or(self.state),
            version: over.version.or(self.version),
            prices: over.prices.or(self.prices),
            quantities: over.quantities.or(self.quantities),
            grants: over.grants.or(self.grants),
        }
    }

    /// Write the patch into `instance`.
    pub fn apply(&self, instance: &mut PlanInstance) {
        if let Some(state) = self.state {
            instance.state = state;
        }
        if let Some(version) = self.version {
            instance.version = version;
        }
        if let Some(prices) = &self.prices {
            instance.prices.clone_from(prices);
        }
        if let Some(quantities) = &self.quantities {
            instance.quantities.clone_from(quantities);
        }
        if let Some(grants) = &self.grants {
            instance.grants.clone_from(grants);
        }
    }
}

/// A patch addressed to one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceUpdate {
    /// Target instance.
    pub instance: InstanceId,
    /// Changes.
    pub patch: InstancePatch,
}

/// The diff a plan computer produces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingPlan {
    /// New instances.
    pub insert: Vec<PlanInstance>,
    /// Changed instances.
    pub update: Vec<InstanceUpdate>,
    /// Removed instances.
    pub delete: Vec<PlanInstance>,
    /// Money to charge or credit.
    pub line_items: Vec<LineItem>,
    /// New join rows.
    pub link: Vec<SubscriptionLink>,
    /// Removed join rows.
    pub unlink: Vec<SubscriptionLink>,
    /// Processor subscriptions left with no live instance.
    pub cancel_subscriptions: Vec<ExternalSubscriptionRef>,
    /// Billing-cycle anchor decision for new subscriptions.
    pub anchor: BillingAnchor,
}

impl BillingPlan {
    /// True when the plan changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.insert.is_empty()
            && self.update.is_empty()
            && self.delete.is_empty()
            && self.line_items.is_empty()
            && self.link.is_empty()
            && self.unlink.is_empty()
            && self.cancel_subscriptions.is_empty()
    }

    /// Net money of all line items.
    #[must_use]
    pub fn total(&self) -> Decimal {
        self.line_items.iter().map(|item| item.amount).sum()
    }

    /// Add a patch, merging with an existing patch for the same instance.
    pub fn patch(&mut self, instance: InstanceId, patch: InstancePatch) {
        if patch.is_empty() {
            return;
        }
        match self.update.iter_mut().find(|u| u.instance == instance) {
            Some(existing) => {
                existing.patch = std::mem::take(&mut existing.patch).merge(patch);
            }
            None => self.update.push(InstanceUpdate { instance, patch }),
        }
    }

    /// Mark an instance for deletion once.
    pub fn remove(&mut self, instance: &PlanInstance) {
        if !self.delete.iter().any(|d| d.id == instance.id) {
            self.delete.push(instance.clone());
        }
    }

    /// The patch addressed to `instance`.
    #[must_use]
    pub fn update_for(&self, instance: InstanceId) -> Option<&InstancePatch> {
        self.update
            .iter()
            .find(|u| u.instance == instance)
            .map(|u| &u.patch)
    }

    /// Whether `instance` is deleted by this plan.
    #[must_use]
    pub fn deletes(&self, instance: InstanceId) -> bool {
        self.delete.iter().any(|d| d.id == instance)
    }

    /// Combine with `other`. Patches from `other` win on conflicting fields;
    /// inserts, deletes, line items and link changes are additive.
    #[must_use]
    pub fn merge(mut self, other: Self) -> Self {
        self.insert.extend(other.insert);
        for update in other.update {
            self.patch(update.instance, update.patch);
        }
        for deleted in &other.delete {
            self.remove(deleted);
        }
        self.line_items.extend(other.line_items);
        self.link.extend(other.link);
        self.unlink.extend(other.unlink);
        for external in other.cancel_subscriptions {
            if !self.cancel_subscriptions.contains(&external) {
                self.cancel_subscriptions.push(external);
            }
        }
        if let BillingAnchor::Override { .. } = other.anchor {
            self.anchor = other.anchor;
        }
        self
    }

    /// The instance set after applying this plan to `instances`.
    ///
    /// # Errors
    ///
    /// Fails without partial output if an update or delete targets an unknown
    /// instance, or an insert reuses an existing id.
    pub fn project(&self, instances: &[PlanInstance]) -> Result<Vec<PlanInstance>> {
        let mut projected = instances.to_vec();

        for update in &self.update {
            let target = projected
                .iter_mut()
                .find(|i| i.id == update.instance)
                .ok_or(PlanFailure::InstanceNotFound {
                    instance: update.instance,
                })?;
            update.patch.apply(target);
        }

        for deleted in &self.delete {
            let before = projected.len();
            projected.retain(|i| i.id != deleted.id);
            if projected.len() == before {
                return Err(PlanFailure::InstanceNotFound {
                    instance: deleted.id,
                }
                .into());
            }
        }

        for inserted in &self.insert {
            if projected.iter().any(|i| i.id == inserted.id) {
                return Err(EntitleError::Validation(format!(
                    "instance {} inserted twice",
                    inserted.id
                )));
            }
            projected.push(inserted.clone());
        }

        Ok(projected)
    }

    /// The join after applying this plan to `links`.
    #[must_use]
    pub fn project_links(&self, links: &[SubscriptionLink]) -> Vec<SubscriptionLink> {
        let mut projected: Vec<SubscriptionLink> = links
            .iter()
            .filter(|link| !self.unlink.contains(link))
            .cloned()
            .collect();
        for link in &self.link {
            if !projected.contains(link) {
                projected.push(link.clone());
            }
        }
        projected
    }
}
