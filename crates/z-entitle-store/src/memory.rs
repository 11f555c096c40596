//! In-memory storage implementation.
//!
//! Used by tests and by deployments that do not need durability. All writes to
//! one customer happen under a single write lock, so plan application and
//! compare-and-swap are atomic.

use std::collections::HashMap;

use parking_lot::RwLock;

use z_entitle_core::{
    BillingPlan, CustomerId, CustomerState, ExternalSubscriptionRef, Grant, GrantId,
    SubscriptionLink,
};

use crate::error::{Result, StoreError};
use crate::{apply_to_state, swap_grants, Store};

/// Store keeping every customer in a map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    customers: RwLock<HashMap<CustomerId, CustomerState>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(customer: &CustomerId) -> StoreError {
    StoreError::NotFound {
        entity: "customer",
        id: customer.to_string(),
    }
}

impl Store for MemoryStore {
    fn put_customer(&self, state: &CustomerState) -> Result<()> {
        self.customers.write().insert(state.customer, state.clone());
        Ok(())
    }

    fn get_customer(&self, customer: &CustomerId) -> Result<Option<CustomerState>> {
        Ok(self.customers.read().get(customer).cloned())
    }

    fn list_customers(&self) -> Result<Vec<CustomerId>> {
        let mut customers: Vec<_> = self.customers.read().keys().copied().collect();
        customers.sort();
        Ok(customers)
    }

    fn find_links(
        &self,
        external_ref: &ExternalSubscriptionRef,
    ) -> Result<Vec<(CustomerId, SubscriptionLink)>> {
        Ok(self
            .customers
            .read()
            .values()
            .flat_map(|state| {
                state
                    .links
                    .iter()
                    .filter(|link| &link.external_ref == external_ref)
                    .map(|link| (state.customer, link.clone()))
            })
            .collect())
    }

    fn apply_billing_plan(&self, customer: &CustomerId, plan: &BillingPlan) -> Result<()> {
        let mut customers = self.customers.write();
        let state = customers.get_mut(customer).ok_or_else(|| not_found(customer))?;
        let mut next = state.clone();
        apply_to_state(&mut next, plan)?;
        *state = next;
        Ok(())
    }

    fn compare_and_swap_grants(
        &self,
        customer: &CustomerId,
        expected: &[(GrantId, u64)],
        grants: &[Grant],
    ) -> Result<()> {
        let mut customers = self.customers.write();
        let state = customers.get_mut(customer).ok_or_else(|| not_found(customer))?;
        let mut next = state.clone();
        swap_grants(&mut next, expected, grants)?;
        *state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InstanceFilter;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;
    use z_entitle_core::{
        Cadence, FeatureId, FeatureItem, GroupId, InstanceState, Plan, PlanId, PlanInstance,
    };

    fn customer_with_instance() -> (CustomerState, PlanInstance) {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        let plan = Plan {
            id: PlanId::new("pro").unwrap(),
            version: 1,
            group: GroupId::new("main").unwrap(),
            name: "Pro".into(),
            is_add_on: false,
            is_default: false,
            currency: "usd".into(),
            prices: vec![],
            features: vec![FeatureItem::new(
                FeatureId::new("messages").unwrap(),
                dec!(100),
                Some(Cadence::monthly()),
            )],
        };
        let mut state = CustomerState::new(CustomerId::generate());
        let instance = PlanInstance::from_plan(
            &plan,
            state.customer,
            None,
            InstanceState::Active,
            now,
            &[],
            vec![],
            now,
        )
        .unwrap();
        state.instances.push(instance.clone());
        (state, instance)
    }

    #[test]
    fn customer_crud_and_filter() {
        let store = MemoryStore::new();
        let (state, instance) = customer_with_instance();
        store.put_customer(&state).unwrap();

        assert_eq!(store.list_customers().unwrap(), vec![state.customer]);
        let found = store
            .get_instance(&state.customer, instance.id)
            .unwrap()
            .unwrap();
        assert_eq!(found.id, instance.id);

        let active = InstanceFilter {
            status: Some("active"),
            ..InstanceFilter::default()
        };
        assert_eq!(store.list_instances(&state.customer, &active).unwrap().len(), 1);
        let scheduled = InstanceFilter {
            status: Some("scheduled"),
            ..InstanceFilter::default()
        };
        assert!(store
            .list_instances(&state.customer, &scheduled)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn rejected_plan_writes_nothing() {
        let store = MemoryStore::new();
        let (state, instance) = customer_with_instance();
        store.put_customer(&state).unwrap();

        let mut plan = BillingPlan::default();
        plan.patch(
            instance.id,
            z_entitle_core::InstancePatch::state(InstanceState::Expired {
                ended_at: Utc::now(),
                canceled_at: None,
            }),
        );
        plan.insert.push(instance.clone());

        let result = store.apply_billing_plan(&state.customer, &plan);
        assert!(matches!(result, Err(StoreError::PlanRejected(_))));
        let stored = store.get_customer(&state.customer).unwrap().unwrap();
        assert_eq!(stored.instances[0].state, InstanceState::Active);
    }

    #[test]
    fn compare_and_swap_detects_stale_version() {
        let store = MemoryStore::new();
        let (state, instance) = customer_with_instance();
        store.put_customer(&state).unwrap();

        let grant = &instance.grants[0];
        let expected = [(grant.id(), grant.version())];
        let updated = grant.clone().with_usage(dec!(5));
        store
            .compare_and_swap_grants(&state.customer, &expected, &[updated.clone()])
            .unwrap();

        let stale = [(grant.id(), grant.version() + 1)];
        let err = store
            .compare_and_swap_grants(&state.customer, &stale, &[updated])
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));
        assert!(err.is_store_behind());
    }

    #[test]
    fn links_are_found_by_ref() {
        let store = MemoryStore::new();
        let (mut state, instance) = customer_with_instance();
        let external_ref = ExternalSubscriptionRef::new("sub_1").unwrap();
        state.links.push(SubscriptionLink {
            instance: instance.id,
            external_ref: external_ref.clone(),
        });
        store.put_customer(&state).unwrap();

        let links = store.find_links(&external_ref).unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].0, state.customer);
    }
}
