//! Storage layer for z-entitle.
//!
//! This crate provides the durable store of customer state (plan instances
//! with their grants, entities, processor-subscription links) and the fast
//! balance cache that sits in front of it on the usage path.
//!
//! - [`Store`]: durable store, with [`MemoryStore`] and, behind the
//!   `rocksdb-backend` feature, `RocksStore`
//! - [`BalanceCache`]: TTL cache of balances, statuses and grant snapshots,
//!   with [`MemoryCache`]
//!
//! The cache is an optimization. Financial decisions are taken on store state.
//!
//! # Example
//!
//! ```
//! use z_entitle_core::{CustomerId, CustomerState};
//! use z_entitle_store::{MemoryStore, Store};
//!
//! let store = MemoryStore::new();
//! let customer = CustomerId::generate();
//! store.put_customer(&CustomerState::new(customer)).unwrap();
//! assert!(store.get_customer(&customer).unwrap().is_some());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod cache;
pub mod error;
pub mod keys;
pub mod memory;
#[cfg(feature = "rocksdb-backend")]
pub mod rocks;
pub mod schema;

pub use cache::{BalanceCache, BalanceKey, MemoryCache};
pub use error::{Result, StoreError};
pub use memory::MemoryStore;
#[cfg(feature = "rocksdb-backend")]
pub use rocks::RocksStore;

use z_entitle_core::{
    BillingPlan, CustomerId, CustomerState, EntityId, ExternalSubscriptionRef, Grant, GrantId,
    GroupId, InstanceId, PlanInstance, SubscriptionLink,
};

/// Selects instances of one customer. `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceFilter {
    /// Entity scope; `Some(None)` selects customer-level instances only.
    pub entity: Option<Option<EntityId>>,
    /// Plan group.
    pub group: Option<GroupId>,
    /// State name, as in `InstanceState::name`.
    pub status: Option<&'static str>,
}

impl InstanceFilter {
    /// Whether `instance` passes the filter.
    #[must_use]
    pub fn matches(&self, instance: &PlanInstance) -> bool {
        self.entity.map_or(true, |entity| instance.entity == entity)
            && self.group.as_ref().map_or(true, |group| &instance.group == group)
            && self
                .status
                .map_or(true, |status| instance.state.name() == status)
    }
}

/// The storage trait defining all database operations.
///
/// This trait abstracts the storage layer, allowing for different implementations
/// (e.g., `RocksDB`, in-memory for testing).
pub trait Store: Send + Sync {
    // =========================================================================
    // Customer Operations
    // =========================================================================

    /// Insert or replace the complete state of a customer.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_customer(&self, state: &CustomerState) -> Result<()>;

    /// Get the complete state of a customer.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_customer(&self, customer: &CustomerId) -> Result<Option<CustomerState>>;

    /// Every customer id, for sweeps.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_customers(&self) -> Result<Vec<CustomerId>>;

    // =========================================================================
    // Instance Operations
    // =========================================================================

    /// Get one instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_instance(
        &self,
        customer: &CustomerId,
        instance: InstanceId,
    ) -> Result<Option<PlanInstance>> {
        Ok(self
            .get_customer(customer)?
            .and_then(|state| state.instances.into_iter().find(|i| i.id == instance)))
    }

    /// List a customer's instances matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_instances(
        &self,
        customer: &CustomerId,
        filter: &InstanceFilter,
    ) -> Result<Vec<PlanInstance>> {
        Ok(self
            .get_customer(customer)?
            .map(|state| {
                state
                    .instances
                    .into_iter()
                    .filter(|i| filter.matches(i))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Every link to a processor subscription, with the owning customer.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn find_links(
        &self,
        external_ref: &ExternalSubscriptionRef,
    ) -> Result<Vec<(CustomerId, SubscriptionLink)>>;

    // =========================================================================
    // Compound Operations
    // =========================================================================

    /// Apply a billing plan to a customer atomically.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the customer doesn't exist.
    /// - `StoreError::PlanRejected` if the plan does not apply to the stored state;
    ///   nothing is written.
    fn apply_billing_plan(&self, customer: &CustomerId, plan: &BillingPlan) -> Result<()>;

    /// Replace grants whose stored versions still match `expected`.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the customer or a grant doesn't exist.
    /// - `StoreError::VersionConflict` if a stored version differs; nothing is written.
    fn compare_and_swap_grants(
        &self,
        customer: &CustomerId,
        expected: &[(GrantId, u64)],
        grants: &[Grant],
    ) -> Result<()>;
}

/// Apply `plan` to an in-memory copy of a customer's state.
pub(crate) fn apply_to_state(state: &mut CustomerState, plan: &BillingPlan) -> Result<()> {
    let instances = plan.project(&state.instances)?;
    state.instances = instances;
    state.links = plan.project_links(&state.links);
    Ok(())
}

/// Compare-and-swap grants inside an in-memory copy of a customer's state.
pub(crate) fn swap_grants(
    state: &mut CustomerState,
    expected: &[(GrantId, u64)],
    grants: &[Grant],
) -> Result<()> {
    for (grant_id, version) in expected {
        let stored = state
            .instances
            .iter()
            .flat_map(|i| i.grants.iter())
            .find(|g| g.id() == *grant_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "grant",
                id: grant_id.to_string(),
            })?;
        if stored.version() != *version {
            return Err(StoreError::VersionConflict {
                grant: *grant_id,
                expected: *version,
                found: stored.version(),
            });
        }
    }
    for grant in grants {
        let slot = state
            .instances
            .iter_mut()
            .flat_map(|i| i.grants.iter_mut())
            .find(|g| g.id() == grant.id())
            .ok_or_else(|| StoreError::NotFound {
                entity: "grant",
                id: grant.id().to_string(),
            })?;
        *slot = grant.clone();
    }
    Ok(())
}
