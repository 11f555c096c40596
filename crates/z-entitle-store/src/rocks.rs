//! `RocksDB` storage implementation.
//!
//! This module provides the `RocksStore` implementation of the `Store` trait.
//! A customer's instances and links live under its 16-byte prefix; compound
//! operations read the customer, apply the change in memory and write the
//! difference in one `WriteBatch`.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch,
};
use serde::{Deserialize, Serialize};

use z_entitle_core::{
    BillingPlan, CustomerId, CustomerState, EntityId, ExternalSubscriptionRef, Grant, GrantId,
    PlanInstance, SubscriptionLink,
};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::{all_column_families, cf};
use crate::{apply_to_state, swap_grants, Store};

/// Value stored in the customers column family.
#[derive(Debug, Serialize, Deserialize)]
struct CustomerRecord {
    customer: CustomerId,
    entities: Vec<EntityId>,
}

/// Value stored in the links-by-ref index.
#[derive(Debug, Serialize, Deserialize)]
struct RefIndexEntry {
    customer: CustomerId,
    link: SubscriptionLink,
}

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    /// Serializes read-modify-write sequences.
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Mutex::new(()),
        })
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    /// Serialize a value using CBOR.
    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a value from CBOR.
    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Every value under `prefix` in one column family.
    fn scan_prefix<T: serde::de::DeserializeOwned>(&self, name: &str, prefix: &[u8]) -> Result<Vec<T>> {
        let cf = self.cf(name)?;
        let mut values = Vec::new();
        for item in self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(prefix) {
                break;
            }
            values.push(Self::deserialize(&value)?);
        }
        Ok(values)
    }

    /// Queue the full state of a customer, replacing what `before` held.
    fn write_state(
        &self,
        batch: &mut WriteBatch,
        before: Option<&CustomerState>,
        state: &CustomerState,
    ) -> Result<()> {
        let cf_customers = self.cf(cf::CUSTOMERS)?;
        let cf_instances = self.cf(cf::INSTANCES)?;
        let cf_links = self.cf(cf::LINKS)?;
        let cf_by_ref = self.cf(cf::LINKS_BY_REF)?;
        let customer = &state.customer;

        if let Some(before) = before {
            for instance in before
                .instances
                .iter()
                .filter(|old| !state.instances.iter().any(|i| i.id == old.id))
            {
                batch.delete_cf(&cf_instances, keys::instance_key(customer, instance.id));
            }
            for link in before.links.iter().filter(|old| !state.links.contains(old)) {
                batch.delete_cf(
                    &cf_links,
                    keys::link_key(customer, link.instance, &link.external_ref),
                );
                batch.delete_cf(
                    &cf_by_ref,
                    keys::ref_index_key(&link.external_ref, customer, link.instance),
                );
            }
        }

        let record = CustomerRecord {
            customer: *customer,
            entities: state.entities.clone(),
        };
        batch.put_cf(
            &cf_customers,
            keys::customer_key(customer),
            Self::serialize(&record)?,
        );
        for instance in &state.instances {
            batch.put_cf(
                &cf_instances,
                keys::instance_key(customer, instance.id),
                Self::serialize(instance)?,
            );
        }
        for link in &state.links {
            batch.put_cf(
                &cf_links,
                keys::link_key(customer, link.instance, &link.external_ref),
                Self::serialize(link)?,
            );
            let entry = RefIndexEntry {
                customer: *customer,
                link: link.clone(),
            };
            batch.put_cf(
                &cf_by_ref,
                keys::ref_index_key(&link.external_ref, customer, link.instance),
                Self::serialize(&entry)?,
            );
        }
        Ok(())
    }

    /// Read a customer, change it in memory, write it back atomically.
    fn modify(
        &self,
        customer: &CustomerId,
        change: impl FnOnce(&mut CustomerState) -> Result<()>,
    ) -> Result<()> {
        let _guard = self.write_lock.lock();
        let before = self.get_customer(customer)?.ok_or_else(|| StoreError::NotFound {
            entity: "customer",
            id: customer.to_string(),
        })?;
        let mut next = before.clone();
        change(&mut next)?;

        let mut batch = WriteBatch::default();
        self.write_state(&mut batch, Some(&before), &next)?;
        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

impl Store for RocksStore {
    // =========================================================================
    // Customer Operations
    // =========================================================================

    fn put_customer(&self, state: &CustomerState) -> Result<()> {
        let _guard = self.write_lock.lock();
        let before = self.get_customer(&state.customer)?;
        let mut batch = WriteBatch::default();
        self.write_state(&mut batch, before.as_ref(), state)?;
        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn get_customer(&self, customer: &CustomerId) -> Result<Option<CustomerState>> {
        let cf = self.cf(cf::CUSTOMERS)?;
        let Some(data) = self
            .db
            .get_cf(&cf, keys::customer_key(customer))
            .map_err(|e| StoreError::Database(e.to_string()))?
        else {
            return Ok(None);
        };
        let record: CustomerRecord = Self::deserialize(&data)?;
        let prefix = keys::customer_prefix(customer);
        let instances: Vec<PlanInstance> = self.scan_prefix(cf::INSTANCES, &prefix)?;
        let links: Vec<SubscriptionLink> = self.scan_prefix(cf::LINKS, &prefix)?;

        Ok(Some(CustomerState {
            customer: record.customer,
            entities: record.entities,
            instances,
            links,
        }))
    }

    fn list_customers(&self) -> Result<Vec<CustomerId>> {
        let records: Vec<CustomerRecord> = self.scan_prefix(cf::CUSTOMERS, &[])?;
        Ok(records.into_iter().map(|r| r.customer).collect())
    }

    fn find_links(
        &self,
        external_ref: &ExternalSubscriptionRef,
    ) -> Result<Vec<(CustomerId, SubscriptionLink)>> {
        let entries: Vec<RefIndexEntry> =
            self.scan_prefix(cf::LINKS_BY_REF, &keys::ref_prefix(external_ref))?;
        Ok(entries.into_iter().map(|e| (e.customer, e.link)).collect())
    }

    // =========================================================================
    // Compound Operations
    // =========================================================================

    fn apply_billing_plan(&self, customer: &CustomerId, plan: &BillingPlan) -> Result<()> {
        self.modify(customer, |state| apply_to_state(state, plan))
    }

    fn compare_and_swap_grants(
        &self,
        customer: &CustomerId,
        expected: &[(GrantId, u64)],
        grants: &[Grant],
    ) -> Result<()> {
        self.modify(customer, |state| swap_grants(state, expected, grants))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;
    use tempfile::TempDir;
    use z_entitle_core::{
        Cadence, FeatureId, FeatureItem, GroupId, InstancePatch, InstanceState, Plan, PlanId,
    };

    fn create_test_store() -> (RocksStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        (store, dir)
    }

    fn customer() -> CustomerState {
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
        state.links.push(SubscriptionLink {
            instance: instance.id,
            external_ref: ExternalSubscriptionRef::new("sub_1").unwrap(),
        });
        state.instances.push(instance);
        state
    }

    #[test]
    fn customer_roundtrip() {
        let (store, _dir) = create_test_store();
        let state = customer();
        store.put_customer(&state).unwrap();

        let loaded = store.get_customer(&state.customer).unwrap().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(store.list_customers().unwrap(), vec![state.customer]);
    }

    #[test]
    fn billing_plan_updates_and_unlinks() {
        let (store, _dir) = create_test_store();
        let state = customer();
        store.put_customer(&state).unwrap();
        let instance = state.instances[0].id;
        let link = state.links[0].clone();

        let mut plan = BillingPlan::default();
        plan.patch(
            instance,
            InstancePatch::state(InstanceState::Expired {
                ended_at: Utc::now(),
                canceled_at: None,
            }),
        );
        plan.unlink.push(link.clone());
        store.apply_billing_plan(&state.customer, &plan).unwrap();

        let loaded = store.get_customer(&state.customer).unwrap().unwrap();
        assert!(loaded.instances[0].state.is_expired());
        assert!(loaded.links.is_empty());
        assert!(store.find_links(&link.external_ref).unwrap().is_empty());
    }

    #[test]
    fn compare_and_swap_rejects_stale_writer() {
        let (store, _dir) = create_test_store();
        let state = customer();
        store.put_customer(&state).unwrap();
        let grant = state.instances[0].grants[0].clone();

        let stale = [(grant.id(), grant.version() + 3)];
        let result = store.compare_and_swap_grants(&state.customer, &stale, &[grant]);
        assert!(matches!(result, Err(StoreError::VersionConflict { .. })));
    }
}
