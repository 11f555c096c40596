//! Balance cache.
//!
//! The usage path writes here synchronously and to the store asynchronously,
//! so an entry may be ahead of the store for a short window. Entries expire
//! after a TTL; an expired entry reads as a miss.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use z_entitle_core::{Balance, CustomerId, EntityId, FeatureId, Grant, InstanceId, InstanceState};

/// Key of one cached aggregate balance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BalanceKey {
    /// The customer.
    pub customer: CustomerId,
    /// Entity scope, `None` for the customer-level aggregate.
    pub entity: Option<EntityId>,
    /// The feature.
    pub feature: FeatureId,
}

/// Cache of balances, instance statuses and grant snapshots.
pub trait BalanceCache: Send + Sync {
    /// A cached aggregate balance.
    fn get_balance(&self, key: &BalanceKey) -> Option<Balance>;

    /// Cache an aggregate balance.
    fn put_balance(&self, key: BalanceKey, balance: Balance);

    /// Every live cached balance of a customer.
    fn balances_for(&self, customer: &CustomerId) -> Vec<(BalanceKey, Balance)>;

    /// A cached instance state.
    fn get_status(&self, customer: &CustomerId, instance: InstanceId) -> Option<InstanceState>;

    /// Cache an instance state.
    fn put_status(&self, customer: CustomerId, instance: InstanceId, state: InstanceState);

    /// The customer's grants as last written on the usage path.
    fn get_grants(&self, customer: &CustomerId) -> Option<Vec<Grant>>;

    /// Cache the customer's grants.
    fn put_grants(&self, customer: CustomerId, grants: Vec<Grant>);

    /// Drop every entry of a customer.
    fn invalidate(&self, customer: &CustomerId);
}

#[derive(Debug, Clone)]
struct Entry<T> {
    value: T,
    written_at: Instant,
}

impl<T: Clone> Entry<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            written_at: Instant::now(),
        }
    }

    fn live(&self, ttl: Duration) -> Option<T> {
        (self.written_at.elapsed() < ttl).then(|| self.value.clone())
    }
}

/// In-memory [`BalanceCache`].
#[derive(Debug)]
pub struct MemoryCache {
    ttl: Duration,
    balances: RwLock<HashMap<BalanceKey, Entry<Balance>>>,
    statuses: RwLock<HashMap<(CustomerId, InstanceId), Entry<InstanceState>>>,
    grants: RwLock<HashMap<CustomerId, Entry<Vec<Grant>>>>,
}

impl MemoryCache {
    /// Create a cache whose entries live for `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            balances: RwLock::default(),
            statuses: RwLock::default(),
            grants: RwLock::default(),
        }
    }

    /// Entry lifetime.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }
}

impl BalanceCache for MemoryCache {
    fn get_balance(&self, key: &BalanceKey) -> Option<Balance> {
        self.balances.read().get(key).and_then(|e| e.live(self.ttl))
    }

    fn put_balance(&self, key: BalanceKey, balance: Balance) {
        self.balances.write().insert(key, Entry::new(balance));
    }

    fn balances_for(&self, customer: &CustomerId) -> Vec<(BalanceKey, Balance)> {
        self.balances
            .read()
            .iter()
            .filter(|(key, _)| &key.customer == customer)
            .filter_map(|(key, entry)| entry.live(self.ttl).map(|b| (key.clone(), b)))
            .collect()
    }

    fn get_status(&self, customer: &CustomerId, instance: InstanceId) -> Option<InstanceState> {
        self.statuses
            .read()
            .get(&(*customer, instance))
            .and_then(|e| e.live(self.ttl))
    }

    fn put_status(&self, customer: CustomerId, instance: InstanceId, state: InstanceState) {
        self.statuses
            .write()
            .insert((customer, instance), Entry::new(state));
    }

    fn get_grants(&self, customer: &CustomerId) -> Option<Vec<Grant>> {
        self.grants.read().get(customer).and_then(|e| e.live(self.ttl))
    }

    fn put_grants(&self, customer: CustomerId, grants: Vec<Grant>) {
        self.grants.write().insert(customer, Entry::new(grants));
    }

    fn invalidate(&self, customer: &CustomerId) {
        self.balances.write().retain(|key, _| &key.customer != customer);
        self.statuses.write().retain(|(c, _), _| c != customer);
        self.grants.write().remove(customer);
        tracing::debug!(customer_id = %customer, "cache invalidated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn balance(current: rust_decimal::Decimal) -> Balance {
        Balance {
            feature: FeatureId::new("messages").unwrap(),
            granted: dec!(100),
            purchased: dec!(0),
            usage: dec!(100) - current,
            current,
        }
    }

    fn key(customer: CustomerId) -> BalanceKey {
        BalanceKey {
            customer,
            entity: None,
            feature: FeatureId::new("messages").unwrap(),
        }
    }

    #[test]
    fn put_then_get() {
        let cache = MemoryCache::new(Duration::from_secs(60));
        let customer = CustomerId::generate();
        cache.put_balance(key(customer), balance(dec!(40)));
        assert_eq!(cache.get_balance(&key(customer)).unwrap().current, dec!(40));
        assert_eq!(cache.balances_for(&customer).len(), 1);
        assert!(cache.balances_for(&CustomerId::generate()).is_empty());
    }

    #[test]
    fn expired_entries_miss() {
        let cache = MemoryCache::new(Duration::ZERO);
        let customer = CustomerId::generate();
        cache.put_balance(key(customer), balance(dec!(40)));
        assert!(cache.get_balance(&key(customer)).is_none());
    }

    #[test]
    fn invalidate_drops_customer() {
        let cache = MemoryCache::new(Duration::from_secs(60));
        let customer = CustomerId::generate();
        let other = CustomerId::generate();
        cache.put_balance(key(customer), balance(dec!(40)));
        cache.put_balance(key(other), balance(dec!(10)));
        cache.put_grants(customer, vec![]);
        cache.put_status(customer, InstanceId::generate(), InstanceState::Active);

        cache.invalidate(&customer);
        assert!(cache.get_balance(&key(customer)).is_none());
        assert!(cache.get_grants(&customer).is_none());
        assert!(cache.get_balance(&key(other)).is_some());
    }
}
