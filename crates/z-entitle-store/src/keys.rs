//! Key encoding utilities for `RocksDB`.
//!
//! Every per-customer key starts with the 16 customer bytes so a prefix scan
//! lists one customer's records.

use z_entitle_core::{CustomerId, ExternalSubscriptionRef, InstanceId};

/// Create a customer key.
#[must_use]
pub fn customer_key(customer: &CustomerId) -> Vec<u8> {
    customer.as_bytes().to_vec()
}

/// Prefix of all per-customer records.
#[must_use]
pub fn customer_prefix(customer: &CustomerId) -> Vec<u8> {
    customer_key(customer)
}

/// Create an instance key.
///
/// Format: `customer_id (16 bytes) || instance_id (16 bytes)`
#[must_use]
pub fn instance_key(customer: &CustomerId, instance: InstanceId) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(customer.as_bytes());
    key.extend_from_slice(instance.as_bytes());
    key
}

/// Create a link key.
///
/// Format: `customer_id (16 bytes) || instance_id (16 bytes) || external_ref`
#[must_use]
pub fn link_key(
    customer: &CustomerId,
    instance: InstanceId,
    external_ref: &ExternalSubscriptionRef,
) -> Vec<u8> {
    let mut key = instance_key(customer, instance);
    key.extend_from_slice(external_ref.as_str().as_bytes());
    key
}

/// Prefix of every index entry for one processor subscription.
///
/// The separator keeps `sub_1` from matching `sub_10`.
#[must_use]
pub fn ref_prefix(external_ref: &ExternalSubscriptionRef) -> Vec<u8> {
    let mut key = external_ref.as_str().as_bytes().to_vec();
    key.push(0);
    key
}

/// Create a links-by-ref index key.
#[must_use]
pub fn ref_index_key(
    external_ref: &ExternalSubscriptionRef,
    customer: &CustomerId,
    instance: InstanceId,
) -> Vec<u8> {
    let mut key = ref_prefix(external_ref);
    key.extend_from_slice(customer.as_bytes());
    key.extend_from_slice(instance.as_bytes());
    key
}
