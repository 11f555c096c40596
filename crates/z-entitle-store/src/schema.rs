//! Database schema definitions and column families.
//!
//! This module defines the column families used in `RocksDB` storage.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Customer records (entities), keyed by `customer_id`.
    pub const CUSTOMERS: &str = "customers";

    /// Plan instances with their grants, keyed by `customer_id || instance_id`.
    pub const INSTANCES: &str = "instances";

    /// Instance ↔ processor-subscription join, keyed by
    /// `customer_id || instance_id || external_ref`.
    pub const LINKS: &str = "links";

    /// Index: links by processor subscription, keyed by
    /// `external_ref || 0x00 || customer_id || instance_id`.
    pub const LINKS_BY_REF: &str = "links_by_ref";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![cf::CUSTOMERS, cf::INSTANCES, cf::LINKS, cf::LINKS_BY_REF]
}
