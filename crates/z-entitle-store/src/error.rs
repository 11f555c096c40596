//! Error types for z-entitle storage.

use z_entitle_core::{EntitleError, GrantId};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Record not found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of record.
        entity: &'static str,
        /// Its identifier.
        id: String,
    },

    /// A compare-and-swap saw a different grant version than expected.
    #[error("version conflict on grant {grant}: expected {expected}, found {found}")]
    VersionConflict {
        /// The grant.
        grant: GrantId,
        /// Version the writer read.
        expected: u64,
        /// Version in the store.
        found: u64,
    },

    /// A billing plan does not apply to the stored state.
    #[error("billing plan rejected: {0}")]
    PlanRejected(#[from] EntitleError),
}

impl StoreError {
    /// A conflict where the store is behind the writer, so waiting may resolve it.
    #[must_use]
    pub const fn is_store_behind(&self) -> bool {
        matches!(self, Self::VersionConflict { expected, found, .. } if *found < *expected)
    }
}
