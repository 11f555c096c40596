//! Partially applied work waiting for an operator.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use z_entitle_core::{BillingPlan, CustomerId, Grant, GroupId};

/// What was left half done.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RepairKind {
    /// Some processor calls of a plan landed, then one failed; nothing was stored.
    ProcessorPartial {
        /// The plan being applied.
        plan: BillingPlan,
        /// Processor ids of the calls that landed.
        completed: Vec<String>,
    },
    /// Every processor call landed but the store rejected the plan.
    StoreWrite {
        /// The plan being applied.
        plan: BillingPlan,
    },
    /// An asynchronous usage write never reached the store.
    UsageSync {
        /// The grants as the cache holds them.
        grants: Vec<Grant>,
    },
}

impl RepairKind {
    /// Short name for logs and reports.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ProcessorPartial { .. } => "processor_partial",
            Self::StoreWrite { .. } => "store_write",
            Self::UsageSync { .. } => "usage_sync",
        }
    }
}

/// One partially applied operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRepair {
    /// The customer.
    pub customer: CustomerId,
    /// Plan group the operation was serialized on, if any.
    pub group: Option<GroupId>,
    /// What is missing.
    pub kind: RepairKind,
    /// The error that stopped the operation.
    pub error: String,
    /// When it was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// Queue of pending repairs shared by the orchestrator and the reconciler.
#[derive(Debug, Default)]
pub struct RepairQueue {
    items: Mutex<Vec<PendingRepair>>,
}

impl RepairQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a repair.
    pub fn push(&self, repair: PendingRepair) {
        tracing::error!(
            customer_id = %repair.customer,
            kind = repair.kind.name(),
            error = %repair.error,
            "partial application queued for repair"
        );
        self.items.lock().push(repair);
    }

    /// Every pending repair.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PendingRepair> {
        self.items.lock().clone()
    }

    /// Pending repairs of one customer.
    #[must_use]
    pub fn for_customer(&self, customer: &CustomerId) -> Vec<PendingRepair> {
        self.items
            .lock()
            .iter()
            .filter(|r| &r.customer == customer)
            .cloned()
            .collect()
    }

    /// Drop the repairs of a customer once an operator resolved them.
    pub fn resolve(&self, customer: &CustomerId) -> usize {
        let mut items = self.items.lock();
        let before = items.len();
        items.retain(|r| &r.customer != customer);
        before - items.len()
    }

    /// Number of pending repairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}
