//! Error types for z-entitle.

use crate::calendar::CalendarError;
use crate::ids::{GrantId, GroupId, IdError, InstanceId, PlanId};
use crate::lifecycle::LifecycleError;
use crate::pricing::PricingError;

/// Result type for z-entitle operations.
pub type Result<T> = std::result::Result<T, EntitleError>;

/// Errors that can occur in z-entitle operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EntitleError {
    /// Bad intent parameters; rejected with no state change.
    #[error("validation error: {0}")]
    Validation(String),

    /// A plan computer could not satisfy a precondition.
    #[error("precondition failed: {0}")]
    Precondition(#[from] PlanFailure),

    /// The ledger produced an impossible state. Bug-class; the operation is aborted.
    #[error("invariant violation on grant {grant_id}: {detail}")]
    InvariantViolation {
        /// The grant that would have been left in an impossible state.
        grant_id: GrantId,
        /// What went wrong.
        detail: String,
    },

    /// A lifecycle transition was not allowed.
    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    /// Calendar arithmetic failed.
    #[error("calendar error: {0}")]
    Calendar(#[from] CalendarError),

    /// Tier math failed.
    #[error("pricing error: {0}")]
    Pricing(#[from] PricingError),

    /// Invalid identifier.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),
}

/// A precondition a plan computer could not satisfy.
///
/// Returned instead of a partially built billing plan.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanFailure {
    /// Cancelling a main plan needs a default plan in its group.
    #[error("no default plan available in group {group}")]
    NoDefaultPlan {
        /// The plan group.
        group: GroupId,
    },

    /// The projected state would hold two main plans in one group.
    #[error("more than one active main plan in group {group}")]
    DuplicateActiveInGroup {
        /// The plan group.
        group: GroupId,
    },

    /// An overage-enabled feature has no usage price to bill it.
    #[error("feature {feature} allows overage but plan {plan} has no usage price for it")]
    MissingPriceTerm {
        /// The plan.
        plan: PlanId,
        /// The feature without a price.
        feature: String,
    },

    /// Plans in one customer must share a currency.
    #[error("currency mismatch: expected {expected}, found {found}")]
    CurrencyMismatch {
        /// The customer's existing currency.
        expected: String,
        /// The currency of the requested plan.
        found: String,
    },

    /// A downgrade is already scheduled and the intent would stack another.
    #[error("a switch is already scheduled in group {group}")]
    SwitchAlreadyScheduled {
        /// The plan group.
        group: GroupId,
    },

    /// The referenced plan instance is not part of the customer's state.
    #[error("plan instance not found: {instance}")]
    InstanceNotFound {
        /// The missing instance.
        instance: InstanceId,
    },

    /// The instance cannot be canceled in its current state.
    #[error("plan instance {instance} cannot be canceled: {reason}")]
    NotCancelable {
        /// The instance.
        instance: InstanceId,
        /// Why not.
        reason: String,
    },

    /// Uncancel was requested for an instance that is not canceling.
    #[error("plan instance {instance} is not canceling")]
    NotCanceling {
        /// The instance.
        instance: InstanceId,
    },

    /// The target plan is the one already attached.
    #[error("plan {plan} is already attached")]
    SamePlan {
        /// The plan.
        plan: PlanId,
    },

    /// The instance is not on the plan version a migration expects.
    #[error("plan instance {instance} is not on {plan} v{version}")]
    VersionMismatch {
        /// The instance.
        instance: InstanceId,
        /// The expected plan.
        plan: PlanId,
        /// The expected version.
        version: u32,
    },
}
