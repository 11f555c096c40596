//! Service error types.

use z_entitle_core::{EntitleError, GroupId, InstanceId, PlanFailure, PlanId};
use z_entitle_store::StoreError;

use crate::processor::ProcessorError;

/// Result type for orchestration operations.
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Errors surfaced by the orchestration layer.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Computation or validation failure from the core.
    #[error(transparent)]
    Entitle(#[from] EntitleError),

    /// Durable store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Processor failure after retries. Effects already applied are queued
    /// for reconciliation.
    #[error("processor error: {0}")]
    Processor(#[from] ProcessorError),

    /// The customer has no stored state.
    #[error("customer not found: {0}")]
    CustomerNotFound(String),

    /// The plan is not in the catalog.
    #[error("unknown plan {plan} version {version:?}")]
    UnknownPlan {
        /// The plan.
        plan: PlanId,
        /// The version, `None` for latest.
        version: Option<u32>,
    },

    /// The intent names an instance outside the locked group.
    #[error("instance {instance} is not in group {group}")]
    WrongGroup {
        /// The instance.
        instance: InstanceId,
        /// The group the request was serialized on.
        group: GroupId,
    },

    /// A processor webhook could not be read.
    #[error("invalid webhook: {0}")]
    InvalidWebhook(String),
}

impl ServiceError {
    /// The typed precondition failure, if this error carries one.
    #[must_use]
    pub fn plan_failure(&self) -> Option<&PlanFailure> {
        match self {
            Self::Entitle(EntitleError::Precondition(failure))
            | Self::Store(StoreError::PlanRejected(EntitleError::Precondition(failure))) => {
                Some(failure)
            }
            _ => None,
        }
    }
}

impl From<PlanFailure> for ServiceError {
    fn from(failure: PlanFailure) -> Self {
        Self::Entitle(EntitleError::Precondition(failure))
    }
}
