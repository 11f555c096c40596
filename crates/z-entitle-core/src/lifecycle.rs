//! Product lifecycle.
//!
//! A plan instance is in exactly one [`InstanceState`]. Transitions are driven
//! by [`LifecycleEvent`]s coming from plan computers or processor webhooks and
//! are validated by [`transition`]. The boolean/timestamp view older clients
//! expect is derived by [`LegacyStatusView`] and never stored.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PlanFailure;
use crate::ids::{CustomerId, EntityId, GroupId};
use crate::instance::PlanInstance;

/// State of a plan instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InstanceState {
    /// Live and billed.
    Active,
    /// Waiting to start, typically a downgrade or default plan at cycle end.
    Scheduled {
        /// When it becomes active.
        starts_at: DateTime<Utc>,
    },
    /// Live until `ends_at`, then expires.
    Canceling {
        /// When cancellation was requested.
        canceled_at: DateTime<Utc>,
        /// End of the committed period.
        ends_at: DateTime<Utc>,
    },
    /// Live but the last payment failed.
    PastDue {
        /// When the payment failure was reported.
        since: DateTime<Utc>,
    },
    /// Ended.
    Expired {
        /// When it ended.
        ended_at: DateTime<Utc>,
        /// When cancellation was requested, if it was canceled.
        canceled_at: Option<DateTime<Utc>>,
    },
}

impl InstanceState {
    /// Short name for logs and errors.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Scheduled { .. } => "scheduled",
            Self::Canceling { .. } => "canceling",
            Self::PastDue { .. } => "past_due",
            Self::Expired { .. } => "expired",
        }
    }

    /// Whether the instance currently grants and bills.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(
            self,
            Self::Active | Self::Canceling { .. } | Self::PastDue { .. }
        )
    }

    /// Whether the instance is waiting to start.
    #[must_use]
    pub const fn is_scheduled(&self) -> bool {
        matches!(self, Self::Scheduled { .. })
    }

    /// Whether the instance is canceling at a future instant.
    #[must_use]
    pub const fn is_canceling(&self) -> bool {
        matches!(self, Self::Canceling { .. })
    }

    /// Whether the instance has ended.
    #[must_use]
    pub const fn is_expired(&self) -> bool {
        matches!(self, Self::Expired { .. })
    }
}

/// How a cancellation takes effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelMode {
    /// End now, refund unused time.
    Immediately,
    /// Keep access until the end of the paid cycle.
    EndOfCycle,
}

/// Something that moves an instance between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// A scheduled instance starts.
    Activate {
        /// Activation instant.
        at: DateTime<Utc>,
    },
    /// Cancellation requested.
    Cancel {
        /// Mode.
        mode: CancelMode,
        /// Request instant.
        at: DateTime<Utc>,
        /// End of the committed period (equal to `at` when immediate).
        ends_at: DateTime<Utc>,
    },
    /// A pending cancellation is withdrawn.
    Uncancel,
    /// The instance ends: replaced, deleted at the processor, or reached its end.
    Expire {
        /// End instant.
        at: DateTime<Utc>,
    },
    /// The processor reported a failed payment.
    PaymentFailed {
        /// Report instant.
        at: DateTime<Utc>,
    },
    /// The processor reported a paid invoice.
    PaymentRecovered,
    /// The past-due grace period ran out.
    GraceExhausted {
        /// Check instant.
        at: DateTime<Utc>,
        /// Configured grace period in days.
        grace_days: i64,
    },
}

impl LifecycleEvent {
    /// Short name for logs and errors.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Activate { .. } => "activate",
            Self::Cancel { .. } => "cancel",
            Self::Uncancel => "uncancel",
            Self::Expire { .. } => "expire",
            Self::PaymentFailed { .. } => "payment_failed",
            Self::PaymentRecovered => "payment_recovered",
            Self::GraceExhausted { .. } => "grace_exhausted",
        }
    }
}

/// Errors from lifecycle transitions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    /// The event is not allowed in the current state.
    #[error("cannot apply {event} to a {from} instance")]
    InvalidTransition {
        /// Current state name.
        from: &'static str,
        /// Event name.
        event: &'static str,
    },

    /// Grace exhaustion reported before the grace period elapsed.
    #[error("grace period runs until {until}")]
    GraceNotElapsed {
        /// When the grace period ends.
        until: DateTime<Utc>,
    },
}

/// Apply `event` to `state`.
///
/// Re-applying an end-of-cycle cancel to a canceling instance, or expiring an
/// expired one, returns the state unchanged.
///
/// # Errors
///
/// Returns `LifecycleError` if the transition is not allowed.
pub fn transition(
    state: &InstanceState,
    event: &LifecycleEvent,
) -> Result<InstanceState, LifecycleError> {
    use InstanceState as S;
    use LifecycleEvent as E;

    let next = match (*state, *event) {
        (S::Scheduled { .. }, E::Activate { .. }) => S::Active,

        (
            S::Active,
            E::Cancel {
                mode: CancelMode::EndOfCycle,
                at,
                ends_at,
            },
        ) => S::Canceling {
            canceled_at: at,
            ends_at,
        },
        (current @ S::Canceling { .. }, E::Cancel { mode: CancelMode::EndOfCycle, .. }) => {
            current
        }
        (
            S::Active | S::PastDue { .. } | S::Scheduled { .. },
            E::Cancel {
                mode: CancelMode::Immediately,
                at,
                ..
            },
        ) => S::Expired {
            ended_at: at,
            canceled_at: Some(at),
        },
        (
            S::Canceling { canceled_at, .. },
            E::Cancel {
                mode: CancelMode::Immediately,
                at,
                ..
            },
        ) => S::Expired {
            ended_at: at,
            canceled_at: Some(canceled_at),
        },

        (S::Canceling { .. }, E::Uncancel) => S::Active,

        (S::Canceling { canceled_at, .. }, E::Expire { at }) => S::Expired {
            ended_at: at,
            canceled_at: Some(canceled_at),
        },
        (S::Active | S::Scheduled { .. } | S::PastDue { .. }, E::Expire { at }) => S::Expired {
            ended_at: at,
            canceled_at: None,
        },
        (current @ S::Expired { .. }, E::Expire { .. }) => current,

        (S::Active, E::PaymentFailed { at }) => S::PastDue { since: at },
        (current @ S::PastDue { .. }, E::PaymentFailed { .. }) => current,
        (S::PastDue { .. }, E::PaymentRecovered) => S::Active,
        (current @ (S::Active | S::Canceling { .. }), E::PaymentRecovered) => current,

        (S::PastDue { since }, E::GraceExhausted { at, grace_days }) => {
            let until = grace_end(since, grace_days);
            if at < until {
                return Err(LifecycleError::GraceNotElapsed { until });
            }
            S::Expired {
                ended_at: at,
                canceled_at: None,
            }
        }

        (from, event) => {
            return Err(LifecycleError::InvalidTransition {
                from: from.name(),
                event: event.name(),
            })
        }
    };
    Ok(next)
}

/// When a grace period of `grace_days` that began at `since` runs out.
///
/// Negative grace counts as none. A grace reaching past the representable
/// range never runs out.
#[must_use]
pub fn grace_end(since: DateTime<Utc>, grace_days: i64) -> DateTime<Utc> {
    Duration::try_days(grace_days.max(0))
        .and_then(|grace| since.checked_add_signed(grace))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// The flat status view of an instance, derived at the API boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyStatusView {
    /// `active`, `scheduled`, `past_due` or `expired`. Canceling shows as `active`.
    pub status: String,
    /// Whether cancellation was requested.
    pub canceled: bool,
    /// When cancellation was requested.
    pub canceled_at: Option<DateTime<Utc>>,
    /// When the instance ends or ended.
    pub ended_at: Option<DateTime<Utc>>,
    /// When a scheduled instance starts.
    pub starts_at: Option<DateTime<Utc>>,
}

impl From<&InstanceState> for LegacyStatusView {
    fn from(state: &InstanceState) -> Self {
        let (status, canceled_at, ended_at, starts_at) = match *state {
            InstanceState::Active => ("active", None, None, None),
            InstanceState::Scheduled { starts_at } => ("scheduled", None, None, Some(starts_at)),
            InstanceState::Canceling {
                canceled_at,
                ends_at,
            } => ("active", Some(canceled_at), Some(ends_at), None),
            InstanceState::PastDue { .. } => ("past_due", None, None, None),
            InstanceState::Expired {
                ended_at,
                canceled_at,
            } => ("expired", canceled_at, Some(ended_at), None),
        };
        Self {
            status: status.to_string(),
            canceled: canceled_at.is_some(),
            canceled_at,
            ended_at,
            starts_at,
        }
    }
}

/// Check that at most one main instance per (customer, entity, group) is live.
///
/// # Errors
///
/// Returns `PlanFailure::DuplicateActiveInGroup` for the first crowded group.
pub fn enforce_group_exclusivity(instances: &[PlanInstance]) -> Result<(), PlanFailure> {
    let mut seen: HashMap<(CustomerId, Option<EntityId>, &GroupId), usize> = HashMap::new();
    for instance in instances
        .iter()
        .filter(|i| i.is_main() && i.state.is_live())
    {
        let count = seen
            .entry((instance.customer, instance.entity, &instance.group))
            .or_insert(0);
        *count += 1;
        if *count > 1 {
            tracing::debug!(
                customer_id = %instance.customer,
                group = %instance.group,
                "group exclusivity violated by projected state"
            );
            return Err(PlanFailure::DuplicateActiveInGroup {
                group: instance.group.clone(),
            });
        }
    }
    Ok(())
}
