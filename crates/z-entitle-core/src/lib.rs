//! Core billing computation for z-entitle.
//!
//! Everything in this crate is pure: given the persisted state of a customer,
//! a plan catalog, an intent and an instant, it computes what should change.
//! Persistence and the payment processor live in `z-entitle-store` and
//! `z-entitle-service`.
//!
//! - **Identifiers**: `CustomerId`, `EntityId`, `InstanceId`, `GrantId`, `PlanId`, `FeatureId`
//! - **Calendar**: `Cadence`, `CycleCalendar`, interval arithmetic and proration
//! - **Pricing**: `PriceTerm`, graduated and volume tiers
//! - **Catalog**: `Plan`, `FeatureItem`
//! - **Grants and ledger**: `Grant`, ordered deduction, balance correction, resets
//! - **Lifecycle**: `InstanceState`, `transition`, group exclusivity
//! - **Plans of change**: `BillingPlan` and the plan computers in [`compute`]
//!
//! # Quantities and money
//!
//! Feature quantities and money are `Decimal`. Line-item amounts are rounded
//! to [`pricing::MONEY_DECIMAL_PLACES`] when they are created; tier math in
//! between stays exact.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod billing_plan;
pub mod calendar;
pub mod compute;
pub mod error;
pub mod grant;
pub mod ids;
pub mod instance;
pub mod ledger;
pub mod lifecycle;
pub mod plan;
pub mod pricing;

pub use billing_plan::{
    BillingAnchor, BillingPlan, InstancePatch, InstanceUpdate, LineItem, Period, SubscriptionLink,
};
pub use calendar::{Cadence, CalendarError, CycleCalendar, Interval};
pub use compute::{
    ActivateContext, AttachContext, AttachPlanComputer, CancelContext, CancelPlanComputer,
    Catalog, CustomerMigration, CustomerState, LifecycleSweep, MigrateContext, MigratePlanComputer,
    SweepContext, SwitchContext, SwitchPlanComputer, SwitchTiming, UncancelContext, UpdateContext,
    UpdatePlanComputer,
};
pub use error::{EntitleError, PlanFailure, Result};
pub use grant::{Breakdown, Grant, GrantSource, ResetSchedule};
pub use ids::{
    CustomerId, EntityId, ExternalSubscriptionRef, FeatureId, GrantId, GroupId, IdError,
    InstanceId, LineItemId, PlanId,
};
pub use instance::PlanInstance;
pub use ledger::{Balance, BalanceScope, GrantChange, LedgerOutcome, Redistribution, ResetOutcome};
pub use lifecycle::{
    CancelMode, InstanceState, LegacyStatusView, LifecycleError, LifecycleEvent,
};
pub use plan::{FeatureItem, FeatureQuantity, Plan, RolloverPolicy};
pub use pricing::{PriceKind, PriceTerm, PricingError, TierBehavior, UsageModel, UsageTier};
