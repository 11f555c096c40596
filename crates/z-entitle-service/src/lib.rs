//! Z-Entitle orchestration service.
//!
//! This crate applies the billing plans computed by `z-entitle-core` to the
//! durable store, the balance cache and the payment processor:
//!
//! - Plan application per (customer, plan group), with retried and
//!   idempotent processor calls
//! - Usage tracking, acknowledged from the cache and written to the store
//!   in the background
//! - Processor webhooks mapped to lifecycle events
//! - The consistency reconciler and its repair queue
//!
//! # Partial failures
//!
//! A plan whose processor calls partly landed, or whose store write failed
//! after the processor accepted it, is recorded in the [`RepairQueue`] and
//! reported by the [`ConsistencyReconciler`] until an operator resolves it.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod processor;
pub mod reconciler;
pub mod repair;
pub mod usage;
pub mod webhooks;

pub use config::ServiceConfig;
pub use error::{Result, ServiceError};
pub use orchestrator::{
    AppliedPlan, BillingOrchestrator, Clock, Intent, MigrationReport, SystemClock,
};
pub use processor::{
    with_retry, InvoiceItemRequest, LocalProcessor, PaymentProcessor, ProcessorError,
    ProcessorSubscription, ProrationBehavior, RetryPolicy, SubscriptionItem, SubscriptionRequest,
    SubscriptionStatus,
};
pub use reconciler::{ConsistencyReconciler, Finding, ReconcileReport, ReconcileRule, Severity};
pub use repair::{PendingRepair, RepairKind, RepairQueue};
pub use usage::UsageReceipt;
pub use webhooks::{ProcessorEvent, WebhookOutcome, WebhookPayload};
