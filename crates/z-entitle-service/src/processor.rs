//! Payment processor seam.
//!
//! The orchestrator translates billing plans into calls on a
//! [`PaymentProcessor`]. Every mutating call carries an idempotency key so a
//! retried call is applied at most once on the processor side, and every call
//! goes through [`with_retry`].

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use z_entitle_core::{
    BillingAnchor, CustomerId, ExternalSubscriptionRef, InstanceId, Period, PlanId, PriceTerm,
};

use crate::config::ServiceConfig;

/// Error type for processor operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessorError {
    /// Transport failure or a 5xx-style response. Safe to retry.
    #[error("processor unavailable: {0}")]
    Unavailable(String),

    /// The processor rejected the request.
    #[error("processor API error: {code} - {message}")]
    Api {
        /// Error code.
        code: String,
        /// Error message.
        message: String,
    },

    /// The referenced subscription does not exist at the processor.
    #[error("unknown subscription: {0}")]
    UnknownSubscription(ExternalSubscriptionRef),
}

impl ProcessorError {
    /// Whether repeating the same call can succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// How the processor treats mid-cycle changes.
///
/// Proration is computed by the plan computers and sent as explicit invoice
/// items, so the orchestrator asks for `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProrationBehavior {
    /// Never prorate on the processor side.
    #[default]
    None,
    /// Let the processor create its own proration items.
    CreateProrations,
}

/// One plan instance billed by a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionItem {
    /// The instance.
    pub instance: InstanceId,
    /// Its plan.
    pub plan: PlanId,
    /// Its plan version.
    pub version: u32,
    /// Its price terms.
    pub prices: Vec<PriceTerm>,
}

/// Create a subscription, or replace the items of an existing one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    /// The customer.
    pub customer: CustomerId,
    /// Subscription to update; `None` creates one.
    pub existing: Option<ExternalSubscriptionRef>,
    /// Billing currency.
    pub currency: String,
    /// Every instance the subscription bills after the call.
    pub items: Vec<SubscriptionItem>,
    /// Processor-side proration.
    pub proration: ProrationBehavior,
    /// Billing-cycle anchor.
    pub anchor: BillingAnchor,
    /// Deduplication key.
    pub idempotency_key: String,
}

/// A one-off charge or credit on the customer's next invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceItemRequest {
    /// The customer.
    pub customer: CustomerId,
    /// Billing currency.
    pub currency: String,
    /// Signed amount in major units.
    pub amount: Decimal,
    /// Invoice line text.
    pub description: String,
    /// Service period covered.
    pub period: Period,
    /// Deduplication key.
    pub idempotency_key: String,
}

/// Subscription status as the processor reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Billing.
    Active,
    /// Canceled.
    Canceled,
}

/// A subscription held by the processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorSubscription {
    /// Processor reference.
    pub external_ref: ExternalSubscriptionRef,
    /// The customer.
    pub customer: CustomerId,
    /// Status.
    pub status: SubscriptionStatus,
    /// Instances billed by it.
    pub instances: Vec<InstanceId>,
}

/// External payment processor client.
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    /// Create a subscription or replace the items of `request.existing`.
    ///
    /// # Errors
    ///
    /// Returns `ProcessorError` if the processor call fails.
    async fn create_or_update_subscription(
        &self,
        request: SubscriptionRequest,
    ) -> Result<ExternalSubscriptionRef, ProcessorError>;

    /// Add an invoice item; returns the processor's item id.
    ///
    /// # Errors
    ///
    /// Returns `ProcessorError` if the processor call fails.
    async fn create_invoice_item(&self, request: InvoiceItemRequest)
        -> Result<String, ProcessorError>;

    /// Cancel a subscription. Canceling a canceled subscription succeeds.
    ///
    /// # Errors
    ///
    /// Returns `ProcessorError` if the processor call fails.
    async fn cancel_subscription(
        &self,
        external_ref: &ExternalSubscriptionRef,
        idempotency_key: &str,
    ) -> Result<(), ProcessorError>;

    /// Active subscriptions of a customer.
    ///
    /// # Errors
    ///
    /// Returns `ProcessorError` if the processor call fails.
    async fn list_subscriptions(
        &self,
        customer: &CustomerId,
    ) -> Result<Vec<ProcessorSubscription>, ProcessorError>;
}

// ============================================================================
// Retry
// ============================================================================

/// Bounded exponential backoff for processor calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts before giving up.
    pub max_retries: u32,
    /// First delay in milliseconds.
    pub initial_backoff_ms: u64,
    /// Delay cap in milliseconds.
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    /// Policy from the service configuration.
    #[must_use]
    pub const fn from_config(config: &ServiceConfig) -> Self {
        Self {
            max_retries: config.processor_max_retries,
            initial_backoff_ms: config.processor_initial_backoff_ms,
            max_backoff_ms: config.processor_max_backoff_ms,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ServiceConfig::default())
    }
}

/// Run `call` until it succeeds, fails permanently, or runs out of attempts.
///
/// The same idempotency key must be baked into every attempt.
///
/// # Errors
///
/// Returns the last error once attempts are exhausted, or the first
/// non-retryable error.
pub async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    operation: &str,
    idempotency_key: &str,
    mut call: F,
) -> Result<T, ProcessorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProcessorError>>,
{
    let mut attempt = 0;
    let mut backoff_ms = policy.initial_backoff_ms;

    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;

                if !e.is_retryable() || attempt >= policy.max_retries {
                    tracing::warn!(
                        operation = %operation,
                        idempotency_key = %idempotency_key,
                        attempt = %attempt,
                        error = %e,
                        "Processor call failed"
                    );
                    return Err(e);
                }

                tracing::debug!(
                    operation = %operation,
                    idempotency_key = %idempotency_key,
                    attempt = %attempt,
                    backoff_ms = %backoff_ms,
                    error = %e,
                    "Processor call failed, retrying"
                );

                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;

                backoff_ms = (backoff_ms * 2).min(policy.max_backoff_ms);
            }
        }
    }
}

// ============================================================================
// Local processor
// ============================================================================

#[derive(Debug, Default)]
struct LocalState {
    sequence: u64,
    seen: HashMap<String, String>,
    subscriptions: Vec<ProcessorSubscription>,
    invoice_items: Vec<(String, InvoiceItemRequest)>,
}

impl LocalState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.sequence += 1;
        format!("{prefix}_local_{}", self.sequence)
    }
}

/// Processor that keeps everything in memory.
///
/// Used when no processor is configured and as the base of test doubles.
/// Honors idempotency keys like a real processor: a repeated key returns the
/// first result without a second effect.
#[derive(Debug, Default)]
pub struct LocalProcessor {
    state: Mutex<LocalState>,
}

impl LocalProcessor {
    /// Create an empty processor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every invoice item created, with its id.
    #[must_use]
    pub fn invoice_items(&self) -> Vec<(String, InvoiceItemRequest)> {
        self.state.lock().invoice_items.clone()
    }

    /// One subscription, in any status.
    #[must_use]
    pub fn subscription(&self, external_ref: &ExternalSubscriptionRef) -> Option<ProcessorSubscription> {
        self.state
            .lock()
            .subscriptions
            .iter()
            .find(|s| &s.external_ref == external_ref)
            .cloned()
    }

    /// Register a subscription created outside the orchestrator.
    pub fn seed_subscription(&self, subscription: ProcessorSubscription) {
        self.state.lock().subscriptions.push(subscription);
    }
}

#[async_trait]
impl PaymentProcessor for LocalProcessor {
    async fn create_or_update_subscription(
        &self,
        request: SubscriptionRequest,
    ) -> Result<ExternalSubscriptionRef, ProcessorError> {
        let mut state = self.state.lock();
        if let Some(id) = state.seen.get(&request.idempotency_key) {
            return ExternalSubscriptionRef::new(id.clone())
                .map_err(|e| ProcessorError::Unavailable(e.to_string()));
        }
        let instances = request.items.iter().map(|item| item.instance).collect();
        let external_ref = match request.existing {
            Some(existing) => {
                let subscription = state
                    .subscriptions
                    .iter_mut()
                    .find(|s| s.external_ref == existing)
                    .ok_or_else(|| ProcessorError::UnknownSubscription(existing.clone()))?;
                subscription.instances = instances;
                subscription.status = SubscriptionStatus::Active;
                existing
            }
            None => {
                let id = state.next_id("sub");
                let external_ref = ExternalSubscriptionRef::new(id)
                    .map_err(|e| ProcessorError::Unavailable(e.to_string()))?;
                state.subscriptions.push(ProcessorSubscription {
                    external_ref: external_ref.clone(),
                    customer: request.customer,
                    status: SubscriptionStatus::Active,
                    instances,
                });
                external_ref
            }
        };
        state
            .seen
            .insert(request.idempotency_key, external_ref.as_str().to_string());
        Ok(external_ref)
    }

    async fn create_invoice_item(
        &self,
        request: InvoiceItemRequest,
    ) -> Result<String, ProcessorError> {
        let mut state = self.state.lock();
        if let Some(id) = state.seen.get(&request.idempotency_key) {
            return Ok(id.clone());
        }
        let id = state.next_id("ii");
        state.seen.insert(request.idempotency_key.clone(), id.clone());
        state.invoice_items.push((id.clone(), request));
        Ok(id)
    }

    async fn cancel_subscription(
        &self,
        external_ref: &ExternalSubscriptionRef,
        _idempotency_key: &str,
    ) -> Result<(), ProcessorError> {
        let mut state = self.state.lock();
        let subscription = state
            .subscriptions
            .iter_mut()
            .find(|s| &s.external_ref == external_ref)
            .ok_or_else(|| ProcessorError::UnknownSubscription(external_ref.clone()))?;
        subscription.status = SubscriptionStatus::Canceled;
        Ok(())
    }

    async fn list_subscriptions(
        &self,
        customer: &CustomerId,
    ) -> Result<Vec<ProcessorSubscription>, ProcessorError> {
        Ok(self
            .state
            .lock()
            .subscriptions
            .iter()
            .filter(|s| &s.customer == customer && s.status == SubscriptionStatus::Active)
            .cloned()
            .collect())
    }
}
