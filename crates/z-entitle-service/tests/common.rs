//! Common test utilities for z-entitle integration tests.

#![allow(dead_code)] // Some utilities are used by different test files

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use z_entitle_core::{
    Cadence, Catalog, CustomerId, CustomerState, ExternalSubscriptionRef, FeatureId, FeatureItem,
    GroupId, Plan, PlanId, PlanInstance, PriceTerm,
};
use z_entitle_service::{
    AppliedPlan, BillingOrchestrator, Clock, Intent, InvoiceItemRequest, LocalProcessor,
    PaymentProcessor, ProcessorError, ProcessorSubscription, ServiceConfig, SubscriptionRequest,
};
use z_entitle_store::{BalanceCache, MemoryCache, MemoryStore, Store};

// ============================================================================
// Clock
// ============================================================================

/// A clock the test moves by hand.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        *self.now.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

// ============================================================================
// Processor
// ============================================================================

/// Processor double: a [`LocalProcessor`] that records every call and fails
/// on demand.
#[derive(Default)]
pub struct FakeProcessor {
    pub inner: LocalProcessor,
    calls: Mutex<Vec<(String, String)>>,
    failures: Mutex<HashMap<String, (u32, ProcessorError)>>,
}

impl FakeProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` calls of `operation` with `error`.
    pub fn fail(&self, operation: &str, times: u32, error: ProcessorError) {
        self.failures
            .lock()
            .insert(operation.to_string(), (times, error));
    }

    /// Every call as (operation, idempotency key), in order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().clone()
    }

    /// Calls of one operation.
    pub fn calls_of(&self, operation: &str) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|(op, _)| op == operation)
            .map(|(_, key)| key.clone())
            .collect()
    }

    pub fn invoice_items(&self) -> Vec<(String, InvoiceItemRequest)> {
        self.inner.invoice_items()
    }

    pub fn subscription(&self, external_ref: &ExternalSubscriptionRef) -> Option<ProcessorSubscription> {
        self.inner.subscription(external_ref)
    }

    fn record(&self, operation: &str, key: &str) -> Result<(), ProcessorError> {
        self.calls
            .lock()
            .push((operation.to_string(), key.to_string()));
        let mut failures = self.failures.lock();
        if let Some((remaining, error)) = failures.get_mut(operation) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(error.clone());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentProcessor for FakeProcessor {
    async fn create_or_update_subscription(
        &self,
        request: SubscriptionRequest,
    ) -> Result<ExternalSubscriptionRef, ProcessorError> {
        let operation = if request.existing.is_some() {
            "update_subscription"
        } else {
            "create_subscription"
        };
        self.record(operation, &request.idempotency_key)?;
        self.inner.create_or_update_subscription(request).await
    }

    async fn create_invoice_item(
        &self,
        request: InvoiceItemRequest,
    ) -> Result<String, ProcessorError> {
        self.record("create_invoice_item", &request.idempotency_key)?;
        self.inner.create_invoice_item(request).await
    }

    async fn cancel_subscription(
        &self,
        external_ref: &ExternalSubscriptionRef,
        idempotency_key: &str,
    ) -> Result<(), ProcessorError> {
        self.record("cancel_subscription", idempotency_key)?;
        self.inner
            .cancel_subscription(external_ref, idempotency_key)
            .await
    }

    async fn list_subscriptions(
        &self,
        customer: &CustomerId,
    ) -> Result<Vec<ProcessorSubscription>, ProcessorError> {
        self.record("list_subscriptions", &customer.to_string())?;
        self.inner.list_subscriptions(customer).await
    }
}

// ============================================================================
// Catalog
// ============================================================================

pub fn t(month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, month, day, 0, 0, 0).unwrap()
}

pub fn messages() -> FeatureId {
    FeatureId::new("messages").unwrap()
}

pub fn main_group() -> GroupId {
    GroupId::new("main").unwrap()
}

pub fn plan_id(id: &str) -> PlanId {
    PlanId::new(id).unwrap()
}

fn monthly_plan(id: &str, price: Decimal, included: Decimal) -> Plan {
    let prices = if price.is_zero() {
        vec![]
    } else {
        vec![PriceTerm::fixed(id, price, Cadence::monthly())]
    };
    Plan {
        id: plan_id(id),
        version: 1,
        group: main_group(),
        name: id.to_string(),
        is_add_on: false,
        is_default: false,
        currency: "usd".into(),
        prices,
        features: vec![FeatureItem::new(
            messages(),
            included,
            Some(Cadence::monthly()),
        )],
    }
}

/// Default plan of the main group: 100 messages a month.
pub fn free() -> Plan {
    Plan {
        is_default: true,
        ..monthly_plan("free", Decimal::ZERO, dec!(100))
    }
}

/// $20 a month, 500 messages.
pub fn pro() -> Plan {
    monthly_plan("pro", dec!(20), dec!(500))
}

/// $50 a month, 2000 messages.
pub fn premium() -> Plan {
    monthly_plan("premium", dec!(50), dec!(2000))
}

pub fn catalog() -> Catalog {
    Catalog::new(vec![free(), pro(), premium()])
}

pub fn attach(plan: &str) -> Intent {
    Intent::Attach {
        plan: plan_id(plan),
        version: None,
        entity: None,
        quantities: vec![],
        anchor: None,
    }
}

// ============================================================================
// Harness
// ============================================================================

/// Fast processor retries.
pub fn test_config() -> ServiceConfig {
    ServiceConfig {
        processor_max_retries: 3,
        processor_initial_backoff_ms: 1,
        processor_max_backoff_ms: 2,
        ..ServiceConfig::default()
    }
}

/// Test harness containing everything needed for integration tests.
pub struct TestHarness {
    /// The orchestrator under test.
    pub orchestrator: Arc<BillingOrchestrator>,
    /// The store behind it, for direct reads.
    pub store: Arc<MemoryStore>,
    /// The balance cache behind it.
    pub cache: Arc<MemoryCache>,
    /// The processor double.
    pub processor: Arc<FakeProcessor>,
    /// The clock, starting at 2025-04-10.
    pub clock: Arc<ManualClock>,
    /// A registered test customer.
    pub customer: CustomerId,
}

impl TestHarness {
    /// Create a new test harness with an empty store and the test catalog.
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    /// Create a test harness on an explicit configuration.
    pub fn with_config(config: ServiceConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCache::new(Duration::from_secs(60)));
        let processor = Arc::new(FakeProcessor::new());
        let clock = Arc::new(ManualClock::new(t(4, 10)));

        let orchestrator = Arc::new(BillingOrchestrator::with_clock(
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::clone(&cache) as Arc<dyn BalanceCache>,
            Arc::clone(&processor) as Arc<dyn PaymentProcessor>,
            catalog(),
            config,
            Arc::clone(&clock) as Arc<dyn Clock>,
        ));

        Self {
            orchestrator,
            store,
            cache,
            processor,
            clock,
            customer: CustomerId::generate(),
        }
    }

    /// Register the test customer on the free plan.
    pub async fn on_free(&self) -> PlanInstance {
        self.orchestrator
            .register_customer(self.customer, vec![])
            .await
            .expect("Failed to register customer");
        self.apply(attach("free")).await;
        self.live_main()
    }

    /// Register the test customer and upgrade it to pro.
    pub async fn on_pro(&self) -> (PlanInstance, AppliedPlan) {
        self.on_free().await;
        let applied = self.apply(attach("pro")).await;
        (self.live_main(), applied)
    }

    /// Apply an intent on the main group, panicking on failure.
    pub async fn apply(&self, intent: Intent) -> AppliedPlan {
        self.orchestrator
            .apply(self.customer, &main_group(), intent)
            .await
            .expect("Failed to apply intent")
    }

    /// Stored state of the test customer, read without waiting for usage writes.
    pub fn stored(&self) -> CustomerState {
        self.store
            .get_customer(&self.customer)
            .expect("Failed to read store")
            .expect("Customer not stored")
    }

    /// The live main instance of the test customer.
    pub fn live_main(&self) -> PlanInstance {
        self.stored()
            .live_main(None, &main_group())
            .cloned()
            .expect("No live main instance")
    }

    /// The stored instance of `plan`, if any.
    pub fn instance_of(&self, plan: &str) -> Option<PlanInstance> {
        self.stored()
            .instances
            .into_iter()
            .find(|i| i.plan.as_str() == plan)
    }

    /// Stored usage of messages on live grants.
    pub fn stored_usage(&self) -> Decimal {
        self.stored()
            .live_grants()
            .iter()
            .filter(|g| g.feature() == &messages())
            .map(z_entitle_core::Grant::usage)
            .sum()
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
