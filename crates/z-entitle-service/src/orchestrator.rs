//! Plan application.
//!
//! The orchestrator is the only writer of customer state. For every intent it
//! takes the (customer, group) lock, loads the customer from the store,
//! runs the matching plan computer and applies the resulting plan: processor
//! calls first, each retried under its own idempotency key, then one atomic
//! store write, then the cache. Anything that landed before a failure is
//! queued as a [`PendingRepair`].

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;

use z_entitle_core::{
    ActivateContext, AttachContext, AttachPlanComputer, BillingPlan, CancelContext, CancelMode,
    CancelPlanComputer, Catalog, CustomerId, CustomerMigration, CustomerState, EntitleError,
    EntityId, ExternalSubscriptionRef, FeatureQuantity, GroupId, InstanceId, LegacyStatusView,
    LifecycleSweep, MigrateContext, MigratePlanComputer, Plan, PlanId, PlanInstance,
    SubscriptionLink, SweepContext, SwitchContext, SwitchPlanComputer, SwitchTiming,
    UncancelContext, UpdateContext, UpdatePlanComputer,
};
use z_entitle_store::{BalanceCache, Store};

use crate::config::ServiceConfig;
use crate::error::{Result, ServiceError};
use crate::processor::{
    with_retry, InvoiceItemRequest, PaymentProcessor, ProcessorError, ProrationBehavior,
    RetryPolicy, SubscriptionItem, SubscriptionRequest,
};
use crate::repair::{PendingRepair, RepairKind, RepairQueue};

// ============================================================================
// Clock
// ============================================================================

/// Source of the current instant.
pub trait Clock: Send + Sync {
    /// Now.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// ============================================================================
// Keyed locks
// ============================================================================

type LockMap<K> = Arc<Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>>;

/// One async mutex per key, created on first use and dropped with its last guard.
pub(crate) struct KeyedLocks<K> {
    locks: LockMap<K>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub(crate) fn new() -> Self {
        Self {
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Wait for the lock of `key`.
    pub(crate) async fn lock(&self, key: K) -> KeyedGuard<K> {
        let lock = {
            let mut locks = self.locks.lock();
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        let guard = lock.lock_owned().await;
        KeyedGuard {
            guard: Some(guard),
            key,
            locks: Arc::clone(&self.locks),
        }
    }

    /// Keys currently held or waited on.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

/// The held lock of one key.
pub(crate) struct KeyedGuard<K: Eq + Hash> {
    guard: Option<OwnedMutexGuard<()>>,
    key: K,
    locks: LockMap<K>,
}

impl<K: Eq + Hash> Drop for KeyedGuard<K> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.lock();
        // Only the map still refers to the mutex: nobody holds or awaits it.
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

/// Every group lock of a customer, then its customer lock.
pub(crate) struct CustomerGuards {
    _customer: KeyedGuard<CustomerId>,
    _groups: Vec<KeyedGuard<(CustomerId, GroupId)>>,
}

// ============================================================================
// Intents
// ============================================================================

/// A requested change to one plan group of a customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "intent", rename_all = "snake_case")]
pub enum Intent {
    /// Attach a plan; switches when the group already has a main plan.
    Attach {
        /// The plan.
        plan: PlanId,
        /// Exact version, latest when `None`.
        version: Option<u32>,
        /// Entity scope, customer-level when `None`.
        entity: Option<EntityId>,
        /// Prepaid quantities.
        quantities: Vec<FeatureQuantity>,
        /// Requested billing anchor.
        anchor: Option<DateTime<Utc>>,
    },
    /// Cancel an instance.
    Cancel {
        /// The instance.
        instance: InstanceId,
        /// Mode.
        mode: CancelMode,
        /// Fail with `NoDefaultPlan` instead of leaving the group empty.
        require_default: bool,
    },
    /// Withdraw a pending cancellation.
    Uncancel {
        /// The instance.
        instance: InstanceId,
    },
    /// Move an instance to other terms of its own plan, or change quantities.
    Update {
        /// The instance.
        instance: InstanceId,
        /// Target version of the instance's plan.
        version: Option<u32>,
        /// New prepaid quantities.
        quantities: Option<Vec<FeatureQuantity>>,
        /// Cancel in the same request.
        cancel: Option<CancelMode>,
    },
    /// Upgrade or downgrade a main instance.
    Switch {
        /// The current instance.
        instance: InstanceId,
        /// Target plan, latest version.
        plan: PlanId,
        /// Prepaid quantities on the target.
        quantities: Vec<FeatureQuantity>,
        /// Forced timing, decided by commitment when `None`.
        timing: Option<SwitchTiming>,
    },
    /// Start a scheduled instance now.
    ActivateScheduled {
        /// The scheduled instance.
        instance: InstanceId,
    },
}

impl Intent {
    /// Short name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Attach { .. } => "attach",
            Self::Cancel { .. } => "cancel",
            Self::Uncancel { .. } => "uncancel",
            Self::Update { .. } => "update",
            Self::Switch { .. } => "switch",
            Self::ActivateScheduled { .. } => "activate_scheduled",
        }
    }
}

/// What one plan application did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedPlan {
    /// The plan as written, including links to subscriptions created for it.
    pub plan: BillingPlan,
    /// Processor ids of the invoice items created.
    pub invoice_items: Vec<String>,
    /// Subscriptions created or updated.
    pub subscriptions: Vec<ExternalSubscriptionRef>,
    /// Subscriptions canceled.
    pub canceled_subscriptions: Vec<ExternalSubscriptionRef>,
}

impl AppliedPlan {
    fn new(plan: BillingPlan) -> Self {
        Self {
            plan,
            invoice_items: Vec::new(),
            subscriptions: Vec::new(),
            canceled_subscriptions: Vec::new(),
        }
    }

    fn has_effects(&self) -> bool {
        !self.invoice_items.is_empty()
            || !self.subscriptions.is_empty()
            || !self.canceled_subscriptions.is_empty()
    }

    fn completed(&self) -> Vec<String> {
        self.invoice_items
            .iter()
            .cloned()
            .chain(self.subscriptions.iter().map(ToString::to_string))
            .chain(self.canceled_subscriptions.iter().map(ToString::to_string))
            .collect()
    }
}

/// Outcome of a catalog-wide migration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// Customers whose instances moved.
    pub migrated: Vec<CustomerId>,
    /// Customers that failed, with the error.
    pub failed: Vec<(CustomerId, String)>,
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Applies billing plans against the store, the cache and the processor.
pub struct BillingOrchestrator {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) cache: Arc<dyn BalanceCache>,
    pub(crate) processor: Arc<dyn PaymentProcessor>,
    pub(crate) catalog: RwLock<Catalog>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: ServiceConfig,
    pub(crate) retry: RetryPolicy,
    group_locks: KeyedLocks<(CustomerId, GroupId)>,
    pub(crate) customer_locks: KeyedLocks<CustomerId>,
    pub(crate) pending_syncs: Mutex<HashMap<CustomerId, Vec<JoinHandle<()>>>>,
    pub(crate) repairs: Arc<RepairQueue>,
}

impl BillingOrchestrator {
    /// Create an orchestrator on the wall clock.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        cache: Arc<dyn BalanceCache>,
        processor: Arc<dyn PaymentProcessor>,
        catalog: Catalog,
        config: ServiceConfig,
    ) -> Self {
        Self::with_clock(store, cache, processor, catalog, config, Arc::new(SystemClock))
    }

    /// Create an orchestrator on an explicit clock.
    #[must_use]
    pub fn with_clock(
        store: Arc<dyn Store>,
        cache: Arc<dyn BalanceCache>,
        processor: Arc<dyn PaymentProcessor>,
        catalog: Catalog,
        config: ServiceConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let retry = RetryPolicy::from_config(&config);
        Self {
            store,
            cache,
            processor,
            catalog: RwLock::new(catalog),
            clock,
            config,
            retry,
            group_locks: KeyedLocks::new(),
            customer_locks: KeyedLocks::new(),
            pending_syncs: Mutex::new(HashMap::new()),
            repairs: Arc::new(RepairQueue::new()),
        }
    }

    /// The repair queue.
    #[must_use]
    pub fn repairs(&self) -> &RepairQueue {
        &self.repairs
    }

    /// A snapshot of the catalog.
    #[must_use]
    pub fn catalog(&self) -> Catalog {
        self.catalog.read().clone()
    }

    /// Add or replace a plan version in the catalog.
    ///
    /// # Errors
    ///
    /// Returns the precondition failure if the plan is not self-consistent.
    pub fn publish_plan(&self, plan: Plan) -> Result<()> {
        plan.validate()?;
        tracing::info!(plan = %plan.id, version = plan.version, "plan published");
        self.catalog.write().insert(plan);
        Ok(())
    }

    /// The current instant.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ========================================================================
    // Customers
    // ========================================================================

    /// Create a customer, or add entities to an existing one.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn register_customer(
        &self,
        customer: CustomerId,
        entities: Vec<EntityId>,
    ) -> Result<CustomerState> {
        let _customer_guard = self.customer_locks.lock(customer).await;
        let mut state = self
            .store
            .get_customer(&customer)?
            .unwrap_or_else(|| CustomerState::new(customer));
        for entity in entities {
            if !state.entities.contains(&entity) {
                state.entities.push(entity);
            }
        }
        self.store.put_customer(&state)?;
        tracing::info!(
            customer_id = %customer,
            entities = state.entities.len(),
            "customer registered"
        );
        Ok(state)
    }

    /// Stored state of a customer, after pending usage writes landed.
    ///
    /// # Errors
    ///
    /// Returns `CustomerNotFound` if the customer is unknown.
    pub async fn customer(&self, customer: &CustomerId) -> Result<CustomerState> {
        self.wait_for_sync(customer).await;
        self.load(customer)
    }

    /// Flat status of an instance, cache first.
    ///
    /// # Errors
    ///
    /// Returns `CustomerNotFound` or `InstanceNotFound` if either is unknown.
    pub fn status(&self, customer: &CustomerId, instance: InstanceId) -> Result<LegacyStatusView> {
        if let Some(state) = self.cache.get_status(customer, instance) {
            return Ok(LegacyStatusView::from(&state));
        }
        let stored = self.load(customer)?;
        let found = stored.instance(instance)?;
        self.cache.put_status(*customer, instance, found.state);
        Ok(found.legacy_view())
    }

    /// Lock every group of a customer in sorted order, then the customer, and
    /// load its state once pending usage writes landed.
    ///
    /// The group set is read before any lock is held, so it is checked again
    /// under the locks; when an intent added a group in between, the locks are
    /// released and taken again over the larger set.
    pub(crate) async fn lock_customer(
        &self,
        customer: CustomerId,
    ) -> Result<(CustomerGuards, CustomerState)> {
        let mut groups = groups_of(&self.load(&customer)?);
        loop {
            let mut group_guards = Vec::with_capacity(groups.len());
            for group in &groups {
                group_guards.push(self.group_locks.lock((customer, group.clone())).await);
            }
            let guards = CustomerGuards {
                _customer: self.customer_locks.lock(customer).await,
                _groups: group_guards,
            };
            self.settle(&customer).await;
            let state = self.load(&customer)?;

            let current = groups_of(&state);
            if current.iter().all(|g| groups.contains(g)) {
                return Ok((guards, state));
            }
            tracing::debug!(customer_id = %customer, "group added while locking, retrying");
            drop(guards);
            groups = current;
        }
    }

    pub(crate) fn load(&self, customer: &CustomerId) -> Result<CustomerState> {
        self.store
            .get_customer(customer)?
            .ok_or_else(|| ServiceError::CustomerNotFound(customer.to_string()))
    }

    // ========================================================================
    // Intents
    // ========================================================================

    /// Compute and apply `intent` on one plan group of a customer.
    ///
    /// Application is serialized per (customer, group); grant writers of the
    /// customer wait on the customer lock until the plan is stored.
    ///
    /// # Errors
    ///
    /// - `Entitle` for validation and precondition failures, with nothing applied.
    /// - `UnknownPlan` or `WrongGroup` for intents that do not fit the catalog
    ///   or the group.
    /// - `Processor` or `Store` once retries are exhausted; effects that
    ///   already landed are queued for repair.
    pub async fn apply(
        &self,
        customer: CustomerId,
        group: &GroupId,
        intent: Intent,
    ) -> Result<AppliedPlan> {
        let _group_guard = self.group_locks.lock((customer, group.clone())).await;
        let _customer_guard = self.customer_locks.lock(customer).await;
        self.settle(&customer).await;

        let state = self.load(&customer)?;
        let now = self.clock.now();
        let plan = self.compute(&state, group, &intent, now)?;

        tracing::debug!(
            customer_id = %customer,
            group = %group,
            intent = intent.name(),
            line_items = plan.line_items.len(),
            "intent computed"
        );

        if plan.is_empty() {
            return Ok(AppliedPlan::new(plan));
        }
        self.execute(&state, Some(group), plan).await
    }

    fn compute(
        &self,
        state: &CustomerState,
        group: &GroupId,
        intent: &Intent,
        now: DateTime<Utc>,
    ) -> Result<BillingPlan> {
        let catalog = self.catalog.read();
        let plan = match intent {
            Intent::Attach {
                plan,
                version,
                entity,
                quantities,
                anchor,
            } => {
                let target = lookup(&catalog, plan, *version)?;
                if &target.group != group {
                    return Err(EntitleError::Validation(format!(
                        "plan {} belongs to group {}, not {group}",
                        target.id, target.group
                    ))
                    .into());
                }
                AttachPlanComputer::compute(&AttachContext {
                    state,
                    catalog: &catalog,
                    plan: target,
                    entity: *entity,
                    quantities: quantities.clone(),
                    anchor: *anchor,
                    alignment_tolerance_seconds: self.config.alignment_tolerance_seconds,
                    now,
                })
            }
            Intent::Cancel {
                instance,
                mode,
                require_default,
            } => {
                in_group(state, *instance, group)?;
                CancelPlanComputer::compute(&CancelContext {
                    state,
                    catalog: &catalog,
                    instance: *instance,
                    mode: *mode,
                    require_default: *require_default,
                    now,
                })
            }
            Intent::Uncancel { instance } => {
                in_group(state, *instance, group)?;
                CancelPlanComputer::uncancel(&UncancelContext {
                    state,
                    instance: *instance,
                    now,
                })
            }
            Intent::Update {
                instance,
                version,
                quantities,
                cancel,
            } => {
                let current = in_group(state, *instance, group)?;
                let target = version
                    .map(|v| lookup(&catalog, &current.plan, Some(v)))
                    .transpose()?;
                UpdatePlanComputer::compute(&UpdateContext {
                    state,
                    catalog: &catalog,
                    instance: *instance,
                    target,
                    quantities: quantities.clone(),
                    cancel: *cancel,
                    now,
                })
            }
            Intent::Switch {
                instance,
                plan,
                quantities,
                timing,
            } => {
                in_group(state, *instance, group)?;
                let target = lookup(&catalog, plan, None)?;
                SwitchPlanComputer::compute(&SwitchContext {
                    state,
                    catalog: &catalog,
                    current: *instance,
                    target,
                    quantities: quantities.clone(),
                    timing: *timing,
                    now,
                })
            }
            Intent::ActivateScheduled { instance } => {
                in_group(state, *instance, group)?;
                SwitchPlanComputer::activate_scheduled(&ActivateContext {
                    state,
                    catalog: &catalog,
                    scheduled: *instance,
                    now,
                })
            }
        };
        Ok(plan?)
    }

    // ========================================================================
    // Time and catalog driven changes
    // ========================================================================

    /// Apply every lifecycle transition of a customer that fell due.
    ///
    /// Returns `None` when nothing was due.
    ///
    /// # Errors
    ///
    /// See [`BillingOrchestrator::apply`].
    pub async fn advance(&self, customer: CustomerId) -> Result<Option<AppliedPlan>> {
        let (_guards, state) = self.lock_customer(customer).await?;
        let plan = {
            let catalog = self.catalog.read();
            LifecycleSweep::compute(&SweepContext {
                state: &state,
                catalog: &catalog,
                grace_days: self.config.past_due_grace_days,
                now: self.clock.now(),
            })?
        };
        if plan.is_empty() {
            return Ok(None);
        }
        tracing::info!(
            customer_id = %customer,
            updates = plan.update.len(),
            inserts = plan.insert.len(),
            "lifecycle transitions due"
        );
        self.execute(&state, None, plan).await.map(Some)
    }

    /// Plan moving every instance of `plan` at version `from` to `to`, without
    /// applying anything.
    ///
    /// # Errors
    ///
    /// Returns `UnknownPlan` if `to` is not in the catalog, or the computer's
    /// validation failure.
    pub async fn preview_migration(
        &self,
        plan: &PlanId,
        from: u32,
        to: u32,
    ) -> Result<Vec<CustomerMigration>> {
        let mut customers = Vec::new();
        for customer in self.store.list_customers()? {
            self.wait_for_sync(&customer).await;
            customers.push(self.load(&customer)?);
        }
        let catalog = self.catalog.read();
        let target = lookup(&catalog, plan, Some(to))?;
        Ok(MigratePlanComputer::compute(&MigrateContext {
            customers: &customers,
            from,
            to: target,
            now: self.clock.now(),
        })?)
    }

    /// Move every instance of `plan` at version `from` to `to`.
    ///
    /// Customers are migrated one at a time under their group lock; a failing
    /// customer is reported and the rest continue.
    ///
    /// # Errors
    ///
    /// Returns `UnknownPlan` if `to` is not in the catalog, or a store error
    /// while listing customers.
    pub async fn migrate(&self, plan: &PlanId, from: u32, to: u32) -> Result<MigrationReport> {
        let target = lookup(&self.catalog.read(), plan, Some(to))?.clone();
        let mut report = MigrationReport::default();

        for customer in self.store.list_customers()? {
            match self.migrate_customer(customer, from, &target).await {
                Ok(true) => report.migrated.push(customer),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(
                        customer_id = %customer,
                        plan = %target.id,
                        error = %e,
                        "migration failed for customer"
                    );
                    report.failed.push((customer, e.to_string()));
                }
            }
        }

        tracing::info!(
            plan = %target.id,
            from,
            to,
            migrated = report.migrated.len(),
            failed = report.failed.len(),
            "migration finished"
        );
        Ok(report)
    }

    async fn migrate_customer(&self, customer: CustomerId, from: u32, to: &Plan) -> Result<bool> {
        let _group_guard = self.group_locks.lock((customer, to.group.clone())).await;
        let _customer_guard = self.customer_locks.lock(customer).await;
        self.settle(&customer).await;

        let state = self.load(&customer)?;
        let plan = MigratePlanComputer::compute_for_customer(&state, from, to, self.clock.now())?;
        if plan.is_empty() {
            return Ok(false);
        }
        self.execute(&state, Some(&to.group), plan).await?;
        Ok(true)
    }

    // ========================================================================
    // Application
    // ========================================================================

    /// Apply a computed plan. The caller holds the customer lock.
    pub(crate) async fn execute(
        &self,
        state: &CustomerState,
        group: Option<&GroupId>,
        mut plan: BillingPlan,
    ) -> Result<AppliedPlan> {
        let customer = state.customer;
        let projected = plan.project(&state.instances)?;

        let mut applied = AppliedPlan::new(BillingPlan::default());
        if let Err(e) = self
            .submit(state, &projected, &mut plan, &mut applied)
            .await
        {
            if applied.has_effects() {
                self.repairs.push(PendingRepair {
                    customer,
                    group: group.cloned(),
                    kind: RepairKind::ProcessorPartial {
                        plan,
                        completed: applied.completed(),
                    },
                    error: e.to_string(),
                    recorded_at: self.clock.now(),
                });
            }
            return Err(e.into());
        }

        if let Err(e) = self.store.apply_billing_plan(&customer, &plan) {
            if applied.has_effects() {
                self.repairs.push(PendingRepair {
                    customer,
                    group: group.cloned(),
                    kind: RepairKind::StoreWrite { plan },
                    error: e.to_string(),
                    recorded_at: self.clock.now(),
                });
            }
            return Err(e.into());
        }

        self.cache.invalidate(&customer);
        for instance in &projected {
            self.cache.put_status(customer, instance.id, instance.state);
        }

        tracing::info!(
            customer_id = %customer,
            group = ?group.map(GroupId::as_str),
            inserts = plan.insert.len(),
            updates = plan.update.len(),
            deletes = plan.delete.len(),
            invoice_items = applied.invoice_items.len(),
            total = %plan.total(),
            "billing plan applied"
        );

        applied.plan = plan;
        Ok(applied)
    }

    /// Processor side of a plan: invoice items, subscription changes, cancels.
    async fn submit(
        &self,
        state: &CustomerState,
        projected: &[PlanInstance],
        plan: &mut BillingPlan,
        applied: &mut AppliedPlan,
    ) -> std::result::Result<(), ProcessorError> {
        let processor = self.processor.as_ref();
        let currency_of = |instance: InstanceId| {
            projected
                .iter()
                .chain(plan.delete.iter())
                .chain(state.instances.iter())
                .find(|i| i.id == instance)
                .map(|i| i.currency.clone())
                .unwrap_or_default()
        };

        for item in &plan.line_items {
            let key = item.idempotency_key();
            let request = InvoiceItemRequest {
                customer: state.customer,
                currency: currency_of(item.instance),
                amount: item.amount,
                description: item.description.clone(),
                period: item.period,
                idempotency_key: key.clone(),
            };
            let id = with_retry(self.retry, "create_invoice_item", &key, || {
                processor.create_invoice_item(request.clone())
            })
            .await?;
            applied.invoice_items.push(id);
        }

        let links = plan.project_links(&state.links);
        for external_ref in touched_subscriptions(state, plan) {
            let members: Vec<&PlanInstance> = links
                .iter()
                .filter(|l| l.external_ref == external_ref)
                .filter_map(|l| projected.iter().find(|i| i.id == l.instance))
                .filter(|i| i.state.is_live())
                .collect();
            let Some(first) = members.first() else {
                continue;
            };
            let key = format!(
                "{external_ref}:{}",
                members
                    .iter()
                    .map(|i| format!("{}@{}", i.id, i.version))
                    .collect::<Vec<_>>()
                    .join(",")
            );
            let request = SubscriptionRequest {
                customer: state.customer,
                existing: Some(external_ref.clone()),
                currency: first.currency.clone(),
                items: members.iter().map(|i| subscription_item(i)).collect(),
                proration: ProrationBehavior::None,
                anchor: plan.anchor,
                idempotency_key: key.clone(),
            };
            let updated = with_retry(self.retry, "update_subscription", &key, || {
                processor.create_or_update_subscription(request.clone())
            })
            .await?;
            applied.subscriptions.push(updated);
        }

        let unlinked: Vec<&PlanInstance> = projected
            .iter()
            .filter(|i| {
                i.state.is_live()
                    && i.is_paid()
                    && i.cadence.is_some()
                    && (plan.insert.iter().any(|n| n.id == i.id) || plan.update_for(i.id).is_some())
                    && !links.iter().any(|l| l.instance == i.id)
            })
            .collect();
        for instance in unlinked {
            let key = format!("{}:subscribe", instance.id);
            let request = SubscriptionRequest {
                customer: state.customer,
                existing: None,
                currency: instance.currency.clone(),
                items: vec![subscription_item(instance)],
                proration: ProrationBehavior::None,
                anchor: plan.anchor,
                idempotency_key: key.clone(),
            };
            let created = with_retry(self.retry, "create_subscription", &key, || {
                processor.create_or_update_subscription(request.clone())
            })
            .await?;
            plan.link.push(SubscriptionLink {
                instance: instance.id,
                external_ref: created.clone(),
            });
            applied.subscriptions.push(created);
        }

        for external_ref in &plan.cancel_subscriptions {
            let key = format!("{external_ref}:cancel");
            with_retry(self.retry, "cancel_subscription", &key, || {
                processor.cancel_subscription(external_ref, &key)
            })
            .await?;
            applied.canceled_subscriptions.push(external_ref.clone());
        }

        Ok(())
    }
}

/// Subscriptions whose membership or prices a plan changes, minus those it cancels.
fn touched_subscriptions(state: &CustomerState, plan: &BillingPlan) -> Vec<ExternalSubscriptionRef> {
    let repriced = plan
        .update
        .iter()
        .filter(|u| u.patch.prices.is_some() || u.patch.version.is_some())
        .flat_map(|u| state.refs_for(u.instance));
    let mut refs: Vec<ExternalSubscriptionRef> = Vec::new();
    for external_ref in plan
        .link
        .iter()
        .chain(plan.unlink.iter())
        .map(|l| l.external_ref.clone())
        .chain(repriced)
    {
        if !refs.contains(&external_ref) && !plan.cancel_subscriptions.contains(&external_ref) {
            refs.push(external_ref);
        }
    }
    refs
}

fn subscription_item(instance: &PlanInstance) -> SubscriptionItem {
    SubscriptionItem {
        instance: instance.id,
        plan: instance.plan.clone(),
        version: instance.version,
        prices: instance.prices.clone(),
    }
}

/// A plan from the catalog, latest version when `version` is `None`.
pub(crate) fn lookup<'a>(
    catalog: &'a Catalog,
    plan: &PlanId,
    version: Option<u32>,
) -> Result<&'a Plan> {
    match version {
        Some(v) => catalog.get(plan, v),
        None => catalog.latest(plan),
    }
    .ok_or_else(|| ServiceError::UnknownPlan {
        plan: plan.clone(),
        version,
    })
}

/// The instance, if it belongs to `group`.
fn in_group<'a>(
    state: &'a CustomerState,
    instance: InstanceId,
    group: &GroupId,
) -> Result<&'a PlanInstance> {
    let found = state.instance(instance)?;
    if &found.group != group {
        return Err(ServiceError::WrongGroup {
            instance,
            group: group.clone(),
        });
    }
    Ok(found)
}

/// The groups a customer has instances in, sorted and deduplicated.
fn groups_of(state: &CustomerState) -> Vec<GroupId> {
    let mut groups: Vec<GroupId> = state.instances.iter().map(|i| i.group.clone()).collect();
    groups.sort();
    groups.dedup();
    groups
}
