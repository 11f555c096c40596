//! Consistency reconciler.
//!
//! Validates each customer's stored state against a fixed rule set, compares
//! the balance cache with the store, and surfaces partially applied plans.
//! Structural drift is repaired by re-running the plan computer that should
//! have produced the state; financial drift is only reported.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

use z_entitle_core::ledger;
use z_entitle_core::{
    ActivateContext, BalanceScope, CancelContext, CancelMode, CancelPlanComputer, CustomerId,
    CustomerState, ExternalSubscriptionRef, InstanceId, InstanceState, SwitchPlanComputer,
};
use z_entitle_store::BalanceKey;

use crate::error::Result;
use crate::orchestrator::BillingOrchestrator;
use crate::processor::SubscriptionStatus;

/// Customers checked concurrently by a full sweep.
const SWEEP_CONCURRENCY: usize = 8;

/// The rules the reconciler checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileRule {
    /// A scheduled main instance with no live main instance in its group.
    ScheduledWithoutMain,
    /// A grant allows overage but its instance has no price for the feature.
    OverageWithoutPrice,
    /// Processor subscriptions and stored links disagree.
    ProcessorSubscriptionMismatch,
    /// The cache disagrees with the store after pending writes landed.
    CacheStoreDrift,
    /// A plan was partially applied.
    PendingRepair,
}

impl ReconcileRule {
    /// Every rule, in check order.
    pub const ALL: [Self; 5] = [
        Self::ScheduledWithoutMain,
        Self::OverageWithoutPrice,
        Self::ProcessorSubscriptionMismatch,
        Self::CacheStoreDrift,
        Self::PendingRepair,
    ];

    /// Stable name for reports.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ScheduledWithoutMain => "scheduled_without_main",
            Self::OverageWithoutPrice => "overage_without_price",
            Self::ProcessorSubscriptionMismatch => "processor_subscription_mismatch",
            Self::CacheStoreDrift => "cache_store_drift",
            Self::PendingRepair => "pending_repair",
        }
    }
}

impl std::fmt::Display for ReconcileRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    /// Money may be wrong.
    Critical,
    /// Data inconsistency that needs attention.
    High,
    /// Potential issue, should investigate.
    Medium,
    /// Informational.
    Low,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => write!(f, "CRITICAL"),
            Self::High => write!(f, "HIGH"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::Low => write!(f, "LOW"),
        }
    }
}

/// One rule violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    /// Which rule was violated.
    pub rule: ReconcileRule,
    /// Customer affected.
    pub customer: CustomerId,
    /// Instances involved.
    pub instances: Vec<InstanceId>,
    /// Human-readable description.
    pub description: String,
    /// Additional context for debugging.
    pub context: serde_json::Value,
    /// Severity level.
    pub severity: Severity,
    /// Whether the reconciler repaired it.
    pub repaired: bool,
}

/// Summary of a reconciliation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// When the run started.
    pub checked_at: DateTime<Utc>,
    /// Customers checked.
    pub customers_checked: usize,
    /// Customers whose check failed outright.
    pub customers_failed: usize,
    /// Rules checked.
    pub checks_run: usize,
    /// Rules without findings.
    pub checks_passed: usize,
    /// Rules with at least one finding.
    pub checks_failed: usize,
    /// Every finding.
    pub findings: Vec<Finding>,
    /// Findings repaired during the run.
    pub repairs_applied: usize,
    /// True when every finding was repaired.
    pub healthy: bool,
}

impl ReconcileReport {
    fn new(
        checked_at: DateTime<Utc>,
        customers_checked: usize,
        customers_failed: usize,
        findings: Vec<Finding>,
    ) -> Self {
        let checks_run = ReconcileRule::ALL.len();
        let checks_failed = findings
            .iter()
            .map(|f| f.rule)
            .collect::<HashSet<_>>()
            .len();
        let repairs_applied = findings.iter().filter(|f| f.repaired).count();
        Self {
            checked_at,
            customers_checked,
            customers_failed,
            checks_run,
            checks_passed: checks_run - checks_failed,
            checks_failed,
            repairs_applied,
            healthy: findings.iter().all(|f| f.repaired) && customers_failed == 0,
            findings,
        }
    }

    /// Findings of one rule.
    pub fn by_rule(&self, rule: ReconcileRule) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(move |f| f.rule == rule)
    }
}

/// Runs the consistency checks.
pub struct ConsistencyReconciler {
    orchestrator: Arc<BillingOrchestrator>,
}

impl ConsistencyReconciler {
    /// Create a reconciler over an orchestrator.
    #[must_use]
    pub const fn new(orchestrator: Arc<BillingOrchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Check every customer.
    ///
    /// # Errors
    ///
    /// Returns an error if customers cannot be listed. Failures of single
    /// customers are counted in the report.
    pub async fn run_all_checks(&self) -> Result<ReconcileReport> {
        let checked_at = self.orchestrator.now();
        let customers = self.orchestrator.store.list_customers()?;
        let customers_checked = customers.len();

        let results: Vec<(CustomerId, Result<Vec<Finding>>)> = stream::iter(customers)
            .map(|customer| async move { (customer, self.check(customer).await) })
            .buffer_unordered(SWEEP_CONCURRENCY)
            .collect()
            .await;

        let mut findings = Vec::new();
        let mut customers_failed = 0;
        for (customer, result) in results {
            match result {
                Ok(found) => findings.extend(found),
                Err(e) => {
                    tracing::warn!(customer_id = %customer, error = %e, "reconciliation failed");
                    customers_failed += 1;
                }
            }
        }

        let report = ReconcileReport::new(checked_at, customers_checked, customers_failed, findings);
        if report.healthy {
            tracing::info!(
                customers = report.customers_checked,
                repairs = report.repairs_applied,
                "reconciliation passed"
            );
        } else {
            tracing::warn!(
                customers = report.customers_checked,
                failed = report.customers_failed,
                checks_failed = report.checks_failed,
                findings = report.findings.len(),
                "reconciliation found drift"
            );
        }
        Ok(report)
    }

    /// Check one customer.
    ///
    /// # Errors
    ///
    /// Returns `CustomerNotFound`, store errors, or processor errors.
    pub async fn check_customer(&self, customer: CustomerId) -> Result<ReconcileReport> {
        let checked_at = self.orchestrator.now();
        let findings = self.check(customer).await?;
        Ok(ReconcileReport::new(checked_at, 1, 0, findings))
    }

    /// Compare the cache of one customer with the store once pending usage
    /// writes landed. Drifted entries are dropped from the cache.
    ///
    /// # Errors
    ///
    /// Returns `CustomerNotFound` or a store error.
    pub async fn verify_cache(&self, customer: CustomerId) -> Result<Vec<Finding>> {
        let orchestrator = &self.orchestrator;
        let (_guards, state) = orchestrator.lock_customer(customer).await?;
        Ok(self.cache_drift(&state))
    }

    async fn check(&self, customer: CustomerId) -> Result<Vec<Finding>> {
        let orchestrator = &self.orchestrator;
        let (_guards, state) = orchestrator.lock_customer(customer).await?;

        let mut findings = self.scheduled_without_main(&state).await?;
        let state = if findings.iter().any(|f| f.repaired) {
            orchestrator.load(&customer)?
        } else {
            state
        };
        findings.extend(overage_without_price(&state, orchestrator.now()));
        findings.extend(self.subscription_mismatch(&state).await?);
        findings.extend(self.cache_drift(&state));
        findings.extend(self.pending_repairs(&customer));
        Ok(findings)
    }

    /// Rule: a scheduled main instance waits on a live main instance of its scope.
    ///
    /// Due orphans are activated, the rest deleted.
    async fn scheduled_without_main(&self, state: &CustomerState) -> Result<Vec<Finding>> {
        let orchestrator = &self.orchestrator;
        let now = orchestrator.now();
        let orphans: Vec<_> = state
            .instances
            .iter()
            .filter(|i| i.is_main() && i.state.is_scheduled())
            .filter(|i| state.live_main(i.entity, &i.group).is_none())
            .cloned()
            .collect();

        let mut findings = Vec::new();
        let mut working = state.clone();
        for orphan in orphans {
            let InstanceState::Scheduled { starts_at } = orphan.state else {
                continue;
            };
            let plan = {
                let catalog = orchestrator.catalog.read();
                if starts_at <= now {
                    SwitchPlanComputer::activate_scheduled(&ActivateContext {
                        state: &working,
                        catalog: &catalog,
                        scheduled: orphan.id,
                        now,
                    })
                } else {
                    CancelPlanComputer::compute(&CancelContext {
                        state: &working,
                        catalog: &catalog,
                        instance: orphan.id,
                        mode: CancelMode::Immediately,
                        require_default: false,
                        now,
                    })
                }
            };
            let repaired = match plan {
                Ok(plan) => match orchestrator.execute(&working, Some(&orphan.group), plan).await {
                    Ok(applied) => {
                        working.instances = applied.plan.project(&working.instances)?;
                        working.links = applied.plan.project_links(&working.links);
                        true
                    }
                    Err(e) => {
                        tracing::warn!(instance_id = %orphan.id, error = %e, "orphan repair failed");
                        false
                    }
                },
                Err(e) => {
                    tracing::warn!(instance_id = %orphan.id, error = %e, "orphan repair not computable");
                    false
                }
            };
            let action = if starts_at <= now { "activated" } else { "deleted" };
            findings.push(Finding {
                rule: ReconcileRule::ScheduledWithoutMain,
                customer: state.customer,
                instances: vec![orphan.id],
                description: format!(
                    "Scheduled instance of plan {} has no live main plan in group {}",
                    orphan.plan, orphan.group
                ),
                context: serde_json::json!({
                    "plan": orphan.plan.as_str(),
                    "group": orphan.group.as_str(),
                    "starts_at": starts_at,
                    "action": action,
                }),
                severity: Severity::High,
                repaired,
            });
        }
        Ok(findings)
    }

    /// Rule: processor subscriptions match the stored links of live instances.
    async fn subscription_mismatch(&self, state: &CustomerState) -> Result<Vec<Finding>> {
        let remote = self
            .orchestrator
            .processor
            .list_subscriptions(&state.customer)
            .await?;

        let mut stored: Vec<(ExternalSubscriptionRef, Vec<InstanceId>)> = Vec::new();
        for link in &state.links {
            let live = state
                .instance(link.instance)
                .is_ok_and(|i| i.state.is_live());
            if !live {
                continue;
            }
            match stored.iter_mut().find(|(r, _)| r == &link.external_ref) {
                Some((_, members)) => members.push(link.instance),
                None => stored.push((link.external_ref.clone(), vec![link.instance])),
            }
        }

        let mut findings = Vec::new();
        let mismatch = |external_ref: &ExternalSubscriptionRef,
                        instances: Vec<InstanceId>,
                        description: String,
                        context: serde_json::Value| Finding {
            rule: ReconcileRule::ProcessorSubscriptionMismatch,
            customer: state.customer,
            instances,
            description: format!("Subscription {external_ref}: {description}"),
            context,
            severity: Severity::High,
            repaired: false,
        };

        for (external_ref, members) in &stored {
            match remote.iter().find(|s| &s.external_ref == external_ref) {
                None => findings.push(mismatch(
                    external_ref,
                    members.clone(),
                    "linked in the store but unknown to the processor".into(),
                    serde_json::json!({ "store_instances": members.len() }),
                )),
                Some(sub) if sub.status != SubscriptionStatus::Active => findings.push(mismatch(
                    external_ref,
                    members.clone(),
                    "linked to live instances but canceled at the processor".into(),
                    serde_json::json!({ "processor_status": sub.status }),
                )),
                Some(sub) => {
                    let mut ours = members.clone();
                    let mut theirs = sub.instances.clone();
                    ours.sort();
                    theirs.sort();
                    if ours != theirs {
                        findings.push(mismatch(
                            external_ref,
                            members.clone(),
                            "membership differs".into(),
                            serde_json::json!({
                                "store_instances": ours.len(),
                                "processor_instances": theirs.len(),
                            }),
                        ));
                    }
                }
            }
        }

        for sub in remote.iter().filter(|s| s.status == SubscriptionStatus::Active) {
            if !stored.iter().any(|(r, _)| r == &sub.external_ref) {
                findings.push(mismatch(
                    &sub.external_ref,
                    sub.instances.clone(),
                    "active at the processor but not linked to a live instance".into(),
                    serde_json::json!({ "processor_instances": sub.instances.len() }),
                ));
            }
        }
        Ok(findings)
    }

    /// Rule: cached balances and statuses equal what the store implies.
    fn cache_drift(&self, state: &CustomerState) -> Vec<Finding> {
        let cache = &self.orchestrator.cache;
        let now = self.orchestrator.now();
        let grants = state.live_grants();
        let mut findings = Vec::new();

        for (key, cached) in cache.balances_for(&state.customer) {
            let BalanceKey {
                entity, feature, ..
            } = &key;
            let scope = match entity {
                Some(entity) => BalanceScope::entity(feature.clone(), *entity),
                None => BalanceScope::customer(feature.clone()),
            };
            let stored = ledger::compute_balance(&grants, &scope, now);
            if stored != cached {
                findings.push(Finding {
                    rule: ReconcileRule::CacheStoreDrift,
                    customer: state.customer,
                    instances: Vec::new(),
                    description: format!("Cached balance of {feature} differs from the store"),
                    context: serde_json::json!({
                        "feature": feature.as_str(),
                        "entity": entity.map(|e| e.to_string()),
                        "cached": cached.current,
                        "stored": stored.current,
                    }),
                    severity: Severity::Medium,
                    repaired: true,
                });
            }
        }

        for instance in &state.instances {
            if let Some(cached) = cache.get_status(&state.customer, instance.id) {
                if cached != instance.state {
                    findings.push(Finding {
                        rule: ReconcileRule::CacheStoreDrift,
                        customer: state.customer,
                        instances: vec![instance.id],
                        description: "Cached status differs from the store".into(),
                        context: serde_json::json!({
                            "cached": cached.name(),
                            "stored": instance.state.name(),
                        }),
                        severity: Severity::Medium,
                        repaired: true,
                    });
                }
            }
        }

        if !findings.is_empty() {
            tracing::warn!(
                customer_id = %state.customer,
                entries = findings.len(),
                "cache drift, invalidating"
            );
            cache.invalidate(&state.customer);
        }
        findings
    }

    /// Rule: nothing of the customer waits in the repair queue.
    fn pending_repairs(&self, customer: &CustomerId) -> Vec<Finding> {
        self.orchestrator
            .repairs
            .for_customer(customer)
            .into_iter()
            .map(|repair| Finding {
                rule: ReconcileRule::PendingRepair,
                customer: *customer,
                instances: Vec::new(),
                description: format!("Partially applied operation: {}", repair.error),
                context: serde_json::json!({
                    "kind": repair.kind.name(),
                    "group": repair.group.as_ref().map(|g| g.as_str()),
                    "recorded_at": repair.recorded_at,
                    "repair": repair.kind,
                }),
                severity: Severity::Critical,
                repaired: false,
            })
            .collect()
    }
}

/// Rule: every live grant that allows overage has a price that bills it.
fn overage_without_price(state: &CustomerState, now: DateTime<Utc>) -> Vec<Finding> {
    let mut findings = Vec::new();
    for instance in state.instances.iter().filter(|i| i.state.is_live()) {
        let mut reported = HashSet::new();
        for grant in instance
            .grants
            .iter()
            .filter(|g| g.overage_allowed() && !g.is_expired(now))
        {
            let priced = instance
                .prices
                .iter()
                .any(|p| p.feature() == Some(grant.feature()));
            if priced || !reported.insert(grant.feature().clone()) {
                continue;
            }
            findings.push(Finding {
                rule: ReconcileRule::OverageWithoutPrice,
                customer: state.customer,
                instances: vec![instance.id],
                description: format!(
                    "Feature {} allows overage but plan {} has no usage price for it",
                    grant.feature(),
                    instance.plan
                ),
                context: serde_json::json!({
                    "feature": grant.feature().as_str(),
                    "plan": instance.plan.as_str(),
                    "version": instance.version,
                    "usage_limit": grant.usage_limit(),
                }),
                severity: Severity::Medium,
                repaired: false,
            });
        }
    }
    findings
}
