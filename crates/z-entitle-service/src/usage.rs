//! Usage tracking.
//!
//! Usage is applied to the customer's grants as the cache holds them and
//! acknowledged from there. The store catches up from a spawned
//! compare-and-swap write, so a balance read right after tracking can be
//! ahead of the store until [`BillingOrchestrator::wait_for_sync`] returns.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use z_entitle_core::ledger::{self, Redistribution};
use z_entitle_core::{
    Balance, BalanceScope, BillingPlan, Breakdown, CustomerId, EntitleError, EntityId, FeatureId,
    Grant, GrantId, InstancePatch, LedgerOutcome,
};
use z_entitle_store::BalanceKey;

use crate::error::Result;
use crate::orchestrator::BillingOrchestrator;
use crate::repair::{PendingRepair, RepairKind};

/// Result of one ledger operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageReceipt {
    /// Aggregate balance of the scope afterwards.
    pub balance: Balance,
    /// Quantity the grants absorbed.
    pub applied: Decimal,
    /// Usage no grant could absorb.
    pub unbillable: Decimal,
    /// Refunded usage with nothing left to restore.
    pub unrestored: Decimal,
}

fn scope_of(feature: &FeatureId, entity: Option<EntityId>) -> BalanceScope {
    match entity {
        Some(entity) => BalanceScope::entity(feature.clone(), entity),
        None => BalanceScope::customer(feature.clone()),
    }
}

impl BillingOrchestrator {
    /// Apply a usage delta; negative deltas give usage back.
    ///
    /// # Errors
    ///
    /// - `CustomerNotFound` if the customer is unknown.
    /// - `Entitle(InvariantViolation)` if the ledger would be left in an
    ///   impossible state; nothing is applied.
    pub async fn track_usage(
        &self,
        customer: CustomerId,
        feature: &FeatureId,
        entity: Option<EntityId>,
        delta: Decimal,
    ) -> Result<UsageReceipt> {
        self.mutate(customer, feature, entity, |grants, scope, now| {
            ledger::apply_usage_delta(grants, scope, delta, now)
        })
        .await
    }

    /// Correct a balance to `target`.
    ///
    /// Entity balances are redistributed proportionally over the entity's
    /// grants; customer balances walk the deduction order.
    ///
    /// # Errors
    ///
    /// See [`BillingOrchestrator::track_usage`].
    pub async fn set_balance(
        &self,
        customer: CustomerId,
        feature: &FeatureId,
        entity: Option<EntityId>,
        target: Decimal,
    ) -> Result<UsageReceipt> {
        let strategy = if entity.is_some() {
            Redistribution::ProportionalRedistribute
        } else {
            Redistribution::SequentialDeduct
        };
        self.mutate(customer, feature, entity, |grants, scope, now| {
            ledger::set_absolute_balance(grants, scope, target, strategy, now)
        })
        .await
    }

    /// Aggregate balance of a feature, cache first.
    ///
    /// # Errors
    ///
    /// Returns `CustomerNotFound` if the customer is unknown.
    pub async fn balance(
        &self,
        customer: CustomerId,
        feature: &FeatureId,
        entity: Option<EntityId>,
    ) -> Result<Balance> {
        let key = BalanceKey {
            customer,
            entity,
            feature: feature.clone(),
        };
        if let Some(balance) = self.cache.get_balance(&key) {
            return Ok(balance);
        }

        let _customer_guard = self.customer_locks.lock(customer).await;
        let grants = self.working_grants(&customer).await?;
        let balance = ledger::compute_balance(&grants, &scope_of(feature, entity), self.clock.now());
        self.cache.put_balance(key, balance.clone());
        Ok(balance)
    }

    /// Per-grant view of a feature.
    ///
    /// # Errors
    ///
    /// Returns `CustomerNotFound` if the customer is unknown.
    pub async fn breakdown(
        &self,
        customer: CustomerId,
        feature: &FeatureId,
        entity: Option<EntityId>,
    ) -> Result<Vec<Breakdown>> {
        let _customer_guard = self.customer_locks.lock(customer).await;
        let grants = self.working_grants(&customer).await?;
        Ok(ledger::breakdown(
            &grants,
            &scope_of(feature, entity),
            self.clock.now(),
        ))
    }

    /// Wait until every usage write of a customer reached the store.
    pub async fn wait_for_sync(&self, customer: &CustomerId) {
        let _customer_guard = self.customer_locks.lock(*customer).await;
        self.settle(customer).await;
    }

    /// Reset every grant of the customer whose reset boundary passed.
    ///
    /// Returns the number of grants reset. Rollover grants join their
    /// instance in the same store write.
    ///
    /// # Errors
    ///
    /// Returns `CustomerNotFound` if the customer is unknown, or a store error.
    pub async fn reset_due_grants(&self, customer: CustomerId) -> Result<usize> {
        let _customer_guard = self.customer_locks.lock(customer).await;
        self.settle(&customer).await;

        let state = self.load(&customer)?;
        let now = self.clock.now();
        let mut plan = BillingPlan::default();
        let mut reset = 0;
        {
            let catalog = self.catalog.read();
            for instance in state.instances.iter().filter(|i| i.state.is_live()) {
                if !instance.grants.iter().any(|g| g.reset_due(now)) {
                    continue;
                }
                let terms = catalog.get(&instance.plan, instance.version);
                let mut grants = instance.grants.clone();
                let mut rollovers = Vec::new();
                for grant in grants
                    .iter_mut()
                    .filter(|g| g.reset_due(now) && !g.is_expired(now))
                {
                    let included = terms
                        .and_then(|p| p.feature(grant.feature()))
                        .map_or(grant.granted(), |item| item.included);
                    if let Some(outcome) = ledger::reset_grant(grant, included, now)? {
                        reset += 1;
                        rollovers.extend(outcome.rollover);
                    }
                }
                grants.extend(rollovers);
                plan.patch(
                    instance.id,
                    InstancePatch {
                        grants: Some(grants),
                        ..InstancePatch::default()
                    },
                );
            }
        }

        if plan.is_empty() {
            return Ok(0);
        }
        self.store.apply_billing_plan(&customer, &plan)?;
        self.cache.invalidate(&customer);
        tracing::info!(customer_id = %customer, grants = reset, "grants reset");
        Ok(reset)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Run one ledger operation on the working grants and sync it.
    async fn mutate<F>(
        &self,
        customer: CustomerId,
        feature: &FeatureId,
        entity: Option<EntityId>,
        op: F,
    ) -> Result<UsageReceipt>
    where
        F: FnOnce(
            &mut [Grant],
            &BalanceScope,
            chrono::DateTime<chrono::Utc>,
        ) -> z_entitle_core::Result<LedgerOutcome>,
    {
        let _customer_guard = self.customer_locks.lock(customer).await;
        let mut grants = self.working_grants(&customer).await?;
        let scope = scope_of(feature, entity);
        let now = self.clock.now();
        let versions: HashMap<GrantId, u64> = grants.iter().map(|g| (g.id(), g.version())).collect();

        let outcome = match op(grants.as_mut_slice(), &scope, now) {
            Ok(outcome) => outcome,
            Err(e @ EntitleError::InvariantViolation { .. }) => {
                tracing::error!(
                    customer_id = %customer,
                    feature = %feature,
                    error = %e,
                    "ledger invariant violated, operation aborted"
                );
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        let balance = ledger::compute_balance(&grants, &scope, now);
        self.cache.put_grants(customer, grants.clone());
        for (key, _) in self
            .cache
            .balances_for(&customer)
            .into_iter()
            .filter(|(key, _)| &key.feature == feature)
        {
            let refreshed = ledger::compute_balance(&grants, &scope_of(feature, key.entity), now);
            self.cache.put_balance(key, refreshed);
        }
        self.cache.put_balance(
            BalanceKey {
                customer,
                entity,
                feature: feature.clone(),
            },
            balance.clone(),
        );

        if !outcome.is_noop() {
            let changed: Vec<Grant> = grants
                .into_iter()
                .filter(|g| outcome.change_for(g.id()).is_some())
                .collect();
            let expected = changed
                .iter()
                .filter_map(|g| versions.get(&g.id()).map(|v| (g.id(), *v)))
                .collect();
            self.spawn_sync(customer, expected, changed);
        }

        tracing::debug!(
            customer_id = %customer,
            feature = %feature,
            applied = %outcome.applied,
            unbillable = %outcome.unbillable,
            balance = %balance.current,
            "ledger updated"
        );

        Ok(UsageReceipt {
            balance,
            applied: outcome.applied,
            unbillable: outcome.unbillable,
            unrestored: outcome.unrestored,
        })
    }

    /// Grants the usage path works on: the cached snapshot, else the store's
    /// live grants once pending writes landed. The caller holds the customer lock.
    async fn working_grants(&self, customer: &CustomerId) -> Result<Vec<Grant>> {
        if let Some(grants) = self.cache.get_grants(customer) {
            return Ok(grants);
        }
        self.settle(customer).await;
        let grants = self.load(customer)?.live_grants();
        self.cache.put_grants(*customer, grants.clone());
        Ok(grants)
    }

    /// Await the pending store writes of a customer. The caller holds the customer lock.
    pub(crate) async fn settle(&self, customer: &CustomerId) {
        let handles = self
            .pending_syncs
            .lock()
            .remove(customer)
            .unwrap_or_default();
        for joined in futures::future::join_all(handles).await {
            if let Err(e) = joined {
                tracing::warn!(customer_id = %customer, error = %e, "usage sync task failed");
            }
        }
    }

    /// Write changed grants to the store in the background.
    ///
    /// Retries while the store is behind the expected versions, which happens
    /// when an earlier write of the same grants has not landed yet. Any other
    /// failure, or running out of attempts, queues a repair.
    fn spawn_sync(&self, customer: CustomerId, expected: Vec<(GrantId, u64)>, grants: Vec<Grant>) {
        let store = Arc::clone(&self.store);
        let repairs = Arc::clone(&self.repairs);
        let clock = Arc::clone(&self.clock);
        let retry = self.retry;

        let handle = tokio::spawn(async move {
            let mut attempt = 0;
            let mut backoff_ms = retry.initial_backoff_ms;

            loop {
                match store.compare_and_swap_grants(&customer, &expected, &grants) {
                    Ok(()) => {
                        tracing::trace!(customer_id = %customer, grants = grants.len(), "usage synced");
                        return;
                    }
                    Err(e) => {
                        attempt += 1;

                        if !e.is_store_behind() || attempt >= retry.max_retries {
                            repairs.push(PendingRepair {
                                customer,
                                group: None,
                                kind: RepairKind::UsageSync { grants },
                                error: e.to_string(),
                                recorded_at: clock.now(),
                            });
                            return;
                        }

                        tracing::debug!(
                            customer_id = %customer,
                            attempt = %attempt,
                            backoff_ms = %backoff_ms,
                            error = %e,
                            "store behind, retrying usage sync"
                        );

                        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;

                        backoff_ms = (backoff_ms * 2).min(retry.max_backoff_ms);
                    }
                }
            }
        });

        let mut pending = self.pending_syncs.lock();
        let handles = pending.entry(customer).or_default();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }
}
