//! Moving instances between versions of one plan.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{finish, regrant_all, CustomerState};
use crate::billing_plan::{BillingPlan, InstancePatch};
use crate::error::{EntitleError, Result};
use crate::ids::CustomerId;
use crate::plan::Plan;

/// Intent to migrate every instance of one plan version.
#[derive(Debug, Clone, Copy)]
pub struct MigrateContext<'a> {
    /// Customers to consider.
    pub customers: &'a [CustomerState],
    /// Version instances are migrated from.
    pub from: u32,
    /// Target version; its id names the plan.
    pub to: &'a Plan,
    /// Evaluation instant.
    pub now: DateTime<Utc>,
}

/// The plan for one customer touched by a migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerMigration {
    /// The customer.
    pub customer: CustomerId,
    /// What changes for them.
    pub plan: BillingPlan,
}

/// Computes migration plans.
#[derive(Debug, Clone, Copy, Default)]
pub struct MigratePlanComputer;

impl MigratePlanComputer {
    /// Plan the migration for every customer with an instance on the old version.
    ///
    /// # Errors
    ///
    /// Fails on the first customer whose plan cannot be computed.
    pub fn compute(ctx: &MigrateContext<'_>) -> Result<Vec<CustomerMigration>> {
        let mut migrations = Vec::new();
        for state in ctx.customers {
            let plan = Self::compute_for_customer(state, ctx.from, ctx.to, ctx.now)?;
            if !plan.is_empty() {
                migrations.push(CustomerMigration {
                    customer: state.customer,
                    plan,
                });
            }
        }
        tracing::info!(
            plan_id = %ctx.to.id,
            from = ctx.from,
            to = ctx.to.version,
            customers = migrations.len(),
            "migration planned"
        );
        Ok(migrations)
    }

    /// Plan the migration of one customer.
    ///
    /// Version, prices and grant terms change; lifecycle state, usage,
    /// purchased quantities and reset calendars do not, and nothing is billed.
    ///
    /// # Errors
    ///
    /// Returns `EntitleError::Validation` if `from` equals the target version.
    pub fn compute_for_customer(
        state: &CustomerState,
        from: u32,
        to: &Plan,
        now: DateTime<Utc>,
    ) -> Result<BillingPlan> {
        if from == to.version {
            return Err(EntitleError::Validation(format!(
                "plan {} is already at version {from}",
                to.id
            )));
        }
        to.validate()?;

        let mut plan = BillingPlan::default();
        for instance in state
            .instances
            .iter()
            .filter(|i| i.is_plan_version(&to.id, from) && !i.state.is_expired())
        {
            let grants = if instance.state.is_scheduled() {
                None
            } else {
                Some(regrant_all(instance, to, &state.entities, now)?)
            };
            plan.patch(
                instance.id,
                InstancePatch {
                    version: Some(to.version),
                    prices: Some(to.prices.clone()),
                    grants,
                    ..InstancePatch::default()
                },
            );
        }
        finish(state, plan)
    }
}
