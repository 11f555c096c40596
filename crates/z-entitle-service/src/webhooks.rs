//! Processor webhooks.
//!
//! Subscription and invoice events are mapped to lifecycle events on every
//! instance linked to the subscription they name.

use serde::Deserialize;

use z_entitle_core::lifecycle::transition;
use z_entitle_core::{
    ActivateContext, BillingPlan, CancelContext, CancelMode, CancelPlanComputer, CustomerId,
    CustomerState, ExternalSubscriptionRef, InstanceId, InstancePatch, InstanceState,
    LifecycleEvent, SwitchPlanComputer, UncancelContext,
};

use crate::error::{Result, ServiceError};
use crate::orchestrator::{AppliedPlan, BillingOrchestrator};

/// Processor webhook payload.
#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    /// Event type.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event ID.
    pub id: String,
    /// Event data.
    pub data: WebhookData,
}

/// Event data container.
#[derive(Debug, Deserialize)]
pub struct WebhookData {
    /// Event object.
    pub object: serde_json::Value,
}

/// A processor event the lifecycle reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessorEvent {
    /// Subscription changed; only the pending-cancel flag matters here.
    SubscriptionUpdated {
        /// The subscription.
        external_ref: ExternalSubscriptionRef,
        /// Whether the subscription ends with its period.
        cancel_at_period_end: bool,
    },
    /// Subscription ended at the processor.
    SubscriptionDeleted {
        /// The subscription.
        external_ref: ExternalSubscriptionRef,
    },
    /// An invoice of the subscription was paid.
    InvoicePaid {
        /// The subscription.
        external_ref: ExternalSubscriptionRef,
    },
    /// Collecting an invoice of the subscription failed.
    InvoicePaymentFailed {
        /// The subscription.
        external_ref: ExternalSubscriptionRef,
    },
}

impl ProcessorEvent {
    /// Read an event from a webhook body.
    ///
    /// Returns `None` for event types the lifecycle ignores and for invoices
    /// without a subscription.
    ///
    /// # Errors
    ///
    /// Returns `InvalidWebhook` if the body is not a webhook payload or a
    /// handled event lacks its subscription id.
    pub fn parse(body: &str) -> Result<Option<Self>> {
        let payload: WebhookPayload =
            serde_json::from_str(body).map_err(|e| ServiceError::InvalidWebhook(e.to_string()))?;
        Self::from_payload(&payload)
    }

    /// Map a decoded payload to an event.
    ///
    /// # Errors
    ///
    /// See [`ProcessorEvent::parse`].
    pub fn from_payload(payload: &WebhookPayload) -> Result<Option<Self>> {
        let object = &payload.data.object;
        let event = match payload.event_type.as_str() {
            "customer.subscription.updated" => Self::SubscriptionUpdated {
                external_ref: subscription_ref(object, "id")?,
                cancel_at_period_end: object
                    .get("cancel_at_period_end")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false),
            },
            "customer.subscription.deleted" => Self::SubscriptionDeleted {
                external_ref: subscription_ref(object, "id")?,
            },
            "invoice.paid" | "invoice.payment_failed" => {
                if object.get("subscription").map_or(true, serde_json::Value::is_null) {
                    tracing::debug!(event_id = %payload.id, "invoice without subscription ignored");
                    return Ok(None);
                }
                let external_ref = subscription_ref(object, "subscription")?;
                if payload.event_type == "invoice.paid" {
                    Self::InvoicePaid { external_ref }
                } else {
                    Self::InvoicePaymentFailed { external_ref }
                }
            }
            _ => {
                tracing::debug!(
                    event_type = %payload.event_type,
                    event_id = %payload.id,
                    "Unhandled webhook event type"
                );
                return Ok(None);
            }
        };
        Ok(Some(event))
    }

    /// The subscription the event is about.
    #[must_use]
    pub const fn external_ref(&self) -> &ExternalSubscriptionRef {
        match self {
            Self::SubscriptionUpdated { external_ref, .. }
            | Self::SubscriptionDeleted { external_ref }
            | Self::InvoicePaid { external_ref }
            | Self::InvoicePaymentFailed { external_ref } => external_ref,
        }
    }

    /// Short name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::SubscriptionUpdated { .. } => "subscription_updated",
            Self::SubscriptionDeleted { .. } => "subscription_deleted",
            Self::InvoicePaid { .. } => "invoice_paid",
            Self::InvoicePaymentFailed { .. } => "invoice_payment_failed",
        }
    }
}

fn subscription_ref(object: &serde_json::Value, field: &str) -> Result<ExternalSubscriptionRef> {
    let id = object
        .get(field)
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| ServiceError::InvalidWebhook(format!("missing {field}")))?;
    ExternalSubscriptionRef::new(id).map_err(|e| ServiceError::InvalidWebhook(e.to_string()))
}

/// What handling one event changed.
#[derive(Debug, Clone, Default)]
pub struct WebhookOutcome {
    /// Customers owning the subscription.
    pub customers: Vec<CustomerId>,
    /// Plans applied, one per customer with changes.
    pub applied: Vec<AppliedPlan>,
}

impl BillingOrchestrator {
    /// Handle a raw webhook body.
    ///
    /// # Errors
    ///
    /// Returns `InvalidWebhook` for unreadable bodies, otherwise see
    /// [`BillingOrchestrator::handle_event`].
    pub async fn handle_webhook(&self, body: &str) -> Result<WebhookOutcome> {
        match ProcessorEvent::parse(body)? {
            Some(event) => self.handle_event(&event).await,
            None => Ok(WebhookOutcome::default()),
        }
    }

    /// Apply a processor event to every instance linked to its subscription.
    ///
    /// A deleted subscription expires its instances now. An instance with a
    /// successor scheduled behind it hands over to that successor early;
    /// otherwise the group's default takes over.
    ///
    /// Redelivered events find nothing left to change and apply nothing.
    ///
    /// # Errors
    ///
    /// Returns store errors, or the failure of the plan computed for the event.
    pub async fn handle_event(&self, event: &ProcessorEvent) -> Result<WebhookOutcome> {
        let mut customers: Vec<CustomerId> = self
            .store
            .find_links(event.external_ref())?
            .into_iter()
            .map(|(customer, _)| customer)
            .collect();
        customers.sort();
        customers.dedup();

        if customers.is_empty() {
            tracing::warn!(
                event = event.name(),
                external_ref = %event.external_ref(),
                "webhook for unknown subscription"
            );
        }

        let mut outcome = WebhookOutcome {
            customers: customers.clone(),
            applied: Vec::new(),
        };
        for customer in customers {
            let (_guards, state) = self.lock_customer(customer).await?;
            let plan = self.plan_for_event(&state, event)?;
            if plan.is_empty() {
                continue;
            }
            tracing::info!(
                customer_id = %customer,
                event = event.name(),
                external_ref = %event.external_ref(),
                "applying processor event"
            );
            outcome.applied.push(self.execute(&state, None, plan).await?);
        }
        Ok(outcome)
    }

    fn plan_for_event(&self, state: &CustomerState, event: &ProcessorEvent) -> Result<BillingPlan> {
        let now = self.clock.now();
        let linked: Vec<InstanceId> = state
            .links
            .iter()
            .filter(|l| &l.external_ref == event.external_ref())
            .map(|l| l.instance)
            .collect();

        let mut plan = BillingPlan::default();
        match event {
            ProcessorEvent::SubscriptionDeleted { .. } => {
                let catalog = self.catalog.read();
                let mut working = state.clone();
                for instance in &linked {
                    let current = working.instance(*instance)?;
                    if current.state.is_expired() {
                        continue;
                    }
                    let successor = working
                        .scheduled_in(current.entity, &current.group)
                        .find(|s| s.is_main())
                        .map(|s| s.id)
                        .filter(|_| {
                            working
                                .live_main(current.entity, &current.group)
                                .is_some_and(|live| live.id == current.id)
                        });
                    let mut step = match successor {
                        Some(scheduled) => SwitchPlanComputer::activate_successor(&ActivateContext {
                            state: &working,
                            catalog: &catalog,
                            scheduled,
                            now,
                        })?,
                        None => CancelPlanComputer::compute(&CancelContext {
                            state: &working,
                            catalog: &catalog,
                            instance: *instance,
                            mode: CancelMode::Immediately,
                            require_default: false,
                            now,
                        })?,
                    };
                    // The processor already ended the subscription and settles it.
                    step.line_items.clear();
                    step.cancel_subscriptions.clear();
                    working.instances = step.project(&working.instances)?;
                    working.links = step.project_links(&working.links);
                    plan = plan.merge(step);
                }
            }
            ProcessorEvent::SubscriptionUpdated {
                cancel_at_period_end,
                ..
            } => {
                let catalog = self.catalog.read();
                for instance in &linked {
                    let current = state.instance(*instance)?;
                    let step = match (current.state, *cancel_at_period_end) {
                        (InstanceState::Active, true) => {
                            CancelPlanComputer::compute(&CancelContext {
                                state,
                                catalog: &catalog,
                                instance: *instance,
                                mode: CancelMode::EndOfCycle,
                                require_default: false,
                                now,
                            })?
                        }
                        (InstanceState::Canceling { .. }, false) => {
                            CancelPlanComputer::uncancel(&UncancelContext {
                                state,
                                instance: *instance,
                                now,
                            })?
                        }
                        _ => continue,
                    };
                    plan = plan.merge(step);
                }
            }
            ProcessorEvent::InvoicePaid { .. } => {
                patch_states(state, &linked, &LifecycleEvent::PaymentRecovered, &mut plan);
            }
            ProcessorEvent::InvoicePaymentFailed { .. } => {
                patch_states(state, &linked, &LifecycleEvent::PaymentFailed { at: now }, &mut plan);
            }
        }
        Ok(plan)
    }
}

/// Move each linked instance through `event`; instances the event does not
/// apply to, or that it leaves unchanged, are skipped.
fn patch_states(
    state: &CustomerState,
    linked: &[InstanceId],
    event: &LifecycleEvent,
    plan: &mut BillingPlan,
) {
    for instance in state.instances.iter().filter(|i| linked.contains(&i.id)) {
        match transition(&instance.state, event) {
            Ok(next) if next != instance.state => {
                plan.patch(instance.id, InstancePatch::state(next));
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(
                    instance_id = %instance.id,
                    event = event.name(),
                    error = %e,
                    "lifecycle event skipped"
                );
            }
        }
    }
}
