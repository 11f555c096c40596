//! Plan lifecycle integration tests.

mod common;

use chrono::Duration;
use common::{attach, main_group, messages, plan_id, pro, t, test_config, TestHarness};
use rust_decimal_macros::dec;

use z_entitle_core::{CancelMode, FeatureItem, InstanceState, PlanFailure, SwitchTiming};
use z_entitle_service::{Intent, ServiceConfig, ServiceError, SubscriptionStatus};

// ============================================================================
// Attach
// ============================================================================

#[tokio::test]
async fn attach_default_plan_creates_no_processor_calls() {
    let harness = TestHarness::new();

    let free = harness.on_free().await;

    assert_eq!(free.plan.as_str(), "free");
    assert_eq!(free.state, InstanceState::Active);
    assert!(harness.processor.calls().is_empty());

    let balance = harness
        .orchestrator
        .balance(harness.customer, &messages(), None)
        .await
        .unwrap();
    assert_eq!(balance.granted, dec!(100));
    assert_eq!(balance.current, dec!(100));
}

#[tokio::test]
async fn attach_unknown_customer_fails() {
    let harness = TestHarness::new();

    let result = harness
        .orchestrator
        .apply(harness.customer, &main_group(), attach("free"))
        .await;

    assert!(matches!(result, Err(ServiceError::CustomerNotFound(_))));
}

#[tokio::test]
async fn attach_unknown_plan_fails() {
    let harness = TestHarness::new();
    harness.on_free().await;

    let result = harness
        .orchestrator
        .apply(harness.customer, &main_group(), attach("enterprise"))
        .await;

    assert!(matches!(result, Err(ServiceError::UnknownPlan { .. })));
}

#[tokio::test]
async fn attach_same_plan_is_rejected() {
    let harness = TestHarness::new();
    harness.on_free().await;

    let error = harness
        .orchestrator
        .apply(harness.customer, &main_group(), attach("free"))
        .await
        .unwrap_err();

    assert!(matches!(
        error.plan_failure(),
        Some(PlanFailure::SamePlan { .. })
    ));
}

#[tokio::test]
async fn upgrade_charges_and_subscribes() {
    let harness = TestHarness::new();

    let (pro, applied) = harness.on_pro().await;

    assert_eq!(pro.plan.as_str(), "pro");
    assert_eq!(applied.plan.total(), dec!(20));
    assert_eq!(applied.invoice_items.len(), 1);
    assert_eq!(applied.subscriptions.len(), 1);

    let free = harness.instance_of("free").unwrap();
    assert!(free.state.is_expired());

    let external_ref = &applied.subscriptions[0];
    let stored = harness.stored();
    assert_eq!(stored.refs_for(pro.id), vec![external_ref.clone()]);

    let subscription = harness.processor.subscription(external_ref).unwrap();
    assert_eq!(subscription.status, SubscriptionStatus::Active);
    assert_eq!(subscription.instances, vec![pro.id]);

    let items = harness.processor.invoice_items();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].1.amount, dec!(20));
    assert_eq!(items[0].1.currency, "usd");
}

#[tokio::test]
async fn mid_cycle_upgrade_prorates_and_keeps_subscription() {
    let harness = TestHarness::new();
    let (pro, first) = harness.on_pro().await;
    let external_ref = first.subscriptions[0].clone();

    harness.clock.set(t(4, 25));
    let applied = harness.apply(attach("premium")).await;

    // Half of pro back, half of premium charged.
    assert_eq!(applied.plan.total(), dec!(15));

    let premium = harness.live_main();
    assert_eq!(premium.plan.as_str(), "premium");
    assert_eq!(premium.billing_anchor, pro.billing_anchor);
    assert_eq!(harness.stored().refs_for(premium.id), vec![external_ref.clone()]);
    assert_eq!(
        harness.processor.subscription(&external_ref).unwrap().instances,
        vec![premium.id]
    );
    assert_eq!(harness.processor.calls_of("create_subscription").len(), 1);
}

// ============================================================================
// Downgrade and scheduled activation
// ============================================================================

#[tokio::test]
async fn downgrade_waits_for_cycle_end() {
    let harness = TestHarness::new();
    let (pro, _) = harness.on_pro().await;

    harness.clock.set(t(4, 12));
    let applied = harness.apply(attach("free")).await;
    assert!(applied.plan.line_items.is_empty());

    let stored = harness.stored();
    let current = stored.instance(pro.id).unwrap();
    assert_eq!(
        current.state,
        InstanceState::Canceling {
            canceled_at: t(4, 12),
            ends_at: t(5, 10),
        }
    );
    let group = main_group();
    let scheduled: Vec<_> = stored.scheduled_in(None, &group).collect();
    assert_eq!(scheduled.len(), 1);
    assert_eq!(scheduled[0].state, InstanceState::Scheduled { starts_at: t(5, 10) });
    assert!(scheduled[0].grants.is_empty());

    harness.clock.set(t(5, 9));
    assert!(harness
        .orchestrator
        .advance(harness.customer)
        .await
        .unwrap()
        .is_none());

    harness.clock.set(t(5, 10));
    let swept = harness.orchestrator.advance(harness.customer).await.unwrap();
    assert!(swept.is_some());

    let free = harness.live_main();
    assert_eq!(free.plan.as_str(), "free");
    assert!(!free.grants.is_empty());
    assert!(harness.stored().instance(pro.id).unwrap().state.is_expired());
}

#[tokio::test]
async fn forced_immediate_downgrade_credits_unused_time() {
    let harness = TestHarness::new();
    let (pro, _) = harness.on_pro().await;

    harness.clock.set(t(4, 25));
    let applied = harness
        .apply(Intent::Switch {
            instance: pro.id,
            plan: plan_id("free"),
            quantities: vec![],
            timing: Some(SwitchTiming::Immediate),
        })
        .await;

    assert_eq!(applied.plan.total(), dec!(-10));
    assert_eq!(harness.live_main().plan.as_str(), "free");
}

#[tokio::test]
async fn switching_to_an_already_scheduled_plan_fails() {
    let harness = TestHarness::new();
    let (pro, _) = harness.on_pro().await;
    harness.clock.set(t(4, 12));
    harness.apply(attach("free")).await;

    let error = harness
        .orchestrator
        .apply(
            harness.customer,
            &main_group(),
            Intent::Switch {
                instance: pro.id,
                plan: plan_id("free"),
                quantities: vec![],
                timing: None,
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(
        error.plan_failure(),
        Some(PlanFailure::SwitchAlreadyScheduled { .. })
    ));
}

// ============================================================================
// Cancel
// ============================================================================

#[tokio::test]
async fn cancel_end_of_cycle_then_uncancel() {
    let harness = TestHarness::new();
    let (pro, _) = harness.on_pro().await;

    harness.clock.set(t(4, 12));
    harness
        .apply(Intent::Cancel {
            instance: pro.id,
            mode: CancelMode::EndOfCycle,
            require_default: true,
        })
        .await;

    let status = harness
        .orchestrator
        .status(&harness.customer, pro.id)
        .unwrap();
    assert_eq!(status.status, "active");
    assert!(status.canceled);
    assert_eq!(status.ended_at, Some(t(5, 10)));

    // Repeating the cancel changes nothing.
    let repeated = harness
        .apply(Intent::Cancel {
            instance: pro.id,
            mode: CancelMode::EndOfCycle,
            require_default: true,
        })
        .await;
    assert!(repeated.plan.is_empty());

    harness.apply(Intent::Uncancel { instance: pro.id }).await;

    let stored = harness.stored();
    assert_eq!(stored.instance(pro.id).unwrap().state, InstanceState::Active);
    assert_eq!(stored.scheduled_in(None, &main_group()).count(), 0);
    assert!(!harness
        .orchestrator
        .status(&harness.customer, pro.id)
        .unwrap()
        .canceled);
}

#[tokio::test]
async fn cancel_immediately_refunds_and_falls_back_to_default() {
    let harness = TestHarness::new();
    let (pro, first) = harness.on_pro().await;
    let external_ref = first.subscriptions[0].clone();

    harness.clock.set(t(4, 25));
    let applied = harness
        .apply(Intent::Cancel {
            instance: pro.id,
            mode: CancelMode::Immediately,
            require_default: true,
        })
        .await;

    assert_eq!(applied.plan.total(), dec!(-10));
    assert_eq!(applied.canceled_subscriptions, vec![external_ref.clone()]);
    assert_eq!(
        harness.processor.subscription(&external_ref).unwrap().status,
        SubscriptionStatus::Canceled
    );

    let stored = harness.stored();
    assert!(stored.instance(pro.id).unwrap().state.is_expired());
    assert!(stored.refs_for(pro.id).is_empty());
    assert_eq!(harness.live_main().plan.as_str(), "free");

    let balance = harness
        .orchestrator
        .balance(harness.customer, &messages(), None)
        .await
        .unwrap();
    assert_eq!(balance.granted, dec!(100));
}

#[tokio::test]
async fn cancel_checks_the_locked_group() {
    let harness = TestHarness::new();
    let (pro, _) = harness.on_pro().await;

    let other = z_entitle_core::GroupId::new("extras").unwrap();
    let result = harness
        .orchestrator
        .apply(
            harness.customer,
            &other,
            Intent::Cancel {
                instance: pro.id,
                mode: CancelMode::Immediately,
                require_default: false,
            },
        )
        .await;

    assert!(matches!(result, Err(ServiceError::WrongGroup { .. })));
    assert_eq!(harness.live_main().id, pro.id);
}

// ============================================================================
// Sweep
// ============================================================================

#[tokio::test]
async fn past_due_instance_expires_after_grace() {
    let harness = TestHarness::new();
    let (pro, first) = harness.on_pro().await;
    let external_ref = first.subscriptions[0].clone();

    let body = format!(
        r#"{{"type": "invoice.payment_failed", "id": "evt_1",
            "data": {{"object": {{"id": "in_1", "subscription": "{external_ref}"}}}}}}"#
    );
    harness.orchestrator.handle_webhook(&body).await.unwrap();
    assert_eq!(
        harness.orchestrator.status(&harness.customer, pro.id).unwrap().status,
        "past_due"
    );

    harness.clock.advance(Duration::days(6));
    assert!(harness
        .orchestrator
        .advance(harness.customer)
        .await
        .unwrap()
        .is_none());

    harness.clock.advance(Duration::days(2));
    harness.orchestrator.advance(harness.customer).await.unwrap();

    assert!(harness.stored().instance(pro.id).unwrap().state.is_expired());
    assert_eq!(harness.live_main().plan.as_str(), "free");
    assert_eq!(
        harness.processor.subscription(&external_ref).unwrap().status,
        SubscriptionStatus::Canceled
    );
}

#[tokio::test]
async fn zero_grace_expires_past_due_at_the_next_sweep() {
    let harness = TestHarness::with_config(ServiceConfig {
        past_due_grace_days: 0,
        ..test_config()
    });
    let (pro, first) = harness.on_pro().await;
    let external_ref = first.subscriptions[0].clone();

    let body = format!(
        r#"{{"type": "invoice.payment_failed", "id": "evt_1",
            "data": {{"object": {{"id": "in_1", "subscription": "{external_ref}"}}}}}}"#
    );
    harness.orchestrator.handle_webhook(&body).await.unwrap();

    let swept = harness.orchestrator.advance(harness.customer).await.unwrap();
    assert!(swept.is_some());
    assert!(harness.stored().instance(pro.id).unwrap().state.is_expired());
    assert_eq!(harness.live_main().plan.as_str(), "free");
}

// ============================================================================
// Migration
// ============================================================================

#[tokio::test]
async fn migration_moves_instances_without_charging() {
    let harness = TestHarness::new();
    let (pro, _) = harness.on_pro().await;
    harness
        .orchestrator
        .track_usage(harness.customer, &messages(), None, dec!(40))
        .await
        .unwrap();

    let mut v2 = pro_v2();
    v2.features = vec![FeatureItem::new(
        messages(),
        dec!(600),
        Some(z_entitle_core::Cadence::monthly()),
    )];
    harness.orchestrator.publish_plan(v2).unwrap();

    let preview = harness
        .orchestrator
        .preview_migration(&plan_id("pro"), 1, 2)
        .await
        .unwrap();
    assert_eq!(preview.len(), 1);
    assert_eq!(preview[0].customer, harness.customer);
    assert_eq!(harness.live_main().version, 1);

    let invoices_before = harness.processor.invoice_items().len();
    let report = harness
        .orchestrator
        .migrate(&plan_id("pro"), 1, 2)
        .await
        .unwrap();

    assert_eq!(report.migrated, vec![harness.customer]);
    assert!(report.failed.is_empty());
    assert_eq!(harness.processor.invoice_items().len(), invoices_before);

    let migrated = harness.live_main();
    assert_eq!(migrated.id, pro.id);
    assert_eq!(migrated.version, 2);

    let balance = harness
        .orchestrator
        .balance(harness.customer, &messages(), None)
        .await
        .unwrap();
    assert_eq!(balance.granted, dec!(600));
    assert_eq!(balance.usage, dec!(40));
}

#[tokio::test]
async fn migration_to_unknown_version_fails() {
    let harness = TestHarness::new();
    harness.on_pro().await;

    let result = harness.orchestrator.migrate(&plan_id("pro"), 1, 9).await;

    assert!(matches!(result, Err(ServiceError::UnknownPlan { .. })));
}

fn pro_v2() -> z_entitle_core::Plan {
    z_entitle_core::Plan {
        version: 2,
        prices: vec![z_entitle_core::PriceTerm::fixed(
            "pro",
            dec!(25),
            z_entitle_core::Cadence::monthly(),
        )],
        ..pro()
    }
}
