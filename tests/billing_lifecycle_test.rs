use quotagate::client::test::MockStripeClient;
use quotagate::storage::test::InMemorySubscriptionStore;
use quotagate::webhook::test::sign_payload;
use quotagate::{
    AccountIdentity, CheckoutIssuer, Error, Plan, PlanCatalog, ResourceKind, StatusService,
    SubscriptionStatus, SubscriptionStore, UsageGate, WebhookReconciler,
};
use std::sync::Arc;

const WEBHOOK_SECRET: &str = "whsec_integration_secret";

struct TestIdentity;

#[async_trait::async_trait]
impl AccountIdentity for TestIdentity {
    async fn email(&self, account_id: &str) -> quotagate::Result<String> {
        Ok(format!("{account_id}@example.com"))
    }
}

struct Harness {
    store: Arc<InMemorySubscriptionStore>,
    gate: UsageGate<InMemorySubscriptionStore>,
    status: StatusService<InMemorySubscriptionStore>,
    checkout: CheckoutIssuer<InMemorySubscriptionStore, MockStripeClient, TestIdentity>,
    reconciler: WebhookReconciler<InMemorySubscriptionStore>,
}

fn harness() -> Harness {
    let store = Arc::new(InMemorySubscriptionStore::new());
    let catalog = PlanCatalog::new("price_basic", "price_premium");
    Harness {
        gate: UsageGate::new(Arc::clone(&store)),
        status: StatusService::new(Arc::clone(&store)),
        checkout: CheckoutIssuer::new(
            Arc::clone(&store),
            Arc::new(MockStripeClient::new()),
            Arc::new(TestIdentity),
            catalog.clone(),
            "https://app.example.com",
        ),
        reconciler: WebhookReconciler::new(Arc::clone(&store), WEBHOOK_SECRET, catalog),
        store,
    }
}

fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// Build, sign, and deliver a subscription event for the given customer.
async fn deliver_subscription_event(
    harness: &Harness,
    event_id: &str,
    event_type: &str,
    customer_id: &str,
    price: &str,
    status: &str,
    period_start: u64,
) -> quotagate::WebhookOutcome {
    let payload = serde_json::json!({
        "id": event_id,
        "type": event_type,
        "created": now(),
        "data": {"object": {
            "id": "sub_1",
            "customer": customer_id,
            "status": status,
            "current_period_start": period_start,
            "current_period_end": period_start + 2_592_000,
            "cancel_at_period_end": false,
            "items": {"data": [{"price": {"id": price}}]}
        }}
    })
    .to_string();

    let header = sign_payload(WEBHOOK_SECRET, payload.as_bytes(), now() as i64);
    let event = harness
        .reconciler
        .verify_signature(payload.as_bytes(), &header)
        .unwrap();
    harness.reconciler.handle_event(event).await.unwrap()
}

#[tokio::test]
async fn test_free_tier_lifecycle_without_checkout() {
    let harness = harness();

    // A brand-new account gets free-tier quota on first use.
    for _ in 0..2 {
        harness
            .gate
            .record_usage("acct_1", ResourceKind::Profile)
            .await
            .unwrap();
    }

    let check = harness
        .gate
        .check_usage("acct_1", ResourceKind::Profile)
        .await
        .unwrap();
    assert!(!check.allowed);
    assert!(check.needs_upgrade);

    let err = harness
        .gate
        .record_usage("acct_1", ResourceKind::Profile)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::QuotaExceeded { needs_upgrade: true, .. }));

    let view = harness.status.subscription_status("acct_1").await.unwrap();
    assert_eq!(view.plan, Plan::Free);
    assert_eq!(view.profiles.used, 2);
    assert_eq!(view.proposals.used, 0);
}

#[tokio::test]
async fn test_checkout_then_activation_raises_limits() {
    let harness = harness();

    // Use up the free profile quota first.
    harness
        .gate
        .record_usage("acct_1", ResourceKind::Profile)
        .await
        .unwrap();
    harness
        .gate
        .record_usage("acct_1", ResourceKind::Profile)
        .await
        .unwrap();

    // Checkout links a provider customer but changes nothing else.
    let outcome = harness
        .checkout
        .create_session("acct_1", Plan::Premium)
        .await
        .unwrap();
    assert!(!outcome.url.is_empty());

    let record = harness.store.get("acct_1").await.unwrap().unwrap();
    let customer_id = record.stripe_customer_id.clone().unwrap();
    assert_eq!(record.plan, Plan::Free);

    // Provider confirms the subscription; limits jump, counters survive.
    let outcome = deliver_subscription_event(
        &harness,
        "evt_1",
        "customer.subscription.created",
        &customer_id,
        "price_premium",
        "active",
        1_700_000_000,
    )
    .await;
    assert_eq!(outcome, quotagate::WebhookOutcome::Applied);

    let view = harness.status.subscription_status("acct_1").await.unwrap();
    assert_eq!(view.plan, Plan::Premium);
    assert_eq!(view.status, SubscriptionStatus::Active);
    assert_eq!(view.profiles.used, 2);
    assert_eq!(view.profiles.limit, 10);
    assert_eq!(view.proposals.limit, 50);

    // The third profile that was blocked on free tier now goes through.
    harness
        .gate
        .record_usage("acct_1", ResourceKind::Profile)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_downgrade_leaves_account_over_quota() {
    let harness = harness();

    harness.checkout.create_session("acct_1", Plan::Premium).await.unwrap();
    let customer_id = harness
        .store
        .get("acct_1")
        .await
        .unwrap()
        .unwrap()
        .stripe_customer_id
        .unwrap();

    deliver_subscription_event(
        &harness,
        "evt_1",
        "customer.subscription.created",
        &customer_id,
        "price_premium",
        "active",
        1_700_000_000,
    )
    .await;

    // Burn through more than the free tier would ever allow.
    for _ in 0..7 {
        harness
            .gate
            .record_usage("acct_1", ResourceKind::Profile)
            .await
            .unwrap();
    }

    // Subscription ends; the account reverts to free limits over-quota.
    let payload = serde_json::json!({
        "id": "evt_del",
        "type": "customer.subscription.deleted",
        "created": now(),
        "data": {"object": {"id": "sub_1", "customer": customer_id}}
    })
    .to_string();
    let header = sign_payload(WEBHOOK_SECRET, payload.as_bytes(), now() as i64);
    let event = harness
        .reconciler
        .verify_signature(payload.as_bytes(), &header)
        .unwrap();
    assert_eq!(
        harness.reconciler.handle_event(event).await.unwrap(),
        quotagate::WebhookOutcome::Applied
    );

    let view = harness.status.subscription_status("acct_1").await.unwrap();
    assert_eq!(view.plan, Plan::Free);
    assert_eq!(view.status, SubscriptionStatus::Cancelled);
    assert_eq!(view.profiles.used, 7);
    assert_eq!(view.profiles.limit, 2);

    // Over-quota accounts cannot create more until they upgrade again.
    let check = harness
        .gate
        .check_usage("acct_1", ResourceKind::Profile)
        .await
        .unwrap();
    assert!(!check.allowed);
    assert!(check.needs_upgrade);
    assert!(harness
        .gate
        .record_usage("acct_1", ResourceKind::Profile)
        .await
        .is_err());
}

#[tokio::test]
async fn test_past_due_keeps_plan_limits() {
    let harness = harness();

    harness.checkout.create_session("acct_1", Plan::Basic).await.unwrap();
    let customer_id = harness
        .store
        .get("acct_1")
        .await
        .unwrap()
        .unwrap()
        .stripe_customer_id
        .unwrap();

    deliver_subscription_event(
        &harness,
        "evt_1",
        "customer.subscription.created",
        &customer_id,
        "price_basic",
        "active",
        1_700_000_000,
    )
    .await;

    let payload = serde_json::json!({
        "id": "evt_fail",
        "type": "invoice.payment_failed",
        "created": now(),
        "data": {"object": {"id": "in_1", "customer": customer_id}}
    })
    .to_string();
    let header = sign_payload(WEBHOOK_SECRET, payload.as_bytes(), now() as i64);
    let event = harness
        .reconciler
        .verify_signature(payload.as_bytes(), &header)
        .unwrap();
    harness.reconciler.handle_event(event).await.unwrap();

    // Past due downgrades nothing; limits stay at the paid tier until the
    // provider cancels the subscription.
    let view = harness.status.subscription_status("acct_1").await.unwrap();
    assert_eq!(view.status, SubscriptionStatus::PastDue);
    assert_eq!(view.plan, Plan::Basic);
    assert_eq!(view.proposals.limit, 15);
    harness
        .gate
        .record_usage("acct_1", ResourceKind::Proposal)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_out_of_order_renewal_events() {
    let harness = harness();

    harness.checkout.create_session("acct_1", Plan::Basic).await.unwrap();
    let customer_id = harness
        .store
        .get("acct_1")
        .await
        .unwrap()
        .unwrap()
        .stripe_customer_id
        .unwrap();

    // Renewal for the new period arrives first.
    deliver_subscription_event(
        &harness,
        "evt_new",
        "customer.subscription.updated",
        &customer_id,
        "price_premium",
        "active",
        1_702_592_000,
    )
    .await;

    // The delayed event from the old period must not roll state back.
    let outcome = deliver_subscription_event(
        &harness,
        "evt_old",
        "customer.subscription.updated",
        &customer_id,
        "price_basic",
        "active",
        1_700_000_000,
    )
    .await;
    assert_eq!(outcome, quotagate::WebhookOutcome::Ignored);

    let view = harness.status.subscription_status("acct_1").await.unwrap();
    assert_eq!(view.plan, Plan::Premium);
}

#[tokio::test]
async fn test_concurrent_usage_and_webhook_reconciliation() {
    let harness = harness();

    harness.checkout.create_session("acct_1", Plan::Basic).await.unwrap();
    let customer_id = harness
        .store
        .get("acct_1")
        .await
        .unwrap()
        .unwrap()
        .stripe_customer_id
        .unwrap();
    deliver_subscription_event(
        &harness,
        "evt_1",
        "customer.subscription.created",
        &customer_id,
        "price_basic",
        "active",
        1_700_000_000,
    )
    .await;

    // Usage recording races a plan upgrade; no increments may be lost and
    // the counter may never pass the limit in force when it commits.
    let mut handles = Vec::new();
    for _ in 0..10 {
        let gate = harness.gate.clone();
        handles.push(tokio::spawn(async move {
            gate.record_usage("acct_1", ResourceKind::Proposal).await
        }));
    }

    // Under heavy counter churn the reconciler may exhaust its save retries
    // and report a conflict; the provider responds by redelivering, which
    // dedup permits because the event was never marked processed.
    let payload = serde_json::json!({
        "id": "evt_2",
        "type": "customer.subscription.updated",
        "created": now(),
        "data": {"object": {
            "id": "sub_1",
            "customer": customer_id,
            "status": "active",
            "current_period_start": 1_700_000_100u64,
            "current_period_end": 1_702_592_100u64,
            "cancel_at_period_end": false,
            "items": {"data": [{"price": {"id": "price_premium"}}]}
        }}
    })
    .to_string();
    let header = sign_payload(WEBHOOK_SECRET, payload.as_bytes(), now() as i64);
    let upgrade = loop {
        let event = harness
            .reconciler
            .verify_signature(payload.as_bytes(), &header)
            .unwrap();
        match harness.reconciler.handle_event(event).await {
            Ok(outcome) => break outcome,
            Err(Error::Conflict(_)) => continue,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    };
    assert_eq!(upgrade, quotagate::WebhookOutcome::Applied);

    let mut applied = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            applied += 1;
        }
    }

    let record = harness.store.get("acct_1").await.unwrap().unwrap();
    assert_eq!(record.proposals_used, applied);
    assert!(record.proposals_used <= record.proposals_limit);
    assert_eq!(record.plan, Plan::Premium);
}
