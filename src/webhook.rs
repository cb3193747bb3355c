//! Provider webhook verification and reconciliation.
//!
//! Webhooks are the only path through which subscription lifecycle state
//! (plan, status, billing period) changes. Processing is a fixed pipeline:
//! verify the signature, dedup by event id, classify, correlate to a local
//! record by provider customer reference, apply the enumerated fields, and
//! persist with compare-and-save.
//!
//! The webhook secret is held in a [`SecretString`] so it cannot leak through
//! debug output.

use crate::error::{Error, Result};
use crate::plans::PlanCatalog;
use crate::storage::{SubscriptionRecord, SubscriptionStatus, SubscriptionStore};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha2::Sha256;
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// Maximum accepted age of a webhook timestamp, in seconds.
const TIMESTAMP_TOLERANCE_SECS: i64 = 300;

/// Retries for the compare-and-save before giving up with a conflict.
const SAVE_RETRIES: u32 = 3;

/// Parsed webhook event envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    /// Provider event id, used for dedup.
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: WebhookEventData,
    /// Unix timestamp the provider created the event.
    pub created: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEventData {
    /// The provider object the event describes.
    pub object: serde_json::Value,
}

/// Outcome of webhook processing.
///
/// All three outcomes are acknowledged to the provider with success; only a
/// verification or persistence failure is reported as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// The event changed (or confirmed) local state and was marked processed.
    Applied,
    /// The event was irrelevant, uncorrelatable, or stale; nothing changed.
    Ignored,
    /// The event id was seen before; nothing changed.
    AlreadyProcessed,
}

/// Verifies and applies provider webhook events.
pub struct WebhookReconciler<S> {
    store: Arc<S>,
    webhook_secret: SecretString,
    catalog: PlanCatalog,
}

impl<S: SubscriptionStore> WebhookReconciler<S> {
    #[must_use]
    pub fn new(
        store: Arc<S>,
        webhook_secret: impl Into<SecretString>,
        catalog: PlanCatalog,
    ) -> Self {
        Self {
            store,
            webhook_secret: webhook_secret.into(),
            catalog,
        }
    }

    /// Verify the webhook signature and parse the event.
    ///
    /// The signature header has the form `t=<unix>,v1=<hex hmac>`; the HMAC
    /// covers `"{t}.{payload}"`. Timestamps older than five minutes are
    /// rejected to bound replay. Comparison is constant-time.
    ///
    /// Verification failures leave no trace in the store; a replayed payload
    /// with a bad signature must not poison dedup state for the real event.
    pub fn verify_signature(&self, payload: &[u8], signature: &str) -> Result<WebhookEvent> {
        let parts = parse_signature_header(signature)?;

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0) as i64;
        if (now - parts.timestamp).abs() > TIMESTAMP_TOLERANCE_SECS {
            return Err(Error::InvalidSignature);
        }

        let signed_payload = format!("{}.{}", parts.timestamp, String::from_utf8_lossy(payload));
        let expected = compute_signature(
            self.webhook_secret.expose_secret(),
            signed_payload.as_bytes(),
        )?;

        let expected_bytes =
            hex::decode(&expected).map_err(|e| Error::Other(anyhow::anyhow!(e)))?;
        let provided_bytes = hex::decode(&parts.signature).map_err(|_| Error::InvalidSignature)?;

        if expected_bytes.ct_eq(&provided_bytes).unwrap_u8() != 1 {
            return Err(Error::InvalidSignature);
        }

        serde_json::from_slice(payload).map_err(|e| {
            tracing::warn!(
                target: "quotagate",
                error = %e,
                "failed to parse webhook payload"
            );
            Error::invalid_payload("malformed webhook payload")
        })
    }

    /// Process a verified event: dedup, classify, correlate, apply.
    ///
    /// Only [`WebhookOutcome::Applied`] events are marked processed, so an
    /// event ignored for a transient reason (e.g. its checkout raced the
    /// customer-link write) can be redelivered and applied later.
    pub async fn handle_event(&self, event: WebhookEvent) -> Result<WebhookOutcome> {
        if self.store.is_event_processed(&event.id).await? {
            tracing::debug!(
                target: "quotagate",
                event_id = %event.id,
                "duplicate webhook event skipped"
            );
            return Ok(WebhookOutcome::AlreadyProcessed);
        }

        let outcome = match event.event_type.as_str() {
            "customer.subscription.created" | "customer.subscription.updated" => {
                self.apply_subscription_update(&event).await?
            }
            "customer.subscription.deleted" => self.apply_subscription_deleted(&event).await?,
            "invoice.payment_failed" => self.apply_payment_failed(&event).await?,
            // No state transition: the matching subscription.updated event
            // carries the authoritative period and status changes.
            "invoice.payment_succeeded" => WebhookOutcome::Applied,
            other => {
                tracing::debug!(
                    target: "quotagate",
                    event_id = %event.id,
                    event_type = other,
                    "webhook event type not handled"
                );
                WebhookOutcome::Ignored
            }
        };

        if outcome == WebhookOutcome::Applied {
            self.store.mark_event_processed(&event.id).await?;
        }

        Ok(outcome)
    }

    /// Apply a subscription created/updated event.
    async fn apply_subscription_update(&self, event: &WebhookEvent) -> Result<WebhookOutcome> {
        let data = SubscriptionEventData::parse(&event.data.object)?;

        let Some(record) = self.find_by_customer(&event.id, &data.customer_id).await? else {
            return Ok(WebhookOutcome::Ignored);
        };

        let plan = self.catalog.plan_for_price_ref(data.price_ref.as_deref().unwrap_or(""));
        let limits = plan.limits();
        let status = SubscriptionStatus::from_provider(&data.status);

        // Out-of-order delivery guard: an update describing an older billing
        // period than the one on record must not clobber newer state. The
        // check runs inside the save loop, against the record the save will
        // compare against, so a newer update committing concurrently cannot
        // be rolled back after an earlier snapshot passed the check.
        let applied = self
            .persist_if(&record.account_id, |record| {
                if let (Some(incoming), Some(stored)) =
                    (data.current_period_start, record.current_period_start)
                {
                    if incoming < stored {
                        return false;
                    }
                }
                record.plan = plan;
                record.status = status;
                record.stripe_subscription_id = Some(data.subscription_id.clone());
                record.stripe_price_id = data.price_ref.clone();
                record.current_period_start = data.current_period_start;
                record.current_period_end = data.current_period_end;
                record.cancel_at_period_end = if data.cancel_at_period_end {
                    data.current_period_end
                } else {
                    None
                };
                record.profiles_limit = limits.profiles;
                record.proposals_limit = limits.proposals;
                true
            })
            .await?;

        if !applied {
            tracing::warn!(
                target: "quotagate",
                event_id = %event.id,
                account_id = %record.account_id,
                incoming_period_start = data.current_period_start,
                "stale subscription update discarded"
            );
            return Ok(WebhookOutcome::Ignored);
        }

        tracing::info!(
            target: "quotagate",
            event_id = %event.id,
            account_id = %record.account_id,
            plan = plan.as_str(),
            status = status.as_str(),
            "subscription state reconciled"
        );

        Ok(WebhookOutcome::Applied)
    }

    /// Apply a subscription deleted event.
    ///
    /// The account drops to cancelled free tier with free limits. Usage
    /// counters are untouched, so an account that used more than the free
    /// quota while paid is simply over limit until it upgrades again.
    async fn apply_subscription_deleted(&self, event: &WebhookEvent) -> Result<WebhookOutcome> {
        let customer_id = require_str(&event.data.object, "customer")?;

        let Some(record) = self.find_by_customer(&event.id, customer_id).await? else {
            return Ok(WebhookOutcome::Ignored);
        };

        let free = SubscriptionRecord::free_tier("");
        self.persist(&record.account_id, |record| {
            record.plan = free.plan;
            record.status = SubscriptionStatus::Cancelled;
            record.stripe_subscription_id = None;
            record.stripe_price_id = None;
            record.current_period_start = None;
            record.current_period_end = None;
            record.cancel_at_period_end = None;
            record.profiles_limit = free.profiles_limit;
            record.proposals_limit = free.proposals_limit;
        })
        .await?;

        tracing::info!(
            target: "quotagate",
            event_id = %event.id,
            account_id = %record.account_id,
            "subscription deleted; account reverted to free tier"
        );

        Ok(WebhookOutcome::Applied)
    }

    /// Apply an invoice.payment_failed event: mark past due, change nothing else.
    async fn apply_payment_failed(&self, event: &WebhookEvent) -> Result<WebhookOutcome> {
        let customer_id = require_str(&event.data.object, "customer")?;

        let Some(record) = self.find_by_customer(&event.id, customer_id).await? else {
            return Ok(WebhookOutcome::Ignored);
        };

        self.persist(&record.account_id, |record| {
            record.status = SubscriptionStatus::PastDue;
        })
        .await?;

        tracing::warn!(
            target: "quotagate",
            event_id = %event.id,
            account_id = %record.account_id,
            "payment failed; subscription marked past due"
        );

        Ok(WebhookOutcome::Applied)
    }

    /// Correlate an event to a local record; a miss is logged, not an error.
    async fn find_by_customer(
        &self,
        event_id: &str,
        customer_id: &str,
    ) -> Result<Option<SubscriptionRecord>> {
        let record = self.store.get_by_customer(customer_id).await?;
        if record.is_none() {
            // Expected for events about customers this deployment never
            // created (e.g. shared test-mode accounts).
            tracing::debug!(
                target: "quotagate",
                event_id,
                customer_id,
                "webhook event references unknown customer"
            );
        }
        Ok(record)
    }

    /// Apply `mutate` to the current record and save with compare-and-save,
    /// reloading and retrying on version conflict.
    async fn persist<F>(&self, account_id: &str, mutate: F) -> Result<()>
    where
        F: Fn(&mut SubscriptionRecord),
    {
        self.persist_if(account_id, |record| {
            mutate(record);
            true
        })
        .await
        .map(|_| ())
    }

    /// Like [`persist`](Self::persist), but the mutation sees the freshly
    /// loaded record on every attempt and may decline to write. Returns
    /// whether a write was committed; declining is not an error.
    async fn persist_if<F>(&self, account_id: &str, mutate: F) -> Result<bool>
    where
        F: Fn(&mut SubscriptionRecord) -> bool,
    {
        for _ in 0..SAVE_RETRIES {
            let current = self
                .store
                .get(account_id)
                .await?
                .ok_or_else(|| Error::not_found(format!("subscription for {account_id}")))?;
            let expected = current.version;
            let mut update = current;
            if !mutate(&mut update) {
                return Ok(false);
            }
            if self.store.compare_and_save(&update, expected).await? {
                return Ok(true);
            }
        }
        Err(Error::Conflict(format!(
            "could not persist webhook update for {account_id}"
        )))
    }
}

/// Fields this engine reads from a provider subscription object.
struct SubscriptionEventData {
    subscription_id: String,
    customer_id: String,
    status: String,
    price_ref: Option<String>,
    current_period_start: Option<u64>,
    current_period_end: Option<u64>,
    cancel_at_period_end: bool,
}

impl SubscriptionEventData {
    fn parse(object: &serde_json::Value) -> Result<Self> {
        let subscription_id = require_str(object, "id")?.to_string();
        let customer_id = require_str(object, "customer")?.to_string();
        let status = object
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        // First line item's price is the plan price.
        let price_ref = object
            .get("items")
            .and_then(|v| v.get("data"))
            .and_then(|v| v.as_array())
            .and_then(|items| items.first())
            .and_then(|item| item.get("price"))
            .and_then(|price| price.get("id"))
            .and_then(|v| v.as_str())
            .map(String::from);

        Ok(Self {
            subscription_id,
            customer_id,
            status,
            price_ref,
            current_period_start: object.get("current_period_start").and_then(|v| v.as_u64()),
            current_period_end: object.get("current_period_end").and_then(|v| v.as_u64()),
            cancel_at_period_end: object
                .get("cancel_at_period_end")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        })
    }
}

fn require_str<'a>(object: &'a serde_json::Value, field: &str) -> Result<&'a str> {
    object
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::invalid_payload(format!("missing {field} in event object")))
}

/// Parsed signature header parts.
struct SignatureParts {
    timestamp: i64,
    signature: String,
}

fn parse_signature_header(header: &str) -> Result<SignatureParts> {
    let mut timestamp = None;
    let mut signature = None;

    for part in header.split(',') {
        let Some((key, value)) = part.split_once('=') else {
            return Err(Error::InvalidSignature);
        };
        match key.trim() {
            "t" => timestamp = value.parse().ok(),
            "v1" => signature = Some(value.to_string()),
            // Other scheme versions are ignored.
            _ => {}
        }
    }

    Ok(SignatureParts {
        timestamp: timestamp.ok_or(Error::InvalidSignature)?,
        signature: signature.ok_or(Error::InvalidSignature)?,
    })
}

fn compute_signature(secret: &str, payload: &[u8]) -> Result<String> {
    type HmacSha256 = Hmac<Sha256>;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::Other(anyhow::anyhow!("hmac key error: {e}")))?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[cfg(any(test, feature = "test-support"))]
pub mod test {
    /// Build a valid signature header for `payload` at `timestamp`.
    pub fn sign_payload(secret: &str, payload: &[u8], timestamp: i64) -> String {
        let signed = format!("{}.{}", timestamp, String::from_utf8_lossy(payload));
        let sig = super::compute_signature(secret, signed.as_bytes()).unwrap();
        format!("t={timestamp},v1={sig}")
    }
}
