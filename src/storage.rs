//! Storage trait for subscription state.
//!
//! Implement [`SubscriptionStore`] to persist subscription records to your
//! database. The trait exposes two write primitives with explicit atomicity
//! contracts: a guarded counter increment and a row-versioned
//! compare-and-save. An in-memory implementation is provided for testing.

use crate::error::{Error, Result};
use crate::plans::Plan;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Durable per-account subscription state.
///
/// Exactly one record per account; created lazily with free-tier defaults on
/// first use. `version` is the optimistic-lock token, bumped by the store on
/// every committed write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscriptionRecord {
    /// Owning account, immutable.
    pub account_id: String,
    pub plan: Plan,
    pub status: SubscriptionStatus,
    /// Provider customer reference; set on first checkout.
    pub stripe_customer_id: Option<String>,
    /// Provider subscription reference; set once a paid plan activates.
    pub stripe_subscription_id: Option<String>,
    pub stripe_price_id: Option<String>,
    /// Current billing period start (Unix timestamp).
    pub current_period_start: Option<u64>,
    /// Current billing period end (Unix timestamp).
    pub current_period_end: Option<u64>,
    /// When set, the timestamp at which the subscription will cancel.
    pub cancel_at_period_end: Option<u64>,
    pub profiles_used: u32,
    pub proposals_used: u32,
    pub profiles_limit: u32,
    pub proposals_limit: u32,
    /// Optimistic-lock token.
    pub version: u64,
}

impl SubscriptionRecord {
    /// A fresh free-tier record for an account that has never subscribed.
    #[must_use]
    pub fn free_tier(account_id: impl Into<String>) -> Self {
        let limits = Plan::Free.limits();
        Self {
            account_id: account_id.into(),
            plan: Plan::Free,
            status: SubscriptionStatus::Inactive,
            stripe_customer_id: None,
            stripe_subscription_id: None,
            stripe_price_id: None,
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: None,
            profiles_used: 0,
            proposals_used: 0,
            profiles_limit: limits.profiles,
            proposals_limit: limits.proposals,
            version: 0,
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == SubscriptionStatus::Active
    }

    #[must_use]
    pub fn is_past_due(&self) -> bool {
        self.status == SubscriptionStatus::PastDue
    }

    /// Current usage counter for a resource kind.
    #[must_use]
    pub fn used(&self, kind: ResourceKind) -> u32 {
        match kind {
            ResourceKind::Profile => self.profiles_used,
            ResourceKind::Proposal => self.proposals_used,
        }
    }

    /// Current quota limit for a resource kind.
    #[must_use]
    pub fn limit(&self, kind: ResourceKind) -> u32 {
        match kind {
            ResourceKind::Profile => self.profiles_limit,
            ResourceKind::Proposal => self.proposals_limit,
        }
    }
}

/// Subscription lifecycle status.
///
/// Written only by the webhook reconciler; application code reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// No paid subscription has ever activated.
    Inactive,
    /// Subscription is active and paid.
    Active,
    /// Subscription was cancelled; a fresh checkout is required to reactivate.
    Cancelled,
    /// Payment failed; subscription still exists but is past due.
    PastDue,
}

impl SubscriptionStatus {
    /// Map a provider-reported status string to the internal state.
    ///
    /// The table is fixed: anything unrecognized maps to `Inactive` rather
    /// than guessing at provider statuses this engine does not model.
    #[must_use]
    pub fn from_provider(status: &str) -> Self {
        match status {
            "active" => Self::Active,
            "canceled" => Self::Cancelled,
            "past_due" => Self::PastDue,
            _ => Self::Inactive,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Active => "active",
            Self::Cancelled => "cancelled",
            Self::PastDue => "past_due",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A metered resource kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Profile,
    Proposal,
}

impl ResourceKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Profile => "profile",
            Self::Proposal => "proposal",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "profile" => Ok(Self::Profile),
            "proposal" => Ok(Self::Proposal),
            other => Err(Error::invalid_payload(format!(
                "unknown resource kind: {other}"
            ))),
        }
    }
}

/// Outcome of an atomic guarded counter increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum UsageIncrement {
    /// The counter was incremented; `used` is the new value.
    Applied { used: u32, limit: u32 },
    /// The counter was already at the limit; nothing was written.
    LimitReached { used: u32, limit: u32 },
}

/// Trait for persisting subscription state.
///
/// # Atomicity contract
///
/// `try_increment_usage` and `compare_and_save` are the only write paths and
/// both must be atomic with respect to concurrent callers:
///
/// - `try_increment_usage` must be a single guarded read-modify-write, e.g.
///   `UPDATE subscriptions SET profiles_used = profiles_used + 1, version =
///   version + 1 WHERE account_id = $1 AND profiles_used < profiles_limit
///   RETURNING ...`. It must never commit `used > limit` and must never lose
///   a concurrent increment.
/// - `compare_and_save` must be a conditional write, e.g. `UPDATE ... WHERE
///   account_id = $1 AND version = $2`, returning whether a row matched. It
///   must bump `version` on success.
///
/// `get_or_create` must be an atomic upsert (`INSERT ... ON CONFLICT DO
/// NOTHING` then read) so two requests lazily creating the same account's
/// record cannot produce duplicates.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Load the record for an account.
    async fn get(&self, account_id: &str) -> Result<Option<SubscriptionRecord>>;

    /// Load the record linked to a provider customer reference.
    async fn get_by_customer(&self, customer_id: &str) -> Result<Option<SubscriptionRecord>>;

    /// Load the record for an account, creating free-tier defaults if absent.
    async fn get_or_create(&self, account_id: &str) -> Result<SubscriptionRecord>;

    /// Save `record` only if the stored version equals `expected_version`.
    ///
    /// Returns `Ok(false)` on version mismatch; the caller reloads and
    /// retries or gives up with a conflict error.
    async fn compare_and_save(
        &self,
        record: &SubscriptionRecord,
        expected_version: u64,
    ) -> Result<bool>;

    /// Atomically increment a usage counter, guarded by its limit.
    async fn try_increment_usage(
        &self,
        account_id: &str,
        kind: ResourceKind,
    ) -> Result<UsageIncrement>;

    // Webhook idempotency

    /// Check whether a webhook event has already been applied.
    async fn is_event_processed(&self, event_id: &str) -> Result<bool>;

    /// Record a webhook event as applied.
    async fn mark_event_processed(&self, event_id: &str) -> Result<()>;

    /// Drop dedup entries older than the given age (default: no-op).
    async fn cleanup_old_events(&self, _older_than_days: u32) -> Result<usize> {
        Ok(0)
    }
}

/// In-memory store for testing.
#[cfg(any(test, feature = "test-support"))]
pub mod test {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, RwLock};

    /// In-memory subscription store.
    ///
    /// All write operations take the single write lock for their full
    /// duration, so the atomicity contract holds by construction. Wraps data
    /// in `Arc` for cheap cloning into concurrent test tasks.
    #[derive(Default, Clone)]
    pub struct InMemorySubscriptionStore {
        inner: Arc<Inner>,
    }

    #[derive(Default)]
    struct Inner {
        records: RwLock<HashMap<String, SubscriptionRecord>>,
        processed_events: RwLock<HashMap<String, u64>>,
    }

    impl InMemorySubscriptionStore {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Seed a record directly, bypassing the upsert path (for tests).
        pub fn seed(&self, record: SubscriptionRecord) {
            self.inner
                .records
                .write()
                .unwrap()
                .insert(record.account_id.clone(), record);
        }

        /// All processed event ids (for test assertions).
        pub fn processed_events(&self) -> Vec<String> {
            self.inner
                .processed_events
                .read()
                .unwrap()
                .keys()
                .cloned()
                .collect()
        }
    }

    fn now_secs() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    #[async_trait]
    impl SubscriptionStore for InMemorySubscriptionStore {
        async fn get(&self, account_id: &str) -> Result<Option<SubscriptionRecord>> {
            Ok(self.inner.records.read().unwrap().get(account_id).cloned())
        }

        async fn get_by_customer(&self, customer_id: &str) -> Result<Option<SubscriptionRecord>> {
            let records = self.inner.records.read().unwrap();
            Ok(records
                .values()
                .find(|r| r.stripe_customer_id.as_deref() == Some(customer_id))
                .cloned())
        }

        async fn get_or_create(&self, account_id: &str) -> Result<SubscriptionRecord> {
            let mut records = self.inner.records.write().unwrap();
            Ok(records
                .entry(account_id.to_string())
                .or_insert_with(|| SubscriptionRecord::free_tier(account_id))
                .clone())
        }

        async fn compare_and_save(
            &self,
            record: &SubscriptionRecord,
            expected_version: u64,
        ) -> Result<bool> {
            let mut records = self.inner.records.write().unwrap();
            // Mirrors a conditional UPDATE: no row, no match, no write.
            let Some(current) = records.get(&record.account_id) else {
                return Ok(false);
            };
            if current.version != expected_version {
                return Ok(false);
            }
            let mut saved = record.clone();
            saved.version = expected_version + 1;
            records.insert(record.account_id.clone(), saved);
            Ok(true)
        }

        async fn try_increment_usage(
            &self,
            account_id: &str,
            kind: ResourceKind,
        ) -> Result<UsageIncrement> {
            let mut records = self.inner.records.write().unwrap();
            let record = records
                .get_mut(account_id)
                .ok_or_else(|| Error::not_found(format!("subscription for {account_id}")))?;

            let (used, limit) = match kind {
                ResourceKind::Profile => (&mut record.profiles_used, record.profiles_limit),
                ResourceKind::Proposal => (&mut record.proposals_used, record.proposals_limit),
            };

            if *used >= limit {
                return Ok(UsageIncrement::LimitReached { used: *used, limit });
            }

            *used += 1;
            let new_used = *used;
            record.version += 1;
            Ok(UsageIncrement::Applied {
                used: new_used,
                limit,
            })
        }

        async fn is_event_processed(&self, event_id: &str) -> Result<bool> {
            Ok(self
                .inner
                .processed_events
                .read()
                .unwrap()
                .contains_key(event_id))
        }

        async fn mark_event_processed(&self, event_id: &str) -> Result<()> {
            self.inner
                .processed_events
                .write()
                .unwrap()
                .insert(event_id.to_string(), now_secs());
            Ok(())
        }

        async fn cleanup_old_events(&self, older_than_days: u32) -> Result<usize> {
            let cutoff = now_secs().saturating_sub(u64::from(older_than_days) * 86400);
            let mut events = self.inner.processed_events.write().unwrap();
            let before = events.len();
            events.retain(|_, &mut ts| ts >= cutoff);
            Ok(before - events.len())
        }
    }
}
