//! Quota enforcement for metered resources.
//!
//! The [`UsageGate`] answers two questions: "may this account create one more
//! of this resource?" ([`UsageGate::check_usage`]) and "commit one unit of
//! usage" ([`UsageGate::record_usage`]). The check is advisory only; the
//! record path is the enforcing one and is atomic at the store level, so
//! concurrent callers can never push a counter past its limit.
//!
//! # Example
//!
//! ```rust,ignore
//! use quotagate::{UsageGate, ResourceKind};
//!
//! let gate = UsageGate::new(store);
//!
//! let check = gate.check_usage("acct_1", ResourceKind::Profile).await?;
//! if !check.allowed {
//!     // surface check.needs_upgrade to the client
//! }
//!
//! // At creation time, enforce:
//! gate.record_usage("acct_1", ResourceKind::Profile).await?;
//! ```

use crate::error::{Error, Result};
use crate::plans::Plan;
use crate::storage::{ResourceKind, SubscriptionStore, UsageIncrement};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Result of an advisory quota check.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuotaCheck {
    /// Whether one more unit would fit under the limit.
    pub allowed: bool,
    /// Current counter value.
    pub used: u32,
    /// Current limit for this resource.
    pub limit: u32,
    /// Whether upgrading the plan would raise the limit.
    pub needs_upgrade: bool,
}

impl QuotaCheck {
    /// Units remaining before the limit.
    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.used)
    }
}

/// Quota state for every metered resource at once.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageSnapshot {
    pub profiles: QuotaCheck,
    pub proposals: QuotaCheck,
}

/// Enforces per-account usage quotas against the subscription store.
pub struct UsageGate<S> {
    store: Arc<S>,
}

impl<S> Clone for UsageGate<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: SubscriptionStore> UsageGate<S> {
    /// Create a new usage gate.
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Advisory check: would one more unit of `kind` fit under the limit?
    ///
    /// Lazily creates a free-tier record for accounts that have never
    /// subscribed, so every account has a quota to check against. The answer
    /// may be stale by the time the caller acts on it; [`record_usage`] is
    /// the enforcing path.
    ///
    /// `needs_upgrade` is only set for free-tier accounts, where an upgrade
    /// is the remedy for a full quota.
    ///
    /// [`record_usage`]: UsageGate::record_usage
    pub async fn check_usage(&self, account_id: &str, kind: ResourceKind) -> Result<QuotaCheck> {
        let record = self.store.get_or_create(account_id).await?;
        let used = record.used(kind);
        let limit = record.limit(kind);
        let allowed = used < limit;

        Ok(QuotaCheck {
            allowed,
            used,
            limit,
            needs_upgrade: !allowed && record.plan == Plan::Free,
        })
    }

    /// Quota state for all resources in one read.
    pub async fn usage_snapshot(&self, account_id: &str) -> Result<UsageSnapshot> {
        let record = self.store.get_or_create(account_id).await?;
        let check = |kind: ResourceKind| {
            let used = record.used(kind);
            let limit = record.limit(kind);
            let allowed = used < limit;
            QuotaCheck {
                allowed,
                used,
                limit,
                needs_upgrade: !allowed && record.plan == Plan::Free,
            }
        };
        Ok(UsageSnapshot {
            profiles: check(ResourceKind::Profile),
            proposals: check(ResourceKind::Proposal),
        })
    }

    /// Commit one unit of usage for `kind`, enforcing the limit atomically.
    ///
    /// On success returns the updated counter. Returns
    /// [`Error::QuotaExceeded`] when the counter is already at the limit;
    /// nothing is written in that case.
    pub async fn record_usage(&self, account_id: &str, kind: ResourceKind) -> Result<QuotaCheck> {
        // Lazy creation keeps parity with check_usage: first-touch accounts
        // get free-tier quota instead of a not-found error.
        self.store.get_or_create(account_id).await?;

        match self.store.try_increment_usage(account_id, kind).await? {
            UsageIncrement::Applied { used, limit } => {
                tracing::debug!(
                    target: "quotagate",
                    account_id,
                    kind = kind.as_str(),
                    used,
                    limit,
                    "usage recorded"
                );
                Ok(QuotaCheck {
                    allowed: used < limit,
                    used,
                    limit,
                    needs_upgrade: false,
                })
            }
            UsageIncrement::LimitReached { used, limit } => {
                let record = self.store.get_or_create(account_id).await?;
                Err(Error::QuotaExceeded {
                    kind,
                    used,
                    limit,
                    needs_upgrade: record.plan == Plan::Free,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test::InMemorySubscriptionStore;
    use crate::storage::{SubscriptionRecord, SubscriptionStatus};

    fn gate() -> (UsageGate<InMemorySubscriptionStore>, Arc<InMemorySubscriptionStore>) {
        let store = Arc::new(InMemorySubscriptionStore::new());
        (UsageGate::new(Arc::clone(&store)), store)
    }

    #[tokio::test]
    async fn test_check_creates_free_tier_lazily() {
        let (gate, store) = gate();

        let check = gate
            .check_usage("acct_new", ResourceKind::Profile)
            .await
            .unwrap();
        assert!(check.allowed);
        assert_eq!(check.used, 0);
        assert_eq!(check.limit, 2);
        assert!(!check.needs_upgrade);

        let record = store.get("acct_new").await.unwrap().unwrap();
        assert_eq!(record.plan, Plan::Free);
        assert_eq!(record.status, SubscriptionStatus::Inactive);
    }

    #[tokio::test]
    async fn test_free_tier_profile_quota() {
        let (gate, _) = gate();

        // Free tier: 2 profiles.
        gate.record_usage("acct_1", ResourceKind::Profile)
            .await
            .unwrap();
        gate.record_usage("acct_1", ResourceKind::Profile)
            .await
            .unwrap();

        let check = gate
            .check_usage("acct_1", ResourceKind::Profile)
            .await
            .unwrap();
        assert!(!check.allowed);
        assert_eq!(check.used, 2);
        assert_eq!(check.limit, 2);
        assert!(check.needs_upgrade);
        assert_eq!(check.remaining(), 0);

        let err = gate
            .record_usage("acct_1", ResourceKind::Profile)
            .await
            .unwrap_err();
        match err {
            Error::QuotaExceeded {
                kind,
                used,
                limit,
                needs_upgrade,
            } => {
                assert_eq!(kind, ResourceKind::Profile);
                assert_eq!(used, 2);
                assert_eq!(limit, 2);
                assert!(needs_upgrade);
            }
            other => panic!("expected QuotaExceeded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_paid_plan_limit_hit_does_not_suggest_upgrade() {
        let (gate, store) = gate();
        let mut record = SubscriptionRecord::free_tier("acct_1");
        record.plan = Plan::Premium;
        record.status = SubscriptionStatus::Active;
        record.profiles_limit = 10;
        record.proposals_limit = 50;
        record.proposals_used = 50;
        store.seed(record);

        let check = gate
            .check_usage("acct_1", ResourceKind::Proposal)
            .await
            .unwrap();
        assert!(!check.allowed);
        assert!(!check.needs_upgrade);

        let err = gate
            .record_usage("acct_1", ResourceKind::Proposal)
            .await
            .unwrap_err();
        match err {
            Error::QuotaExceeded { needs_upgrade, .. } => assert!(!needs_upgrade),
            other => panic!("expected QuotaExceeded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_usage_snapshot_covers_both_resources() {
        let (gate, _) = gate();

        gate.record_usage("acct_1", ResourceKind::Profile)
            .await
            .unwrap();
        gate.record_usage("acct_1", ResourceKind::Profile)
            .await
            .unwrap();
        gate.record_usage("acct_1", ResourceKind::Proposal)
            .await
            .unwrap();

        let snapshot = gate.usage_snapshot("acct_1").await.unwrap();
        assert!(!snapshot.profiles.allowed);
        assert!(snapshot.profiles.needs_upgrade);
        assert_eq!(snapshot.profiles.used, 2);
        assert!(snapshot.proposals.allowed);
        assert_eq!(snapshot.proposals.used, 1);
        assert_eq!(snapshot.proposals.limit, 5);
    }

    #[tokio::test]
    async fn test_counters_are_independent() {
        let (gate, _) = gate();

        gate.record_usage("acct_1", ResourceKind::Profile)
            .await
            .unwrap();
        gate.record_usage("acct_1", ResourceKind::Profile)
            .await
            .unwrap();

        // Profiles exhausted; proposals unaffected.
        let proposals = gate
            .check_usage("acct_1", ResourceKind::Proposal)
            .await
            .unwrap();
        assert!(proposals.allowed);
        assert_eq!(proposals.used, 0);
        assert_eq!(proposals.limit, 5);
    }

    #[tokio::test]
    async fn test_concurrent_recording_never_exceeds_limit() {
        let (gate, store) = gate();
        let mut record = SubscriptionRecord::free_tier("acct_1");
        record.plan = Plan::Basic;
        record.profiles_limit = 5;
        record.proposals_limit = 15;
        store.seed(record);

        let mut handles = Vec::new();
        for _ in 0..20 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                gate.record_usage("acct_1", ResourceKind::Proposal).await
            }));
        }

        let mut ok = 0;
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => ok += 1,
                Err(Error::QuotaExceeded { .. }) => rejected += 1,
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }

        assert_eq!(ok, 15);
        assert_eq!(rejected, 5);

        let record = store.get("acct_1").await.unwrap().unwrap();
        assert_eq!(record.proposals_used, 15);
    }
}
