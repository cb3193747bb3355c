//! Read-only subscription status queries.
//!
//! Produces the client-facing summary of an account's plan, status, and
//! usage. Unlike the usage gate, querying status never creates a record;
//! accounts without one are reported with free-tier defaults.

use crate::error::Result;
use crate::plans::Plan;
use crate::storage::{SubscriptionRecord, SubscriptionStatus, SubscriptionStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Per-resource usage summary.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceUsage {
    pub used: u32,
    pub limit: u32,
}

/// Client-facing subscription summary.
///
/// Provider object ids are deliberately absent; clients get plan, status,
/// usage, and period information only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscriptionStatusView {
    pub plan: Plan,
    pub status: SubscriptionStatus,
    pub profiles: ResourceUsage,
    pub proposals: ResourceUsage,
    /// End of the current billing period (Unix timestamp), for paid plans.
    pub current_period_end: Option<u64>,
    /// Set when the subscription is scheduled to cancel at period end.
    pub cancel_at_period_end: Option<u64>,
}

impl From<&SubscriptionRecord> for SubscriptionStatusView {
    fn from(record: &SubscriptionRecord) -> Self {
        Self {
            plan: record.plan,
            status: record.status,
            profiles: ResourceUsage {
                used: record.profiles_used,
                limit: record.profiles_limit,
            },
            proposals: ResourceUsage {
                used: record.proposals_used,
                limit: record.proposals_limit,
            },
            current_period_end: record.current_period_end,
            cancel_at_period_end: record.cancel_at_period_end,
        }
    }
}

/// Answers subscription status queries.
pub struct StatusService<S> {
    store: Arc<S>,
}

impl<S: SubscriptionStore> StatusService<S> {
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Current subscription summary for an account.
    ///
    /// Accounts with no record yet are reported as inactive free tier with
    /// zero usage; no record is created by asking.
    pub async fn subscription_status(&self, account_id: &str) -> Result<SubscriptionStatusView> {
        match self.store.get(account_id).await? {
            Some(record) => Ok(SubscriptionStatusView::from(&record)),
            None => Ok(SubscriptionStatusView::from(&SubscriptionRecord::free_tier(
                account_id,
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test::InMemorySubscriptionStore;

    #[tokio::test]
    async fn test_unknown_account_reports_free_defaults_without_creating() {
        let store = Arc::new(InMemorySubscriptionStore::new());
        let service = StatusService::new(Arc::clone(&store));

        let view = service.subscription_status("acct_ghost").await.unwrap();
        assert_eq!(view.plan, Plan::Free);
        assert_eq!(view.status, SubscriptionStatus::Inactive);
        assert_eq!(view.profiles, ResourceUsage { used: 0, limit: 2 });
        assert_eq!(view.proposals, ResourceUsage { used: 0, limit: 5 });
        assert!(view.current_period_end.is_none());

        // Asking did not create a record.
        assert!(store.get("acct_ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_view_reflects_stored_record() {
        let store = Arc::new(InMemorySubscriptionStore::new());
        let mut record = SubscriptionRecord::free_tier("acct_1");
        record.plan = Plan::Basic;
        record.status = SubscriptionStatus::Active;
        record.profiles_limit = 5;
        record.proposals_limit = 15;
        record.profiles_used = 3;
        record.stripe_customer_id = Some("cus_1".to_string());
        record.current_period_end = Some(1_702_592_000);
        record.cancel_at_period_end = Some(1_702_592_000);
        store.seed(record);

        let service = StatusService::new(store);
        let view = service.subscription_status("acct_1").await.unwrap();
        assert_eq!(view.plan, Plan::Basic);
        assert_eq!(view.profiles, ResourceUsage { used: 3, limit: 5 });
        assert_eq!(view.current_period_end, Some(1_702_592_000));
        assert_eq!(view.cancel_at_period_end, Some(1_702_592_000));

        // Provider ids never appear in the serialized view.
        let json = serde_json::to_string(&view).unwrap();
        assert!(!json.contains("cus_1"));
    }
}
