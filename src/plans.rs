//! Plan catalog: the closed set of subscription tiers and their quotas.
//!
//! Quota limits and prices are fixed per tier; the only per-deployment input
//! is the mapping between tiers and the provider's price identifiers, which
//! comes from [`BillingConfig`](crate::config::BillingConfig) at startup.

use serde::{Deserialize, Serialize};

/// A subscription tier.
///
/// The variant set is closed; there is no dynamic plan registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    Free,
    Basic,
    Premium,
}

impl Plan {
    /// Quota limits for this tier.
    #[must_use]
    pub fn limits(&self) -> PlanLimits {
        match self {
            Self::Free => PlanLimits {
                profiles: 2,
                proposals: 5,
            },
            Self::Basic => PlanLimits {
                profiles: 5,
                proposals: 15,
            },
            Self::Premium => PlanLimits {
                profiles: 10,
                proposals: 50,
            },
        }
    }

    /// Monthly price in cents, for display purposes.
    #[must_use]
    pub fn monthly_price_cents(&self) -> u32 {
        match self {
            Self::Free => 0,
            Self::Basic => 2999,
            Self::Premium => 9999,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Basic => "basic",
            Self::Premium => "premium",
        }
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-tier quota limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanLimits {
    /// Maximum number of profiles.
    pub profiles: u32,
    /// Maximum number of proposals.
    pub proposals: u32,
}

/// Mapping between tiers and the provider's price identifiers.
///
/// Built once at startup from configuration; read-only afterwards.
#[derive(Debug, Clone)]
pub struct PlanCatalog {
    basic_price_ref: String,
    premium_price_ref: String,
}

impl PlanCatalog {
    #[must_use]
    pub fn new(basic_price_ref: impl Into<String>, premium_price_ref: impl Into<String>) -> Self {
        Self {
            basic_price_ref: basic_price_ref.into(),
            premium_price_ref: premium_price_ref.into(),
        }
    }

    /// The provider price identifier for a paid tier; `None` for free.
    #[must_use]
    pub fn price_ref_for(&self, plan: Plan) -> Option<&str> {
        match plan {
            Plan::Free => None,
            Plan::Basic => Some(&self.basic_price_ref),
            Plan::Premium => Some(&self.premium_price_ref),
        }
    }

    /// Resolve a provider price identifier back to a tier.
    ///
    /// Unknown identifiers map to [`Plan::Free`], matching how foreign or
    /// retired prices are treated on inbound webhook events.
    #[must_use]
    pub fn plan_for_price_ref(&self, price_ref: &str) -> Plan {
        if price_ref == self.basic_price_ref {
            Plan::Basic
        } else if price_ref == self.premium_price_ref {
            Plan::Premium
        } else {
            Plan::Free
        }
    }
}
