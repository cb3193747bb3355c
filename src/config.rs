//! Billing configuration.
//!
//! All provider coordinates come from the environment. Secrets are wrapped
//! in [`SecretString`] immediately on load so they never appear in debug
//! output or logs.

use crate::error::{Error, Result};
use crate::plans::PlanCatalog;
use secrecy::SecretString;
use url::Url;

/// Configuration for the billing engine.
pub struct BillingConfig {
    /// Provider API key (`sk_...`).
    pub secret_key: SecretString,
    /// Webhook signing secret (`whsec_...`).
    pub webhook_secret: SecretString,
    /// Provider price reference for the basic plan.
    pub basic_price_ref: String,
    /// Provider price reference for the premium plan.
    pub premium_price_ref: String,
    /// Base URL of the frontend, for checkout redirect targets.
    pub frontend_url: String,
}

impl BillingConfig {
    /// Load configuration from environment variables.
    ///
    /// Required: `STRIPE_SECRET_KEY`, `STRIPE_WEBHOOK_SECRET`,
    /// `STRIPE_BASIC_PRICE_ID`, `STRIPE_PREMIUM_PRICE_ID`, `FRONTEND_URL`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through a key lookup function.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let require = |key: &str| -> Result<String> {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| Error::Config(format!("{key} is not set")))
        };

        let frontend_url = require("FRONTEND_URL")?;
        Url::parse(&frontend_url)
            .map_err(|e| Error::Config(format!("FRONTEND_URL is not a valid URL: {e}")))?;

        Ok(Self {
            secret_key: require("STRIPE_SECRET_KEY")?.into(),
            webhook_secret: require("STRIPE_WEBHOOK_SECRET")?.into(),
            basic_price_ref: require("STRIPE_BASIC_PRICE_ID")?,
            premium_price_ref: require("STRIPE_PREMIUM_PRICE_ID")?,
            frontend_url,
        })
    }

    /// Plan catalog built from the configured price references.
    #[must_use]
    pub fn catalog(&self) -> PlanCatalog {
        PlanCatalog::new(&self.basic_price_ref, &self.premium_price_ref)
    }
}

impl std::fmt::Debug for BillingConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BillingConfig")
            .field("secret_key", &"[REDACTED]")
            .field("webhook_secret", &"[REDACTED]")
            .field("basic_price_ref", &self.basic_price_ref)
            .field("premium_price_ref", &self.premium_price_ref)
            .field("frontend_url", &self.frontend_url)
            .finish()
    }
}
