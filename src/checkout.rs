//! Hosted checkout session issuance.
//!
//! The [`CheckoutIssuer`] turns "account X wants plan Y" into a provider
//! checkout URL. It reuses the account's provider customer when one exists,
//! creates and persists one when it doesn't, and never writes subscription
//! state beyond the customer link; activation happens only when the webhook
//! reconciler sees the provider confirm it.

use crate::client::{CreateCheckoutRequest, CreateCustomerRequest, StripeClient};
use crate::error::{Error, Result};
use crate::plans::{Plan, PlanCatalog};
use crate::storage::SubscriptionStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Retries for the customer-link compare-and-save before giving up.
const SAVE_RETRIES: u32 = 3;

/// Resolves an account id to the identity details the provider needs.
///
/// Implemented by the host application against its own user store.
#[async_trait]
pub trait AccountIdentity: Send + Sync {
    async fn email(&self, account_id: &str) -> Result<String>;

    /// Display name, if the account has one.
    async fn display_name(&self, account_id: &str) -> Result<Option<String>> {
        let _ = account_id;
        Ok(None)
    }
}

/// A checkout session ready for client redirect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutOutcome {
    pub session_id: String,
    pub url: String,
}

/// Issues hosted checkout sessions for plan purchases.
pub struct CheckoutIssuer<S, C, I> {
    store: Arc<S>,
    client: Arc<C>,
    identity: Arc<I>,
    catalog: PlanCatalog,
    frontend_url: String,
}

impl<S, C, I> CheckoutIssuer<S, C, I>
where
    S: SubscriptionStore,
    C: StripeClient,
    I: AccountIdentity,
{
    #[must_use]
    pub fn new(
        store: Arc<S>,
        client: Arc<C>,
        identity: Arc<I>,
        catalog: PlanCatalog,
        frontend_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            client,
            identity,
            catalog,
            frontend_url: frontend_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Create a checkout session for `account_id` to purchase `plan`.
    ///
    /// Only paid plans are purchasable; requesting [`Plan::Free`] is an
    /// invalid payload. The session carries the account id as metadata so
    /// the webhook reconciler can correlate the resulting events.
    pub async fn create_session(&self, account_id: &str, plan: Plan) -> Result<CheckoutOutcome> {
        let price_ref = self
            .catalog
            .price_ref_for(plan)
            .ok_or_else(|| {
                Error::invalid_payload(format!("plan {plan} cannot be purchased"))
            })?
            .to_string();

        let customer_id = self.ensure_customer(account_id).await?;

        let session = self
            .client
            .create_checkout_session(CreateCheckoutRequest {
                customer_id,
                price_ref,
                success_url: format!(
                    "{}/payment/success?session_id={{CHECKOUT_SESSION_ID}}",
                    self.frontend_url
                ),
                cancel_url: format!("{}/payment/cancel", self.frontend_url),
                account_id: account_id.to_string(),
            })
            .await?;

        tracing::info!(
            target: "quotagate",
            account_id,
            plan = plan.as_str(),
            session_id = %session.id,
            "checkout session created"
        );

        Ok(CheckoutOutcome {
            session_id: session.id,
            url: session.url,
        })
    }

    /// Return the account's provider customer id, creating one if needed.
    ///
    /// The customer link is persisted with compare-and-save; if a concurrent
    /// writer raced us, the record is reloaded and an already-written link
    /// from the other writer is reused rather than creating a duplicate.
    async fn ensure_customer(&self, account_id: &str) -> Result<String> {
        let mut record = self.store.get_or_create(account_id).await?;
        if let Some(customer_id) = record.stripe_customer_id.clone() {
            return Ok(customer_id);
        }

        let email = self.identity.email(account_id).await?;
        let name = self.identity.display_name(account_id).await?;
        let customer = self
            .client
            .create_customer(CreateCustomerRequest {
                email,
                name,
                account_id: account_id.to_string(),
            })
            .await?;

        for _ in 0..SAVE_RETRIES {
            let expected = record.version;
            let mut update = record.clone();
            update.stripe_customer_id = Some(customer.id.clone());
            if self.store.compare_and_save(&update, expected).await? {
                return Ok(customer.id);
            }

            record = self
                .store
                .get(account_id)
                .await?
                .ok_or_else(|| Error::not_found(format!("subscription for {account_id}")))?;
            if let Some(existing) = record.stripe_customer_id.clone() {
                // A concurrent checkout already linked a customer; use it.
                return Ok(existing);
            }
        }

        Err(Error::Conflict(format!(
            "could not persist customer link for {account_id}"
        )))
    }
}
