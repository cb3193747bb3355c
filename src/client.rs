//! Payment provider client abstraction.
//!
//! The engine talks to Stripe through the [`StripeClient`] trait so that
//! checkout flows can be driven by a mock in tests. The production
//! implementation lives in [`crate::live_client`].

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Request to create a provider customer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCustomerRequest {
    pub email: String,
    /// Display name, when the account has one.
    pub name: Option<String>,
    /// Internal account id, stored as provider metadata for correlation.
    pub account_id: String,
}

/// A provider customer reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    pub email: String,
}

/// Request to create a hosted checkout session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCheckoutRequest {
    pub customer_id: String,
    /// Provider price reference for the plan being purchased.
    pub price_ref: String,
    pub success_url: String,
    pub cancel_url: String,
    /// Internal account id, attached as session metadata.
    pub account_id: String,
}

/// A hosted checkout session the client should be redirected to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub url: String,
}

/// Trait for the provider operations the checkout flow needs.
#[async_trait]
pub trait StripeClient: Send + Sync {
    /// Create a customer at the provider.
    async fn create_customer(&self, request: CreateCustomerRequest) -> Result<Customer>;

    /// Create a hosted checkout session for a subscription purchase.
    async fn create_checkout_session(
        &self,
        request: CreateCheckoutRequest,
    ) -> Result<CheckoutSession>;
}

#[cfg(any(test, feature = "test-support"))]
pub mod test {
    use super::*;
    use crate::error::Error;
    use std::sync::{Arc, RwLock};

    /// Mock provider client for testing.
    ///
    /// Records every request and hands back deterministic-looking ids.
    /// Individual operations can be set to fail to exercise error paths.
    #[derive(Default, Clone)]
    pub struct MockStripeClient {
        inner: Arc<RwLock<MockState>>,
    }

    #[derive(Default)]
    struct MockState {
        customers: Vec<CreateCustomerRequest>,
        sessions: Vec<CreateCheckoutRequest>,
        fail_customers: bool,
        fail_sessions: bool,
    }

    impl MockStripeClient {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// All customer-creation requests seen so far.
        pub fn customer_requests(&self) -> Vec<CreateCustomerRequest> {
            self.inner.read().unwrap().customers.clone()
        }

        /// All checkout-session requests seen so far.
        pub fn session_requests(&self) -> Vec<CreateCheckoutRequest> {
            self.inner.read().unwrap().sessions.clone()
        }

        /// Make subsequent create_customer calls fail.
        pub fn fail_customer_creation(&self) {
            self.inner.write().unwrap().fail_customers = true;
        }

        /// Make subsequent create_checkout_session calls fail.
        pub fn fail_session_creation(&self) {
            self.inner.write().unwrap().fail_sessions = true;
        }
    }

    #[async_trait]
    impl StripeClient for MockStripeClient {
        async fn create_customer(&self, request: CreateCustomerRequest) -> Result<Customer> {
            let mut state = self.inner.write().unwrap();
            if state.fail_customers {
                return Err(Error::Provider {
                    operation: "create_customer".to_string(),
                    message: "mock failure".to_string(),
                    status: Some(500),
                });
            }
            let customer = Customer {
                id: format!("cus_mock_{}", state.customers.len() + 1),
                email: request.email.clone(),
            };
            state.customers.push(request);
            Ok(customer)
        }

        async fn create_checkout_session(
            &self,
            request: CreateCheckoutRequest,
        ) -> Result<CheckoutSession> {
            let mut state = self.inner.write().unwrap();
            if state.fail_sessions {
                return Err(Error::Provider {
                    operation: "create_checkout_session".to_string(),
                    message: "mock failure".to_string(),
                    status: Some(500),
                });
            }
            let n = state.sessions.len() + 1;
            let session = CheckoutSession {
                id: format!("cs_mock_{n}"),
                url: format!("https://checkout.example.com/cs_mock_{n}"),
            };
            state.sessions.push(request);
            Ok(session)
        }
    }
}
