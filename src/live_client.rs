//! Production Stripe client over HTTPS.
//!
//! Talks to the Stripe REST API directly with form-encoded requests. Each
//! mutating call carries an idempotency key so a retried request cannot
//! create a duplicate customer or session.

use crate::client::{
    CheckoutSession, CreateCheckoutRequest, CreateCustomerRequest, Customer, StripeClient,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;

const API_BASE: &str = "https://api.stripe.com/v1";

/// Retries for transient provider failures (429 and 5xx).
const REQUEST_RETRIES: u32 = 2;

/// Stripe client backed by [`reqwest`].
pub struct LiveStripeClient {
    http: reqwest::Client,
    secret_key: SecretString,
    api_base: String,
}

impl LiveStripeClient {
    /// Create a client with the given API key (`sk_test_`, `sk_live_`, or a
    /// restricted `rk_` key).
    pub fn new(secret_key: impl Into<SecretString>) -> Result<Self> {
        let secret_key = secret_key.into();
        let key = secret_key.expose_secret();
        if !(key.starts_with("sk_test_") || key.starts_with("sk_live_") || key.starts_with("rk_"))
        {
            return Err(Error::Config(
                "Stripe secret key must start with sk_test_, sk_live_, or rk_".to_string(),
            ));
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            secret_key,
            api_base: API_BASE.to_string(),
        })
    }

    /// Point the client at a different API base (for test servers).
    #[cfg(any(test, feature = "test-support"))]
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    /// POST a form-encoded request, retrying transient failures.
    async fn post_form<T: serde::de::DeserializeOwned>(
        &self,
        operation: &'static str,
        path: &str,
        form: &[(String, String)],
    ) -> Result<T> {
        let url = format!("{}{path}", self.api_base);
        let idempotency_key = uuid::Uuid::new_v4().to_string();

        let mut attempt = 0;
        loop {
            let response = self
                .http
                .post(&url)
                .bearer_auth(self.secret_key.expose_secret())
                .header("Idempotency-Key", &idempotency_key)
                .form(form)
                .send()
                .await;

            match response {
                Ok(response) if response.status().is_success() => {
                    return Ok(response.json::<T>().await?);
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    let message = parse_api_error(response).await;
                    let err = Error::Provider {
                        operation: operation.to_string(),
                        message,
                        status: Some(status),
                    };
                    if attempt < REQUEST_RETRIES && err.is_retryable() {
                        attempt += 1;
                        tracing::warn!(
                            target: "quotagate",
                            operation,
                            status,
                            attempt,
                            "provider request failed, retrying"
                        );
                        tokio::time::sleep(backoff(attempt)).await;
                        continue;
                    }
                    return Err(err);
                }
                Err(e) => {
                    if attempt < REQUEST_RETRIES && (e.is_timeout() || e.is_connect()) {
                        attempt += 1;
                        tracing::warn!(
                            target: "quotagate",
                            operation,
                            error = %e,
                            attempt,
                            "provider request errored, retrying"
                        );
                        tokio::time::sleep(backoff(attempt)).await;
                        continue;
                    }
                    return Err(Error::Provider {
                        operation: operation.to_string(),
                        message: e.to_string(),
                        status: None,
                    });
                }
            }
        }
    }
}

/// Exponential backoff with a small jitter so concurrent retries spread out.
fn backoff(attempt: u32) -> Duration {
    let base = 250 * u64::from(2_u32.saturating_pow(attempt - 1));
    let jitter = u64::from(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0),
    ) % 100;
    Duration::from_millis(base + jitter)
}

/// Pull the human-readable message out of a Stripe error response.
async fn parse_api_error(response: reqwest::Response) -> String {
    #[derive(Deserialize)]
    struct ApiErrorBody {
        error: ApiError,
    }
    #[derive(Deserialize)]
    struct ApiError {
        message: Option<String>,
        #[serde(rename = "type")]
        error_type: Option<String>,
    }

    match response.json::<ApiErrorBody>().await {
        Ok(body) => body
            .error
            .message
            .or(body.error.error_type)
            .unwrap_or_else(|| "unknown provider error".to_string()),
        Err(_) => "unparseable provider error response".to_string(),
    }
}

#[derive(Deserialize)]
struct CustomerResponse {
    id: String,
    email: Option<String>,
}

#[derive(Deserialize)]
struct SessionResponse {
    id: String,
    url: Option<String>,
}

#[async_trait]
impl StripeClient for LiveStripeClient {
    async fn create_customer(&self, request: CreateCustomerRequest) -> Result<Customer> {
        let mut form = vec![
            ("email".to_string(), request.email.clone()),
            ("metadata[account_id]".to_string(), request.account_id),
        ];
        if let Some(name) = request.name {
            form.push(("name".to_string(), name));
        }

        let customer: CustomerResponse = self
            .post_form("create_customer", "/customers", &form)
            .await?;

        Ok(Customer {
            id: customer.id,
            email: customer.email.unwrap_or(request.email),
        })
    }

    async fn create_checkout_session(
        &self,
        request: CreateCheckoutRequest,
    ) -> Result<CheckoutSession> {
        let form = vec![
            ("mode".to_string(), "subscription".to_string()),
            ("customer".to_string(), request.customer_id),
            ("line_items[0][price]".to_string(), request.price_ref),
            ("line_items[0][quantity]".to_string(), "1".to_string()),
            ("success_url".to_string(), request.success_url),
            ("cancel_url".to_string(), request.cancel_url),
            ("metadata[account_id]".to_string(), request.account_id),
        ];

        let session: SessionResponse = self
            .post_form("create_checkout_session", "/checkout/sessions", &form)
            .await?;

        let url = session.url.ok_or_else(|| Error::Provider {
            operation: "create_checkout_session".to_string(),
            message: "session response had no redirect URL".to_string(),
            status: None,
        })?;

        Ok(CheckoutSession {
            id: session.id,
            url,
        })
    }
}

impl std::fmt::Debug for LiveStripeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveStripeClient")
            .field("secret_key", &"[REDACTED]")
            .field("api_base", &self.api_base)
            .finish()
    }
}
