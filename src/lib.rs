//! Quotagate - subscription lifecycle and usage metering for Stripe-billed SaaS
//!
//! Quotagate keeps a local, authoritative view of each account's subscription
//! (plan, status, billing period) and enforces per-plan usage quotas, with
//! Stripe as the payment processor of record.
//!
//! # Features
//!
//! - **Plan catalog**: fixed free/basic/premium tiers with per-resource limits
//! - **Usage gate**: advisory quota checks plus atomic, race-safe usage recording
//! - **Checkout**: hosted checkout session issuance with customer reuse
//! - **Webhooks**: signature verification, idempotency, and reconciliation of
//!   provider events into local state
//! - **Status**: read-only subscription summaries for clients
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use quotagate::{
//!     BillingConfig, LiveStripeClient, StatusService, UsageGate, WebhookReconciler,
//! };
//! use secrecy::ExposeSecret;
//! use std::sync::Arc;
//!
//! # async fn run(store: Arc<impl quotagate::SubscriptionStore + 'static>) -> anyhow::Result<()> {
//! quotagate::init_tracing();
//!
//! let config = BillingConfig::from_env()?;
//! let catalog = config.catalog();
//! let client = Arc::new(LiveStripeClient::new(
//!     config.secret_key.expose_secret(),
//! )?);
//!
//! let gate = UsageGate::new(Arc::clone(&store));
//! let status = StatusService::new(Arc::clone(&store));
//! let reconciler = Arc::new(WebhookReconciler::new(
//!     Arc::clone(&store),
//!     config.webhook_secret,
//!     catalog,
//! ));
//!
//! let app = quotagate::webhook_router(reconciler);
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//! axum::serve(listener, app).await?;
//! # Ok(())
//! # }
//! ```
//!
//! State changes follow one rule: usage counters move only through the usage
//! gate, and everything else (plan, status, period) moves only through the
//! webhook reconciler.

pub mod checkout;
pub mod client;
mod config;
mod error;
pub mod http;
pub mod live_client;
pub mod plans;
pub mod status;
pub mod storage;
pub mod usage;
pub mod webhook;

pub use checkout::{AccountIdentity, CheckoutIssuer, CheckoutOutcome};
pub use client::{
    CheckoutSession, CreateCheckoutRequest, CreateCustomerRequest, Customer, StripeClient,
};
pub use config::BillingConfig;
pub use error::{Error, ErrorBody, Result};
pub use http::webhook_router;
pub use live_client::LiveStripeClient;
pub use plans::{Plan, PlanCatalog, PlanLimits};
pub use status::{ResourceUsage, StatusService, SubscriptionStatusView};
pub use storage::{
    ResourceKind, SubscriptionRecord, SubscriptionStatus, SubscriptionStore, UsageIncrement,
};
pub use usage::{QuotaCheck, UsageGate, UsageSnapshot};
pub use webhook::{WebhookEvent, WebhookOutcome, WebhookReconciler};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing/logging with sensible defaults.
///
/// Call once early in `main()`.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Set log level (e.g., "info", "debug", "quotagate=debug")
/// - `QUOTAGATE_LOG_JSON`: Set to "true" for JSON formatted logs
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = std::env::var("QUOTAGATE_LOG_JSON")
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
