//! HTTP surface for the billing engine.
//!
//! Exposes the webhook ingestion endpoint. The handler acknowledges every
//! verified event with 200 regardless of whether it was applied, ignored, or
//! a duplicate; only verification and persistence failures surface as error
//! statuses, which makes the provider retry.

use crate::error::{Error, Result};
use crate::storage::SubscriptionStore;
use crate::webhook::{WebhookOutcome, WebhookReconciler};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Json;
use axum::routing::post;
use axum::Router;
use serde::Serialize;
use std::sync::Arc;

/// Acknowledgement body returned to the provider.
#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    pub outcome: &'static str,
}

impl From<WebhookOutcome> for WebhookAck {
    fn from(outcome: WebhookOutcome) -> Self {
        Self {
            received: true,
            outcome: match outcome {
                WebhookOutcome::Applied => "applied",
                WebhookOutcome::Ignored => "ignored",
                WebhookOutcome::AlreadyProcessed => "already_processed",
            },
        }
    }
}

/// Build a router exposing `POST /webhook`.
///
/// Mount this into the application router under the billing prefix.
pub fn webhook_router<S>(reconciler: Arc<WebhookReconciler<S>>) -> Router
where
    S: SubscriptionStore + 'static,
{
    Router::new()
        .route("/webhook", post(handle_webhook::<S>))
        .with_state(reconciler)
}

/// Verify and process one webhook delivery.
///
/// The signature is verified against the raw body bytes before any JSON
/// parsing happens.
async fn handle_webhook<S>(
    State(reconciler): State<Arc<WebhookReconciler<S>>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>>
where
    S: SubscriptionStore,
{
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or(Error::InvalidSignature)?;

    let event = reconciler.verify_signature(&body, signature)?;
    let outcome = reconciler.handle_event(event).await?;
    Ok(Json(WebhookAck::from(outcome)))
}
