use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::storage::ResourceKind;

/// The main error type for billing-engine operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    InvalidPayload(String),

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("{kind} limit reached ({used}/{limit})")]
    QuotaExceeded {
        kind: ResourceKind,
        used: u32,
        limit: u32,
        needs_upgrade: bool,
    },

    /// A row-versioned write lost the race too many times in a row.
    #[error("Concurrent modification: {0}")]
    Conflict(String),

    #[error("Payment provider error during '{operation}': {message}")]
    Provider {
        operation: String,
        message: String,
        status: Option<u16>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Store(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid_payload(msg: impl Into<String>) -> Self {
        Self::InvalidPayload(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn provider(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            operation: operation.into(),
            message: message.into(),
            status: None,
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidPayload(_) | Self::InvalidSignature | Self::QuotaExceeded { .. } => {
                StatusCode::BAD_REQUEST
            }
            Self::Conflict(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Provider { .. } => StatusCode::BAD_GATEWAY,
            Self::Config(_) | Self::Store(_) | Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether a caller may usefully retry the same operation.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Conflict(_) => true,
            Self::Provider { status, .. } => {
                matches!(status, Some(429) | Some(500..=599) | None)
            }
            _ => false,
        }
    }

    /// Message safe to return to clients.
    ///
    /// Server-side failures get a generic message; details stay in the logs.
    fn safe_message(&self) -> String {
        match self {
            Self::Store(_) | Self::Other(_) => "Internal server error".to_string(),
            Self::Config(_) => "Service misconfigured".to_string(),
            Self::Provider { .. } => "Payment provider unavailable".to_string(),
            other => other.to_string(),
        }
    }
}

/// JSON body rendered for API errors.
///
/// Quota errors carry structured usage fields so clients can render
/// actionable upgrade messaging instead of a generic failure.
#[derive(Debug, Serialize, serde::Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub error_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_usage: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub needs_upgrade: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "type")]
    pub resource: Option<String>,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_id = uuid::Uuid::new_v4().to_string();

        let mut body = ErrorBody {
            error: self.safe_message(),
            error_id: error_id.clone(),
            current_usage: None,
            limit: None,
            needs_upgrade: None,
            resource: None,
        };

        if let Error::QuotaExceeded {
            kind,
            used,
            limit,
            needs_upgrade,
        } = &self
        {
            body.current_usage = Some(*used);
            body.limit = Some(*limit);
            body.needs_upgrade = Some(*needs_upgrade);
            body.resource = Some(kind.as_str().to_string());
        }

        tracing::error!(
            target: "quotagate",
            status = status.as_u16(),
            error_id = %error_id,
            error = %self,
            "Request failed"
        );

        (status, Json(body)).into_response()
    }
}

/// Result type alias for billing-engine operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        let status = err.status().map(|s| s.as_u16());
        Self::Provider {
            operation: "http".to_string(),
            message: err.to_string(),
            status,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidPayload(format!("JSON error: {err}"))
    }
}
