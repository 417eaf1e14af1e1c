//! Typed error hierarchy for the workers engine.
//!
//! `WorkersError` is the one enum every controller returns. The HTTP layer
//! maps each variant onto a status code in `workers::api::ApiError`.

use thiserror::Error;

/// Errors surfaced by controllers, clients and the store.
#[derive(Debug, Error)]
pub enum WorkersError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    /// Timeout, connection failure or 5xx from the orchestrator or CI provider.
    /// Never retried internally; the caller decides.
    #[error("{service} unavailable: {message}")]
    TransientInfra {
        service: &'static str,
        message: String,
    },

    #[error("Upstream authentication failed: {0}")]
    UpstreamAuth(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Invalid resource declaration: {0}")]
    InvalidResource(String),

    #[error("Missing or invalid API token")]
    Unauthorized,

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WorkersError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn transient(service: &'static str, message: impl Into<String>) -> Self {
        Self::TransientInfra {
            service,
            message: message.into(),
        }
    }

    /// Classify a reqwest transport error. Every transport-level failure is
    /// transient from our point of view.
    pub fn from_transport(service: &'static str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::transient(service, format!("request timed out: {}", err))
        } else {
            Self::transient(service, err.to_string())
        }
    }

    /// Classify a non-success HTTP status from an external service.
    pub fn from_status(service: &'static str, status: reqwest::StatusCode, body: &str) -> Self {
        let body = body.trim();
        let detail = if body.is_empty() {
            status.to_string()
        } else {
            format!("{}: {}", status, truncate(body, 300))
        };
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Self::transient(service, detail)
        } else if status == reqwest::StatusCode::CONFLICT {
            Self::Conflict(format!("{} rejected request: {}", service, detail))
        } else {
            Self::Other(anyhow::anyhow!("{} returned {}", service, detail))
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientInfra { .. })
    }
}

pub type WorkersResult<T> = Result<T, WorkersError>;

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        s
    } else {
        &s[..s.floor_char_boundary(max)]
    }
}
