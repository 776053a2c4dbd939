use std::time::Duration;

use thiserror::Error;

use super::model::UserId;

/// Failure reported by the durable mutation service.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("draft already exists")]
    AlreadyExists,
    #[error("draft not found")]
    NotFound,
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Token bucket exhausted. Carries what a caller needs to back off.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("rate limited, retry after {}ms", retry_after.as_millis())]
pub struct RateLimited {
    pub retry_after: Duration,
    pub limit: u32,
    pub remaining: u32,
}

/// Every rejection the mutation request path can produce.
///
/// `Clone` so a single outcome can be handed to every caller that raced on
/// the same idempotency key.
#[derive(Debug, Clone, Error)]
pub enum MutationError {
    #[error("it's not your turn: {holder} holds the ring")]
    RingRequired { holder: UserId },
    #[error("{0}")]
    Forbidden(&'static str),
    #[error("{user} is not the creator or an accepted collaborator")]
    InvalidTarget { user: UserId },
    #[error("draft is locked")]
    DraftLocked,
    #[error("draft is completed")]
    DraftCompleted,
    #[error("draft not found")]
    NotFound,
    #[error("idempotency key already used for {previous}")]
    KeyReused { previous: &'static str },
    #[error(transparent)]
    RateLimited(#[from] RateLimited),
    #[error("storage unavailable: {0}")]
    Storage(String),
}

impl MutationError {
    /// Stable wire code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RingRequired { .. } => "ring_required",
            Self::Forbidden(_) => "forbidden",
            Self::InvalidTarget { .. } => "invalid_target",
            Self::DraftLocked => "draft_locked",
            Self::DraftCompleted => "draft_completed",
            Self::NotFound => "not_found",
            Self::KeyReused { .. } => "idempotency_conflict",
            Self::RateLimited(_) => "rate_limited",
            Self::Storage(_) => "storage_unavailable",
        }
    }
}

impl From<StoreError> for MutationError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => Self::NotFound,
            other => Self::Storage(other.to_string()),
        }
    }
}
