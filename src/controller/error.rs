//! # Error Taxonomy
//!
//! Errors raised while reconciling a Component fall into three classes:
//!
//! - [`ReconcileError::Fatal`]: the component is misconfigured or the source
//!   produced something the controller cannot process. Retrying without user
//!   intervention will not help; the watch loop falls back to its default
//!   backoff so the condition is eventually re-evaluated.
//! - [`ReconcileError::Retriable`]: a transient condition (source not ready,
//!   dependency not synced, referenced object not found). Carries an optional
//!   suggested retry delay; the controller never sleeps itself, it always
//!   returns the delay to the watch loop.
//! - [`ReconcileError::Precondition`]: a defect in the calling code, e.g.
//!   reading artifact state that was never resolved. Never retried, surfaced
//!   loudly in logs.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("{0:#}")]
    Fatal(#[from] anyhow::Error),

    #[error("{message}")]
    Retriable {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("precondition violated: {0}")]
    Precondition(String),
}

impl ReconcileError {
    /// Transient condition without a delay suggestion; the watch loop applies
    /// its default backoff.
    pub fn retriable(message: impl Into<String>) -> Self {
        ReconcileError::Retriable {
            message: message.into(),
            retry_after: None,
        }
    }

    /// Transient condition with a suggested retry delay.
    pub fn retriable_after(message: impl Into<String>, delay: Duration) -> Self {
        ReconcileError::Retriable {
            message: message.into(),
            retry_after: Some(delay),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        ReconcileError::Fatal(anyhow::anyhow!(message.into()))
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, ReconcileError::Retriable { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ReconcileError::Retriable { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

pub type Result<T, E = ReconcileError> = std::result::Result<T, E>;
