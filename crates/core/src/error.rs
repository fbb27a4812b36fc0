use crate::{Kind, ObjectKey};

/// Errors surfaced by an [`Accessor`](crate::Accessor).
#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    #[error("{kind} \"{key}\" not found")]
    NotFound { kind: Kind, key: ObjectKey },
    #[error("conflict writing {kind} \"{key}\": {message}")]
    Conflict { kind: Kind, key: ObjectKey, message: String },
    #[error("context cancelled")]
    Cancelled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AccessError {
    pub fn not_found(kind: &Kind, key: &ObjectKey) -> Self {
        Self::NotFound { kind: kind.clone(), key: key.clone() }
    }

    pub fn conflict(kind: &Kind, key: &ObjectKey, message: impl Into<String>) -> Self {
        Self::Conflict { kind: kind.clone(), key: key.clone(), message: message.into() }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(anyhow::anyhow!(message.into()))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }
}
