use crate::{decision::Exceeded, Reason};
use thiserror::Error;

/// Every way an admission call can end other than being allowed.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to decode admission review: {0}")]
    Decode(String),

    #[error("failed to read {kind}: {message}")]
    Extraction { kind: &'static str, message: String },

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error(transparent)]
    QuotaExceeded(#[from] Exceeded),

    #[error("invalid ClusterResourceQuota: {0}")]
    InvalidQuotaObject(String),

    #[error("unsupported resource type: {0}")]
    UnsupportedKind(String),
}

impl Error {
    pub fn extraction(kind: &'static str, error: impl std::fmt::Display) -> Self {
        Self::Extraction {
            kind,
            message: error.to_string(),
        }
    }

    pub fn unavailable(error: impl std::fmt::Display) -> Self {
        Self::ServiceUnavailable(error.to_string())
    }

    pub fn reason(&self) -> Reason {
        match self {
            Self::Decode(_) => Reason::Decode,
            Self::Extraction { .. } => Reason::Extraction,
            Self::ServiceUnavailable(_) => Reason::ServiceUnavailable,
            Self::QuotaExceeded(_) => Reason::QuotaExceeded,
            Self::InvalidQuotaObject(_) => Reason::InvalidQuotaObject,
            Self::UnsupportedKind(_) => Reason::UnsupportedKind,
        }
    }
}
