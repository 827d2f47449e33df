use crate::query::error::QueryError;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrellisErrorCode {
    Query,
    NotSupported,
    UniqueViolation,
    DuplicateKey,
    Integrity,
    TransactionFailed,
    Data,
    Store,
}

impl TrellisErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            TrellisErrorCode::Query => "query",
            TrellisErrorCode::NotSupported => "not_supported",
            TrellisErrorCode::UniqueViolation => "unique_violation",
            TrellisErrorCode::DuplicateKey => "duplicate_key",
            TrellisErrorCode::Integrity => "integrity",
            TrellisErrorCode::TransactionFailed => "transaction_failed",
            TrellisErrorCode::Data => "data",
            TrellisErrorCode::Store => "store",
        }
    }
}

#[derive(Debug, Error)]
pub enum TrellisError {
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("operation not supported: {0}")]
    NotSupported(String),
    #[error("unique constraint violation for kind {table} on fields: {fields}")]
    UniqueViolation { table: String, fields: String },
    #[error("duplicate identity in kind '{table}': {key}")]
    DuplicateKey { table: String, key: String },
    #[error("integrity error: {0}")]
    Integrity(String),
    #[error("transaction failed: {0}")]
    TransactionFailed(String),
    #[error("data error: {0}")]
    Data(String),
    #[error("store error: {0}")]
    Store(String),
}

impl TrellisError {
    pub fn code(&self) -> TrellisErrorCode {
        match self {
            TrellisError::Query(_) => TrellisErrorCode::Query,
            TrellisError::NotSupported(_) => TrellisErrorCode::NotSupported,
            TrellisError::UniqueViolation { .. } => TrellisErrorCode::UniqueViolation,
            TrellisError::DuplicateKey { .. } => TrellisErrorCode::DuplicateKey,
            TrellisError::Integrity(_) => TrellisErrorCode::Integrity,
            TrellisError::TransactionFailed(_) => TrellisErrorCode::TransactionFailed,
            TrellisError::Data(_) => TrellisErrorCode::Data,
            TrellisError::Store(_) => TrellisErrorCode::Store,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    /// True for every flavour of integrity failure, whichever variant
    /// carried it (marker conflict, duplicate identity, batch pre-check).
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            TrellisError::UniqueViolation { .. }
                | TrellisError::DuplicateKey { .. }
                | TrellisError::Integrity(_)
        )
    }
}
