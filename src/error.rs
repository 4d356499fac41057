use crate::store::StoreError;

/// Broad class of a rejection, for callers that map errors onto a transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    StateConflict,
    Duplicate,
    Storage,
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("invalid input ({reason}): {detail}")]
    Validation { reason: &'static str, detail: String },
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("operation not allowed ({reason}): {detail}")]
    StateConflict { reason: &'static str, detail: String },
    #[error("duplicate ({reason}): {detail}")]
    Duplicate { reason: &'static str, detail: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LedgerError {
    pub(crate) fn validation(reason: &'static str, detail: impl Into<String>) -> Self {
        LedgerError::Validation {
            reason,
            detail: detail.into(),
        }
    }

    pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        LedgerError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub(crate) fn conflict(reason: &'static str, detail: impl Into<String>) -> Self {
        LedgerError::StateConflict {
            reason,
            detail: detail.into(),
        }
    }

    pub(crate) fn duplicate(reason: &'static str, detail: impl Into<String>) -> Self {
        LedgerError::Duplicate {
            reason,
            detail: detail.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::Validation { .. } => ErrorKind::Validation,
            LedgerError::NotFound { .. } => ErrorKind::NotFound,
            LedgerError::StateConflict { .. } => ErrorKind::StateConflict,
            LedgerError::Duplicate { .. } => ErrorKind::Duplicate,
            LedgerError::Store(_) => ErrorKind::Storage,
        }
    }

    /// Stable snake_case code for the rejection.
    pub fn reason_code(&self) -> &'static str {
        match self {
            LedgerError::Validation { reason, .. }
            | LedgerError::StateConflict { reason, .. }
            | LedgerError::Duplicate { reason, .. } => *reason,
            LedgerError::NotFound { entity, .. } => match *entity {
                "account" => "account_not_found",
                "stake" => "stake_not_found",
                "referrer" => "referrer_not_found",
                _ => "not_found",
            },
            LedgerError::Store(_) => "storage_error",
        }
    }
}

pub type Result<T, E = LedgerError> = std::result::Result<T, E>;
