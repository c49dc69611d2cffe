//! Error kinds returned by store and transaction operations.

use thiserror::Error;

use super::checker::PositionCollision;

/// Failure of a store or transaction operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// A member, container, or membership with this identity already exists.
    #[error("duplicate name: {0}")]
    DuplicateName(String),

    /// The referenced member, container, or membership does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Two memberships of one container share a position.
    #[error("constraint violation: {0}")]
    ConstraintViolation(PositionCollision),

    /// A concurrent commit wrote state this transaction depends on.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The operation is not valid in the transaction's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl StoreError {
    /// Returns true when retrying the whole transaction may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }

    /// Returns true for [`StoreError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    /// Returns true for [`StoreError::ConstraintViolation`].
    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, StoreError::ConstraintViolation(_))
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
