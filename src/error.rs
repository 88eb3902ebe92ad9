//! Error taxonomy shared by every ledger component.

use crate::cipher::CipherError;
use crate::request::RequestId;
use thiserror::Error;

/// Errors surfaced by the measurement ledger and its components.
///
/// Every variant except [`LedgerError::IdSpaceExhausted`] is local and
/// recoverable: the failing operation performed no state mutation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("invalid input: {0}")]
    /// Malformed or uninitialized ciphertext, or a missing/oversized field.
    InvalidInput(String),
    #[error("not found: {0}")]
    /// Unknown measurement id or region.
    NotFound(String),
    #[error("already revealed: {0}")]
    /// The target's reveal slot is already populated.
    AlreadyRevealed(String),
    #[error("decryption request {0} already fulfilled")]
    /// Duplicate or late callback for a finished request.
    AlreadyFulfilled(RequestId),
    #[error("unknown decryption request {0}")]
    /// Callback referenced a request id that was never issued.
    UnknownRequest(RequestId),
    #[error("decryption proof rejected for request {0}")]
    /// The callback proof failed verification; the request stays pending.
    InvalidProof(RequestId),
    #[error("insufficient data: need at least 2 values, had {0}")]
    /// Aggregate or trend computation over fewer than two values.
    InsufficientData(usize),
    #[error("decryption of {target} already pending under request {request}")]
    /// A live request already covers the target.
    RequestPending {
        /// Human-readable target description.
        target: String,
        /// Identifier of the request that is still pending.
        request: RequestId,
    },
    #[error("decryption request {0} was cancelled")]
    /// Callback arrived for a request that was cancelled or expired.
    RequestCancelled(RequestId),
    #[error("identifier space exhausted")]
    /// Fatal: the monotonic id counter cannot advance.
    IdSpaceExhausted,
    #[error(transparent)]
    /// Failure reported by the ciphertext capability.
    Cipher(#[from] CipherError),
    #[error("oracle dispatch failed: {0}")]
    /// The external decryption oracle refused the request.
    Oracle(String),
}

impl LedgerError {
    /// Returns `true` for errors that must abort the caller instead of being retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::IdSpaceExhausted)
    }
}

/// Convenience alias used throughout the crate.
pub type LedgerResult<T> = Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_id_exhaustion_is_fatal() {
        assert!(LedgerError::IdSpaceExhausted.is_fatal());
        let id = RequestId([7u8; 32]);
        let recoverable = [
            LedgerError::InvalidInput("x".into()),
            LedgerError::NotFound("x".into()),
            LedgerError::AlreadyRevealed("x".into()),
            LedgerError::AlreadyFulfilled(id),
            LedgerError::UnknownRequest(id),
            LedgerError::InvalidProof(id),
            LedgerError::InsufficientData(1),
            LedgerError::RequestPending {
                target: "m-1".into(),
                request: id,
            },
            LedgerError::RequestCancelled(id),
            LedgerError::Cipher(CipherError::Overflow),
            LedgerError::Oracle("queue full".into()),
        ];
        for err in &recoverable {
            assert!(!err.is_fatal(), "{err} should be recoverable");
        }
    }
}
