//! Ciphertext capability consumed by the ledger.
//!
//! The ledger never inspects ciphertext contents.  It only folds ciphertexts
//! through the operations below and forwards their 32-byte handles to the
//! decryption oracle.  Concrete schemes implement [`CiphertextOps`]; the
//! trend calculator additionally needs [`MomentOps`] for second moments.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// 32-byte reference to a ciphertext, as handed to the decryption oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct CipherHandle(pub [u8; 32]);

impl CipherHandle {
    /// Handle reserved for ciphertexts that were never initialized.
    pub const UNSET: CipherHandle = CipherHandle([0u8; 32]);

    /// Returns `true` for the reserved all-zero handle.
    pub fn is_unset(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for CipherHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Failures reported by a ciphertext capability.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CipherError {
    #[error("ciphertext is not initialized")]
    /// Operand was never produced by the scheme.
    Uninitialized,
    #[error("unknown ciphertext handle {0}")]
    /// Handle does not reference a live ciphertext.
    UnknownHandle(CipherHandle),
    #[error("division by zero")]
    /// Plaintext divisor was zero.
    DivisionByZero,
    #[error("arithmetic overflow")]
    /// Result does not fit the scheme's plaintext space.
    Overflow,
}

/// Homomorphic operations the ledger relies on.
pub trait CiphertextOps: Send + Sync {
    /// Opaque ciphertext type.
    type Ciphertext: Clone + fmt::Debug + Send + Sync;

    /// Returns an encryption of zero.
    fn zero(&self) -> Result<Self::Ciphertext, CipherError>;

    /// Homomorphic addition.
    fn add(
        &self,
        a: &Self::Ciphertext,
        b: &Self::Ciphertext,
    ) -> Result<Self::Ciphertext, CipherError>;

    /// Divides a ciphertext by a plaintext integer.
    fn div(&self, a: &Self::Ciphertext, divisor: u64) -> Result<Self::Ciphertext, CipherError>;

    /// Returns `true` if `c` was produced by the scheme.
    fn is_initialized(&self, c: &Self::Ciphertext) -> bool;

    /// Returns the handle used to reference `c` outside the scheme.
    fn to_handle(&self, c: &Self::Ciphertext) -> CipherHandle;
}

/// Extra operations needed for variance and forecasting.
pub trait MomentOps: CiphertextOps {
    /// Homomorphic subtraction `a - b`.
    fn sub(
        &self,
        a: &Self::Ciphertext,
        b: &Self::Ciphertext,
    ) -> Result<Self::Ciphertext, CipherError>;

    /// Homomorphic multiplication of two ciphertexts.
    fn mul(
        &self,
        a: &Self::Ciphertext,
        b: &Self::Ciphertext,
    ) -> Result<Self::Ciphertext, CipherError>;
}
