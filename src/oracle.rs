//! Decryption oracle boundary.
//!
//! The ledger hands each new request to a [`DecryptionOracle`] and returns
//! immediately.  The oracle later answers out of band with a [`Fulfillment`],
//! which the caller feeds back into `ConfidentialLedger::fulfill`.
//! [`LocalOracle`] queues requests in memory and answers them on demand using
//! a [`Decryptor`] that holds the reference coprocessor and attestor keys.

use crate::attestation::{sign_decryption, DecryptionProof};
use crate::cipher::{CipherError, CipherHandle};
use crate::fixed::Fixed;
use crate::reference::ReferenceScheme;
use crate::request::RequestId;
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::debug;

/// Work item handed to the oracle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleRequest {
    /// Request to answer.
    pub request_id: RequestId,
    /// Handles to decrypt, in order.
    pub handles: Vec<CipherHandle>,
}

/// Callback payload produced by the oracle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fulfillment {
    /// Request being answered.
    pub request_id: RequestId,
    /// Decrypted values in handle order.
    pub cleartexts: Vec<Fixed>,
    /// Attestor signatures over the cleartexts.
    pub proof: DecryptionProof,
}

/// Oracle failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OracleError {
    #[error("oracle unavailable: {0}")]
    /// The oracle cannot accept more work.
    Unavailable(String),
    #[error(transparent)]
    /// A handle could not be decrypted.
    Cipher(#[from] CipherError),
}

/// External actor that decrypts handles off the ledger's critical path.
pub trait DecryptionOracle: Send + Sync {
    /// Accepts a request for later processing.  Must not block on decryption.
    fn dispatch(&self, request: OracleRequest) -> Result<(), OracleError>;
}

/// Holds decryption capability and attestor keys.
#[derive(Clone)]
pub struct Decryptor {
    scheme: Arc<ReferenceScheme>,
    attestors: Vec<SigningKey>,
}

impl std::fmt::Debug for Decryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decryptor")
            .field("attestors", &self.attestors.len())
            .finish()
    }
}

impl Decryptor {
    /// Creates a decryptor signing with every key in `attestors`.
    pub fn new(scheme: Arc<ReferenceScheme>, attestors: Vec<SigningKey>) -> Self {
        Self { scheme, attestors }
    }

    /// Decrypts the request's handles and signs the result.
    pub fn answer(&self, request: &OracleRequest) -> Result<Fulfillment, OracleError> {
        let cleartexts = request
            .handles
            .iter()
            .map(|handle| self.scheme.decrypt(handle))
            .collect::<Result<Vec<_>, _>>()?;
        let signatures = self
            .attestors
            .iter()
            .map(|key| sign_decryption(key, &request.request_id, &cleartexts))
            .collect();
        Ok(Fulfillment {
            request_id: request.request_id,
            cleartexts,
            proof: DecryptionProof { signatures },
        })
    }
}

/// In-memory oracle answering queued requests when polled.
#[derive(Debug)]
pub struct LocalOracle {
    decryptor: Decryptor,
    capacity: usize,
    queue: Mutex<VecDeque<OracleRequest>>,
}

impl LocalOracle {
    /// Creates an oracle that accepts at most `capacity` outstanding requests.
    pub fn new(decryptor: Decryptor, capacity: usize) -> Self {
        Self {
            decryptor,
            capacity,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Number of queued requests.
    pub fn queued(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Answers the oldest queued request.
    pub fn process_next(&self) -> Option<Result<Fulfillment, OracleError>> {
        let request = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()?;
        debug!(request = %request.request_id, "oracle answering request");
        Some(self.decryptor.answer(&request))
    }

    /// Answers every queued request.
    pub fn drain(&self) -> Vec<Result<Fulfillment, OracleError>> {
        std::iter::from_fn(|| self.process_next()).collect()
    }
}

impl DecryptionOracle for LocalOracle {
    fn dispatch(&self, request: OracleRequest) -> Result<(), OracleError> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        if queue.len() >= self.capacity {
            return Err(OracleError::Unavailable(format!(
                "queue full ({} requests)",
                self.capacity
            )));
        }
        queue.push_back(request);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::{attestor_from_seed, ProofVerifier, QuorumVerifier};

    #[test]
    fn local_oracle_answers_in_fifo_order_with_valid_proofs() {
        let scheme = Arc::new(ReferenceScheme::with_seed([5u8; 32]));
        let a = scheme.encrypt(Fixed::from_raw(1_000_000)).unwrap();
        let b = scheme.encrypt(Fixed::from_raw(2_000_000)).unwrap();
        let key = attestor_from_seed("alpha");
        let verifier = QuorumVerifier::new(1, [key.verifying_key()]);
        let oracle = LocalOracle::new(Decryptor::new(scheme, vec![key]), 4);

        let first = RequestId([1u8; 32]);
        let second = RequestId([2u8; 32]);
        oracle
            .dispatch(OracleRequest {
                request_id: first,
                handles: vec![a.handle()],
            })
            .unwrap();
        oracle
            .dispatch(OracleRequest {
                request_id: second,
                handles: vec![b.handle(), a.handle()],
            })
            .unwrap();
        assert_eq!(oracle.queued(), 2);

        let answers: Vec<Fulfillment> = oracle.drain().into_iter().map(Result::unwrap).collect();
        assert_eq!(answers[0].request_id, first);
        assert_eq!(
            answers[1].cleartexts,
            vec![Fixed::from_raw(2_000_000), Fixed::from_raw(1_000_000)]
        );
        for answer in &answers {
            assert!(verifier.check_proof(&answer.request_id, &answer.cleartexts, &answer.proof));
        }
        assert!(oracle.process_next().is_none());
    }

    #[test]
    fn full_queue_refuses_dispatch() {
        let scheme = Arc::new(ReferenceScheme::with_seed([6u8; 32]));
        let oracle = LocalOracle::new(Decryptor::new(scheme, Vec::new()), 1);
        let request = OracleRequest {
            request_id: RequestId([1u8; 32]),
            handles: Vec::new(),
        };
        oracle.dispatch(request.clone()).unwrap();
        assert!(matches!(
            oracle.dispatch(request),
            Err(OracleError::Unavailable(_))
        ));
    }

    #[test]
    fn unknown_handles_surface_as_errors() {
        let scheme = Arc::new(ReferenceScheme::with_seed([7u8; 32]));
        let decryptor = Decryptor::new(scheme, Vec::new());
        let result = decryptor.answer(&OracleRequest {
            request_id: RequestId([1u8; 32]),
            handles: vec![CipherHandle([4u8; 32])],
        });
        assert!(matches!(
            result,
            Err(OracleError::Cipher(CipherError::UnknownHandle(_)))
        ));
    }
}
