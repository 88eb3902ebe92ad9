//! Decryption proofs: ed25519 attestor signatures over the released cleartexts.
//!
//! A proof is valid when at least `threshold` distinct, configured attestors
//! signed the canonical payload digest of `(request_id, cleartexts)`.

use crate::fixed::Fixed;
use crate::request::RequestId;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::collections::HashSet;
use thiserror::Error;

const DECRYPTION_DOMAIN: &[u8] = b"TIDEWATCH_DECRYPTION_V1";

/// Checks decryption proofs delivered with oracle callbacks.
pub trait ProofVerifier: Send + Sync {
    /// Returns `true` if `proof` attests `cleartexts` for `request_id`.
    fn check_proof(&self, request_id: &RequestId, cleartexts: &[Fixed], proof: &DecryptionProof)
        -> bool;
}

/// One attestor's signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestorSignature {
    /// Base64 ed25519 public key.
    pub public_key: String,
    /// Base64 signature over the payload digest.
    pub signature: String,
}

/// Proof accompanying an oracle callback.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptionProof {
    /// Collected attestor signatures.
    pub signatures: Vec<AttestorSignature>,
}

/// Errors raised while decoding attestor key material.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("key decode error: {0}")]
    /// Base64 or ed25519 parsing failure.
    Decode(String),
    #[error("unexpected key length: {0}")]
    /// Buffer did not have the expected length.
    InvalidLength(usize),
}

/// Canonical digest signed by attestors.
pub fn decryption_payload(request_id: &RequestId, cleartexts: &[Fixed]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(DECRYPTION_DOMAIN);
    hasher.update(request_id.0);
    hasher.update((cleartexts.len() as u64).to_be_bytes());
    for value in cleartexts {
        hasher.update(value.raw().to_be_bytes());
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Derives a deterministic attestor key from a seed string.
pub fn attestor_from_seed(seed: &str) -> SigningKey {
    let mut hasher = Sha512::new();
    hasher.update(seed.as_bytes());
    let digest = hasher.finalize();
    let mut secret = [0u8; SECRET_KEY_LENGTH];
    secret.copy_from_slice(&digest[..SECRET_KEY_LENGTH]);
    SigningKey::from_bytes(&secret)
}

/// Encodes a public key as base64.
pub fn encode_public_key_base64(verifying: &VerifyingKey) -> String {
    BASE64.encode(verifying.to_bytes())
}

/// Decodes a base64 public key.
pub fn decode_public_key_base64(input: &str) -> Result<VerifyingKey, KeyError> {
    let bytes = BASE64
        .decode(input.trim())
        .map_err(|err| KeyError::Decode(err.to_string()))?;
    let array: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| KeyError::InvalidLength(bytes.len()))?;
    VerifyingKey::from_bytes(&array).map_err(|err| KeyError::Decode(err.to_string()))
}

fn decode_signature_base64(input: &str) -> Result<Signature, KeyError> {
    let bytes = BASE64
        .decode(input.trim())
        .map_err(|err| KeyError::Decode(err.to_string()))?;
    Signature::from_slice(&bytes).map_err(|err| KeyError::Decode(err.to_string()))
}

/// Signs the decryption payload with one attestor key.
pub fn sign_decryption(
    signing: &SigningKey,
    request_id: &RequestId,
    cleartexts: &[Fixed],
) -> AttestorSignature {
    let payload = decryption_payload(request_id, cleartexts);
    AttestorSignature {
        public_key: encode_public_key_base64(&signing.verifying_key()),
        signature: BASE64.encode(signing.sign(&payload).to_bytes()),
    }
}

/// K-of-N attestor quorum.
#[derive(Debug, Clone)]
pub struct QuorumVerifier {
    threshold: usize,
    attestors: HashSet<[u8; 32]>,
}

impl QuorumVerifier {
    /// Builds a verifier from decoded keys.
    pub fn new(threshold: usize, attestors: impl IntoIterator<Item = VerifyingKey>) -> Self {
        Self {
            threshold,
            attestors: attestors.into_iter().map(|vk| vk.to_bytes()).collect(),
        }
    }

    /// Builds a verifier from base64-encoded keys.
    pub fn from_base64(threshold: usize, attestors: &[String]) -> Result<Self, KeyError> {
        let keys = attestors
            .iter()
            .map(|b64| decode_public_key_base64(b64))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(threshold, keys))
    }

    /// Required number of distinct attestor signatures.
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Counts distinct authorised attestors whose signature verifies.
    pub fn valid_signers(
        &self,
        request_id: &RequestId,
        cleartexts: &[Fixed],
        proof: &DecryptionProof,
    ) -> usize {
        let payload = decryption_payload(request_id, cleartexts);
        let mut seen = HashSet::new();
        for sig in &proof.signatures {
            let Ok(verifying) = decode_public_key_base64(&sig.public_key) else {
                continue;
            };
            let key = verifying.to_bytes();
            if !self.attestors.contains(&key) || seen.contains(&key) {
                continue;
            }
            let Ok(signature) = decode_signature_base64(&sig.signature) else {
                continue;
            };
            if verifying.verify(&payload, &signature).is_ok() {
                seen.insert(key);
            }
        }
        seen.len()
    }
}

impl ProofVerifier for QuorumVerifier {
    fn check_proof(
        &self,
        request_id: &RequestId,
        cleartexts: &[Fixed],
        proof: &DecryptionProof,
    ) -> bool {
        self.threshold > 0 && self.valid_signers(request_id, cleartexts, proof) >= self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values() -> Vec<Fixed> {
        vec![Fixed::from_raw(8_050_000), Fixed::from_raw(2_000_000)]
    }

    fn verifier(threshold: usize, seeds: &[&str]) -> QuorumVerifier {
        QuorumVerifier::new(
            threshold,
            seeds.iter().map(|s| attestor_from_seed(s).verifying_key()),
        )
    }

    #[test]
    fn payload_binds_request_and_values() {
        let a = RequestId([1u8; 32]);
        let b = RequestId([2u8; 32]);
        assert_ne!(decryption_payload(&a, &values()), decryption_payload(&b, &values()));
        assert_ne!(
            decryption_payload(&a, &values()),
            decryption_payload(&a, &values()[..1])
        );
    }

    #[test]
    fn quorum_requires_distinct_authorised_signers() {
        let id = RequestId([5u8; 32]);
        let qv = verifier(2, &["alpha", "beta", "gamma"]);
        let alpha = sign_decryption(&attestor_from_seed("alpha"), &id, &values());
        let beta = sign_decryption(&attestor_from_seed("beta"), &id, &values());
        let mallory = sign_decryption(&attestor_from_seed("mallory"), &id, &values());

        let single = DecryptionProof {
            signatures: vec![alpha.clone(), alpha.clone(), mallory],
        };
        assert!(!qv.check_proof(&id, &values(), &single));

        let pair = DecryptionProof {
            signatures: vec![alpha, beta],
        };
        assert!(qv.check_proof(&id, &values(), &pair));
        assert!(!qv.check_proof(&id, &values()[..1], &pair));
        assert!(!qv.check_proof(&RequestId([6u8; 32]), &values(), &pair));
    }

    #[test]
    fn garbage_signatures_are_ignored() {
        let id = RequestId([7u8; 32]);
        let qv = verifier(1, &["alpha"]);
        let key = encode_public_key_base64(&attestor_from_seed("alpha").verifying_key());
        let proof = DecryptionProof {
            signatures: vec![AttestorSignature {
                public_key: key,
                signature: "not-base64!".into(),
            }],
        };
        assert!(!qv.check_proof(&id, &values(), &proof));
        assert!(!verifier(0, &[]).check_proof(&id, &values(), &DecryptionProof::default()));
    }

    #[test]
    fn base64_keys_round_trip() {
        let vk = attestor_from_seed("alpha").verifying_key();
        let encoded = encode_public_key_base64(&vk);
        assert_eq!(decode_public_key_base64(&encoded).unwrap(), vk);
        assert!(QuorumVerifier::from_base64(1, &["AAAA".to_string()]).is_err());
    }
}
