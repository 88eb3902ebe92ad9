//! Decryption request lifecycle.
//!
//! A request moves `Pending -> Fulfilled` or `Pending -> Cancelled`.  Both
//! end states are terminal.  Request identifiers are 256-bit random values
//! drawn from the OS RNG and are kept for the lifetime of the manager, so an
//! identifier is never issued twice and a late callback always resolves to
//! the request it was issued for.

use crate::cipher::CipherHandle;
use crate::error::{LedgerError, LedgerResult};
use crate::region::RegionKey;
use crate::store::MeasurementId;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Unguessable identifier of a decryption request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub [u8; 32]);

impl RequestId {
    /// Draws a fresh identifier from the OS RNG.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        RequestId(bytes)
    }

    /// Parses the hex form produced by `Display`.
    pub fn from_hex(input: &str) -> Result<Self, String> {
        let bytes = hex::decode(input.trim()).map_err(|err| err.to_string())?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|bytes: Vec<u8>| format!("expected 32 bytes, got {}", bytes.len()))?;
        Ok(RequestId(array))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// What a decryption request reveals.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecryptionTarget {
    /// All three readings of one measurement.
    Measurement {
        /// Target record.
        id: MeasurementId,
    },
    /// The aggregated sum of one region.
    Region {
        /// Region name, stored verbatim alongside the request.
        name: String,
        /// Derived key reported to external observers.
        key: RegionKey,
        /// Plaintext count of the accumulator at request time.
        count: u64,
    },
}

impl DecryptionTarget {
    /// Number of cleartexts a callback must carry for this target.
    pub fn expected_cleartexts(&self) -> usize {
        match self {
            Self::Measurement { .. } => 3,
            Self::Region { .. } => 1,
        }
    }

    fn slot_key(&self) -> TargetKey {
        match self {
            Self::Measurement { id } => TargetKey::Measurement(*id),
            Self::Region { name, .. } => TargetKey::Region(name.clone()),
        }
    }
}

impl fmt::Display for DecryptionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Measurement { id } => write!(f, "{id}"),
            Self::Region { name, .. } => write!(f, "region `{name}`"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TargetKey {
    Measurement(MeasurementId),
    Region(String),
}

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    /// Dispatched to the oracle, waiting for a verified callback.
    Pending,
    /// Callback verified and applied.
    Fulfilled,
    /// Withdrawn or expired before fulfilment.
    Cancelled,
}

/// Bookkeeping record of one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptionRequest {
    /// Request identifier.
    pub id: RequestId,
    /// Fixed target, set at creation.
    pub target: DecryptionTarget,
    /// Ciphertext handles in decoding order.
    pub handles: Vec<CipherHandle>,
    /// Current state.
    pub state: RequestState,
    /// Issue time in milliseconds since the Unix epoch.
    pub issued_at_ms: u64,
}

/// Owns every decryption request ever issued.
#[derive(Debug, Default)]
pub struct DecryptionRequestManager {
    requests: HashMap<RequestId, DecryptionRequest>,
    pending: HashMap<TargetKey, RequestId>,
}

impl DecryptionRequestManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the pending request covering `target`, if any.
    pub fn pending_for(&self, target: &DecryptionTarget) -> Option<RequestId> {
        self.pending.get(&target.slot_key()).copied()
    }

    /// Records a new pending request and returns its identifier.
    ///
    /// Fails with [`LedgerError::RequestPending`] if the target already has a
    /// live request; nothing is allocated in that case.
    pub fn issue(
        &mut self,
        target: DecryptionTarget,
        handles: Vec<CipherHandle>,
        now_ms: u64,
    ) -> LedgerResult<RequestId> {
        if handles.len() != target.expected_cleartexts() {
            return Err(LedgerError::InvalidInput(format!(
                "{target} needs {} handles, got {}",
                target.expected_cleartexts(),
                handles.len()
            )));
        }
        let slot = target.slot_key();
        if let Some(existing) = self.pending.get(&slot) {
            return Err(LedgerError::RequestPending {
                target: target.to_string(),
                request: *existing,
            });
        }
        let id = self.fresh_id();
        self.pending.insert(slot, id);
        self.requests.insert(
            id,
            DecryptionRequest {
                id,
                target,
                handles,
                state: RequestState::Pending,
                issued_at_ms: now_ms,
            },
        );
        Ok(id)
    }

    fn fresh_id(&self) -> RequestId {
        loop {
            let id = RequestId::random();
            if !self.requests.contains_key(&id) {
                return id;
            }
        }
    }

    /// Returns the request if it is still pending.
    pub fn pending(&self, id: &RequestId) -> LedgerResult<&DecryptionRequest> {
        let request = self
            .requests
            .get(id)
            .ok_or(LedgerError::UnknownRequest(*id))?;
        match request.state {
            RequestState::Pending => Ok(request),
            RequestState::Fulfilled => Err(LedgerError::AlreadyFulfilled(*id)),
            RequestState::Cancelled => Err(LedgerError::RequestCancelled(*id)),
        }
    }

    /// Moves a pending request to `Fulfilled`.
    pub fn complete(&mut self, id: &RequestId) -> LedgerResult<()> {
        self.finish(id, RequestState::Fulfilled)
    }

    /// Moves a pending request to `Cancelled`.
    pub fn cancel(&mut self, id: &RequestId) -> LedgerResult<()> {
        self.finish(id, RequestState::Cancelled)
    }

    fn finish(&mut self, id: &RequestId, state: RequestState) -> LedgerResult<()> {
        self.pending(id)?;
        let request = self
            .requests
            .get_mut(id)
            .ok_or(LedgerError::UnknownRequest(*id))?;
        request.state = state;
        self.pending.remove(&request.target.slot_key());
        Ok(())
    }

    /// Cancels every pending request issued at or before `cutoff_ms`.
    pub fn expire_issued_before(&mut self, cutoff_ms: u64) -> Vec<RequestId> {
        let mut stale: Vec<RequestId> = self
            .requests
            .values()
            .filter(|req| req.state == RequestState::Pending && req.issued_at_ms <= cutoff_ms)
            .map(|req| req.id)
            .collect();
        stale.sort();
        stale.retain(|id| self.finish(id, RequestState::Cancelled).is_ok());
        stale
    }

    /// Looks up any request regardless of state.
    pub fn get(&self, id: &RequestId) -> Option<&DecryptionRequest> {
        self.requests.get(id)
    }

    /// Number of requests still pending.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Total number of requests ever issued.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Returns `true` if no request was ever issued.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn measurement(id: u64) -> DecryptionTarget {
        DecryptionTarget::Measurement {
            id: MeasurementId(id),
        }
    }

    fn handles(n: usize) -> Vec<CipherHandle> {
        (0..n).map(|i| CipherHandle([i as u8 + 1; 32])).collect()
    }

    #[test]
    fn request_ids_round_trip_through_hex() {
        let id = RequestId::random();
        assert_eq!(RequestId::from_hex(&id.to_string()).unwrap(), id);
        assert!(RequestId::from_hex("abcd").is_err());
    }

    #[test]
    fn lifecycle_pending_to_fulfilled() {
        let mut mgr = DecryptionRequestManager::new();
        let id = mgr.issue(measurement(1), handles(3), 10).unwrap();
        assert_eq!(mgr.pending(&id).unwrap().target, measurement(1));
        assert_eq!(mgr.pending_for(&measurement(1)), Some(id));

        mgr.complete(&id).unwrap();
        assert_eq!(mgr.get(&id).unwrap().state, RequestState::Fulfilled);
        assert_eq!(mgr.complete(&id), Err(LedgerError::AlreadyFulfilled(id)));
        assert_eq!(mgr.cancel(&id), Err(LedgerError::AlreadyFulfilled(id)));
        assert_eq!(mgr.pending_count(), 0);
    }

    #[test]
    fn duplicate_pending_requests_are_refused() {
        let mut mgr = DecryptionRequestManager::new();
        let first = mgr.issue(measurement(4), handles(3), 0).unwrap();
        let err = mgr.issue(measurement(4), handles(3), 0).unwrap_err();
        assert!(matches!(err, LedgerError::RequestPending { request, .. } if request == first));
        assert_eq!(mgr.len(), 1);

        mgr.cancel(&first).unwrap();
        let second = mgr.issue(measurement(4), handles(3), 0).unwrap();
        assert_ne!(first, second);
        assert_eq!(
            mgr.pending(&first).unwrap_err(),
            LedgerError::RequestCancelled(first)
        );
    }

    #[test]
    fn unknown_and_malformed_requests() {
        let mut mgr = DecryptionRequestManager::new();
        let ghost = RequestId([3u8; 32]);
        assert_eq!(
            mgr.pending(&ghost).unwrap_err(),
            LedgerError::UnknownRequest(ghost)
        );
        assert!(matches!(
            mgr.issue(measurement(1), handles(1), 0),
            Err(LedgerError::InvalidInput(_))
        ));
        assert!(mgr.is_empty());
    }

    #[test]
    fn expiry_cancels_only_old_pending_requests() {
        let mut mgr = DecryptionRequestManager::new();
        let old = mgr.issue(measurement(1), handles(3), 100).unwrap();
        let done = mgr.issue(measurement(2), handles(3), 100).unwrap();
        let fresh = mgr.issue(measurement(3), handles(3), 900).unwrap();
        mgr.complete(&done).unwrap();

        assert_eq!(mgr.expire_issued_before(500), vec![old]);
        assert_eq!(mgr.get(&old).unwrap().state, RequestState::Cancelled);
        assert_eq!(mgr.get(&done).unwrap().state, RequestState::Fulfilled);
        assert_eq!(mgr.get(&fresh).unwrap().state, RequestState::Pending);
        assert_eq!(mgr.pending_count(), 1);
        assert!(mgr.expire_issued_before(500).is_empty());
        assert_eq!(mgr.expire_issued_before(900), vec![fresh]);
        assert_eq!(mgr.pending_count(), 0);
    }
}
