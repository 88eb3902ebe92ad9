//! The confidential measurement ledger.
//!
//! [`ConfidentialLedger`] wires the measurement store, the region aggregator,
//! the decryption request manager and the trend calculator together behind
//! one `&self` API that is safe to share across threads:
//!
//! * identifiers come from an atomic counter and are never reused;
//! * each region accumulator sits behind its own mutex, so submissions into
//!   one region are serialized while other regions proceed in parallel;
//! * the request table is guarded by a single mutex that is held for the
//!   whole of `fulfill`, which makes duplicate callbacks observe the
//!   `Fulfilled` state of the first one.
//!
//! Lock order is requests, then store, then a region slot.  The oracle is
//! always called with no ledger lock held, so an oracle may answer
//! synchronously from inside `dispatch`.

use crate::attestation::{DecryptionProof, ProofVerifier};
use crate::cipher::{CiphertextOps, MomentOps};
use crate::config::LedgerConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::events::{EventSink, LedgerEvent, NullSink};
use crate::fixed::Fixed;
use crate::oracle::{DecryptionOracle, OracleRequest};
use crate::region::{AccumulatorSnapshot, RegionAggregator, RegionKey, RegionReveal};
use crate::request::{DecryptionRequest, DecryptionRequestManager, DecryptionTarget, RequestId};
use crate::store::{
    EncryptedMeasurement, EncryptedReading, IdAllocator, MeasurementId, MeasurementStore,
    ReadingField, RevealSlot, StationId,
};
use crate::trend::{self, TrendSummary};
use std::fmt;
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// What a caller asks to decrypt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecryptionSubject {
    /// One measurement's three readings.
    Measurement(MeasurementId),
    /// One region's aggregated sum.
    Region(String),
}

impl From<MeasurementId> for DecryptionSubject {
    fn from(id: MeasurementId) -> Self {
        DecryptionSubject::Measurement(id)
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Shared confidential measurement ledger.
pub struct ConfidentialLedger<C: CiphertextOps> {
    scheme: Arc<C>,
    config: LedgerConfig,
    ids: IdAllocator,
    store: RwLock<MeasurementStore<C::Ciphertext>>,
    regions: RegionAggregator<C>,
    requests: Mutex<DecryptionRequestManager>,
    oracle: Arc<dyn DecryptionOracle>,
    verifier: Arc<dyn ProofVerifier>,
    events: Arc<dyn EventSink>,
}

impl<C: CiphertextOps> fmt::Debug for ConfidentialLedger<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfidentialLedger")
            .field("config", &self.config)
            .field("next_id", &self.ids.peek())
            .field("regions", &self.regions)
            .finish()
    }
}

impl<C: CiphertextOps> ConfidentialLedger<C> {
    /// Creates an empty ledger.
    pub fn new(
        scheme: Arc<C>,
        config: LedgerConfig,
        oracle: Arc<dyn DecryptionOracle>,
        verifier: Arc<dyn ProofVerifier>,
    ) -> Self {
        let regions = RegionAggregator::new(
            Arc::clone(&scheme),
            config.max_regions,
            config.max_region_name_len,
        );
        Self {
            scheme,
            config,
            ids: IdAllocator::default(),
            store: RwLock::new(MeasurementStore::new()),
            regions,
            requests: Mutex::new(DecryptionRequestManager::new()),
            oracle,
            verifier,
            events: Arc::new(NullSink),
        }
    }

    /// Routes notifications to `sink`.
    pub fn with_events(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    /// Ciphertext capability backing this ledger.
    pub fn scheme(&self) -> &Arc<C> {
        &self.scheme
    }

    /// Active configuration.
    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    fn store(&self) -> RwLockReadGuard<'_, MeasurementStore<C::Ciphertext>> {
        self.store.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn store_mut(&self) -> RwLockWriteGuard<'_, MeasurementStore<C::Ciphertext>> {
        self.store.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn requests(&self) -> MutexGuard<'_, DecryptionRequestManager> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------
    // Measurement store
    // -----------------------------------------------------------------

    /// Appends an encrypted measurement and folds its tracked reading into
    /// the region accumulator.
    ///
    /// A region is created together with its first successful addition, so
    /// a rejected submission never leaves an empty region behind.  An id
    /// allocated for a submission that later fails is not reused.
    pub fn submit(
        &self,
        station: StationId,
        reading: EncryptedReading<C::Ciphertext>,
        region: &str,
    ) -> LedgerResult<MeasurementId> {
        for (field, value) in reading.iter() {
            if !self.scheme.is_initialized(value) {
                return Err(LedgerError::InvalidInput(format!(
                    "{} ciphertext is not initialized",
                    field.as_str()
                )));
            }
        }
        self.regions.validate_name(region)?;
        let id = MeasurementId(self.ids.allocate()?);
        let timestamp_ms = now_millis();
        let count = self
            .regions
            .accumulate(region, reading.field(self.config.tracked_field))?;
        if count == 1 {
            info!(region, "new region registered");
        }
        self.store_mut().insert(EncryptedMeasurement {
            id,
            station: station.clone(),
            reading,
            region: region.to_string(),
            timestamp_ms,
        })?;
        info!(id = id.0, %station, region, count, "measurement submitted");
        self.events.emit(&LedgerEvent::MeasurementSubmitted {
            id,
            station,
            region: region.to_string(),
            timestamp_ms,
        });
        Ok(id)
    }

    /// Returns a copy of the stored record.
    pub fn measurement(&self, id: MeasurementId) -> LedgerResult<EncryptedMeasurement<C::Ciphertext>> {
        self.store().get(id).cloned()
    }

    /// Returns the reveal slot of a measurement.
    pub fn reveal_slot(&self, id: MeasurementId) -> LedgerResult<RevealSlot> {
        self.store().reveal_slot(id)
    }

    /// Number of stored measurements.
    pub fn measurement_count(&self) -> usize {
        self.store().len()
    }

    // -----------------------------------------------------------------
    // Region aggregator
    // -----------------------------------------------------------------

    /// Encrypted sum and count of a region.
    pub fn accumulator(&self, region: &str) -> LedgerResult<AccumulatorSnapshot<C::Ciphertext>> {
        self.regions.accumulator(region)
    }

    /// Decrypted statistic of a region, once revealed.
    pub fn region_reveal(&self, region: &str) -> LedgerResult<RegionReveal> {
        self.regions.reveal_slot(region)
    }

    /// Resolves a derived region key back to its name.
    pub fn resolve_region(&self, key: &RegionKey) -> Option<String> {
        self.regions.resolve(key)
    }

    /// All known region names, sorted.
    pub fn regions(&self) -> Vec<String> {
        self.regions.regions()
    }

    /// Ciphertexts of `field` for every measurement of `region`, in submission order.
    pub fn region_series(&self, region: &str, field: ReadingField) -> LedgerResult<Vec<C::Ciphertext>> {
        self.regions.accumulator(region)?;
        Ok(self.store().region_series(region, field))
    }

    // -----------------------------------------------------------------
    // Trend calculator
    // -----------------------------------------------------------------

    /// Encrypted mean of a region's tracked reading.
    pub fn region_average(&self, region: &str) -> LedgerResult<C::Ciphertext> {
        let snapshot = self.regions.accumulator(region)?;
        trend::mean_from_sum(self.scheme.as_ref(), &snapshot.encrypted_sum, snapshot.count)
    }

    /// Encrypted mean of `field` over an explicit list of measurements.
    pub fn average_of(&self, ids: &[MeasurementId], field: ReadingField) -> LedgerResult<C::Ciphertext> {
        let values = {
            let store = self.store();
            ids.iter()
                .map(|id| store.get(*id).map(|m| m.reading.field(field).clone()))
                .collect::<LedgerResult<Vec<_>>>()?
        };
        trend::average(self.scheme.as_ref(), &values)
    }

    // -----------------------------------------------------------------
    // Decryption requests
    // -----------------------------------------------------------------

    fn resolve_target(
        &self,
        subject: &DecryptionSubject,
    ) -> LedgerResult<(DecryptionTarget, Vec<crate::cipher::CipherHandle>)> {
        match subject {
            DecryptionSubject::Measurement(id) => {
                let store = self.store();
                let record = store.get(*id)?;
                if store.reveal_slot(*id)?.is_revealed() {
                    return Err(LedgerError::AlreadyRevealed(id.to_string()));
                }
                let handles = record
                    .reading
                    .iter()
                    .map(|(_, value)| self.scheme.to_handle(value))
                    .collect();
                Ok((DecryptionTarget::Measurement { id: *id }, handles))
            }
            DecryptionSubject::Region(name) => {
                if self.regions.reveal_slot(name)?.is_revealed() {
                    return Err(LedgerError::AlreadyRevealed(format!("region `{name}`")));
                }
                let snapshot = self.regions.accumulator(name)?;
                let target = DecryptionTarget::Region {
                    name: name.clone(),
                    key: RegionKey::derive(name),
                    count: snapshot.count,
                };
                Ok((target, vec![self.scheme.to_handle(&snapshot.encrypted_sum)]))
            }
        }
    }

    /// Issues a decryption request and hands it to the oracle.
    ///
    /// Unknown or already revealed targets fail before any request id is
    /// allocated.  If the oracle refuses the work the request is cancelled
    /// and [`LedgerError::Oracle`] is returned.
    pub fn request_decryption(&self, subject: impl Into<DecryptionSubject>) -> LedgerResult<RequestId> {
        let subject = subject.into();
        let (request_id, target, handles) = {
            let mut requests = self.requests();
            let (target, handles) = self.resolve_target(&subject)?;
            let id = requests.issue(target.clone(), handles.clone(), now_millis())?;
            (id, target, handles)
        };
        info!(request = %request_id, %target, "decryption requested");
        self.events.emit(&LedgerEvent::DecryptionRequested {
            request: request_id,
            target,
        });
        if let Err(err) = self.oracle.dispatch(OracleRequest {
            request_id,
            handles,
        }) {
            warn!(request = %request_id, %err, "oracle refused request; cancelling");
            self.withdraw(&request_id, "oracle dispatch failed")?;
            return Err(LedgerError::Oracle(err.to_string()));
        }
        Ok(request_id)
    }

    /// Shorthand for requesting a region statistic.
    pub fn request_region_decryption(&self, region: &str) -> LedgerResult<RequestId> {
        self.request_decryption(DecryptionSubject::Region(region.to_string()))
    }

    /// Applies an oracle callback.
    ///
    /// The request must be pending and the proof must verify; otherwise
    /// nothing changes and the request stays pending.  A second callback for
    /// the same request fails with [`LedgerError::AlreadyFulfilled`].
    pub fn fulfill(
        &self,
        request_id: RequestId,
        cleartexts: &[Fixed],
        proof: &DecryptionProof,
    ) -> LedgerResult<()> {
        let mut requests = self.requests();
        let request = match requests.pending(&request_id) {
            Ok(request) => request.clone(),
            Err(err) => {
                match &err {
                    LedgerError::UnknownRequest(_) => {
                        warn!(request = %request_id, "callback for unknown request ignored")
                    }
                    _ => debug!(request = %request_id, %err, "stale callback rejected"),
                }
                return Err(err);
            }
        };
        if !self.verifier.check_proof(&request_id, cleartexts, proof) {
            warn!(request = %request_id, "decryption proof rejected");
            return Err(LedgerError::InvalidProof(request_id));
        }
        let event = match &request.target {
            DecryptionTarget::Measurement { id } => {
                let values: [Fixed; 3] = cleartexts.try_into().map_err(|_| {
                    LedgerError::InvalidInput(format!(
                        "expected 3 cleartexts for {id}, got {}",
                        cleartexts.len()
                    ))
                })?;
                self.store_mut().reveal(*id, values)?;
                LedgerEvent::MeasurementDecrypted {
                    request: request_id,
                    id: *id,
                    values,
                }
            }
            DecryptionTarget::Region { name, key, count } => {
                let [sum] = cleartexts else {
                    return Err(LedgerError::InvalidInput(format!(
                        "expected 1 cleartext for region `{name}`, got {}",
                        cleartexts.len()
                    )));
                };
                self.regions.reveal(name, *sum, *count)?;
                LedgerEvent::RegionDecrypted {
                    request: request_id,
                    region: name.clone(),
                    key: *key,
                    sum: *sum,
                    count: *count,
                }
            }
        };
        requests.complete(&request_id)?;
        drop(requests);
        info!(request = %request_id, target = %request.target, "decryption fulfilled");
        self.events.emit(&event);
        Ok(())
    }

    fn withdraw(&self, request_id: &RequestId, reason: &str) -> LedgerResult<()> {
        self.requests().cancel(request_id)?;
        self.events.emit(&LedgerEvent::RequestCancelled {
            request: *request_id,
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Withdraws a pending request.  The target may be requested again.
    pub fn cancel(&self, request_id: &RequestId) -> LedgerResult<()> {
        self.withdraw(request_id, "cancelled")?;
        info!(request = %request_id, "decryption request cancelled");
        Ok(())
    }

    /// Cancels pending requests older than the configured timeout.
    pub fn expire_stale(&self) -> Vec<RequestId> {
        self.expire_stale_at(now_millis())
    }

    /// Same as [`expire_stale`](Self::expire_stale) against an explicit clock.
    pub fn expire_stale_at(&self, now_ms: u64) -> Vec<RequestId> {
        let Some(timeout) = self.config.request_timeout_ms else {
            return Vec::new();
        };
        let expired = self
            .requests()
            .expire_issued_before(now_ms.saturating_sub(timeout));
        for id in &expired {
            warn!(request = %id, timeout_ms = timeout, "decryption request expired");
            self.events.emit(&LedgerEvent::RequestCancelled {
                request: *id,
                reason: "expired".into(),
            });
        }
        expired
    }

    /// Looks up a request in any state.
    pub fn request(&self, request_id: &RequestId) -> Option<DecryptionRequest> {
        self.requests().get(request_id).cloned()
    }

    /// Number of requests currently pending.
    pub fn pending_requests(&self) -> usize {
        self.requests().pending_count()
    }

    /// Number of requests ever issued.
    pub fn issued_requests(&self) -> usize {
        self.requests().len()
    }
}

impl<C: MomentOps> ConfidentialLedger<C> {
    /// Encrypted population variance of `field` within a region.
    pub fn region_variance(&self, region: &str, field: ReadingField) -> LedgerResult<C::Ciphertext> {
        let series = self.region_series(region, field)?;
        trend::variance(self.scheme.as_ref(), &series)
    }

    /// Encrypted one-step forecast of `field` within a region.
    pub fn region_forecast(&self, region: &str, field: ReadingField) -> LedgerResult<C::Ciphertext> {
        let series = self.region_series(region, field)?;
        trend::forecast_next(self.scheme.as_ref(), &series)
    }

    /// Encrypted mean, variance and forecast of `field` within a region.
    pub fn region_summary(
        &self,
        region: &str,
        field: ReadingField,
    ) -> LedgerResult<TrendSummary<C::Ciphertext>> {
        let series = self.region_series(region, field)?;
        trend::summarize(self.scheme.as_ref(), &series)
    }
}
