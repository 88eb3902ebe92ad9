//! Per-region homomorphic accumulators.
//!
//! Each region owns one running encrypted sum and a plaintext count.  Regions
//! are created lazily, at most once, and live behind their own mutex so that
//! submissions into different regions proceed in parallel while submissions
//! into the same region are serialized.
//!
//! The set of regions is bounded.  Every region name is registered under its
//! Keccak-256 [`RegionKey`]; a name whose key is already held by a different
//! name is rejected at registration, so a derived key always resolves to
//! exactly one region.

use crate::cipher::CiphertextOps;
use crate::error::{LedgerError, LedgerResult};
use crate::fixed::Fixed;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::debug;

/// Keccak-256 digest of a region name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionKey(pub [u8; 32]);

impl RegionKey {
    /// Derives the key for `name`.
    pub fn derive(name: &str) -> Self {
        let mut hasher = Keccak256::new();
        hasher.update(name.as_bytes());
        let mut out = [0u8; 32];
        out.copy_from_slice(&hasher.finalize());
        RegionKey(out)
    }
}

impl fmt::Display for RegionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Encrypted sum and count exposed for a region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccumulatorSnapshot<T> {
    /// Homomorphic sum of every tracked reading in the region.
    pub encrypted_sum: T,
    /// Number of readings folded into the sum.
    pub count: u64,
}

/// Decrypted region statistic, populated once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RegionReveal {
    sum: Option<Fixed>,
    count: Option<u64>,
    revealed: bool,
}

impl RegionReveal {
    /// Whether the statistic has been decrypted.
    pub fn is_revealed(&self) -> bool {
        self.revealed
    }

    /// Decrypted sum.
    pub fn sum(&self) -> Option<Fixed> {
        self.sum
    }

    /// Count snapshot taken when the decryption was requested.
    pub fn count(&self) -> Option<u64> {
        self.count
    }

    /// Decrypted mean, rounded to the nearest micro-unit.
    pub fn mean(&self) -> Option<Fixed> {
        match (self.sum, self.count) {
            (Some(sum), Some(count)) if count > 0 => Some(Fixed::from_raw(
                crate::fixed::div_round(sum.raw() as i128, count as i128) as i64,
            )),
            _ => None,
        }
    }
}

/// Running state of one region.
#[derive(Debug)]
struct RegionAccumulator<T> {
    encrypted_sum: T,
    count: u64,
    reveal: RegionReveal,
}

impl<T: Clone> RegionAccumulator<T> {
    fn snapshot(&self) -> AccumulatorSnapshot<T> {
        AccumulatorSnapshot {
            encrypted_sum: self.encrypted_sum.clone(),
            count: self.count,
        }
    }
}

type Slot<T> = Arc<Mutex<RegionAccumulator<T>>>;

fn lock<T>(slot: &Mutex<T>) -> MutexGuard<'_, T> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns every region accumulator.
pub struct RegionAggregator<C: CiphertextOps> {
    scheme: Arc<C>,
    max_regions: usize,
    max_name_len: usize,
    regions: RwLock<HashMap<String, Slot<C::Ciphertext>>>,
    keys: RwLock<HashMap<RegionKey, String>>,
}

impl<C: CiphertextOps> fmt::Debug for RegionAggregator<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionAggregator")
            .field("max_regions", &self.max_regions)
            .field("regions", &self.len())
            .finish()
    }
}

impl<C: CiphertextOps> RegionAggregator<C> {
    /// Creates an aggregator holding at most `max_regions` regions.
    pub fn new(scheme: Arc<C>, max_regions: usize, max_name_len: usize) -> Self {
        Self {
            scheme,
            max_regions,
            max_name_len,
            regions: RwLock::new(HashMap::new()),
            keys: RwLock::new(HashMap::new()),
        }
    }

    fn lookup(&self, region: &str) -> Option<Slot<C::Ciphertext>> {
        self.regions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(region)
            .cloned()
    }

    fn slot(&self, region: &str) -> LedgerResult<Slot<C::Ciphertext>> {
        self.lookup(region)
            .ok_or_else(|| LedgerError::NotFound(format!("region `{region}`")))
    }

    /// Checks that `region` is an acceptable region name.
    pub fn validate_name(&self, region: &str) -> LedgerResult<()> {
        if region.is_empty() {
            return Err(LedgerError::InvalidInput("region name is empty".into()));
        }
        if region.len() > self.max_name_len {
            return Err(LedgerError::InvalidInput(format!(
                "region name exceeds {} bytes",
                self.max_name_len
            )));
        }
        if region.chars().any(char::is_control) {
            return Err(LedgerError::InvalidInput(
                "region name contains control characters".into(),
            ));
        }
        Ok(())
    }

    /// Registers `region` with `first` as its only reading.
    ///
    /// Returns the existing slot instead when another submitter created the
    /// region first.  Nothing is inserted unless the first addition succeeds.
    fn register(
        &self,
        region: &str,
        first: &C::Ciphertext,
    ) -> LedgerResult<Option<Slot<C::Ciphertext>>> {
        self.validate_name(region)?;
        let mut regions = self.regions.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = regions.get(region) {
            return Ok(Some(Arc::clone(slot)));
        }
        if regions.len() >= self.max_regions {
            return Err(LedgerError::InvalidInput(format!(
                "region capacity of {} reached",
                self.max_regions
            )));
        }
        let key = RegionKey::derive(region);
        let mut keys = self.keys.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = keys.get(&key) {
            return Err(LedgerError::InvalidInput(format!(
                "region `{region}` collides with `{existing}`"
            )));
        }
        let sum = self.scheme.add(&self.scheme.zero()?, first)?;
        keys.insert(key, region.to_string());
        regions.insert(
            region.to_string(),
            Arc::new(Mutex::new(RegionAccumulator {
                encrypted_sum: sum,
                count: 1,
                reveal: RegionReveal::default(),
            })),
        );
        debug!(region, key = %key, "region accumulator created");
        Ok(None)
    }

    /// Folds `value` into the region's sum and bumps its count, creating the
    /// region on its first reading.
    ///
    /// Returns the new count; a count of 1 means the region was just
    /// created.  On error neither the region set nor any accumulator changes.
    pub fn accumulate(&self, region: &str, value: &C::Ciphertext) -> LedgerResult<u64> {
        let slot = match self.lookup(region) {
            Some(slot) => slot,
            None => match self.register(region, value)? {
                Some(slot) => slot,
                None => return Ok(1),
            },
        };
        let mut acc = lock(&slot);
        let next = self.scheme.add(&acc.encrypted_sum, value)?;
        acc.encrypted_sum = next;
        acc.count += 1;
        Ok(acc.count)
    }

    /// Returns the encrypted sum and count of `region`.
    pub fn accumulator(&self, region: &str) -> LedgerResult<AccumulatorSnapshot<C::Ciphertext>> {
        let slot = self.slot(region)?;
        let acc = lock(&slot);
        Ok(acc.snapshot())
    }

    /// Returns the reveal slot of `region`.
    pub fn reveal_slot(&self, region: &str) -> LedgerResult<RegionReveal> {
        let slot = self.slot(region)?;
        let acc = lock(&slot);
        Ok(acc.reveal)
    }

    /// Resolves a derived key back to its region name.
    pub fn resolve(&self, key: &RegionKey) -> Option<String> {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub(crate) fn reveal(&self, region: &str, sum: Fixed, count: u64) -> LedgerResult<()> {
        let slot = self.slot(region)?;
        let mut acc = lock(&slot);
        if acc.reveal.revealed {
            return Err(LedgerError::AlreadyRevealed(format!("region `{region}`")));
        }
        acc.reveal = RegionReveal {
            sum: Some(sum),
            count: Some(count),
            revealed: true,
        };
        Ok(())
    }

    /// Names of every known region, sorted.
    pub fn regions(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .regions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Number of known regions.
    pub fn len(&self) -> usize {
        self.regions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns `true` when no region exists.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
