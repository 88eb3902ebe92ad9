//! Append-only store of encrypted measurements and their reveal slots.

use crate::error::{LedgerError, LedgerResult};
use crate::fixed::Fixed;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier assigned to a measurement at submission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MeasurementId(pub u64);

impl fmt::Display for MeasurementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "measurement #{}", self.0)
    }
}

/// Identifies a submitting station.  Only compared for equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StationId(pub String);

impl From<&str> for StationId {
    fn from(value: &str) -> Self {
        StationId(value.to_string())
    }
}

impl fmt::Display for StationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The three scalar readings carried by every measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingField {
    /// Seawater pH.
    #[default]
    Ph,
    /// Carbonate ion concentration.
    Carbonate,
    /// Water temperature.
    Temperature,
}

impl ReadingField {
    /// All fields in the fixed order used for gathering and decoding.
    pub const ALL: [ReadingField; 3] = [Self::Ph, Self::Carbonate, Self::Temperature];

    /// Lower-case field name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ph => "ph",
            Self::Carbonate => "carbonate",
            Self::Temperature => "temperature",
        }
    }
}

impl std::str::FromStr for ReadingField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ph" => Ok(Self::Ph),
            "carbonate" => Ok(Self::Carbonate),
            "temperature" | "temp" => Ok(Self::Temperature),
            other => Err(format!("unknown reading field `{other}`")),
        }
    }
}

/// Encrypted readings submitted together by a station.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedReading<T> {
    /// Encrypted pH.
    pub ph: T,
    /// Encrypted carbonate concentration.
    pub carbonate: T,
    /// Encrypted temperature.
    pub temperature: T,
}

impl<T> EncryptedReading<T> {
    /// Returns the ciphertext for `field`.
    pub fn field(&self, field: ReadingField) -> &T {
        match field {
            ReadingField::Ph => &self.ph,
            ReadingField::Carbonate => &self.carbonate,
            ReadingField::Temperature => &self.temperature,
        }
    }

    /// Iterates the ciphertexts in gathering order.
    pub fn iter(&self) -> impl Iterator<Item = (ReadingField, &T)> {
        ReadingField::ALL.into_iter().map(move |f| (f, self.field(f)))
    }
}

/// Immutable ledger record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedMeasurement<T> {
    /// Assigned identifier.
    pub id: MeasurementId,
    /// Submitting station.
    pub station: StationId,
    /// Encrypted readings.
    pub reading: EncryptedReading<T>,
    /// Region key grouping the measurement for aggregation.
    pub region: String,
    /// Submission time in milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

/// Plaintext slot populated exactly once by a verified decryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RevealSlot {
    ph: Option<Fixed>,
    carbonate: Option<Fixed>,
    temperature: Option<Fixed>,
    revealed: bool,
}

impl RevealSlot {
    /// Whether the slot has been populated.
    pub fn is_revealed(&self) -> bool {
        self.revealed
    }

    /// Decrypted pH, if revealed.
    pub fn ph(&self) -> Option<Fixed> {
        self.ph
    }

    /// Decrypted carbonate concentration, if revealed.
    pub fn carbonate(&self) -> Option<Fixed> {
        self.carbonate
    }

    /// Decrypted temperature, if revealed.
    pub fn temperature(&self) -> Option<Fixed> {
        self.temperature
    }

    /// Populates all three fields at once.  A revealed slot never changes again.
    pub(crate) fn reveal(&mut self, values: [Fixed; 3]) -> LedgerResult<()> {
        if self.revealed {
            return Err(LedgerError::AlreadyRevealed("reveal slot".into()));
        }
        let [ph, carbonate, temperature] = values;
        self.ph = Some(ph);
        self.carbonate = Some(carbonate);
        self.temperature = Some(temperature);
        self.revealed = true;
        Ok(())
    }
}

/// Monotonic identifier source.  Never hands out the same value twice.
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    /// Creates an allocator whose first identifier is `first`.
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// Allocates the next identifier.
    ///
    /// Fails with [`LedgerError::IdSpaceExhausted`] once `u64::MAX` has been
    /// handed out; the counter is left untouched in that case.
    pub fn allocate(&self) -> LedgerResult<u64> {
        self.next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                current.checked_add(1)
            })
            .map_err(|_| LedgerError::IdSpaceExhausted)
    }

    /// Peeks at the identifier the next call would return.
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

/// Owns measurement records and their reveal slots.
#[derive(Debug)]
pub struct MeasurementStore<T> {
    records: BTreeMap<MeasurementId, EncryptedMeasurement<T>>,
    reveals: BTreeMap<MeasurementId, RevealSlot>,
}

impl<T: Clone> MeasurementStore<T> {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            records: BTreeMap::new(),
            reveals: BTreeMap::new(),
        }
    }

    /// Inserts a freshly allocated record together with an empty reveal slot.
    pub(crate) fn insert(&mut self, record: EncryptedMeasurement<T>) -> LedgerResult<()> {
        if self.records.contains_key(&record.id) {
            return Err(LedgerError::InvalidInput(format!(
                "{} already recorded",
                record.id
            )));
        }
        self.reveals.insert(record.id, RevealSlot::default());
        self.records.insert(record.id, record);
        Ok(())
    }

    /// Looks up a record.
    pub fn get(&self, id: MeasurementId) -> LedgerResult<&EncryptedMeasurement<T>> {
        self.records
            .get(&id)
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))
    }

    /// Looks up the reveal slot of a record.
    pub fn reveal_slot(&self, id: MeasurementId) -> LedgerResult<RevealSlot> {
        self.reveals
            .get(&id)
            .copied()
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))
    }

    pub(crate) fn reveal(&mut self, id: MeasurementId, values: [Fixed; 3]) -> LedgerResult<()> {
        let slot = self
            .reveals
            .get_mut(&id)
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;
        slot.reveal(values)
            .map_err(|_| LedgerError::AlreadyRevealed(id.to_string()))
    }

    /// Ciphertexts of `field` for every record in `region`, in submission order.
    pub fn region_series(&self, region: &str, field: ReadingField) -> Vec<T> {
        self.records
            .values()
            .filter(|record| record.region == region)
            .map(|record| record.reading.field(field).clone())
            .collect()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` if nothing has been submitted.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl<T: Clone> Default for MeasurementStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u64, region: &str) -> EncryptedMeasurement<u32> {
        EncryptedMeasurement {
            id: MeasurementId(id),
            station: StationId::from("buoy-7"),
            reading: EncryptedReading {
                ph: id as u32,
                carbonate: 100 + id as u32,
                temperature: 200 + id as u32,
            },
            region: region.to_string(),
            timestamp_ms: 1_700_000_000_000 + id,
        }
    }

    #[test]
    fn allocator_is_monotonic_and_fails_at_the_end() {
        let alloc = IdAllocator::default();
        assert_eq!(alloc.allocate().unwrap(), 1);
        assert_eq!(alloc.allocate().unwrap(), 2);

        let last = IdAllocator::starting_at(u64::MAX - 1);
        assert_eq!(last.allocate().unwrap(), u64::MAX - 1);
        assert_eq!(last.allocate(), Err(LedgerError::IdSpaceExhausted));
        assert_eq!(last.peek(), u64::MAX);
    }

    #[test]
    fn insert_creates_empty_reveal_slot() {
        let mut store = MeasurementStore::new();
        store.insert(record(1, "pacific-nw")).unwrap();
        let slot = store.reveal_slot(MeasurementId(1)).unwrap();
        assert!(!slot.is_revealed());
        assert_eq!(slot.ph(), None);
        assert!(store.insert(record(1, "pacific-nw")).is_err());
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let store: MeasurementStore<u32> = MeasurementStore::new();
        assert!(matches!(
            store.get(MeasurementId(9)),
            Err(LedgerError::NotFound(_))
        ));
        assert!(matches!(
            store.reveal_slot(MeasurementId(9)),
            Err(LedgerError::NotFound(_))
        ));
    }

    #[test]
    fn reveal_happens_once() {
        let mut store = MeasurementStore::new();
        store.insert(record(1, "gulf")).unwrap();
        let values = [
            Fixed::from_raw(8_050_000),
            Fixed::from_raw(2_100_000),
            Fixed::from_raw(12_500_000),
        ];
        store.reveal(MeasurementId(1), values).unwrap();
        let slot = store.reveal_slot(MeasurementId(1)).unwrap();
        assert!(slot.is_revealed());
        assert_eq!(slot.temperature(), Some(Fixed::from_raw(12_500_000)));
        assert!(matches!(
            store.reveal(MeasurementId(1), [Fixed::ZERO; 3]),
            Err(LedgerError::AlreadyRevealed(_))
        ));
        assert_eq!(store.reveal_slot(MeasurementId(1)).unwrap().ph(), Some(values[0]));
    }

    #[test]
    fn region_series_keeps_submission_order() {
        let mut store = MeasurementStore::new();
        store.insert(record(1, "gulf")).unwrap();
        store.insert(record(2, "arctic")).unwrap();
        store.insert(record(3, "gulf")).unwrap();
        assert_eq!(store.region_series("gulf", ReadingField::Ph), vec![1, 3]);
        assert_eq!(
            store.region_series("gulf", ReadingField::Temperature),
            vec![201, 203]
        );
        assert!(store.region_series("indian", ReadingField::Ph).is_empty());
    }
}
