//! Ledger notifications.
//!
//! Events are emitted for observers only; correctness never depends on them.
//! [`JsonlSink`] keeps an append-only journal with one JSON object per line.

use crate::fixed::Fixed;
use crate::region::RegionKey;
use crate::request::{DecryptionTarget, RequestId};
use crate::store::{MeasurementId, StationId};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::warn;

/// Notification emitted by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LedgerEvent {
    /// A measurement was appended.
    MeasurementSubmitted {
        /// Assigned identifier.
        id: MeasurementId,
        /// Submitting station.
        station: StationId,
        /// Region the measurement was folded into.
        region: String,
        /// Submission time (ms).
        timestamp_ms: u64,
    },
    /// A decryption request was dispatched to the oracle.
    DecryptionRequested {
        /// Issued request id.
        request: RequestId,
        /// Request target.
        target: DecryptionTarget,
    },
    /// A measurement's readings were revealed.
    MeasurementDecrypted {
        /// Fulfilled request id.
        request: RequestId,
        /// Revealed record.
        id: MeasurementId,
        /// Decrypted pH, carbonate, temperature.
        values: [Fixed; 3],
    },
    /// A region statistic was revealed.
    RegionDecrypted {
        /// Fulfilled request id.
        request: RequestId,
        /// Region name.
        region: String,
        /// Derived region key.
        key: RegionKey,
        /// Decrypted sum.
        sum: Fixed,
        /// Count snapshot.
        count: u64,
    },
    /// A pending request was withdrawn or expired.
    RequestCancelled {
        /// Cancelled request id.
        request: RequestId,
        /// Why the request ended.
        reason: String,
    },
}

/// Receives ledger notifications.
pub trait EventSink: Send + Sync {
    /// Handles one event.  Failures must not propagate into the ledger.
    fn emit(&self, event: &LedgerEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &LedgerEvent) {}
}

/// Keeps events in memory, mainly for tests and the demo.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<LedgerEvent>>,
}

impl MemorySink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every recorded event.
    pub fn events(&self) -> Vec<LedgerEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &LedgerEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

/// Appends events to a JSON-lines file.
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlSink {
    /// Opens (and creates the parent directory of) the journal at `path`.
    pub fn new(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    /// Location of the journal.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, event: &LedgerEvent) -> Result<(), String> {
        let mut line = serde_json::to_string(event).map_err(|err| err.to_string())?;
        line.push('\n');
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(line.as_bytes()))
            .map_err(|err| err.to_string())
    }
}

impl EventSink for JsonlSink {
    fn emit(&self, event: &LedgerEvent) {
        if let Err(err) = self.append(event) {
            warn!(path = %self.path.display(), %err, "failed to append ledger event");
        }
    }
}

/// Reads back a journal written by [`JsonlSink`].
pub fn read_journal(path: &Path) -> Result<Vec<LedgerEvent>, String> {
    let contents = fs::read_to_string(path)
        .map_err(|err| format!("failed to read {}: {err}", path.display()))?;
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(idx, line)| {
            serde_json::from_str(line)
                .map_err(|err| format!("{} line {}: {err}", path.display(), idx + 1))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    #[test]
    fn jsonl_sink_appends_one_line_per_event() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("tidewatch_events_{nanos}"));
        let sink = JsonlSink::new(dir.join("journal.jsonl")).unwrap();
        let submitted = LedgerEvent::MeasurementSubmitted {
            id: MeasurementId(1),
            station: StationId::from("buoy-1"),
            region: "pacific-nw".into(),
            timestamp_ms: 42,
        };
        let cancelled = LedgerEvent::RequestCancelled {
            request: RequestId([9u8; 32]),
            reason: "expired".into(),
        };
        sink.emit(&submitted);
        sink.emit(&cancelled);

        let raw = fs::read_to_string(sink.path()).unwrap();
        assert_eq!(raw.lines().count(), 2);
        assert!(raw.lines().next().unwrap().contains("\"event\":\"measurement_submitted\""));
        assert_eq!(read_journal(sink.path()).unwrap(), vec![submitted, cancelled]);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn memory_sink_records_in_order() {
        let sink = MemorySink::new();
        for id in 1..=3 {
            sink.emit(&LedgerEvent::MeasurementSubmitted {
                id: MeasurementId(id),
                station: StationId::from("s"),
                region: "r".into(),
                timestamp_ms: id,
            });
        }
        let ids: Vec<u64> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                LedgerEvent::MeasurementSubmitted { id, .. } => Some(id.0),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
