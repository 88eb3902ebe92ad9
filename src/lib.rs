#![deny(missing_docs)]

//! # tidewatch
//!
//! **tidewatch** is a confidential ledger for ocean-chemistry measurements.
//! Stations submit encrypted pH, carbonate and temperature readings; the
//! ledger stores them, folds one tracked reading per measurement into a
//! running encrypted sum per region, and releases plaintext only through an
//! asynchronous decryption oracle whose answers carry an attestor quorum
//! proof.
//!
//! ## Features
//!
//! * **Ciphertext capability**: the [`CiphertextOps`] trait describes the
//!   homomorphic operations the ledger relies on.  [`ReferenceScheme`] is an
//!   in-process coprocessor that hands out opaque handles.
//! * **Measurement store** with once-only reveal slots ([`store`]).
//! * **Region aggregation** with bounded, collision-checked region keys
//!   ([`region`]).
//! * **Decryption requests** moving `Pending -> Fulfilled | Cancelled`
//!   ([`request`]), verified by a K-of-N ed25519 [`QuorumVerifier`].
//! * **Encrypted trends**: sum, mean, population variance and a drift
//!   forecast computed without decrypting anything ([`trend`]).
//! * **Relay** (feature `relay`): a tokio channel oracle and worker loop.
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use tidewatch::{
//!     attestor_from_seed, encode_public_key_base64, ConfidentialLedger, Decryptor,
//!     EncryptedReading, LedgerConfig, LocalOracle, ReferenceScheme, StationId,
//! };
//!
//! let scheme = Arc::new(ReferenceScheme::new());
//! let attestor = attestor_from_seed("demo-attestor");
//! let mut config = LedgerConfig::default();
//! config.attestation.attestors = vec![encode_public_key_base64(&attestor.verifying_key())];
//! let verifier = Arc::new(config.quorum_verifier().unwrap());
//! let oracle = Arc::new(LocalOracle::new(
//!     Decryptor::new(Arc::clone(&scheme), vec![attestor]),
//!     16,
//! ));
//! let ledger = ConfidentialLedger::new(Arc::clone(&scheme), config, oracle.clone(), verifier);
//!
//! for ph in ["8.05", "8.02", "7.99"] {
//!     let reading = EncryptedReading {
//!         ph: scheme.encrypt(ph.parse().unwrap()).unwrap(),
//!         carbonate: scheme.encrypt("2.1".parse().unwrap()).unwrap(),
//!         temperature: scheme.encrypt("11.5".parse().unwrap()).unwrap(),
//!     };
//!     ledger.submit(StationId::from("buoy-7"), reading, "pacific-nw").unwrap();
//! }
//!
//! let request = ledger.request_region_decryption("pacific-nw").unwrap();
//! let answer = oracle.process_next().unwrap().unwrap();
//! ledger.fulfill(request, &answer.cleartexts, &answer.proof).unwrap();
//! let reveal = ledger.region_reveal("pacific-nw").unwrap();
//! assert_eq!(reveal.mean(), Some("8.02".parse().unwrap()));
//! ```

pub mod attestation;
pub mod cipher;
pub mod config;
pub mod error;
pub mod events;
pub mod fixed;
pub mod ledger;
pub mod oracle;
pub mod reference;
pub mod region;
#[cfg(feature = "relay")]
pub mod relay;
pub mod request;
pub mod store;
pub mod trend;

pub use attestation::{
    attestor_from_seed, decode_public_key_base64, decryption_payload, encode_public_key_base64,
    sign_decryption, AttestorSignature, DecryptionProof, KeyError, ProofVerifier, QuorumVerifier,
};
pub use cipher::{CipherError, CipherHandle, CiphertextOps, MomentOps};
pub use config::{AttestationConfig, ConfigError, LedgerConfig};
pub use error::{LedgerError, LedgerResult};
pub use events::{read_journal, EventSink, JsonlSink, LedgerEvent, MemorySink, NullSink};
pub use fixed::{Fixed, ParseFixedError, FIXED_DECIMALS, FIXED_SCALE};
pub use ledger::{ConfidentialLedger, DecryptionSubject};
pub use oracle::{DecryptionOracle, Decryptor, Fulfillment, LocalOracle, OracleError, OracleRequest};
pub use reference::{ReferenceScheme, SealedValue};
pub use region::{AccumulatorSnapshot, RegionAggregator, RegionKey, RegionReveal};
#[cfg(feature = "relay")]
pub use relay::{run_relay, ChannelOracle, RelayStats};
pub use request::{
    DecryptionRequest, DecryptionRequestManager, DecryptionTarget, RequestId, RequestState,
};
pub use store::{
    EncryptedMeasurement, EncryptedReading, IdAllocator, MeasurementId, MeasurementStore,
    ReadingField, RevealSlot, StationId,
};
pub use trend::TrendSummary;
