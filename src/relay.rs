//! Asynchronous oracle relay.
//!
//! [`ChannelOracle`] forwards requests into a bounded tokio channel without
//! blocking the caller.  [`run_relay`] drains that channel on a runtime,
//! answers each request with a [`Decryptor`] and feeds the result back into
//! the ledger until the shutdown future resolves.

use crate::cipher::CiphertextOps;
use crate::ledger::ConfidentialLedger;
use crate::oracle::{DecryptionOracle, Decryptor, OracleError, OracleRequest};
use std::future::Future;
use std::sync::Arc;
use tokio::select;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

/// Oracle front end backed by a bounded channel.
#[derive(Debug, Clone)]
pub struct ChannelOracle {
    tx: mpsc::Sender<OracleRequest>,
}

impl ChannelOracle {
    /// Creates the oracle and the receiving half consumed by [`run_relay`].
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<OracleRequest>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl DecryptionOracle for ChannelOracle {
    fn dispatch(&self, request: OracleRequest) -> Result<(), OracleError> {
        self.tx.try_send(request).map_err(|err| match err {
            TrySendError::Full(_) => OracleError::Unavailable("relay queue full".into()),
            TrySendError::Closed(_) => OracleError::Unavailable("relay stopped".into()),
        })
    }
}

/// Outcome counters reported when the relay stops.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// Callbacks accepted by the ledger.
    pub fulfilled: usize,
    /// Callbacks the ledger refused (stale, cancelled, bad proof).
    pub rejected: usize,
    /// Requests the decryptor could not answer; these are cancelled.
    pub failed: usize,
}

fn relay_one<C: CiphertextOps>(
    ledger: &ConfidentialLedger<C>,
    decryptor: &Decryptor,
    request: OracleRequest,
    stats: &mut RelayStats,
) {
    let request_id = request.request_id;
    match decryptor.answer(&request) {
        Ok(answer) => match ledger.fulfill(answer.request_id, &answer.cleartexts, &answer.proof) {
            Ok(()) => stats.fulfilled += 1,
            Err(err) => {
                debug!(request = %request_id, %err, "relay callback rejected");
                stats.rejected += 1;
            }
        },
        Err(err) => {
            warn!(request = %request_id, %err, "relay could not decrypt request");
            if let Err(err) = ledger.cancel(&request_id) {
                debug!(request = %request_id, %err, "cancel after failed decryption");
            }
            stats.failed += 1;
        }
    }
}

/// Answers requests from `rx` until `shutdown` resolves or every sender is gone.
pub async fn run_relay<C, F>(
    ledger: Arc<ConfidentialLedger<C>>,
    mut rx: mpsc::Receiver<OracleRequest>,
    decryptor: Decryptor,
    shutdown: F,
) -> RelayStats
where
    C: CiphertextOps,
    F: Future<Output = ()>,
{
    let mut stats = RelayStats::default();
    tokio::pin!(shutdown);
    info!("decryption relay started");
    loop {
        select! {
            _ = &mut shutdown => {
                info!("decryption relay shutting down");
                break;
            }
            next = rx.recv() => match next {
                Some(request) => relay_one(&ledger, &decryptor, request, &mut stats),
                None => break,
            },
        }
    }
    info!(
        fulfilled = stats.fulfilled,
        rejected = stats.rejected,
        failed = stats.failed,
        "decryption relay stopped"
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::{attestor_from_seed, encode_public_key_base64};
    use crate::config::LedgerConfig;
    use crate::error::LedgerError;
    use crate::fixed::Fixed;
    use crate::reference::ReferenceScheme;
    use crate::store::{EncryptedReading, StationId};
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn setup(
        capacity: usize,
    ) -> (
        Arc<ConfidentialLedger<ReferenceScheme>>,
        Arc<ReferenceScheme>,
        mpsc::Receiver<OracleRequest>,
        Decryptor,
    ) {
        let scheme = Arc::new(ReferenceScheme::with_seed([11u8; 32]));
        let key = attestor_from_seed("relay");
        let mut config = LedgerConfig::default();
        config.attestation.attestors = vec![encode_public_key_base64(&key.verifying_key())];
        let verifier = Arc::new(config.quorum_verifier().unwrap());
        let (oracle, rx) = ChannelOracle::channel(capacity);
        let ledger = Arc::new(ConfidentialLedger::new(
            Arc::clone(&scheme),
            config,
            Arc::new(oracle),
            verifier,
        ));
        let decryptor = Decryptor::new(Arc::clone(&scheme), vec![key]);
        (ledger, scheme, rx, decryptor)
    }

    fn reading(scheme: &ReferenceScheme, ph: &str) -> EncryptedReading<crate::reference::SealedValue> {
        EncryptedReading {
            ph: scheme.encrypt(ph.parse().unwrap()).unwrap(),
            carbonate: scheme.encrypt(Fixed::ZERO).unwrap(),
            temperature: scheme.encrypt(Fixed::ZERO).unwrap(),
        }
    }

    #[tokio::test]
    async fn relay_fulfils_dispatched_requests() {
        let (ledger, scheme, rx, decryptor) = setup(8);
        let id = ledger
            .submit(StationId::from("buoy"), reading(&scheme, "8.05"), "gulf")
            .unwrap();
        ledger
            .submit(StationId::from("buoy"), reading(&scheme, "7.95"), "gulf")
            .unwrap();

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let relay = tokio::spawn(run_relay(Arc::clone(&ledger), rx, decryptor, async move {
            let _ = stop_rx.await;
        }));

        ledger.request_decryption(id).unwrap();
        ledger.request_region_decryption("gulf").unwrap();
        for _ in 0..200 {
            if ledger.pending_requests() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        stop_tx.send(()).unwrap();
        let stats = relay.await.unwrap();

        assert_eq!(stats.fulfilled, 2);
        assert_eq!(ledger.reveal_slot(id).unwrap().ph(), Some("8.05".parse().unwrap()));
        assert_eq!(
            ledger.region_reveal("gulf").unwrap().mean(),
            Some("8.0".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn full_channel_cancels_the_request() {
        let (ledger, scheme, _rx, _decryptor) = setup(1);
        let a = ledger
            .submit(StationId::from("s"), reading(&scheme, "8.0"), "gulf")
            .unwrap();
        let b = ledger
            .submit(StationId::from("s"), reading(&scheme, "8.1"), "gulf")
            .unwrap();
        ledger.request_decryption(a).unwrap();
        assert!(matches!(
            ledger.request_decryption(b),
            Err(LedgerError::Oracle(_))
        ));
        assert_eq!(ledger.pending_requests(), 1);
    }

    #[tokio::test]
    async fn closed_channel_refuses_dispatch() {
        let (oracle, rx) = ChannelOracle::channel(4);
        drop(rx);
        let result = oracle.dispatch(OracleRequest {
            request_id: crate::request::RequestId([1u8; 32]),
            handles: Vec::new(),
        });
        assert!(matches!(result, Err(OracleError::Unavailable(_))));
    }
}
