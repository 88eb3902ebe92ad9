//! Command-line front end for the tidewatch ledger.
//!
//! `demo` drives a full submit / aggregate / decrypt cycle against the
//! in-process reference coprocessor, `keygen` derives attestor keys, and
//! `check-config` validates a configuration file.

use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{
    env,
    path::{Path, PathBuf},
    sync::Arc,
};
use tidewatch::{
    attestor_from_seed, encode_public_key_base64, ConfidentialLedger, Decryptor, EncryptedReading,
    EventSink, Fixed, JsonlSink, LedgerConfig, LedgerError, LocalOracle, MeasurementId,
    MemorySink, ReadingField, ReferenceScheme, SealedValue, StationId,
};
use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEMO_ATTESTORS: [&str; 3] = [
    "tidewatch-attestor-1",
    "tidewatch-attestor-2",
    "tidewatch-attestor-3",
];

fn fatal(message: &str) -> ! {
    eprintln!("{message}");
    std::process::exit(1);
}

/// Aborts on fatal ledger errors and logs recoverable ones.
fn skip_or_abort(context: &str, err: LedgerError) {
    if err.is_fatal() {
        fatal(&format!("{context}: {err}; ledger cannot continue"));
    }
    warn!(%err, "{context} skipped");
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn main() {
    init_logging();
    let mut args = env::args().skip(1);
    let command = args.next();
    match command.as_deref() {
        Some("demo") => cmd_demo(args.collect()),
        Some("keygen") => cmd_keygen(args.collect()),
        Some("check-config") => cmd_check_config(args.collect()),
        _ => {
            eprintln!("Usage: tidewatch <demo|keygen|check-config> ...");
            eprintln!("  demo [--config <path>] [--events <journal.jsonl>] [--seed <u64>]");
            eprintln!("  keygen --seed <seed>");
            eprintln!("  check-config <path>");
            std::process::exit(1);
        }
    }
}

fn load_config(path: Option<&Path>) -> LedgerConfig {
    let base = match path {
        Some(path) => LedgerConfig::load(path)
            .unwrap_or_else(|err| fatal(&format!("failed to load {}: {err}", path.display()))),
        None => LedgerConfig::default(),
    };
    base.with_env_overrides()
        .unwrap_or_else(|err| fatal(&format!("invalid environment override: {err}")))
}

fn cmd_keygen(args: Vec<String>) {
    let mut seed: Option<String> = None;
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--seed" => {
                seed = Some(
                    iter.next()
                        .unwrap_or_else(|| fatal("--seed expects a value")),
                );
            }
            other => fatal(&format!("unknown argument: {other}")),
        }
    }
    let seed = seed.unwrap_or_else(|| fatal("Usage: tidewatch keygen --seed <seed>"));
    let signing = attestor_from_seed(&seed);
    println!(
        "public_key_b64: {}",
        encode_public_key_base64(&signing.verifying_key())
    );
}

fn cmd_check_config(args: Vec<String>) {
    let [path] = args.as_slice() else {
        fatal("Usage: tidewatch check-config <path>")
    };
    let path = Path::new(path);
    if !path.exists() {
        fatal(&format!("config file {} does not exist", path.display()));
    }
    let config = load_config(Some(path));
    config
        .validate()
        .unwrap_or_else(|err| fatal(&format!("{}: {err}", path.display())));
    config
        .quorum_verifier()
        .unwrap_or_else(|err| fatal(&format!("{}: {err}", path.display())));
    let rendered = serde_json::to_string_pretty(&config)
        .unwrap_or_else(|err| fatal(&format!("failed to render config: {err}")));
    println!("{rendered}");
    println!("config ok");
}

struct Demo {
    scheme: Arc<ReferenceScheme>,
    oracle: Arc<LocalOracle>,
    ledger: ConfidentialLedger<ReferenceScheme>,
}

impl Demo {
    fn seal(&self, value: Fixed) -> SealedValue {
        self.scheme
            .encrypt(value)
            .unwrap_or_else(|err| fatal(&format!("encryption failed: {err}")))
    }

    fn submit(&self, station: &str, region: &str, values: [Fixed; 3]) -> Option<MeasurementId> {
        let reading = EncryptedReading {
            ph: self.seal(values[0]),
            carbonate: self.seal(values[1]),
            temperature: self.seal(values[2]),
        };
        match self.ledger.submit(StationId::from(station), reading, region) {
            Ok(id) => Some(id),
            Err(err) => {
                skip_or_abort(&format!("submit from {station}"), err);
                None
            }
        }
    }

    fn view(&self, value: &SealedValue) -> Fixed {
        self.scheme
            .decrypt(&value.handle())
            .unwrap_or_else(|err| fatal(&format!("coprocessor lookup failed: {err}")))
    }

    fn settle(&self) -> usize {
        let mut settled = 0;
        for answer in self.oracle.drain() {
            let answer = answer.unwrap_or_else(|err| fatal(&format!("oracle failed: {err}")));
            match self
                .ledger
                .fulfill(answer.request_id, &answer.cleartexts, &answer.proof)
            {
                Ok(()) => settled += 1,
                Err(err) => skip_or_abort(&format!("callback {}", answer.request_id), err),
            }
        }
        settled
    }
}

fn fixed(text: &str) -> Fixed {
    text.parse()
        .unwrap_or_else(|err| fatal(&format!("bad constant {text}: {err}")))
}

fn jitter(rng: &mut StdRng, base: Fixed, spread: i64) -> Fixed {
    Fixed::from_raw(base.raw() + rng.gen_range(-spread..=spread))
}

fn cmd_demo(args: Vec<String>) {
    let mut config_path: Option<PathBuf> = None;
    let mut events_path: Option<PathBuf> = None;
    let mut seed: u64 = 7;
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                config_path = Some(PathBuf::from(
                    iter.next()
                        .unwrap_or_else(|| fatal("--config expects a value")),
                ));
            }
            "--events" => {
                events_path = Some(PathBuf::from(
                    iter.next()
                        .unwrap_or_else(|| fatal("--events expects a value")),
                ));
            }
            "--seed" => {
                seed = iter
                    .next()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(|| fatal("--seed expects an unsigned integer"));
            }
            other => fatal(&format!("unknown argument: {other}")),
        }
    }

    let keys: Vec<_> = DEMO_ATTESTORS
        .iter()
        .map(|seed| attestor_from_seed(seed))
        .collect();
    let mut config = load_config(config_path.as_deref());
    if config.attestation.attestors.is_empty() {
        config.attestation.attestors = keys
            .iter()
            .map(|key| encode_public_key_base64(&key.verifying_key()))
            .collect();
        config.attestation.threshold = 2;
    }
    config
        .validate()
        .unwrap_or_else(|err| fatal(&format!("{err}")));
    let verifier = config
        .quorum_verifier()
        .unwrap_or_else(|err| fatal(&format!("{err}")));

    let events: Arc<dyn EventSink> = match &events_path {
        Some(path) => Arc::new(
            JsonlSink::new(path)
                .unwrap_or_else(|err| fatal(&format!("failed to open {}: {err}", path.display()))),
        ),
        None => Arc::new(MemorySink::new()),
    };
    let scheme = Arc::new(ReferenceScheme::new());
    let oracle = Arc::new(LocalOracle::new(
        Decryptor::new(Arc::clone(&scheme), keys),
        64,
    ));
    let ledger = ConfidentialLedger::new(
        Arc::clone(&scheme),
        config,
        oracle.clone(),
        Arc::new(verifier),
    )
    .with_events(events);
    let demo = Demo {
        scheme,
        oracle,
        ledger,
    };
    let tracked = demo.ledger.config().tracked_field;

    let first = demo
        .submit(
            "pnw-buoy-1",
            "pacific-nw",
            [fixed("8.05"), fixed("2.10"), fixed("11.40")],
        )
        .unwrap_or_else(|| fatal("first measurement was rejected"));
    demo.submit(
        "pnw-buoy-2",
        "pacific-nw",
        [fixed("8.02"), fixed("2.05"), fixed("11.10")],
    );
    demo.submit(
        "pnw-buoy-3",
        "pacific-nw",
        [fixed("7.99"), fixed("1.98"), fixed("10.90")],
    );

    let mut rng = StdRng::seed_from_u64(seed);
    let sites = [
        ("gulf-of-maine", ["8.10", "2.30", "9.50"]),
        ("arctic", ["8.15", "1.70", "1.20"]),
    ];
    for (region, base) in sites {
        for station in 1..=4 {
            let values = [
                jitter(&mut rng, fixed(base[0]), 40_000),
                jitter(&mut rng, fixed(base[1]), 80_000),
                jitter(&mut rng, fixed(base[2]), 500_000),
            ];
            demo.submit(&format!("{region}-{station}"), region, values);
        }
    }

    println!("tracked field: {}", tracked.as_str());
    for region in demo.ledger.regions() {
        let summary = demo
            .ledger
            .region_summary(&region, tracked)
            .unwrap_or_else(|err| fatal(&format!("trend for {region} failed: {err}")));
        println!(
            "{region}: n={} mean={} variance={} forecast={}",
            summary.count,
            demo.view(&summary.mean),
            demo.view(&summary.variance),
            demo.view(&summary.forecast),
        );
        if let Err(err) = demo.ledger.request_region_decryption(&region) {
            skip_or_abort(&format!("decryption of {region}"), err);
        }
    }
    let request = demo
        .ledger
        .request_decryption(first)
        .unwrap_or_else(|err| fatal(&format!("measurement request failed: {err}")));
    println!("settled {} decryption callbacks", demo.settle());

    for region in demo.ledger.regions() {
        let reveal = demo
            .ledger
            .region_reveal(&region)
            .unwrap_or_else(|err| fatal(&format!("{err}")));
        let show = |value: Option<Fixed>| value.map(|v| v.to_string()).unwrap_or_default();
        println!(
            "revealed {region}: sum={} count={} mean={}",
            show(reveal.sum()),
            reveal.count().unwrap_or_default(),
            show(reveal.mean()),
        );
    }
    let slot = demo
        .ledger
        .reveal_slot(first)
        .unwrap_or_else(|err| fatal(&format!("{err}")));
    for field in ReadingField::ALL {
        let value = match field {
            ReadingField::Ph => slot.ph(),
            ReadingField::Carbonate => slot.carbonate(),
            ReadingField::Temperature => slot.temperature(),
        };
        if let Some(value) = value {
            println!("{first} {}: {value}", field.as_str());
        }
    }

    let replay = demo.ledger.request(&request).map(|r| r.state);
    println!("request {request} state: {replay:?}");
    if let Some(path) = events_path {
        println!("event journal: {}", path.display());
    }
}
