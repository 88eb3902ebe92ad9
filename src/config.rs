//! Ledger configuration.
//!
//! Loaded from a JSON file; a missing file yields the defaults.  A handful of
//! `TIDEWATCH_*` environment variables override individual fields.

use crate::attestation::{KeyError, QuorumVerifier};
use crate::store::ReadingField;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Attestor quorum settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttestationConfig {
    /// Distinct attestor signatures needed to accept a decryption proof.
    pub threshold: usize,
    /// Base64 ed25519 public keys of the authorised attestors.
    pub attestors: Vec<String>,
}

impl Default for AttestationConfig {
    fn default() -> Self {
        Self {
            threshold: 1,
            attestors: Vec::new(),
        }
    }
}

/// Runtime configuration of a ledger instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Reading folded into the region accumulators.
    pub tracked_field: ReadingField,
    /// Upper bound on the number of distinct regions.
    pub max_regions: usize,
    /// Upper bound on region name length in bytes.
    pub max_region_name_len: usize,
    /// Pending requests older than this are cancelled by `expire_stale`.
    pub request_timeout_ms: Option<u64>,
    /// Attestor quorum.
    pub attestation: AttestationConfig,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            tracked_field: ReadingField::Ph,
            max_regions: 1024,
            max_region_name_len: 64,
            request_timeout_ms: None,
            attestation: AttestationConfig::default(),
        }
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    /// Filesystem failure.
    Io(String),
    #[error("config parse error: {0}")]
    /// JSON or environment value could not be parsed.
    Parse(String),
    #[error("invalid config: {0}")]
    /// Values are inconsistent.
    Invalid(String),
}

impl From<KeyError> for ConfigError {
    fn from(err: KeyError) -> Self {
        ConfigError::Invalid(err.to_string())
    }
}

impl LedgerConfig {
    /// Loads a JSON config file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path).map_err(|err| ConfigError::Io(err.to_string()))?;
        serde_json::from_str(&contents).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Applies `TIDEWATCH_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary lookup (the environment in production).
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(value) = lookup("TIDEWATCH_TRACKED_FIELD") {
            self.tracked_field = value.parse().map_err(ConfigError::Parse)?;
        }
        if let Some(value) = lookup("TIDEWATCH_MAX_REGIONS") {
            self.max_regions = parse_env("TIDEWATCH_MAX_REGIONS", &value)?;
        }
        if let Some(value) = lookup("TIDEWATCH_REQUEST_TIMEOUT_MS") {
            self.request_timeout_ms = Some(parse_env("TIDEWATCH_REQUEST_TIMEOUT_MS", &value)?);
        }
        if let Some(value) = lookup("TIDEWATCH_ATTESTATION_THRESHOLD") {
            self.attestation.threshold = parse_env("TIDEWATCH_ATTESTATION_THRESHOLD", &value)?;
        }
        Ok(self)
    }

    /// Rejects inconsistent settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_regions == 0 {
            return Err(ConfigError::Invalid("max_regions must be positive".into()));
        }
        if self.max_region_name_len == 0 {
            return Err(ConfigError::Invalid(
                "max_region_name_len must be positive".into(),
            ));
        }
        if self.request_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "request_timeout_ms must be positive when set".into(),
            ));
        }
        let threshold = self.attestation.threshold;
        if threshold == 0 {
            return Err(ConfigError::Invalid(
                "attestation threshold must be positive".into(),
            ));
        }
        if threshold > self.attestation.attestors.len() {
            return Err(ConfigError::Invalid(format!(
                "attestation threshold {threshold} exceeds {} attestors",
                self.attestation.attestors.len()
            )));
        }
        Ok(())
    }

    /// Builds the proof verifier described by `attestation`.
    pub fn quorum_verifier(&self) -> Result<QuorumVerifier, ConfigError> {
        Ok(QuorumVerifier::from_base64(
            self.attestation.threshold,
            &self.attestation.attestors,
        )?)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Parse(format!("{key}={value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::{attestor_from_seed, encode_public_key_base64};
    use std::collections::HashMap;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn attestor(seed: &str) -> String {
        encode_public_key_base64(&attestor_from_seed(seed).verifying_key())
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = LedgerConfig::load(Path::new("/definitely/not/here.json")).unwrap();
        assert_eq!(cfg, LedgerConfig::default());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let path = std::env::temp_dir().join(format!("tidewatch_cfg_{nanos}.json"));
        fs::write(
            &path,
            format!(
                "{{\"tracked_field\":\"temperature\",\"attestation\":{{\"threshold\":1,\"attestors\":[\"{}\"]}}}}",
                attestor("alpha")
            ),
        )
        .unwrap();
        let cfg = LedgerConfig::load(&path).unwrap();
        fs::remove_file(&path).unwrap();
        assert_eq!(cfg.tracked_field, ReadingField::Temperature);
        assert_eq!(cfg.max_regions, 1024);
        cfg.validate().unwrap();
        assert_eq!(cfg.quorum_verifier().unwrap().threshold(), 1);
    }

    #[test]
    fn overrides_apply_and_reject_garbage() {
        let vars: HashMap<&str, &str> = [
            ("TIDEWATCH_TRACKED_FIELD", "carbonate"),
            ("TIDEWATCH_MAX_REGIONS", "8"),
            ("TIDEWATCH_REQUEST_TIMEOUT_MS", "30000"),
        ]
        .into_iter()
        .collect();
        let cfg = LedgerConfig::default()
            .with_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(cfg.tracked_field, ReadingField::Carbonate);
        assert_eq!(cfg.max_regions, 8);
        assert_eq!(cfg.request_timeout_ms, Some(30_000));

        let bad = LedgerConfig::default()
            .with_overrides(|k| (k == "TIDEWATCH_MAX_REGIONS").then(|| "lots".to_string()));
        assert!(matches!(bad, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn validation_catches_inconsistent_quorum() {
        let mut cfg = LedgerConfig::default();
        assert!(cfg.validate().is_err());
        cfg.attestation.attestors = vec![attestor("a"), attestor("b")];
        cfg.attestation.threshold = 3;
        assert!(cfg.validate().is_err());
        cfg.attestation.threshold = 2;
        cfg.validate().unwrap();
        cfg.max_regions = 0;
        assert!(cfg.validate().is_err());
    }
}
