//! In-process reference coprocessor for the ciphertext capability.
//!
//! Ciphertexts are 32-byte handles that point into values held by the
//! coprocessor, the way handle-based FHE coprocessors expose their state to a
//! ledger.  Fresh handles are derived from a domain-separated BLAKE2b-256
//! stream so they are unlinkable to the values they reference.  The plaintext
//! side ([`ReferenceScheme::encrypt`] and [`ReferenceScheme::decrypt`]) stands
//! in for station encryptors and the oracle's key holder; the ledger itself
//! only ever calls the [`CiphertextOps`] surface.
//!
//! The value table only grows.  Every `encrypt`, `zero`, `add`, `div`, `sub`
//! and `mul` stores its result under a fresh handle, and nothing is released
//! until the scheme itself is dropped, so [`ReferenceScheme::len`] tracks the
//! total number of operations performed.  Long-running callers should scope a
//! scheme to a bounded workload.

use crate::cipher::{CipherError, CipherHandle, CiphertextOps, MomentOps};
use crate::fixed::{div_round, Fixed, FIXED_SCALE};
use blake2::digest::{consts::U32, Digest};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

type Blake2b256 = blake2::Blake2b<U32>;

const HANDLE_DOMAIN: &[u8] = b"TIDEWATCH_HANDLE";

/// Ciphertext produced by [`ReferenceScheme`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SealedValue {
    handle: CipherHandle,
}

impl SealedValue {
    /// A ciphertext that was never initialized by any scheme.
    pub fn uninitialized() -> Self {
        Self::default()
    }

    /// Returns the handle carried by this ciphertext.
    pub fn handle(&self) -> CipherHandle {
        self.handle
    }
}

#[derive(Debug)]
struct Coprocessor {
    seed: [u8; 32],
    counter: u64,
    values: HashMap<CipherHandle, i128>,
}

impl Coprocessor {
    fn next_handle(&mut self) -> CipherHandle {
        loop {
            let mut hasher = Blake2b256::new();
            hasher.update(HANDLE_DOMAIN);
            hasher.update(self.seed);
            hasher.update(self.counter.to_be_bytes());
            self.counter = self.counter.wrapping_add(1);
            let mut out = [0u8; 32];
            out.copy_from_slice(&hasher.finalize());
            let handle = CipherHandle(out);
            if !handle.is_unset() && !self.values.contains_key(&handle) {
                return handle;
            }
        }
    }

    fn store(&mut self, raw: i128) -> Result<SealedValue, CipherError> {
        if raw > i64::MAX as i128 || raw < i64::MIN as i128 {
            return Err(CipherError::Overflow);
        }
        let handle = self.next_handle();
        self.values.insert(handle, raw);
        Ok(SealedValue { handle })
    }

    fn load(&self, value: &SealedValue) -> Result<i128, CipherError> {
        if value.handle.is_unset() {
            return Err(CipherError::Uninitialized);
        }
        self.values
            .get(&value.handle)
            .copied()
            .ok_or(CipherError::UnknownHandle(value.handle))
    }
}

/// Reference implementation of the ciphertext capability.
#[derive(Debug)]
pub struct ReferenceScheme {
    inner: Mutex<Coprocessor>,
}

impl ReferenceScheme {
    /// Creates a coprocessor whose handle stream is seeded from the OS RNG.
    pub fn new() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Self::with_seed(seed)
    }

    /// Creates a coprocessor with a deterministic handle stream.
    pub fn with_seed(seed: [u8; 32]) -> Self {
        Self {
            inner: Mutex::new(Coprocessor {
                seed,
                counter: 0,
                values: HashMap::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, Coprocessor> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Encrypts a plaintext reading.
    pub fn encrypt(&self, value: Fixed) -> Result<SealedValue, CipherError> {
        self.state().store(value.raw() as i128)
    }

    /// Decrypts the value referenced by `handle`.
    pub fn decrypt(&self, handle: &CipherHandle) -> Result<Fixed, CipherError> {
        let raw = self.state().load(&SealedValue { handle: *handle })?;
        i64::try_from(raw)
            .map(Fixed::from_raw)
            .map_err(|_| CipherError::Overflow)
    }

    /// Number of ciphertexts currently held by the coprocessor.
    pub fn len(&self) -> usize {
        self.state().values.len()
    }

    /// Returns `true` when no ciphertext has been produced yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ReferenceScheme {
    fn default() -> Self {
        Self::new()
    }
}

impl CiphertextOps for ReferenceScheme {
    type Ciphertext = SealedValue;

    fn zero(&self) -> Result<SealedValue, CipherError> {
        self.state().store(0)
    }

    fn add(&self, a: &SealedValue, b: &SealedValue) -> Result<SealedValue, CipherError> {
        let mut state = self.state();
        let sum = state
            .load(a)?
            .checked_add(state.load(b)?)
            .ok_or(CipherError::Overflow)?;
        state.store(sum)
    }

    fn div(&self, a: &SealedValue, divisor: u64) -> Result<SealedValue, CipherError> {
        if divisor == 0 {
            return Err(CipherError::DivisionByZero);
        }
        let mut state = self.state();
        let value = state.load(a)?;
        state.store(div_round(value, divisor as i128))
    }

    fn is_initialized(&self, c: &SealedValue) -> bool {
        !c.handle.is_unset() && self.state().values.contains_key(&c.handle)
    }

    fn to_handle(&self, c: &SealedValue) -> CipherHandle {
        c.handle
    }
}

impl MomentOps for ReferenceScheme {
    fn sub(&self, a: &SealedValue, b: &SealedValue) -> Result<SealedValue, CipherError> {
        let mut state = self.state();
        let diff = state
            .load(a)?
            .checked_sub(state.load(b)?)
            .ok_or(CipherError::Overflow)?;
        state.store(diff)
    }

    fn mul(&self, a: &SealedValue, b: &SealedValue) -> Result<SealedValue, CipherError> {
        let mut state = self.state();
        let product = state
            .load(a)?
            .checked_mul(state.load(b)?)
            .ok_or(CipherError::Overflow)?;
        state.store(div_round(product, FIXED_SCALE as i128))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(s: &str) -> Fixed {
        s.parse().unwrap()
    }

    #[test]
    fn add_and_div_match_plaintext() {
        let scheme = ReferenceScheme::with_seed([7u8; 32]);
        let a = scheme.encrypt(fixed("8.05")).unwrap();
        let b = scheme.encrypt(fixed("7.99")).unwrap();
        let sum = scheme.add(&a, &b).unwrap();
        assert_eq!(scheme.decrypt(&sum.handle()).unwrap(), fixed("16.04"));
        let mean = scheme.div(&sum, 2).unwrap();
        assert_eq!(scheme.decrypt(&mean.handle()).unwrap(), fixed("8.02"));
    }

    #[test]
    fn handles_are_fresh_per_operation() {
        let scheme = ReferenceScheme::with_seed([1u8; 32]);
        let a = scheme.encrypt(fixed("1")).unwrap();
        let b = scheme.encrypt(fixed("1")).unwrap();
        assert_ne!(a.handle(), b.handle());
        assert_eq!(scheme.len(), 2);
    }

    #[test]
    fn every_operation_retains_its_result() {
        let scheme = ReferenceScheme::with_seed([6u8; 32]);
        let a = scheme.encrypt(fixed("2")).unwrap();
        let zero = scheme.zero().unwrap();
        let sum = scheme.add(&zero, &a).unwrap();
        let half = scheme.div(&sum, 2).unwrap();
        let diff = scheme.sub(&a, &half).unwrap();
        let square = scheme.mul(&diff, &diff).unwrap();
        assert_eq!(scheme.len(), 6);
        for value in [a, zero, sum, half, diff] {
            assert!(scheme.is_initialized(&value));
        }
        assert_eq!(scheme.decrypt(&square.handle()).unwrap(), fixed("1"));
        assert!(scheme.add(&a, &a).is_ok());
        assert_eq!(scheme.len(), 7);
    }

    #[test]
    fn uninitialized_operands_are_rejected() {
        let scheme = ReferenceScheme::with_seed([2u8; 32]);
        let zero = scheme.zero().unwrap();
        let unset = SealedValue::uninitialized();
        assert!(!scheme.is_initialized(&unset));
        assert!(scheme.is_initialized(&zero));
        assert_eq!(scheme.add(&zero, &unset), Err(CipherError::Uninitialized));
        assert_eq!(scheme.div(&zero, 0), Err(CipherError::DivisionByZero));

        let foreign = ReferenceScheme::with_seed([3u8; 32]).zero().unwrap();
        assert!(!scheme.is_initialized(&foreign));
        assert!(matches!(
            scheme.add(&zero, &foreign),
            Err(CipherError::UnknownHandle(_))
        ));
    }

    #[test]
    fn moments_use_fixed_point_products() {
        let scheme = ReferenceScheme::with_seed([4u8; 32]);
        let a = scheme.encrypt(fixed("0.03")).unwrap();
        let b = scheme.encrypt(fixed("-0.03")).unwrap();
        let square = scheme.mul(&a, &a).unwrap();
        assert_eq!(scheme.decrypt(&square.handle()).unwrap(), fixed("0.0009"));
        let diff = scheme.sub(&a, &b).unwrap();
        assert_eq!(scheme.decrypt(&diff.handle()).unwrap(), fixed("0.06"));
    }
}
