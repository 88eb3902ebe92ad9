//! Encrypted trend statistics.
//!
//! Every statistic is a composition of capability operations over
//! ciphertexts; nothing here ever sees a plaintext.  Folding order does not
//! matter because homomorphic addition is associative, but the divisor is
//! always the number of ciphertexts actually folded.

use crate::cipher::{CiphertextOps, MomentOps};
use crate::error::{LedgerError, LedgerResult};

fn check_inputs<C: CiphertextOps>(scheme: &C, values: &[C::Ciphertext]) -> LedgerResult<()> {
    if let Some(idx) = values.iter().position(|v| !scheme.is_initialized(v)) {
        return Err(LedgerError::InvalidInput(format!(
            "operand {idx} is not an initialized ciphertext"
        )));
    }
    Ok(())
}

fn require_series(len: usize) -> LedgerResult<u64> {
    if len <= 1 {
        return Err(LedgerError::InsufficientData(len));
    }
    Ok(len as u64)
}

/// Homomorphic sum of `values`; the empty sum is an encryption of zero.
pub fn sum<C: CiphertextOps>(scheme: &C, values: &[C::Ciphertext]) -> LedgerResult<C::Ciphertext> {
    check_inputs(scheme, values)?;
    values
        .iter()
        .try_fold(scheme.zero()?, |acc, value| scheme.add(&acc, value))
        .map_err(LedgerError::from)
}

/// Encrypted mean of `values`.  Needs at least two values.
pub fn average<C: CiphertextOps>(
    scheme: &C,
    values: &[C::Ciphertext],
) -> LedgerResult<C::Ciphertext> {
    let n = require_series(values.len())?;
    let total = sum(scheme, values)?;
    Ok(scheme.div(&total, n)?)
}

/// Encrypted mean of an accumulator holding `count` values.
pub fn mean_from_sum<C: CiphertextOps>(
    scheme: &C,
    encrypted_sum: &C::Ciphertext,
    count: u64,
) -> LedgerResult<C::Ciphertext> {
    if count <= 1 {
        return Err(LedgerError::InsufficientData(count as usize));
    }
    if !scheme.is_initialized(encrypted_sum) {
        return Err(LedgerError::InvalidInput(
            "accumulator sum is not initialized".into(),
        ));
    }
    Ok(scheme.div(encrypted_sum, count)?)
}

/// Encrypted population variance `Σ(xᵢ − μ)² / n`.
pub fn variance<C: MomentOps>(scheme: &C, values: &[C::Ciphertext]) -> LedgerResult<C::Ciphertext> {
    let n = require_series(values.len())?;
    let mean = average(scheme, values)?;
    let mut squares = scheme.zero()?;
    for value in values {
        let deviation = scheme.sub(value, &mean)?;
        let square = scheme.mul(&deviation, &deviation)?;
        squares = scheme.add(&squares, &square)?;
    }
    Ok(scheme.div(&squares, n)?)
}

/// One-step drift forecast `last + (last − first) / (n − 1)`.
pub fn forecast_next<C: MomentOps>(
    scheme: &C,
    values: &[C::Ciphertext],
) -> LedgerResult<C::Ciphertext> {
    let n = require_series(values.len())?;
    check_inputs(scheme, values)?;
    let (first, last) = match (values.first(), values.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => return Err(LedgerError::InsufficientData(values.len())),
    };
    let span = scheme.sub(last, first)?;
    let slope = scheme.div(&span, n - 1)?;
    Ok(scheme.add(last, &slope)?)
}

/// Encrypted summary of an ordered series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrendSummary<T> {
    /// Number of values in the series.
    pub count: u64,
    /// Encrypted mean.
    pub mean: T,
    /// Encrypted population variance.
    pub variance: T,
    /// Encrypted one-step forecast.
    pub forecast: T,
}

/// Computes mean, variance and forecast of `values` in one pass over the API.
pub fn summarize<C: MomentOps>(
    scheme: &C,
    values: &[C::Ciphertext],
) -> LedgerResult<TrendSummary<C::Ciphertext>> {
    let count = require_series(values.len())?;
    Ok(TrendSummary {
        count,
        mean: average(scheme, values)?,
        variance: variance(scheme, values)?,
        forecast: forecast_next(scheme, values)?,
    })
}
