//! Fixed-point plaintext values.
//!
//! Readings and decrypted statistics are carried as signed integers scaled by
//! `10^6`.  Division and multiplication round half away from zero so that the
//! homomorphic pipeline and the plaintext reference agree bit for bit.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Number of fractional decimal digits carried by [`Fixed`].
pub const FIXED_DECIMALS: u32 = 6;
/// Scale factor between a [`Fixed`] and its raw representation.
pub const FIXED_SCALE: i64 = 1_000_000;

/// Signed fixed-point number with six fractional digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fixed(i64);

impl Fixed {
    /// The value zero.
    pub const ZERO: Fixed = Fixed(0);

    /// Wraps a raw micro-unit value.
    pub const fn from_raw(raw: i64) -> Self {
        Fixed(raw)
    }

    /// Returns the raw micro-unit value.
    pub const fn raw(self) -> i64 {
        self.0
    }
}

/// Divides `numerator` by `denominator`, rounding half away from zero.
pub(crate) fn div_round(numerator: i128, denominator: i128) -> i128 {
    let quotient = numerator / denominator;
    let remainder = numerator % denominator;
    if remainder.abs() * 2 >= denominator.abs() {
        if (numerator < 0) ^ (denominator < 0) {
            quotient - 1
        } else {
            quotient + 1
        }
    } else {
        quotient
    }
}

impl fmt::Display for Fixed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let magnitude = self.0.unsigned_abs();
        let scale = FIXED_SCALE as u64;
        let frac = format!("{:06}", magnitude % scale);
        let frac = frac.trim_end_matches('0');
        if frac.is_empty() {
            write!(f, "{sign}{}", magnitude / scale)
        } else {
            write!(f, "{sign}{}.{frac}", magnitude / scale)
        }
    }
}

/// Error returned when a decimal string cannot be parsed into a [`Fixed`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid fixed-point literal `{0}`")]
pub struct ParseFixedError(String);

impl FromStr for Fixed {
    type Err = ParseFixedError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let err = || ParseFixedError(input.to_string());
        let trimmed = input.trim();
        let (negative, digits) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
        };
        let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));
        if whole.is_empty() && frac.is_empty() {
            return Err(err());
        }
        if frac.len() > FIXED_DECIMALS as usize
            || !whole.chars().all(|c| c.is_ascii_digit())
            || !frac.chars().all(|c| c.is_ascii_digit())
        {
            return Err(err());
        }
        let whole: i64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| err())?
        };
        let frac_raw: i64 = if frac.is_empty() {
            0
        } else {
            let padded = format!("{frac:0<width$}", width = FIXED_DECIMALS as usize);
            padded.parse().map_err(|_| err())?
        };
        let raw = whole
            .checked_mul(FIXED_SCALE)
            .and_then(|w| w.checked_add(frac_raw))
            .ok_or_else(err)?;
        Ok(Fixed(if negative { -raw } else { raw }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_decimal_literals() {
        assert_eq!("8.05".parse::<Fixed>().unwrap().raw(), 8_050_000);
        assert_eq!("-0.5".parse::<Fixed>().unwrap().raw(), -500_000);
        assert_eq!("12".parse::<Fixed>().unwrap().raw(), 12_000_000);
        assert!("1.2345678".parse::<Fixed>().is_err());
        assert!("abc".parse::<Fixed>().is_err());
        assert!(".".parse::<Fixed>().is_err());
    }

    #[test]
    fn display_trims_trailing_zeros() {
        assert_eq!(Fixed::from_raw(24_060_000).to_string(), "24.06");
        assert_eq!(Fixed::from_raw(-1_500_000).to_string(), "-1.5");
        assert_eq!(Fixed::from_raw(3_000_000).to_string(), "3");
    }

    #[test]
    fn div_round_is_symmetric() {
        assert_eq!(div_round(5, 2), 3);
        assert_eq!(div_round(-5, 2), -3);
        assert_eq!(div_round(4, 3), 1);
        assert_eq!(div_round(-4, 3), -1);
    }
}
