use std::fmt;
use std::str::FromStr;

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, Error};

/// Decimal count assumed when a token's `decimals()` cannot be read.
pub const DEFAULT_DECIMALS: u8 = 18;

/// A non-negative quantity in a token's smallest unit.
///
/// Amounts are not tagged with their decimals; pairing an amount with
/// the right token is the caller's job.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TokenAmount(BigUint);

impl TokenAmount {
    pub fn zero() -> Self {
        Self(BigUint::default())
    }

    pub fn is_zero(&self) -> bool {
        self.0 == BigUint::default()
    }

    pub fn as_biguint(&self) -> &BigUint {
        &self.0
    }

    /// Interpret a big-endian byte string (e.g. an ABI word).
    pub fn from_be_bytes(bytes: &[u8]) -> Self {
        Self(BigUint::from_bytes_be(bytes))
    }

    /// Encode as a 32-byte big-endian word, failing above `2^256 - 1`.
    pub fn to_word(&self) -> Result<[u8; 32], Error> {
        let bytes = self.0.to_bytes_be();
        if bytes.len() > 32 {
            return Err(Error::InvalidAmountFormat(format!(
                "{} does not fit in uint256",
                self.0
            )));
        }
        let mut word = [0u8; 32];
        word[32 - bytes.len()..].copy_from_slice(&bytes);
        Ok(word)
    }

    /// Narrow to `u64`, e.g. for timestamps and durations.
    pub fn to_u64(&self) -> Result<u64, DecodeError> {
        u64::try_from(&self.0).map_err(|_| DecodeError::OutOfRange(format!("{} exceeds u64", self.0)))
    }

    /// Minimum acceptable output after a slippage tolerance of
    /// `slippage_pct` percent, truncating toward zero.
    pub fn with_slippage(&self, slippage_pct: u8) -> Self {
        let keep = BigUint::from(100u32.saturating_sub(u32::from(slippage_pct)));
        Self(&self.0 * keep / BigUint::from(100u32))
    }
}

impl From<u64> for TokenAmount {
    fn from(value: u64) -> Self {
        Self(BigUint::from(value))
    }
}

impl From<u128> for TokenAmount {
    fn from(value: u128) -> Self {
        Self(BigUint::from(value))
    }
}

impl From<BigUint> for TokenAmount {
    fn from(value: BigUint) -> Self {
        Self(value)
    }
}

impl fmt::Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TokenAmount {
    type Err = Error;

    /// Parse a plain base-10 integer. Signs, separators and whitespace
    /// are rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with('-') {
            return Err(Error::InvalidAmountFormat(format!(
                "negative amount: {s}"
            )));
        }
        if !is_digits(s) {
            return Err(Error::InvalidAmountFormat(format!(
                "not an integer: {s:?}"
            )));
        }
        BigUint::parse_bytes(s.as_bytes(), 10)
            .map(Self)
            .ok_or_else(|| Error::InvalidAmountFormat(format!("not an integer: {s:?}")))
    }
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn check_decimals(decimals: i32) -> Result<usize, Error> {
    usize::try_from(decimals).map_err(|_| {
        Error::InvalidAmountFormat(format!("decimals must not be negative, got {decimals}"))
    })
}

/// Convert a decimal string such as `"12.5"` into base units.
///
/// Fractional digits beyond `decimals` are truncated, never rounded.
pub fn to_base_units(amount: &str, decimals: i32) -> Result<TokenAmount, Error> {
    let decimals = check_decimals(decimals)?;

    let (integer, fraction) = match amount.split_once('.') {
        Some((integer, fraction)) => (integer, fraction),
        None => (amount, ""),
    };
    let has_point = amount.contains('.');
    if !is_digits(integer) || (has_point && !is_digits(fraction)) {
        return Err(Error::InvalidAmountFormat(format!(
            "expected INTEGER[.FRACTION], got {amount:?}"
        )));
    }

    let fraction = if fraction.len() > decimals {
        log::warn!(
            "fractional part {fraction:?} has more than {decimals} digits, truncating"
        );
        &fraction[..decimals]
    } else {
        fraction
    };

    let mut digits = String::with_capacity(integer.len() + decimals);
    digits.push_str(integer);
    digits.push_str(fraction);
    digits.extend(std::iter::repeat_n('0', decimals - fraction.len()));

    digits.parse()
}

/// Render a base-unit amount as a fixed-point string with trailing
/// fractional zeros stripped.
pub fn from_base_units(amount: &TokenAmount, decimals: i32) -> Result<String, Error> {
    let decimals = check_decimals(decimals)?;
    let s = amount.to_string();

    if decimals == 0 {
        return Ok(s);
    }

    let padded = if s.len() <= decimals {
        let mut padded = "0".repeat(decimals + 1 - s.len());
        padded.push_str(&s);
        padded
    } else {
        s
    };

    let (integer_part, fraction_part) = padded.split_at(padded.len() - decimals);
    let trimmed = fraction_part.trim_end_matches('0');
    if trimmed.is_empty() {
        Ok(integer_part.to_string())
    } else {
        Ok(format!("{integer_part}.{trimmed}"))
    }
}

/// [`from_base_units`] for a raw decimal integer string.
pub fn from_base_units_str(amount: &str, decimals: i32) -> Result<String, Error> {
    from_base_units(&amount.parse()?, decimals)
}
