//! Exact decimal representation for `DECIMAL`, `NUMERIC` and money types.

use std::fmt;
use std::str::FromStr;

use crate::error::TypeError;

/// Largest precision SQL Server accepts for `DECIMAL`/`NUMERIC`.
pub const MAX_PRECISION: u8 = 38;

/// Scale used by `MONEY` and `SMALLMONEY`.
pub const MONEY_SCALE: u8 = 4;

const MAX_MANTISSA: u128 = 10u128.pow(MAX_PRECISION as u32) - 1;

/// Largest integer an IEEE-754 double holds without rounding (2^53).
const F64_EXACT_LIMIT: u128 = 1 << 53;

/// A decimal number stored as an `i128` mantissa and a base-10 scale.
///
/// `Numeric::new(12345, 2)` is `123.45`. The mantissa is limited to 38
/// decimal digits, matching the widest value the server can send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Numeric {
    value: i128,
    scale: u8,
}

impl Numeric {
    /// Create a numeric from a mantissa and scale.
    pub fn new(value: i128, scale: u8) -> Result<Self, TypeError> {
        if scale > MAX_PRECISION {
            return Err(TypeError::InvalidNumeric(format!(
                "scale {scale} exceeds {MAX_PRECISION}"
            )));
        }
        if value.unsigned_abs() > MAX_MANTISSA {
            return Err(TypeError::OutOfRange {
                target_type: "NUMERIC(38)",
            });
        }
        Ok(Self { value, scale })
    }

    /// Create a money value from its wire representation (ten-thousandths).
    #[must_use]
    pub const fn from_money(ten_thousandths: i64) -> Self {
        Self {
            value: ten_thousandths as i128,
            scale: MONEY_SCALE,
        }
    }

    /// The raw mantissa.
    #[must_use]
    pub const fn value(self) -> i128 {
        self.value
    }

    /// Number of digits after the decimal point.
    #[must_use]
    pub const fn scale(self) -> u8 {
        self.scale
    }

    /// Whether the value is below zero.
    #[must_use]
    pub const fn is_negative(self) -> bool {
        self.value < 0
    }

    /// Integer part, truncated toward zero.
    #[must_use]
    pub fn int_part(self) -> i128 {
        self.value / pow10(self.scale)
    }

    /// Fractional part as an unsigned count of `10^-scale` units.
    #[must_use]
    pub fn frac_part(self) -> u128 {
        self.value.unsigned_abs() % pow10(self.scale).unsigned_abs()
    }

    /// Smallest precision able to hold this value at its current scale.
    #[must_use]
    pub fn precision(self) -> u8 {
        let int_digits = digit_count(self.int_part().unsigned_abs());
        let int_digits = if int_digits == 0 { 1 } else { int_digits };
        (int_digits + self.scale).min(MAX_PRECISION)
    }

    /// Return the same value expressed at `scale`.
    ///
    /// Increasing the scale is exact. Decreasing it rounds half away from
    /// zero. Fails when the result needs more than 38 digits.
    pub fn rescale(self, scale: u8) -> Result<Self, TypeError> {
        if scale == self.scale {
            return Ok(self);
        }
        if scale > self.scale {
            let factor = pow10(scale - self.scale);
            let value = self
                .value
                .checked_mul(factor)
                .ok_or(TypeError::OutOfRange {
                    target_type: "NUMERIC(38)",
                })?;
            return Self::new(value, scale);
        }
        let factor = pow10(self.scale - scale);
        let quotient = self.value / factor;
        let remainder = (self.value % factor).unsigned_abs();
        let rounded = if remainder * 2 >= factor.unsigned_abs() {
            quotient + self.value.signum()
        } else {
            quotient
        };
        Self::new(rounded, scale)
    }

    /// Convert to `f64`.
    ///
    /// Fails with [`TypeError::OutOfRange`] when the mantissa exceeds 2^53
    /// and would be rounded by the conversion.
    pub fn to_f64(self) -> Result<f64, TypeError> {
        if self.value.unsigned_abs() > F64_EXACT_LIMIT {
            return Err(TypeError::OutOfRange { target_type: "f64" });
        }
        Ok(self.value as f64 / 10f64.powi(i32::from(self.scale)))
    }
}

fn pow10(exp: u8) -> i128 {
    10i128.pow(u32::from(exp))
}

fn digit_count(mut n: u128) -> u8 {
    let mut digits = 0;
    while n != 0 {
        n /= 10;
        digits += 1;
    }
    digits
}

impl fmt::Display for Numeric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.is_negative() { "-" } else { "" };
        let int_part = self.int_part().unsigned_abs();
        if self.scale == 0 {
            write!(f, "{sign}{int_part}")
        } else {
            write!(
                f,
                "{sign}{int_part}.{:0width$}",
                self.frac_part(),
                width = self.scale as usize
            )
        }
    }
}

impl FromStr for Numeric {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TypeError::InvalidNumeric(s.to_string());
        let trimmed = s.trim();
        let (negative, digits) = match trimmed.as_bytes().first() {
            Some(b'-') => (true, &trimmed[1..]),
            Some(b'+') => (false, &trimmed[1..]),
            _ => (false, trimmed),
        };
        let (int_str, frac_str) = digits.split_once('.').unwrap_or((digits, ""));
        if int_str.is_empty() && frac_str.is_empty() {
            return Err(invalid());
        }
        if !int_str.bytes().chain(frac_str.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let scale = u8::try_from(frac_str.len()).map_err(|_| invalid())?;
        let mut value: i128 = 0;
        for b in int_str.bytes().chain(frac_str.bytes()) {
            value = value
                .checked_mul(10)
                .and_then(|v| v.checked_add(i128::from(b - b'0')))
                .ok_or(TypeError::OutOfRange {
                    target_type: "NUMERIC(38)",
                })?;
        }
        Self::new(if negative { -value } else { value }, scale)
    }
}

impl From<i32> for Numeric {
    fn from(v: i32) -> Self {
        Self {
            value: i128::from(v),
            scale: 0,
        }
    }
}

impl From<i64> for Numeric {
    fn from(v: i64) -> Self {
        Self {
            value: i128::from(v),
            scale: 0,
        }
    }
}

#[cfg(feature = "decimal")]
impl TryFrom<Numeric> for rust_decimal::Decimal {
    type Error = TypeError;

    fn try_from(n: Numeric) -> Result<Self, Self::Error> {
        rust_decimal::Decimal::try_from_i128_with_scale(n.value, u32::from(n.scale)).map_err(
            |_| TypeError::OutOfRange {
                target_type: "Decimal",
            },
        )
    }
}

#[cfg(feature = "decimal")]
impl From<rust_decimal::Decimal> for Numeric {
    fn from(d: rust_decimal::Decimal) -> Self {
        // rust_decimal caps scale at 28 and the mantissa at 96 bits.
        Self {
            value: d.mantissa(),
            scale: d.scale() as u8,
        }
    }
}
