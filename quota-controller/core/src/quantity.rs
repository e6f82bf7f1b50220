use std::{fmt, ops, str::FromStr};
use thiserror::Error;

const NANOS_PER_UNIT: i128 = 1_000_000_000;
const MAX_EXPONENT: i32 = 64;

/// An exact resource quantity, stored as a count of nano-units.
///
/// Quantities are parsed from the cluster's native notation (`500m`, `1Gi`,
/// `2e3`, ...) without going through floating point, so that comparisons at
/// an exact limit boundary are never perturbed by rounding. Values with more
/// precision than a nano-unit are rounded up, which only ever makes a request
/// look larger.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Quantity(i128);

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum QuantityError {
    #[error("quantity must not be empty")]
    Empty,

    #[error("invalid number in quantity {0:?}")]
    InvalidNumber(String),

    #[error("invalid suffix {suffix:?} in quantity {quantity:?}")]
    InvalidSuffix { quantity: String, suffix: String },

    #[error("quantity {0:?} is out of range")]
    Overflow(String),
}

// === impl Quantity ===

impl Quantity {
    pub const ZERO: Self = Self(0);

    /// A whole number of units, e.g. an object count.
    pub const fn from_units(units: i64) -> Self {
        Self(units as i128 * NANOS_PER_UNIT)
    }

    pub const fn as_nanos(&self) -> i128 {
        self.0
    }

    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub const fn is_negative(&self) -> bool {
        self.0 < 0
    }

    /// Subtracts `other`, clamping at zero.
    pub fn saturating_sub_to_zero(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0).max(0))
    }

    /// An approximate value in whole units. Only suitable for reporting.
    pub fn as_f64(&self) -> f64 {
        self.0 as f64 / NANOS_PER_UNIT as f64
    }
}

impl FromStr for Quantity {
    type Err = QuantityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(QuantityError::Empty);
        }

        let (negative, unsigned) = match s.as_bytes()[0] {
            b'-' => (true, &s[1..]),
            b'+' => (false, &s[1..]),
            _ => (false, s),
        };

        let split = unsigned
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(unsigned.len());
        let (number, suffix) = unsigned.split_at(split);
        let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
        if (whole.is_empty() && fraction.is_empty())
            || !whole.bytes().all(|b| b.is_ascii_digit())
            || !fraction.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(QuantityError::InvalidNumber(s.to_string()));
        }

        let (binary_power, decimal_exponent) =
            parse_suffix(suffix).ok_or_else(|| QuantityError::InvalidSuffix {
                quantity: s.to_string(),
                suffix: suffix.to_string(),
            })?;

        let overflow = || QuantityError::Overflow(s.to_string());

        let mut mantissa: i128 = 0;
        for digit in whole.bytes().chain(fraction.bytes()) {
            mantissa = mantissa
                .checked_mul(10)
                .and_then(|m| m.checked_add(i128::from(digit - b'0')))
                .ok_or_else(overflow)?;
        }

        let mut nanos = 1024i128
            .checked_pow(binary_power)
            .and_then(|m| mantissa.checked_mul(m))
            .ok_or_else(overflow)?;

        let scale = 9 + decimal_exponent - fraction.len() as i32;
        if scale >= 0 {
            nanos = 10i128
                .checked_pow(scale as u32)
                .and_then(|m| nanos.checked_mul(m))
                .ok_or_else(overflow)?;
        } else {
            nanos = match 10i128.checked_pow(scale.unsigned_abs()) {
                Some(divisor) => {
                    let rounded = nanos / divisor;
                    if nanos % divisor == 0 {
                        rounded
                    } else {
                        rounded + 1
                    }
                }
                // Smaller than any representable nano-unit.
                None if nanos == 0 => 0,
                None => 1,
            };
        }

        Ok(Self(if negative { -nanos } else { nanos }))
    }
}

/// Returns the binary power (of 1024) and decimal exponent denoted by a suffix.
fn parse_suffix(suffix: &str) -> Option<(u32, i32)> {
    let parsed = match suffix {
        "" => (0, 0),
        "n" => (0, -9),
        "u" => (0, -6),
        "m" => (0, -3),
        "k" => (0, 3),
        "M" => (0, 6),
        "G" => (0, 9),
        "T" => (0, 12),
        "P" => (0, 15),
        "E" => (0, 18),
        "Ki" => (1, 0),
        "Mi" => (2, 0),
        "Gi" => (3, 0),
        "Ti" => (4, 0),
        "Pi" => (5, 0),
        "Ei" => (6, 0),
        exp => {
            let digits = exp.strip_prefix(['e', 'E'])?;
            let unsigned = digits.strip_prefix(['+', '-']).unwrap_or(digits);
            if unsigned.is_empty() || !unsigned.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            let exponent = digits.parse::<i32>().ok()?;
            if exponent.abs() > MAX_EXPONENT {
                return None;
            }
            (0, exponent)
        }
    };
    Some(parsed)
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = self.0;
        if n % NANOS_PER_UNIT == 0 {
            write!(f, "{}", n / NANOS_PER_UNIT)
        } else if n % 1_000_000 == 0 {
            write!(f, "{}m", n / 1_000_000)
        } else if n % 1_000 == 0 {
            write!(f, "{}u", n / 1_000)
        } else {
            write!(f, "{}n", n)
        }
    }
}

impl ops::Add for Quantity {
    type Output = Self;

    #[inline]
    fn add(self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }
}

impl ops::AddAssign for Quantity {
    #[inline]
    fn add_assign(&mut self, other: Self) {
        *self = *self + other;
    }
}

impl ops::Sub for Quantity {
    type Output = Self;

    #[inline]
    fn sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }
}

impl std::iter::Sum for Quantity {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, |acc, q| acc + q)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(s: &str) -> Quantity {
        s.parse().unwrap_or_else(|e| panic!("{s}: {e}"))
    }

    #[test]
    fn parses_decimal_si() {
        for (input, nanos) in [
            ("0", 0),
            ("1", 1_000_000_000),
            ("500m", 500_000_000),
            ("1.5", 1_500_000_000),
            (".5", 500_000_000),
            ("250u", 250_000),
            ("7n", 7),
            ("2k", 2_000_000_000_000),
            ("3M", 3_000_000_000_000_000),
            ("1E", 1_000_000_000_000_000_000_000_000_000),
            ("-1", -1_000_000_000),
            ("+2", 2_000_000_000),
        ] {
            assert_eq!(q(input).as_nanos(), nanos, "{input}");
        }
    }

    #[test]
    fn parses_binary_si() {
        assert_eq!(q("1Ki"), Quantity::from_units(1024));
        assert_eq!(q("1Gi"), Quantity::from_units(1024 * 1024 * 1024));
        assert_eq!(q("1.5Mi"), Quantity::from_units(1024 * 1024 * 3 / 2));
    }

    #[test]
    fn parses_exponents() {
        assert_eq!(q("1e3"), Quantity::from_units(1000));
        assert_eq!(q("1E3"), Quantity::from_units(1000));
        assert_eq!(q("5e-3"), q("5m"));
    }

    #[test]
    fn equivalent_notations_compare_equal() {
        assert_eq!(q("1"), q("1000m"));
        assert_eq!(q("1k"), q("1000"));
        assert_eq!(q("1.0"), q("1"));
        assert!(q("1Ki") > q("1k"));
    }

    #[test]
    fn rounds_sub_nano_precision_up() {
        assert_eq!(q("0.0000000001").as_nanos(), 1);
        assert_eq!(q("1.0000000001").as_nanos(), 1_000_000_001);
        assert_eq!(q("0.0000000000").as_nanos(), 0);
    }

    #[test]
    fn rejects_malformed() {
        assert_eq!("".parse::<Quantity>(), Err(QuantityError::Empty));
        for input in ["abc", "1..2", ".", "-", "1.2.3"] {
            assert!(
                matches!(input.parse::<Quantity>(), Err(QuantityError::InvalidNumber(_))),
                "{input}"
            );
        }
        for input in ["1Q", "1KiB", "1e", "1e+", "1mi", "1e999"] {
            assert!(
                matches!(input.parse::<Quantity>(), Err(QuantityError::InvalidSuffix { .. })),
                "{input}"
            );
        }
        assert!(matches!(
            "999999999999999999999999999999999999999".parse::<Quantity>(),
            Err(QuantityError::Overflow(_))
        ));
    }

    #[test]
    fn displays_exact_values() {
        assert_eq!(q("4").to_string(), "4");
        assert_eq!(q("1500m").to_string(), "1500m");
        assert_eq!(q("1Ki").to_string(), "1024");
        assert_eq!(q("3u").to_string(), "3u");
        assert_eq!(q("3n").to_string(), "3n");
        assert_eq!(q("-250m").to_string(), "-250m");
    }

    #[test]
    fn arithmetic() {
        assert_eq!(q("3") + q("1"), q("4"));
        assert_eq!(q("1") - q("250m"), q("750m"));
        assert_eq!(q("1").saturating_sub_to_zero(q("2")), Quantity::ZERO);
        assert_eq!([q("1"), q("2"), q("500m")].into_iter().sum::<Quantity>(), q("3.5"));
    }
}
