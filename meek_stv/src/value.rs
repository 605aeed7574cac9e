// Fixed-point vote arithmetic.
//
// All the quantities manipulated by the count (weights, quota, retention factors,
// retained totals) go through this type. The representation is an arbitrary-precision
// integer scaled by 10^SCALE, so that every operation is reproducible bit for bit.

use std::{
    cmp::Ordering,
    fmt::Display,
    iter::Sum,
    ops::{Add, AddAssign, Mul, Sub, SubAssign},
    str::FromStr,
    sync::OnceLock,
};

use num_bigint::BigInt;
use num_traits::{One, Signed, Zero};

/// Number of decimal digits kept after the decimal point.
pub const SCALE: u32 = 48;

fn unit() -> &'static BigInt {
    static UNIT: OnceLock<BigInt> = OnceLock::new();
    UNIT.get_or_init(|| ten_pow(SCALE))
}

fn ten_pow(exp: u32) -> BigInt {
    num_traits::pow(BigInt::from(10u8), exp as usize)
}

/// A signed decimal number with a fixed number of fractional digits.
///
/// Multiplication and division truncate toward zero. There is no rounding mode to
/// configure: the same inputs always produce the same digits.
#[derive(Eq, PartialEq, Debug, Clone, Hash)]
pub struct VoteValue(BigInt);

impl VoteValue {
    pub fn zero() -> VoteValue {
        VoteValue(BigInt::zero())
    }

    pub fn one() -> VoteValue {
        VoteValue(unit().clone())
    }

    /// An integral number of votes.
    pub fn from_weight(weight: u64) -> VoteValue {
        VoteValue(BigInt::from(weight) * unit())
    }

    /// The smallest representable positive step (10^-exp), clamped to the scale.
    pub fn ten_to_minus(exp: u32) -> VoteValue {
        let exp = exp.min(SCALE);
        VoteValue(ten_pow(SCALE - exp))
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_positive(&self) -> bool {
        self.0.is_positive()
    }

    pub fn abs_diff(&self, other: &VoteValue) -> VoteValue {
        VoteValue((&self.0 - &other.0).abs())
    }

    /// Division, truncated. Returns None when dividing by zero.
    pub fn checked_div(&self, rhs: &VoteValue) -> Option<VoteValue> {
        if rhs.is_zero() {
            return None;
        }
        Some(VoteValue((&self.0 * unit()) / &rhs.0))
    }

    /// Division by a whole number, truncated.
    pub fn div_int(&self, rhs: u64) -> Option<VoteValue> {
        if rhs == 0 {
            return None;
        }
        Some(VoteValue(&self.0 / BigInt::from(rhs)))
    }

    /// Clamps the value into [low, high].
    pub fn clamp_to(self, low: &VoteValue, high: &VoteValue) -> VoteValue {
        if &self < low {
            low.clone()
        } else if &self > high {
            high.clone()
        } else {
            self
        }
    }

    /// Renders the value with exactly `places` fractional digits, rounding half away
    /// from zero. Only used for display purposes; never fed back into the count.
    pub fn to_fixed(&self, places: u32) -> String {
        let places = places.min(SCALE);
        let divisor = ten_pow(SCALE - places);
        let negative = self.0.is_negative();
        let magnitude = self.0.abs();
        let mut quotient = &magnitude / &divisor;
        let remainder = &magnitude % &divisor;
        if remainder * BigInt::from(2u8) >= divisor {
            quotient += BigInt::one();
        }
        let digits = format_scaled(&quotient, places);
        if negative && !quotient.is_zero() {
            format!("-{}", digits)
        } else {
            digits
        }
    }
}

// Places a decimal point `places` digits from the right of a non-negative integer.
fn format_scaled(magnitude: &BigInt, places: u32) -> String {
    let raw = magnitude.to_string();
    let places = places as usize;
    if places == 0 {
        return raw;
    }
    let padded = if raw.len() <= places {
        format!("{}{}", "0".repeat(places + 1 - raw.len()), raw)
    } else {
        raw
    };
    let (int_part, frac_part) = padded.split_at(padded.len() - places);
    format!("{}.{}", int_part, frac_part)
}

impl Display for VoteValue {
    /// Exact decimal rendering, without trailing zeros.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let full = format_scaled(&self.0.abs(), SCALE);
        let trimmed = full.trim_end_matches('0').trim_end_matches('.');
        if self.0.is_negative() {
            write!(f, "-{}", trimmed)
        } else {
            write!(f, "{}", trimmed)
        }
    }
}

/// Errors when reading a decimal string.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct ParseVoteValueError(pub String);

impl std::error::Error for ParseVoteValueError {}

impl Display for ParseVoteValueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cannot read {:?} as a decimal value", self.0)
    }
}

// Largest exponent accepted when parsing. Anything beyond is far outside the scale.
const MAX_EXPONENT: i64 = 300;

impl FromStr for VoteValue {
    type Err = ParseVoteValueError;

    /// Accepts `123`, `-0.25`, `1e-28`, `2.5E3`. Digits beyond the scale are truncated.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseVoteValueError(s.to_string());
        let s = s.trim();
        let (mantissa, exponent) = match s.find(['e', 'E']) {
            Some(idx) => {
                let exp: i64 = s[idx + 1..].parse().map_err(|_| err())?;
                if exp.abs() > MAX_EXPONENT {
                    return Err(err());
                }
                (&s[..idx], exp)
            }
            None => (s, 0),
        };
        let (negative, mantissa) = match mantissa.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, mantissa.strip_prefix('+').unwrap_or(mantissa)),
        };
        let (int_digits, frac_digits) = match mantissa.split_once('.') {
            Some((i, f)) => (i, f),
            None => (mantissa, ""),
        };
        let all_digits = format!("{}{}", int_digits, frac_digits);
        if all_digits.is_empty() || !all_digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(err());
        }
        let digits: BigInt = all_digits.parse().map_err(|_| err())?;
        // value = digits * 10^(exponent - frac_len), rescaled to SCALE.
        let shift = exponent - frac_digits.len() as i64 + SCALE as i64;
        let scaled = if shift >= 0 {
            let shift = u32::try_from(shift).map_err(|_| err())?;
            digits * ten_pow(shift)
        } else {
            let shift = u32::try_from(-shift).map_err(|_| err())?;
            digits / ten_pow(shift)
        };
        Ok(VoteValue(if negative { -scaled } else { scaled }))
    }
}

impl PartialOrd for VoteValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VoteValue {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl Add for VoteValue {
    type Output = VoteValue;
    fn add(self, rhs: VoteValue) -> VoteValue {
        VoteValue(self.0 + rhs.0)
    }
}

impl<'a> Add<&'a VoteValue> for &'a VoteValue {
    type Output = VoteValue;
    fn add(self, rhs: &VoteValue) -> VoteValue {
        VoteValue(&self.0 + &rhs.0)
    }
}

impl AddAssign<&VoteValue> for VoteValue {
    fn add_assign(&mut self, rhs: &VoteValue) {
        self.0 += &rhs.0;
    }
}

impl AddAssign for VoteValue {
    fn add_assign(&mut self, rhs: VoteValue) {
        self.0 += rhs.0;
    }
}

impl Sub for VoteValue {
    type Output = VoteValue;
    fn sub(self, rhs: VoteValue) -> VoteValue {
        VoteValue(self.0 - rhs.0)
    }
}

impl<'a> Sub<&'a VoteValue> for &'a VoteValue {
    type Output = VoteValue;
    fn sub(self, rhs: &VoteValue) -> VoteValue {
        VoteValue(&self.0 - &rhs.0)
    }
}

impl SubAssign<&VoteValue> for VoteValue {
    fn sub_assign(&mut self, rhs: &VoteValue) {
        self.0 -= &rhs.0;
    }
}

impl<'a> Mul<&'a VoteValue> for &'a VoteValue {
    type Output = VoteValue;
    fn mul(self, rhs: &VoteValue) -> VoteValue {
        VoteValue((&self.0 * &rhs.0) / unit())
    }
}

impl Sum for VoteValue {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(VoteValue::zero(), |acc, v| acc + v)
    }
}

impl<'a> Sum<&'a VoteValue> for VoteValue {
    fn sum<I: Iterator<Item = &'a VoteValue>>(iter: I) -> Self {
        let mut acc = VoteValue::zero();
        for v in iter {
            acc += v;
        }
        acc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> VoteValue {
        s.parse().unwrap()
    }

    #[test]
    fn display_trims_trailing_zeros() {
        assert_eq!(VoteValue::from_weight(2).to_string(), "2");
        assert_eq!(v("0.250").to_string(), "0.25");
        assert_eq!(VoteValue::zero().to_string(), "0");
        assert_eq!(v("-1.5").to_string(), "-1.5");
    }

    #[test]
    fn parses_exponents() {
        assert_eq!(v("1e-28"), VoteValue::ten_to_minus(28));
        assert_eq!(v("2.5E3"), VoteValue::from_weight(2500));
        assert!("abc".parse::<VoteValue>().is_err());
        assert!("".parse::<VoteValue>().is_err());
        assert!("1e".parse::<VoteValue>().is_err());
    }

    #[test]
    fn huge_exponents_are_rejected() {
        assert!("1e4000000000".parse::<VoteValue>().is_err());
        assert!("1e-301".parse::<VoteValue>().is_err());
        assert_eq!(v("1e-300"), VoteValue::zero());
        assert!(v("1e300") > VoteValue::from_weight(u64::MAX));
    }

    #[test]
    fn division_truncates_deterministically() {
        let five = VoteValue::from_weight(5);
        let third = five.div_int(3).unwrap();
        let expected = format!("1.{}", "6".repeat(SCALE as usize));
        assert_eq!(third.to_string(), expected);
        assert_eq!(third.to_fixed(4), "1.6667");
        assert!(five.checked_div(&VoteValue::zero()).is_none());
    }

    #[test]
    fn multiplication_by_one_is_exact() {
        let x = VoteValue::from_weight(7).div_int(3).unwrap();
        assert_eq!(&x * &VoteValue::one(), x);
    }

    #[test]
    fn clamp_and_compare() {
        let one = VoteValue::one();
        let zero = VoteValue::zero();
        assert_eq!(VoteValue::from_weight(3).clamp_to(&zero, &one), one);
        assert_eq!(v("-0.1").clamp_to(&zero, &one), zero);
        assert!(v("0.1") < v("0.2"));
        assert_eq!(v("0.3").abs_diff(&v("0.5")), v("0.2"));
    }
}
