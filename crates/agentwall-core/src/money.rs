use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::str::FromStr;

/// Fixed-point decimal amount in USD, 8 fractional digits.
///
/// Floating point is forbidden for costs (per the governance invariants:
/// cumulative cost must be monotone and exactly reproducible). `Money`
/// wraps an `i64` of hundred-millionths of a dollar and serializes as a
/// decimal string so JSON round-trips never lose precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Money(i64);

const SCALE: i64 = 100_000_000;

impl Money {
    pub const ZERO: Money = Money(0);

    pub fn from_scaled(units: i64) -> Self {
        Money(units)
    }

    pub fn scaled(self) -> i64 {
        self.0
    }

    /// Construct from a USD amount expressed as `f64`. Only used at
    /// configuration boundaries where an operator wrote a literal like
    /// `10.0` in TOML; never used on the cost-computation hot path.
    pub fn from_dollars_f64(dollars: f64) -> Self {
        Money((dollars * SCALE as f64).round() as i64)
    }

    pub fn as_dollars_f64(self) -> f64 {
        self.0 as f64 / SCALE as f64
    }

    /// Cost of `tokens` at `price_per_million` (itself a `Money` quoting a
    /// price per 1,000,000 tokens). Integer math throughout: multiply then
    /// divide, matching the cost table's documented formula.
    pub fn token_cost(tokens: u64, price_per_million: Money) -> Money {
        let numerator = (tokens as i128) * (price_per_million.0 as i128);
        Money((numerator / 1_000_000) as i64)
    }
}

impl Add for Money {
    type Output = Money;
    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Money) {
        self.0 += rhs.0;
    }
}

impl Sub for Money {
    type Output = Money;
    fn sub(self, rhs: Money) -> Money {
        Money(self.0 - rhs.0)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / SCALE;
        let frac = (self.0 % SCALE).abs();
        write!(f, "{whole}.{frac:08}")
    }
}

impl FromStr for Money {
    type Err = std::num::ParseFloatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (whole, frac) = s.split_once('.').unwrap_or((s, "0"));
        let whole: i64 = whole.parse().map_err(|_| "0".parse::<f64>().unwrap_err())?;
        let frac_digits: String = frac.chars().chain(std::iter::repeat('0')).take(8).collect();
        let frac: i64 = frac_digits
            .parse()
            .map_err(|_| "0".parse::<f64>().unwrap_err())?;
        let sign = if whole < 0 || s.starts_with('-') { -1 } else { 1 };
        Ok(Money(sign * (whole.abs() * SCALE + frac)))
    }
}

impl Serialize for Money {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Money::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_string() {
        let m = Money::from_dollars_f64(12.34);
        let s = m.to_string();
        let parsed: Money = s.parse().unwrap();
        assert_eq!(m, parsed);
    }

    #[test]
    fn token_cost_is_zero_for_zero_tokens() {
        let price = Money::from_dollars_f64(30.0);
        assert_eq!(Money::token_cost(0, price), Money::ZERO);
    }

    #[test]
    fn token_cost_is_monotone_in_tokens() {
        let price = Money::from_dollars_f64(30.0);
        let low = Money::token_cost(1_000, price);
        let high = Money::token_cost(2_000, price);
        assert!(high >= low);
    }

    #[test]
    fn serializes_as_decimal_string() {
        let m = Money::from_dollars_f64(1.5);
        let json = serde_json::to_string(&m).unwrap();
        assert_eq!(json, "\"1.50000000\"");
    }
}
