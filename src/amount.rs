//! Fixed-point money amount
//!
//! Balances carry exactly four fractional digits. Storing them as scaled
//! integers keeps additions exact, so a credit followed by the matching
//! debit always nets to zero.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Signed amount with 4 implied decimal places
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(i64);

impl Amount {
    pub const ZERO: Amount = Amount(0);
    /// Units per whole currency unit
    pub const SCALE: i64 = 10_000;
    /// Number of fractional digits
    pub const DECIMALS: usize = 4;

    /// Build from raw units (1 unit = 0.0001)
    pub const fn from_units(units: i64) -> Self {
        Amount(units)
    }

    /// Build from a whole number of currency units
    pub const fn from_whole(whole: i64) -> Self {
        Amount(whole * Self::SCALE)
    }

    /// Raw units
    pub const fn units(self) -> i64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn abs(self) -> Self {
        Amount(self.0.abs())
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }
}

impl std::ops::Add for Amount {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Amount(self.0 + other.0)
    }
}

impl std::ops::Sub for Amount {
    type Output = Self;

    fn sub(self, other: Self) -> Self {
        Amount(self.0 - other.0)
    }
}

impl std::ops::Neg for Amount {
    type Output = Self;

    fn neg(self) -> Self {
        Amount(-self.0)
    }
}

impl std::iter::Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Self {
        Amount(iter.map(|a| a.0).sum())
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let scale = Self::SCALE as u64;
        write!(
            f,
            "{}{}.{:04}",
            sign,
            abs / scale,
            abs % scale
        )
    }
}

impl FromStr for Amount {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let invalid = || Error::InvalidInput(format!("Invalid amount: {:?}", s));

        let (negative, digits) = match raw.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, raw.strip_prefix('+').unwrap_or(raw)),
        };

        let (whole, frac) = match digits.split_once('.') {
            Some((w, f)) => (w, f),
            None => (digits, ""),
        };

        if whole.is_empty() && frac.is_empty() {
            return Err(invalid());
        }
        if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        if frac.len() > Self::DECIMALS {
            return Err(Error::InvalidInput(format!(
                "Amount {:?} has more than {} decimal places",
                s,
                Self::DECIMALS
            )));
        }

        let whole_units: i64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid())?
        };
        let frac_units: i64 = if frac.is_empty() {
            0
        } else {
            format!("{:0<4}", frac).parse().map_err(|_| invalid())?
        };

        let units = whole_units
            .checked_mul(Self::SCALE)
            .and_then(|w| w.checked_add(frac_units))
            .ok_or_else(invalid)?;

        Ok(Amount(if negative { -units } else { units }))
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        assert_eq!("0.2".parse::<Amount>().unwrap(), Amount::from_units(2_000));
        assert_eq!("1".parse::<Amount>().unwrap(), Amount::from_whole(1));
        assert_eq!(".5".parse::<Amount>().unwrap(), Amount::from_units(5_000));
        assert_eq!("-3.0001".parse::<Amount>().unwrap(), Amount::from_units(-30_001));

        assert_eq!(Amount::from_units(1_000).to_string(), "0.1000");
        assert_eq!(Amount::from_units(-25).to_string(), "-0.0025");
        assert_eq!(Amount::from_whole(5).to_string(), "5.0000");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<Amount>().is_err());
        assert!(".".parse::<Amount>().is_err());
        assert!("abc".parse::<Amount>().is_err());
        assert!("1.2.3".parse::<Amount>().is_err());
        assert!("0.00001".parse::<Amount>().is_err());
        assert!("1e5".parse::<Amount>().is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&Amount::from_units(2_000)).unwrap();
        assert_eq!(json, "\"0.2000\"");

        let back: Amount = serde_json::from_str("\"3.5\"").unwrap();
        assert_eq!(back, Amount::from_units(35_000));
    }

    #[test]
    fn test_sum_and_checked_ops() {
        let total: Amount = ["0.1", "0.2", "0.3"]
            .iter()
            .map(|s| s.parse::<Amount>().unwrap())
            .sum();
        assert_eq!(total, Amount::from_units(6_000));

        assert_eq!(Amount::from_units(i64::MAX).checked_add(Amount::from_units(1)), None);
        assert_eq!(
            Amount::from_whole(2).checked_sub(Amount::from_whole(3)),
            Some(Amount::from_whole(-1))
        );
    }
}
