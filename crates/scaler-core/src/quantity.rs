//! Resource quantities and resource lists.
//!
//! Quantities use the Kubernetes suffix notation (`500m`, `2`, `1.5Gi`,
//! `256Mi`, `1k`) and are held as signed milli-units so that CPU and
//! memory share one arithmetic. Fractions below one milli-unit round up.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, Mul, Sub};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{CoreError, CoreResult};

/// A resource amount in milli-units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Quantity {
    millis: i64,
}

impl Quantity {
    pub const ZERO: Quantity = Quantity { millis: 0 };

    pub fn from_millis(millis: i64) -> Self {
        Self { millis }
    }

    /// Whole units, e.g. `Quantity::from_units(2)` is two CPUs or two bytes.
    pub fn from_units(units: i64) -> Self {
        Self {
            millis: units.saturating_mul(1000),
        }
    }

    pub fn millis(&self) -> i64 {
        self.millis
    }

    pub fn is_negative(&self) -> bool {
        self.millis < 0
    }

    /// Parse a quantity string.
    pub fn parse(input: &str) -> CoreResult<Self> {
        let s = input.trim();
        let split = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+'))
            .unwrap_or(s.len());
        let (number, suffix) = s.split_at(split);

        let multiplier: i128 = match suffix {
            "" => 1_000,
            "m" => 1,
            "k" => 1_000 * 1_000,
            "M" => 1_000 * 1_000_000,
            "G" => 1_000 * 1_000_000_000,
            "T" => 1_000 * 1_000_000_000_000,
            "P" => 1_000 * 1_000_000_000_000_000,
            "Ki" => 1_000 * (1 << 10),
            "Mi" => 1_000 * (1 << 20),
            "Gi" => 1_000 * (1 << 30),
            "Ti" => 1_000 * (1 << 40),
            "Pi" => 1_000 * (1 << 50),
            _ => return Err(CoreError::Quantity(input.to_string())),
        };

        let (negative, digits) = match number.as_bytes().first() {
            Some(b'-') => (true, &number[1..]),
            Some(b'+') => (false, &number[1..]),
            _ => (false, number),
        };
        let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));
        if (whole.is_empty() && frac.is_empty())
            || !whole.bytes().all(|b| b.is_ascii_digit())
            || !frac.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(CoreError::Quantity(input.to_string()));
        }

        let overflow = || CoreError::Overflow(input.to_string());
        let whole: i128 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| overflow())?
        };
        let mut millis = whole.checked_mul(multiplier).ok_or_else(overflow)?;

        if !frac.is_empty() {
            let scale = 10_i128
                .checked_pow(frac.len() as u32)
                .ok_or_else(overflow)?;
            let frac: i128 = frac.parse().map_err(|_| overflow())?;
            let scaled = frac.checked_mul(multiplier).ok_or_else(overflow)?;
            // Round up, as the API server does for sub-milli precision.
            millis += (scaled + scale - 1) / scale;
        }

        if negative {
            millis = -millis;
        }
        let millis = i64::try_from(millis).map_err(|_| overflow())?;
        Ok(Self { millis })
    }
}

impl FromStr for Quantity {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Quantity::parse(s)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.millis % 1000 == 0 {
            write!(f, "{}", self.millis / 1000)
        } else {
            write!(f, "{}m", self.millis)
        }
    }
}

impl Add for Quantity {
    type Output = Quantity;

    fn add(self, rhs: Quantity) -> Quantity {
        Quantity::from_millis(self.millis.saturating_add(rhs.millis))
    }
}

impl Sub for Quantity {
    type Output = Quantity;

    fn sub(self, rhs: Quantity) -> Quantity {
        Quantity::from_millis(self.millis.saturating_sub(rhs.millis))
    }
}

impl Mul<i64> for Quantity {
    type Output = Quantity;

    fn mul(self, rhs: i64) -> Quantity {
        Quantity::from_millis(self.millis.saturating_mul(rhs))
    }
}

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Fixtures write plain integers (`cpu = 2`) as often as strings.
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(i64),
            Str(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Int(units) => Ok(Quantity::from_units(units)),
            Raw::Str(s) => Quantity::parse(&s).map_err(serde::de::Error::custom),
        }
    }
}

/// Resource name → quantity, ordered by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceList(BTreeMap<String, Quantity>);

impl ResourceList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, quantity: Quantity) {
        self.0.insert(name.into(), quantity);
    }

    pub fn with(mut self, name: impl Into<String>, quantity: Quantity) -> Self {
        self.insert(name, quantity);
        self
    }

    pub fn get(&self, name: &str) -> Option<Quantity> {
        self.0.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Quantity)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Add `other` into `self`; names missing on either side count as zero.
    pub fn add(&self, other: &ResourceList) -> ResourceList {
        let mut out = self.clone();
        for (name, q) in other.iter() {
            let entry = out.0.entry(name.to_string()).or_default();
            *entry = *entry + q;
        }
        out
    }

    /// Subtract `other` from `self` over the union of both name sets.
    pub fn sub(&self, other: &ResourceList) -> ResourceList {
        let mut out = self.clone();
        for (name, q) in other.iter() {
            let entry = out.0.entry(name.to_string()).or_default();
            *entry = *entry - q;
        }
        out
    }

    /// Multiply every quantity by `factor`.
    pub fn scale(&self, factor: i64) -> ResourceList {
        ResourceList(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), *v * factor))
                .collect(),
        )
    }

    /// Keep only the names that also appear in `mask`.
    pub fn restrict_to(&self, mask: &ResourceList) -> ResourceList {
        ResourceList(
            self.0
                .iter()
                .filter(|(k, _)| mask.0.contains_key(k.as_str()))
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
        )
    }

    /// Names whose quantity is below zero.
    pub fn negative(&self) -> ResourceList {
        ResourceList(
            self.0
                .iter()
                .filter(|(_, v)| v.is_negative())
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
        )
    }
}

impl FromIterator<(String, Quantity)> for ResourceList {
    fn from_iter<I: IntoIterator<Item = (String, Quantity)>>(iter: I) -> Self {
        ResourceList(iter.into_iter().collect())
    }
}

impl fmt::Display for ResourceList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, q) in self.iter() {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{name}={q}")?;
            first = false;
        }
        Ok(())
    }
}
