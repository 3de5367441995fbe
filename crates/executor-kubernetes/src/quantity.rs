//! Kubernetes resource quantities (`500m`, `2Gi`, `1.5`).

use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid quantity {0:?}")]
pub struct QuantityError(pub String);

enum Exponent {
    Binary(i32),
    Decimal(i32),
}

// binary suffixes first so "Mi" is not read as "i" after an "M"
const SUFFIXES: &[(&str, Exponent)] = &[
    ("Ki", Exponent::Binary(1)),
    ("Mi", Exponent::Binary(2)),
    ("Gi", Exponent::Binary(3)),
    ("Ti", Exponent::Binary(4)),
    ("Pi", Exponent::Binary(5)),
    ("Ei", Exponent::Binary(6)),
    ("n", Exponent::Decimal(-9)),
    ("u", Exponent::Decimal(-6)),
    ("m", Exponent::Decimal(-3)),
    ("k", Exponent::Decimal(3)),
    ("M", Exponent::Decimal(6)),
    ("G", Exponent::Decimal(9)),
    ("T", Exponent::Decimal(12)),
    ("P", Exponent::Decimal(15)),
    ("E", Exponent::Decimal(18)),
];

fn scale(base: f64, exp: &Exponent) -> f64 {
    match exp {
        Exponent::Binary(n) => base * 1024f64.powi(*n),
        Exponent::Decimal(n) if *n < 0 => base / 10f64.powi(-n),
        Exponent::Decimal(n) => base * 10f64.powi(*n),
    }
}

/// A parsed quantity. Keeps the original text for the API and a base-unit value for comparisons.
#[derive(Debug, Clone)]
pub struct Quantity {
    text: String,
    value: f64,
}

impl Quantity {
    pub fn parse(text: &str) -> Result<Self, QuantityError> {
        let trimmed = text.trim();
        let (number, exponent) = SUFFIXES
            .iter()
            .find(|(suffix, _)| trimmed.ends_with(suffix))
            .map(|(suffix, exp)| (&trimmed[..trimmed.len() - suffix.len()], exp))
            .unwrap_or((trimmed, &Exponent::Decimal(0)));

        if number.is_empty() {
            return Err(QuantityError(text.to_string()));
        }

        let base: f64 = number
            .parse()
            .map_err(|_| QuantityError(text.to_string()))?;
        if !base.is_finite() || base < 0.0 {
            return Err(QuantityError(text.to_string()));
        }

        Ok(Self {
            text: trimmed.to_string(),
            value: scale(base, exponent),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Value in base units (cores, bytes).
    pub fn value(&self) -> f64 {
        self.value
    }
}

impl PartialEq for Quantity {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl PartialOrd for Quantity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.value.partial_cmp(&other.value)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text)
    }
}

impl From<&Quantity> for k8s_openapi::apimachinery::pkg::api::resource::Quantity {
    fn from(q: &Quantity) -> Self {
        k8s_openapi::apimachinery::pkg::api::resource::Quantity(q.text.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(s: &str) -> Quantity {
        Quantity::parse(s).unwrap()
    }

    #[test]
    fn parses_suffixes() {
        assert_eq!(q("500m").value(), 0.5);
        assert_eq!(q("2").value(), 2.0);
        assert_eq!(q("1Ki").value(), 1024.0);
        assert_eq!(q("1.5Gi").value(), 1.5 * 1024.0 * 1024.0 * 1024.0);
        assert_eq!(q("1e3").value(), 1000.0);
        assert_eq!(q(" 3k ").as_str(), "3k");
    }

    #[test]
    fn compares_across_units() {
        assert!(q("1500m") > q("1"));
        assert!(q("1Gi") > q("1G"));
        assert!(q("512Mi") < q("1Gi"));
        assert_eq!(q("1000m"), q("1"));
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["", "abc", "1Xi", "-1", "1.2.3"] {
            assert!(Quantity::parse(bad).is_err(), "{:?} parsed", bad);
        }
    }
}
