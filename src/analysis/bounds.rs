//! Bounded integer measurements.
//!
//! A [`BoundedValue`] is either an exact measurement or a lower bound
//! ("at least N") produced by a pass that could not observe the quantity
//! precisely. Every operation here is total: inconsistent inputs yield a
//! best-effort value plus an [`Anomaly`] instead of an error.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Prefix used in the textual form of a lower bound.
const LOWER_BOUND_PREFIX: &str = ">= ";

/// A non-negative integer that is either exact or a lower bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BoundedValue {
    value: u32,
    exact: bool,
}

/// Inconsistency detected between two bounds describing the same quantity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Anomaly {
    /// An exact value fell under a lower bound observed for the same quantity.
    #[error("exact value {exact} is below lower bound {bound}")]
    ExactBelowBound { exact: u32, bound: u32 },

    /// Two exact observations of the same quantity disagree.
    #[error("conflicting exact values {left} and {right}")]
    ConflictingExact { left: u32, right: u32 },

    /// Bucket durations do not add up to the reported total duration.
    #[error("bucket total {buckets} does not match duration {duration}")]
    DurationMismatch { buckets: BoundedValue, duration: u32 },

    /// Computed attenuation classification disagrees with the collaborator.
    #[error("classified level {computed} differs from reported level {reported}")]
    ClassificationMismatch { computed: u32, reported: u32 },
}

/// A value together with the anomaly, if any, found while computing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checked<T> {
    pub value: T,
    pub anomaly: Option<Anomaly>,
}

impl<T> Checked<T> {
    fn clean(value: T) -> Self {
        Self {
            value,
            anomaly: None,
        }
    }

    fn flagged(value: T, anomaly: Anomaly) -> Self {
        Self {
            value,
            anomaly: Some(anomaly),
        }
    }
}

/// Error returned when bound text is malformed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseBoundError {
    #[error("empty bound text")]
    Empty,

    #[error("invalid bound '{text}': expected \"N\" or \">= N\"")]
    InvalidNumber { text: String },
}

impl BoundedValue {
    /// The unknown quantity: at least zero.
    pub const UNKNOWN: BoundedValue = BoundedValue {
        value: 0,
        exact: false,
    };

    /// Exact zero.
    pub const ZERO: BoundedValue = BoundedValue {
        value: 0,
        exact: true,
    };

    pub fn from_exact(value: u32) -> Self {
        Self { value, exact: true }
    }

    pub fn from_lower_bound(value: u32) -> Self {
        Self {
            value,
            exact: false,
        }
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    pub fn is_exact(&self) -> bool {
        self.exact
    }

    /// Parse the textual form: `"N"` is exact, `">= N"` is a lower bound.
    pub fn parse(text: &str) -> Result<Self, ParseBoundError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(ParseBoundError::Empty);
        }

        let (digits, exact) = match trimmed.strip_prefix(">=") {
            Some(rest) => (rest.trim_start(), false),
            None => (trimmed, true),
        };

        let value = digits
            .parse::<u32>()
            .map_err(|_| ParseBoundError::InvalidNumber {
                text: text.to_string(),
            })?;

        Ok(Self { value, exact })
    }

    /// Sum of two bounds; exact only if both are.
    pub fn add(self, other: BoundedValue) -> BoundedValue {
        BoundedValue {
            value: self.value.saturating_add(other.value),
            exact: self.exact && other.exact,
        }
    }

    /// Difference of two bounds.
    ///
    /// Subtracting a lower bound says nothing about the result, so that case
    /// yields [`BoundedValue::UNKNOWN`]. Bounds never go negative.
    pub fn subtract(self, other: BoundedValue) -> BoundedValue {
        if !other.exact {
            return BoundedValue::UNKNOWN;
        }
        BoundedValue {
            value: self.value.saturating_sub(other.value),
            exact: self.exact,
        }
    }

    /// Integer division by a scalar, preserving exactness.
    ///
    /// Division by zero yields [`BoundedValue::UNKNOWN`].
    pub fn divide(self, scalar: u32) -> BoundedValue {
        match self.value.checked_div(scalar) {
            Some(value) => BoundedValue {
                value,
                exact: self.exact,
            },
            None => BoundedValue::UNKNOWN,
        }
    }

    /// Multiply by a scalar weight, preserving exactness.
    pub fn scale(self, factor: u32) -> BoundedValue {
        BoundedValue {
            value: self.value.saturating_mul(factor),
            exact: self.exact,
        }
    }

    /// Whether `n` is a possible value of this bound.
    pub fn matches(&self, n: u32) -> bool {
        if self.exact {
            self.value == n
        } else {
            self.value <= n
        }
    }

    /// Demote to a lower bound with the same value.
    pub fn as_lower_bound(self) -> BoundedValue {
        BoundedValue {
            value: self.value,
            exact: false,
        }
    }

    /// Raise a lower bound to `lower`, promoting it to exact when it lands
    /// on an exact `upper`.
    ///
    /// Exact values are returned unchanged; one that sits under `lower` is
    /// flagged since the quantity can only have grown.
    pub fn clamp(self, lower: BoundedValue, upper: BoundedValue) -> Checked<BoundedValue> {
        if self.exact {
            if self.value < lower.value {
                return Checked::flagged(
                    self,
                    Anomaly::ExactBelowBound {
                        exact: self.value,
                        bound: lower.value,
                    },
                );
            }
            return Checked::clean(self);
        }

        let raised = self.value.max(lower.value);
        if upper.exact && raised == upper.value {
            return Checked::clean(upper);
        }
        Checked::clean(BoundedValue::from_lower_bound(raised))
    }

    /// Combine two bounds believed to describe the same quantity.
    pub fn intersect(self, other: BoundedValue) -> Checked<BoundedValue> {
        match (self.exact, other.exact) {
            (false, false) => Checked::clean(BoundedValue::from_lower_bound(
                self.value.max(other.value),
            )),
            (true, false) => exact_over_bound(self, other),
            (false, true) => exact_over_bound(other, self),
            (true, true) if self.value == other.value => Checked::clean(self),
            (true, true) => Checked::flagged(
                BoundedValue::from_exact(self.value.max(other.value)),
                Anomaly::ConflictingExact {
                    left: self.value,
                    right: other.value,
                },
            ),
        }
    }
}

fn exact_over_bound(exact: BoundedValue, bound: BoundedValue) -> Checked<BoundedValue> {
    if exact.value >= bound.value {
        Checked::clean(exact)
    } else {
        Checked::flagged(
            exact,
            Anomaly::ExactBelowBound {
                exact: exact.value,
                bound: bound.value,
            },
        )
    }
}

impl Default for BoundedValue {
    fn default() -> Self {
        BoundedValue::UNKNOWN
    }
}

impl fmt::Display for BoundedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.exact {
            write!(f, "{}", self.value)
        } else {
            write!(f, "{}{}", LOWER_BOUND_PREFIX, self.value)
        }
    }
}

impl FromStr for BoundedValue {
    type Err = ParseBoundError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for BoundedValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BoundedValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        BoundedValue::parse(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exact(n: u32) -> BoundedValue {
        BoundedValue::from_exact(n)
    }

    fn at_least(n: u32) -> BoundedValue {
        BoundedValue::from_lower_bound(n)
    }

    #[test]
    fn test_add_tracks_exactness() {
        assert_eq!(exact(3).add(exact(4)), exact(7));
        assert_eq!(exact(3).add(at_least(4)), at_least(7));
        assert_eq!(at_least(3).add(at_least(4)), at_least(7));
    }

    #[test]
    fn test_subtract() {
        assert_eq!(exact(10).subtract(exact(4)), exact(6));
        assert_eq!(at_least(10).subtract(exact(4)), at_least(6));
        assert_eq!(exact(10).subtract(at_least(4)), BoundedValue::UNKNOWN);
        assert_eq!(exact(3).subtract(exact(5)), exact(0));
    }

    #[test]
    fn test_divide() {
        assert_eq!(exact(72).divide(27), exact(2));
        assert_eq!(at_least(60).divide(25), at_least(2));
        assert_eq!(exact(5).divide(0), BoundedValue::UNKNOWN);
    }

    #[test]
    fn test_matches() {
        assert!(exact(5).matches(5));
        assert!(!exact(5).matches(6));
        assert!(at_least(5).matches(9));
        assert!(!at_least(5).matches(4));
    }

    #[test]
    fn test_intersect_exact_values() {
        let same = exact(50).intersect(exact(50));
        assert_eq!(same.value, exact(50));
        assert!(same.anomaly.is_none());

        let conflict = exact(50).intersect(exact(60));
        assert_eq!(conflict.value, exact(60));
        assert_eq!(
            conflict.anomaly,
            Some(Anomaly::ConflictingExact {
                left: 50,
                right: 60
            })
        );
    }

    #[test]
    fn test_intersect_exact_with_bound() {
        let refined = at_least(40).intersect(exact(55));
        assert_eq!(refined.value, exact(55));
        assert!(refined.anomaly.is_none());

        let shrunk = at_least(60).intersect(exact(55));
        assert_eq!(shrunk.value, exact(55));
        assert!(matches!(
            shrunk.anomaly,
            Some(Anomaly::ExactBelowBound {
                exact: 55,
                bound: 60
            })
        ));

        // Symmetric in argument order.
        assert_eq!(exact(55).intersect(at_least(40)).value, exact(55));
    }

    #[test]
    fn test_intersect_two_bounds() {
        let merged = at_least(10).intersect(at_least(12));
        assert_eq!(merged.value, at_least(12));
        assert!(merged.anomaly.is_none());
    }

    #[test]
    fn test_clamp() {
        assert_eq!(at_least(10).clamp(at_least(20), at_least(30)).value, at_least(20));
        assert_eq!(at_least(10).clamp(exact(25), exact(25)).value, exact(25));
        assert_eq!(at_least(30).clamp(exact(25), exact(25)).value, at_least(30));

        let kept = exact(12).clamp(at_least(5), BoundedValue::UNKNOWN);
        assert_eq!(kept.value, exact(12));
        assert!(kept.anomaly.is_none());

        let flagged = exact(12).clamp(at_least(20), BoundedValue::UNKNOWN);
        assert_eq!(flagged.value, exact(12));
        assert!(flagged.anomaly.is_some());
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!(BoundedValue::parse("12").unwrap(), exact(12));
        assert_eq!(BoundedValue::parse(">= 30").unwrap(), at_least(30));
        assert_eq!(">=7".parse::<BoundedValue>().unwrap(), at_least(7));
        assert_eq!(at_least(30).to_string(), ">= 30");
        assert_eq!(exact(4).to_string(), "4");
    }

    #[test]
    fn test_parse_rejects_malformed_text() {
        assert_eq!(BoundedValue::parse("  "), Err(ParseBoundError::Empty));
        assert!(matches!(
            BoundedValue::parse(">= ten"),
            Err(ParseBoundError::InvalidNumber { .. })
        ));
        assert!(BoundedValue::parse("-3").is_err());
    }

    #[test]
    fn test_serde_uses_text_form() {
        let json = serde_json::to_string(&vec![exact(5), at_least(30)]).unwrap();
        assert_eq!(json, r#"["5",">= 30"]"#);

        let back: Vec<BoundedValue> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, vec![exact(5), at_least(30)]);

        assert!(serde_json::from_str::<BoundedValue>(r#""abc""#).is_err());
    }
}
