//! Aggregate identification types.
//!
//! Every remediation lifecycle is keyed by an [`AggregateId`]. Events for one
//! aggregate form an ordered history; events across aggregates carry no
//! ordering guarantee.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Aggregate type recorded for corruption remediation lifecycles.
pub const CORRUPTION_AGGREGATE: &str = "corruption";

/// Aggregate type recorded for scan runs.
pub const SCAN_AGGREGATE: &str = "scan";

/// Aggregate type recorded for notification deliveries.
pub const NOTIFICATION_AGGREGATE: &str = "notification";

/// Error type for `AggregateId` parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid aggregate ID: {0}")]
pub struct ParseAggregateIdError(String);

/// Stable identifier for one aggregate (one corrupt file instance, one scan run, ...).
///
/// # Validation
///
/// - `FromStr::from_str()`: validates input (rejects empty or whitespace-only strings,
///   trims surrounding whitespace)
/// - `From::from()` and `new()`: no validation, for application-controlled input
///
/// Use `FromStr` for ids arriving from operators or HTTP clients.
///
/// # Examples
///
/// ```
/// use healwatch_core::aggregate::AggregateId;
///
/// let id = AggregateId::new("abc");
/// assert_eq!(id.as_str(), "abc");
///
/// let parsed: AggregateId = " abc ".parse().unwrap();
/// assert_eq!(parsed, id);
/// assert!("   ".parse::<AggregateId>().is_err());
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregateId(String);

impl AggregateId {
    /// Create a new `AggregateId` from a string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the aggregate ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert the `AggregateId` into its inner `String`.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for AggregateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AggregateId {
    type Err = ParseAggregateIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(ParseAggregateIdError(
                "Aggregate ID cannot be empty".to_string(),
            ));
        }
        if trimmed.chars().any(char::is_control) {
            return Err(ParseAggregateIdError(format!(
                "Aggregate ID contains control characters: {trimmed:?}"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl From<String> for AggregateId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for AggregateId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for AggregateId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_blank_ids() {
        assert!("".parse::<AggregateId>().is_err());
        assert!("  \t ".parse::<AggregateId>().is_err());
        assert!("a\u{0}b".parse::<AggregateId>().is_err());
    }

    #[test]
    fn parse_trims_whitespace() {
        let id: AggregateId = "  corruption-1 ".parse().unwrap();
        assert_eq!(id.as_str(), "corruption-1");
    }

    proptest::proptest! {
        #[test]
        fn parse_keeps_the_trimmed_id(id in "[a-z0-9][a-z0-9-]{0,31}", pad in " {0,3}") {
            let parsed: AggregateId = format!("{pad}{id}{pad}").parse().unwrap();
            proptest::prop_assert_eq!(parsed.as_str(), id.as_str());
        }
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = AggregateId::new("abc");
        let json = serde_json::to_string(&id).expect("serialize id");
        assert_eq!(json, "\"abc\"");
    }
}
