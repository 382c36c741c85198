//! Order numbers (`CMD-202403-0007`) and the calendar periods that scope them.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use atelier_core::{DomainError, DomainResult};

pub const DEFAULT_ORDER_PREFIX: &str = "CMD";

/// Year-month key ("YYYYMM") scoping an order-number sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeriodKey(String);

impl PeriodKey {
    /// Period of a UTC instant.
    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self(format!("{:04}{:02}", at.year(), at.month()))
    }

    pub fn parse(s: &str) -> DomainResult<Self> {
        let valid = s.len() == 6
            && s.bytes().all(|b| b.is_ascii_digit())
            && matches!(s[4..].parse::<u32>(), Ok(1..=12));
        if !valid {
            return Err(DomainError::validation(format!("invalid period key '{s}' (expected YYYYMM)")));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PeriodKey {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PeriodKey> for String {
    fn from(value: PeriodKey) -> Self {
        value.0
    }
}

/// Human-facing order identifier: `{prefix}-{period}-{sequence:04}`.
///
/// The sequence is zero-padded to four digits and widens past 9999.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OrderNumber {
    prefix: String,
    period: PeriodKey,
    sequence: u64,
}

impl OrderNumber {
    pub fn new(prefix: impl Into<String>, period: PeriodKey, sequence: u64) -> DomainResult<Self> {
        let prefix = prefix.into();
        if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(DomainError::validation(format!("invalid order number prefix '{prefix}'")));
        }
        if sequence == 0 {
            return Err(DomainError::validation("order sequence starts at 1"));
        }
        Ok(Self {
            prefix,
            period,
            sequence,
        })
    }

    pub fn parse(s: &str) -> DomainResult<Self> {
        let mut parts = s.trim().rsplitn(3, '-');
        let (Some(seq), Some(period), Some(prefix)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(DomainError::validation(format!("malformed order number '{s}'")));
        };
        if seq.len() < 4 || !seq.bytes().all(|b| b.is_ascii_digit()) {
            return Err(DomainError::validation(format!("malformed order sequence in '{s}'")));
        }
        let sequence = seq
            .parse::<u64>()
            .map_err(|e| DomainError::validation(format!("malformed order sequence in '{s}': {e}")))?;
        Self::new(prefix, PeriodKey::parse(period)?, sequence)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn period(&self) -> &PeriodKey {
        &self.period
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl core::fmt::Display for OrderNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}-{}-{:04}", self.prefix, self.period, self.sequence)
    }
}

impl core::str::FromStr for OrderNumber {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for OrderNumber {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<OrderNumber> for String {
    fn from(value: OrderNumber) -> Self {
        value.to_string()
    }
}
