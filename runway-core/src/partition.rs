//! Partition identity, state and fingerprints
//!
//! A partition is the unit of incremental materialization. Every asset has one
//! or more partitions: daily assets are keyed by `YYYY-MM-DD`, custom assets by
//! their declared keys, and unpartitioned assets by a single implicit key.

use crate::quality::DataQualityResult;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Key used by assets that have no partition dimension
pub const UNPARTITIONED_KEY: &str = "__all__";

/// Date format used for daily partition keys
pub const DAILY_KEY_FORMAT: &str = "%Y-%m-%d";

/// A single row of materialized data
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Partition key within an asset's partition dimension
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionKey(String);

impl PartitionKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The implicit key of an unpartitioned asset
    pub fn unpartitioned() -> Self {
        Self(UNPARTITIONED_KEY.to_string())
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self(date.format(DAILY_KEY_FORMAT).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_unpartitioned(&self) -> bool {
        self.0 == UNPARTITIONED_KEY
    }

    /// Parse the key as a daily partition date
    pub fn as_date(&self) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(&self.0, DAILY_KEY_FORMAT).ok()
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartitionKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for PartitionKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl From<NaiveDate> for PartitionKey {
    fn from(date: NaiveDate) -> Self {
        Self::from_date(date)
    }
}

/// Reference to one partition of one asset
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionRef {
    pub asset: String,
    pub key: PartitionKey,
}

impl PartitionRef {
    pub fn new(asset: impl Into<String>, key: impl Into<PartitionKey>) -> Self {
        Self {
            asset: asset.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for PartitionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.asset, self.key)
    }
}

/// Materialization state of a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionState {
    /// Never materialized
    #[default]
    Missing,

    /// Selected for a run, waiting for dispatch
    Pending,

    /// A unit is computing this partition
    InProgress,

    /// Output committed and all blocking checks passed
    Succeeded,

    /// Compute, fetch or write failed
    Failed,

    /// Output committed but a blocking quality check failed
    Quarantined,
}

impl PartitionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionState::Missing => "missing",
            PartitionState::Pending => "pending",
            PartitionState::InProgress => "in_progress",
            PartitionState::Succeeded => "succeeded",
            PartitionState::Failed => "failed",
            PartitionState::Quarantined => "quarantined",
        }
    }

    /// States that end a unit's execution
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PartitionState::Succeeded | PartitionState::Failed | PartitionState::Quarantined
        )
    }
}

impl fmt::Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown partition state
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown partition state: {0}")]
pub struct ParseStateError(pub String);

impl FromStr for PartitionState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "missing" => Ok(PartitionState::Missing),
            "pending" => Ok(PartitionState::Pending),
            "in_progress" => Ok(PartitionState::InProgress),
            "succeeded" => Ok(PartitionState::Succeeded),
            "failed" => Ok(PartitionState::Failed),
            "quarantined" => Ok(PartitionState::Quarantined),
            other => Err(ParseStateError(other.to_string())),
        }
    }
}

/// Hex-encoded SHA-256 digest of partition inputs or committed output
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    const UNKNOWN: &'static str = "unknown";

    /// Sentinel for partitions whose inputs were never recorded or were invalidated
    pub fn unknown() -> Self {
        Self(Self::UNKNOWN.to_string())
    }

    pub fn is_unknown(&self) -> bool {
        self.0 == Self::UNKNOWN
    }

    /// Wrap an already computed digest
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// Digest arbitrary bytes
    pub fn digest(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }

    /// Fingerprint a set of upstream contributions.
    ///
    /// Contributions are sorted by partition before hashing so the result does
    /// not depend on iteration order.
    pub fn of_inputs<'a, I>(contributions: I) -> Self
    where
        I: IntoIterator<Item = (&'a PartitionRef, String)>,
    {
        let mut lines: Vec<(&PartitionRef, String)> = contributions.into_iter().collect();
        lines.sort_by(|a, b| a.0.cmp(b.0));

        let mut hasher = Sha256::new();
        for (partition, contribution) in lines {
            hasher.update(partition.asset.as_bytes());
            hasher.update([0u8]);
            hasher.update(partition.key.as_str().as_bytes());
            hasher.update([0u8]);
            hasher.update(contribution.as_bytes());
            hasher.update(b"\n");
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Fingerprint {
    fn default() -> Self {
        Self::unknown()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Inclusive range of partition keys.
///
/// Keys compare lexicographically, which orders `YYYY-MM-DD` keys by date.
/// The unpartitioned key is always inside every range.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KeyRange {
    pub start: Option<PartitionKey>,
    pub end: Option<PartitionKey>,
}

impl KeyRange {
    /// Unbounded range
    pub fn all() -> Self {
        Self::default()
    }

    pub fn single(key: impl Into<PartitionKey>) -> Self {
        let key = key.into();
        Self {
            start: Some(key.clone()),
            end: Some(key),
        }
    }

    pub fn between(start: impl Into<PartitionKey>, end: impl Into<PartitionKey>) -> Self {
        Self {
            start: Some(start.into()),
            end: Some(end.into()),
        }
    }

    /// Parse `key` or `start..end`
    pub fn parse(spec: &str) -> Result<Self, KeyRangeError> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(KeyRangeError::Empty);
        }
        match spec.split_once("..") {
            Some((start, end)) => {
                let (start, end) = (start.trim(), end.trim());
                if start.is_empty() || end.is_empty() {
                    return Err(KeyRangeError::Malformed(spec.to_string()));
                }
                let range = Self::between(start, end);
                range.validate()?;
                Ok(range)
            }
            None => Ok(Self::single(spec)),
        }
    }

    /// Reject ranges whose end precedes their start
    pub fn validate(&self) -> Result<(), KeyRangeError> {
        if let (Some(start), Some(end)) = (&self.start, &self.end) {
            let inverted = match (start.as_date(), end.as_date()) {
                (Some(start), Some(end)) => end < start,
                _ => end < start,
            };
            if inverted {
                return Err(KeyRangeError::Inverted {
                    start: start.to_string(),
                    end: end.to_string(),
                });
            }
        }
        Ok(())
    }

    /// The same range with both bounds read as dates and rewritten in
    /// [`DAILY_KEY_FORMAT`], so `2024-3-1` matches the `2024-03-01` partition
    pub fn to_daily(&self) -> Result<Self, KeyRangeError> {
        let normalize = |bound: &Option<PartitionKey>| -> Result<Option<PartitionKey>, KeyRangeError> {
            match bound {
                None => Ok(None),
                Some(key) if key.is_unpartitioned() => Ok(Some(key.clone())),
                Some(key) => NaiveDate::parse_from_str(key.as_str(), DAILY_KEY_FORMAT)
                    .map(|date| Some(PartitionKey::from_date(date)))
                    .map_err(|_| KeyRangeError::NotADate(key.to_string())),
            }
        };
        let range = Self {
            start: normalize(&self.start)?,
            end: normalize(&self.end)?,
        };
        range.validate()?;
        Ok(range)
    }

    pub fn contains(&self, key: &PartitionKey) -> bool {
        if key.is_unpartitioned() {
            return true;
        }
        let after_start = self.start.as_ref().map_or(true, |s| key >= s);
        let before_end = self.end.as_ref().map_or(true, |e| key <= e);
        after_start && before_end
    }

    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.start, &self.end) {
            (None, None) => f.write_str("*"),
            (Some(s), Some(e)) if s == e => write!(f, "{}", s),
            (s, e) => write!(
                f,
                "{}..{}",
                s.as_ref().map_or("", |k| k.as_str()),
                e.as_ref().map_or("", |k| k.as_str())
            ),
        }
    }
}

/// Errors produced when parsing a key range
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyRangeError {
    #[error("Partition range cannot be empty")]
    Empty,

    #[error("Malformed partition range: {0} (expected KEY or START..END)")]
    Malformed(String),

    #[error("Partition range end '{end}' is before start '{start}'")]
    Inverted { start: String, end: String },

    #[error("'{0}' is not a daily partition key (expected YYYY-MM-DD)")]
    NotADate(String),
}

/// Catalog record for one partition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionRecord {
    pub asset: String,
    pub key: PartitionKey,
    pub state: PartitionState,

    /// Fingerprint of the upstream contributions consumed by the last run
    pub input_fingerprint: Fingerprint,

    /// Commit fingerprint returned by the storage writer
    pub output_fingerprint: Option<Fingerprint>,

    pub last_success_at: Option<DateTime<Utc>>,

    /// Rows written by the last successful commit
    pub row_count: Option<u64>,

    /// Results of the most recent quality gate
    #[serde(default)]
    pub quality_results: Vec<DataQualityResult>,

    /// Upstream partition that blocked the most recent run
    pub blocked_by: Option<PartitionRef>,

    pub updated_at: DateTime<Utc>,
}

impl PartitionRecord {
    /// Record for a partition the catalog has never seen
    pub fn missing(asset: impl Into<String>, key: impl Into<PartitionKey>) -> Self {
        Self {
            asset: asset.into(),
            key: key.into(),
            state: PartitionState::Missing,
            input_fingerprint: Fingerprint::unknown(),
            output_fingerprint: None,
            last_success_at: None,
            row_count: None,
            quality_results: Vec::new(),
            blocked_by: None,
            updated_at: Utc::now(),
        }
    }

    pub fn partition_ref(&self) -> PartitionRef {
        PartitionRef::new(self.asset.clone(), self.key.clone())
    }

    /// What this partition contributes to a downstream input fingerprint.
    ///
    /// Succeeded partitions contribute their commit fingerprint; every other
    /// state contributes its name, so a state change alone makes dependents stale.
    pub fn contribution(&self) -> String {
        match (self.state, &self.output_fingerprint) {
            (PartitionState::Succeeded, Some(output)) => format!("output:{}", output),
            (state, _) => format!("state:{}", state.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip_through_str() {
        for state in [
            PartitionState::Missing,
            PartitionState::Pending,
            PartitionState::InProgress,
            PartitionState::Succeeded,
            PartitionState::Failed,
            PartitionState::Quarantined,
        ] {
            assert_eq!(state.as_str().parse::<PartitionState>().unwrap(), state);
        }
        assert!("running".parse::<PartitionState>().is_err());
    }

    #[test]
    fn test_fingerprint_is_order_independent() {
        let a = PartitionRef::new("raw_flights", "2024-03-01");
        let b = PartitionRef::new("airports", UNPARTITIONED_KEY);

        let forward = Fingerprint::of_inputs(vec![
            (&a, "output:abc".to_string()),
            (&b, "output:def".to_string()),
        ]);
        let reversed = Fingerprint::of_inputs(vec![
            (&b, "output:def".to_string()),
            (&a, "output:abc".to_string()),
        ]);

        assert_eq!(forward, reversed);
        assert_eq!(forward.as_str().len(), 64);
    }

    #[test]
    fn test_fingerprint_changes_with_contribution() {
        let a = PartitionRef::new("raw_flights", "2024-03-01");
        let before = Fingerprint::of_inputs(vec![(&a, "output:abc".to_string())]);
        let after = Fingerprint::of_inputs(vec![(&a, "output:abd".to_string())]);
        assert_ne!(before, after);
    }

    #[test]
    fn test_unknown_fingerprint_never_matches_a_digest() {
        let empty = Fingerprint::of_inputs(Vec::<(&PartitionRef, String)>::new());
        assert!(!empty.is_unknown());
        assert_ne!(empty, Fingerprint::unknown());
    }

    #[test]
    fn test_key_range_parse() {
        assert_eq!(
            KeyRange::parse("2024-03-01").unwrap(),
            KeyRange::single("2024-03-01")
        );
        assert_eq!(
            KeyRange::parse("2024-03-01..2024-03-05").unwrap(),
            KeyRange::between("2024-03-01", "2024-03-05")
        );
        assert!(matches!(
            KeyRange::parse("2024-03-05..2024-03-01"),
            Err(KeyRangeError::Inverted { .. })
        ));
        assert!(matches!(
            KeyRange::parse("2024-03-05.."),
            Err(KeyRangeError::Malformed(_))
        ));
        assert_eq!(KeyRange::parse(""), Err(KeyRangeError::Empty));
    }

    #[test]
    fn test_key_range_to_daily() {
        assert_eq!(
            KeyRange::parse("2024-3-9..2024-3-10").unwrap().to_daily().unwrap(),
            KeyRange::between("2024-03-09", "2024-03-10")
        );
        assert_eq!(
            KeyRange::single("yesterday").to_daily(),
            Err(KeyRangeError::NotADate("yesterday".to_string()))
        );
        assert!(matches!(
            KeyRange::between("2024-03-01", "2024-02-30").to_daily(),
            Err(KeyRangeError::NotADate(key)) if key == "2024-02-30"
        ));
        assert_eq!(KeyRange::all().to_daily().unwrap(), KeyRange::all());
    }

    #[test]
    fn test_key_range_contains() {
        let range = KeyRange::between("2024-01-01", "2024-01-03");
        assert!(range.contains(&"2024-01-01".into()));
        assert!(range.contains(&"2024-01-03".into()));
        assert!(!range.contains(&"2024-01-04".into()));
        assert!(!range.contains(&"2023-12-31".into()));
        assert!(range.contains(&PartitionKey::unpartitioned()));
        assert!(KeyRange::all().contains(&"anything".into()));
    }

    #[test]
    fn test_contribution_uses_output_only_when_succeeded() {
        let mut record = PartitionRecord::missing("raw_flights", "2024-03-01");
        assert_eq!(record.contribution(), "state:missing");

        record.state = PartitionState::Succeeded;
        record.output_fingerprint = Some(Fingerprint::from_hex("abc"));
        assert_eq!(record.contribution(), "output:abc");

        record.state = PartitionState::Quarantined;
        assert_eq!(record.contribution(), "state:quarantined");
    }

    #[test]
    fn test_partition_key_dates() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let key = PartitionKey::from_date(date);
        assert_eq!(key.as_str(), "2024-03-01");
        assert_eq!(key.as_date(), Some(date));
        assert_eq!(PartitionKey::unpartitioned().as_date(), None);
    }
}
