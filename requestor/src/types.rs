use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type EntityId = String;

/// The lifetime class of a remote report subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HandleKind {
    /// Never expires and keeps accumulating data.
    Recurring,
    /// Covers an explicit date range and may expire.
    FixedRange,
}

impl HandleKind {
    /// Segment used in registry keys.
    pub const fn as_str(&self) -> &'static str {
        match self {
            HandleKind::Recurring => "recurring",
            HandleKind::FixedRange => "fixed_range",
        }
    }

    /// The `accessType` the App Store Connect API uses for this kind.
    pub const fn access_type(&self) -> &'static str {
        match self {
            HandleKind::Recurring => "ONGOING",
            HandleKind::FixedRange => "ONE_TIME_SNAPSHOT",
        }
    }

    // Recurring subscriptions are usually already present remotely, so listing
    // first avoids a guaranteed 409. Fixed range requests are created directly.
    pub const fn lists_before_create(&self) -> bool {
        matches!(self, HandleKind::Recurring)
    }
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
#[error("unknown handle kind: {0}")]
pub struct UnknownKind(String);

impl FromStr for HandleKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "recurring" | "ongoing" => Ok(HandleKind::Recurring),
            "fixed_range" | "one_time_snapshot" => Ok(HandleKind::FixedRange),
            _ => Err(UnknownKind(s.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        DateRange { start, end }
    }

    /// Stable token used to key fixed range records, e.g. `2025-10-20_2025-10-25`.
    pub fn token(&self) -> String {
        format!("{}_{}", self.start, self.end)
    }
}

/// Parameters for creating a remote resource.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CreateParams {
    pub range: Option<DateRange>,
}

impl CreateParams {
    pub fn with_range(range: DateRange) -> Self {
        CreateParams { range: Some(range) }
    }
}

/// A durable reference to a remote long-lived report subscription.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestHandle {
    pub entity_id: EntityId,
    pub handle_id: String,
    pub kind: HandleKind,
    pub created_at: DateTime<Utc>,
    pub last_verified_at: DateTime<Utc>,
    pub range: Option<String>,
}

impl RequestHandle {
    pub fn new<E, H>(entity_id: E, handle_id: H, kind: HandleKind, now: DateTime<Utc>) -> Self
    where
        E: Into<String>,
        H: Into<String>,
    {
        RequestHandle {
            entity_id: entity_id.into(),
            handle_id: handle_id.into(),
            kind,
            created_at: now,
            last_verified_at: now,
            range: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parse() {
        assert_eq!("recurring".parse(), Ok(HandleKind::Recurring));
        assert_eq!("ONGOING".parse(), Ok(HandleKind::Recurring));
        assert_eq!("fixed-range".parse(), Ok(HandleKind::FixedRange));
        assert_eq!("ONE_TIME_SNAPSHOT".parse(), Ok(HandleKind::FixedRange));
        assert!("weekly".parse::<HandleKind>().is_err());
    }

    #[test]
    fn test_kind_serde() {
        let json = serde_json::to_string(&HandleKind::FixedRange).unwrap();
        assert_eq!(json, r#""FIXED_RANGE""#);
        let kind: HandleKind = serde_json::from_str(r#""RECURRING""#).unwrap();
        assert_eq!(kind, HandleKind::Recurring);
    }

    #[test]
    fn test_range_token() {
        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2025, 10, 20).unwrap(),
            NaiveDate::from_ymd_opt(2025, 10, 25).unwrap(),
        );
        assert_eq!(range.token(), "2025-10-20_2025-10-25");
    }
}
