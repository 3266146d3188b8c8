//! Recurrence rules for habit scheduling.
//!
//! Implements a constrained RFC-5545-like RRULE dialect, e.g.
//! `FREQ=DAILY;INTERVAL=1;UNTIL=20250327T000000Z`. The first token must be
//! `FREQ=<DAILY|WEEKLY|MONTHLY|YEARLY>`; the remaining tokens may appear in
//! any order. Unrecognized `KEY=VALUE` tokens are accepted and ignored so
//! that future dialect extensions do not break existing rules.
//!
//! Occurrence matching is deliberately coarse: only `UNTIL` and `BYDAY`
//! filter dates. `INTERVAL` is parsed and kept but does not participate in
//! matching, and `FREQ` carries no date arithmetic of its own.

use std::fmt;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Utc, Weekday};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{ParseError, RecurrenceError};

/// Recurrence frequency. Matching ignores it beyond requiring a valid value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

/// The closed set of accepted frequencies.
pub const FREQUENCIES: [Frequency; 4] = [
    Frequency::Daily,
    Frequency::Weekly,
    Frequency::Monthly,
    Frequency::Yearly,
];

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Daily => "DAILY",
            Frequency::Weekly => "WEEKLY",
            Frequency::Monthly => "MONTHLY",
            Frequency::Yearly => "YEARLY",
        }
    }

    /// Case-sensitive: `daily` is not a valid frequency token.
    fn from_token(token: &str) -> Option<Self> {
        FREQUENCIES.iter().copied().find(|f| f.as_str() == token)
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Two-letter weekday codes in rule order (Monday first).
pub const WEEKDAY_CODES: [(&str, Weekday); 7] = [
    ("MO", Weekday::Mon),
    ("TU", Weekday::Tue),
    ("WE", Weekday::Wed),
    ("TH", Weekday::Thu),
    ("FR", Weekday::Fri),
    ("SA", Weekday::Sat),
    ("SU", Weekday::Sun),
];

fn weekday_from_code(code: &str) -> Option<Weekday> {
    WEEKDAY_CODES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, d)| *d)
}

fn weekday_code(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "MO",
        Weekday::Tue => "TU",
        Weekday::Wed => "WE",
        Weekday::Thu => "TH",
        Weekday::Fri => "FR",
        Weekday::Sat => "SA",
        Weekday::Sun => "SU",
    }
}

/// A parsed, validated recurrence rule.
///
/// Immutable value type: a rule string either parses into all of these
/// fields well-formed, or is rejected outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecurrenceSpec {
    pub frequency: Frequency,
    /// Parsed for forward compatibility; not used by occurrence matching.
    pub interval: u32,
    /// Occurrences strictly after this instant are invalid.
    pub until: Option<DateTime<Utc>>,
    /// When set, only these weekdays are valid occurrences.
    /// Canonicalized to Monday-first order with duplicates removed.
    pub by_day: Option<Vec<Weekday>>,
}

impl RecurrenceSpec {
    /// Parse a rule string.
    ///
    /// Token order is free apart from `FREQ`, which must come first.
    /// Recognized keys (`UNTIL`, `INTERVAL`, `BYDAY`) must carry
    /// well-formed values; other `KEY=VALUE` tokens are ignored.
    pub fn parse(rule: &str) -> Result<Self, ParseError> {
        let malformed = || ParseError::MalformedGrammar(rule.to_string());

        let mut tokens = rule.split(';');
        let freq_token = tokens.next().filter(|t| !t.is_empty()).ok_or_else(malformed)?;
        let frequency = freq_token
            .strip_prefix("FREQ=")
            .and_then(Frequency::from_token)
            .ok_or_else(malformed)?;

        let mut spec = RecurrenceSpec {
            frequency,
            interval: 1,
            until: None,
            by_day: None,
        };

        for token in tokens {
            let (key, value) = token.split_once('=').ok_or_else(malformed)?;
            if key.is_empty()
                || value.is_empty()
                || !key.bytes().all(|b| b.is_ascii_uppercase())
            {
                return Err(malformed());
            }
            match key {
                "UNTIL" => spec.until = Some(parse_until(value).ok_or_else(malformed)?),
                "INTERVAL" => {
                    let n: u32 = value.parse().ok().filter(|n| *n > 0).ok_or_else(malformed)?;
                    spec.interval = n;
                }
                "BYDAY" => {
                    let mut days = Vec::new();
                    for code in value.split(',') {
                        days.push(weekday_from_code(code).ok_or_else(malformed)?);
                    }
                    days.sort_by_key(|d| d.num_days_from_monday());
                    days.dedup();
                    spec.by_day = Some(days);
                }
                // Forward-compatible: unknown uppercase keys are ignored.
                _ => {}
            }
        }

        Ok(spec)
    }

    /// Is `instant` a valid occurrence of this rule?
    pub fn is_occurrence(&self, instant: DateTime<Utc>) -> bool {
        if let Some(until) = self.until {
            if instant > until {
                return false;
            }
        }
        if let Some(days) = &self.by_day {
            if !days.contains(&instant.weekday()) {
                return false;
            }
        }
        true
    }

    /// Is the calendar day `date` a valid occurrence?
    ///
    /// The bare date compares as its start-of-day instant, so a date equal
    /// to the `UNTIL` day (with a midnight `UNTIL`) is still in range.
    pub fn is_occurrence_on(&self, date: NaiveDate) -> bool {
        self.is_occurrence(date.and_time(chrono::NaiveTime::MIN).and_utc())
    }

    /// Occurrence check against a raw date or datetime string.
    pub fn is_occurrence_str(&self, raw: &str) -> Result<bool, ParseError> {
        Ok(self.is_occurrence(parse_date_arg(raw)?))
    }

    /// Assertion-style variant of [`Self::is_occurrence`].
    pub fn assert_occurrence(&self, instant: DateTime<Utc>) -> Result<(), RecurrenceError> {
        if self.is_occurrence(instant) {
            Ok(())
        } else {
            Err(RecurrenceError::OutOfRange {
                date: instant.date_naive(),
            })
        }
    }

    /// Assertion-style variant of [`Self::is_occurrence_on`].
    pub fn assert_occurrence_on(&self, date: NaiveDate) -> Result<(), RecurrenceError> {
        if self.is_occurrence_on(date) {
            Ok(())
        } else {
            Err(RecurrenceError::OutOfRange { date })
        }
    }
}

/// Strict UTC basic ISO form: `YYYYMMDDThhmmssZ`.
fn parse_until(value: &str) -> Option<DateTime<Utc>> {
    if value.len() != 16 {
        return None;
    }
    NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%SZ")
        .ok()
        .map(|dt| dt.and_utc())
}

/// Parse a caller-supplied date argument: RFC 3339, plain datetime, or
/// plain date (taken as start of day, UTC).
pub fn parse_date_arg(raw: &str) -> Result<DateTime<Utc>, ParseError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Ok(dt.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        if let Some(dt) = date.and_hms_opt(0, 0, 0) {
            return Ok(dt.and_utc());
        }
    }
    Err(ParseError::InvalidDate(raw.to_string()))
}

impl fmt::Display for RecurrenceSpec {
    /// Canonical rule string. Unrecognized tokens from the original input
    /// are not retained.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FREQ={}", self.frequency)?;
        if self.interval != 1 {
            write!(f, ";INTERVAL={}", self.interval)?;
        }
        if let Some(until) = self.until {
            write!(f, ";UNTIL={}", until.format("%Y%m%dT%H%M%SZ"))?;
        }
        if let Some(days) = &self.by_day {
            let codes: Vec<&str> = days.iter().map(|d| weekday_code(*d)).collect();
            write!(f, ";BYDAY={}", codes.join(","))?;
        }
        Ok(())
    }
}

impl std::str::FromStr for RecurrenceSpec {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// Stored and transported as the canonical rule string.
impl Serialize for RecurrenceSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RecurrenceSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        RecurrenceSpec::parse(&raw).map_err(serde::de::Error::custom)
    }
}
