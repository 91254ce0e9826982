//! Report control numbers
//!
//! Every report is identified by a human-readable control number of the form
//! `RL {seq:03}-{year}`, unique across the store. Sequences restart at 1 each
//! year.

use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CoreError;

lazy_static! {
    /// Control number as stored by every client version; whitespace after the
    /// prefix is optional and the match is unanchored
    static ref CONTROL_PATTERN: Regex = Regex::new(r"RL\s*(\d+)-(\d{4})").unwrap();
}

/// A parsed control number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ControlNumber {
    year: i32,
    sequence: u32,
}

impl ControlNumber {
    pub fn new(sequence: u32, year: i32) -> Self {
        Self { year, sequence }
    }

    /// The first control number of a year (`RL 001-<year>`)
    pub fn first(year: i32) -> Self {
        Self::new(1, year)
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    /// The control number following this one in the same year
    pub fn successor(&self) -> Self {
        Self::new(self.sequence.saturating_add(1), self.year)
    }

    /// Extract a control number from free text.
    ///
    /// Returns `None` for anything that does not contain `RL <digits>-<4 digits>`,
    /// including sequences too large for `u32`.
    pub fn parse(text: &str) -> Option<Self> {
        let caps = CONTROL_PATTERN.captures(text)?;
        let sequence = caps.get(1)?.as_str().parse().ok()?;
        let year = caps.get(2)?.as_str().parse().ok()?;
        Some(Self::new(sequence, year))
    }

    /// Next number for `year` given the control number of the most recently
    /// inserted report of that year.
    ///
    /// Only the sequence of `last` is used; an unparsable value restarts the
    /// sequence at 1.
    pub fn next_after(last: Option<&str>, year: i32) -> Self {
        match last.and_then(Self::parse) {
            Some(previous) => Self::new(previous.sequence.saturating_add(1), year),
            None => Self::first(year),
        }
    }

    /// Next number for `year` given every control number already issued for
    /// it: one past the highest parsable sequence.
    pub fn next_from_existing<'a, I>(existing: I, year: i32) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let highest = existing
            .into_iter()
            .filter_map(Self::parse)
            .map(|c| c.sequence)
            .max()
            .unwrap_or(0);
        Self::new(highest.saturating_add(1), year)
    }
}

impl fmt::Display for ControlNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RL {:03}-{}", self.sequence, self.year)
    }
}

impl FromStr for ControlNumber {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| CoreError::InvalidControlNumber(s.to_string()))
    }
}

impl Serialize for ControlNumber {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ControlNumber {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
