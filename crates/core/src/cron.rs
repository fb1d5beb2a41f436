// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Five-field cron expressions.
//!
//! `minute hour day-of-month month day-of-week`, each field supporting
//! `*`, comma lists, ranges `a-b`, and steps `*/n` / `a-b/n`. Day-of-month
//! and day-of-week combine with OR when both are restricted (standard cron
//! behavior); a field counts as restricted when it does not start with `*`.
//! Day-of-week accepts 0-7 with 7 meaning Sunday.

use chrono::{DateTime, Datelike, Days, TimeDelta, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Parse errors for cron expressions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CronError {
    #[error("expected 5 fields, found {0}")]
    FieldCount(usize),

    #[error("invalid {field} field: {value}")]
    Field { field: &'static str, value: String },

    #[error("{field} value {value} out of range {min}-{max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
}

/// A parsed cron expression. Matching and next-fire computation are in UTC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CronExpr {
    minutes: u64,
    hours: u64,
    dom: u64,
    months: u64,
    dow: u64,
    dom_restricted: bool,
    dow_restricted: bool,
    source: String,
}

impl CronExpr {
    /// Parse a five-field expression.
    pub fn parse(source: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = source.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount(fields.len()));
        }

        let minutes = parse_field(fields[0], 0, 59, "minute")?;
        let hours = parse_field(fields[1], 0, 23, "hour")?;
        let dom = parse_field(fields[2], 1, 31, "day-of-month")?;
        let months = parse_field(fields[3], 1, 12, "month")?;
        let mut dow = parse_field(fields[4], 0, 7, "day-of-week")?;

        // 7 is an alias for Sunday
        if dow & (1 << 7) != 0 {
            dow = (dow & !(1 << 7)) | 1;
        }

        Ok(Self {
            minutes,
            hours,
            dom,
            months,
            dow,
            dom_restricted: !fields[2].starts_with('*'),
            dow_restricted: !fields[4].starts_with('*'),
            source: fields.join(" "),
        })
    }

    /// The normalized source expression.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether the expression matches the given minute.
    pub fn matches(&self, t: DateTime<Utc>) -> bool {
        bit(self.minutes, t.minute())
            && bit(self.hours, t.hour())
            && bit(self.months, t.month())
            && self.day_matches(&t)
    }

    /// First matching minute strictly greater than `after`.
    ///
    /// Returns `None` for unsatisfiable expressions (e.g. Feb 30): the scan
    /// gives up after five years, enough to cover leap-day schedules.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = truncate_to_minute(after)? + TimeDelta::minutes(1);
        let horizon = t + TimeDelta::days(366 * 5);

        while t < horizon {
            if !bit(self.months, t.month()) {
                t = first_of_next_month(&t)?;
                continue;
            }
            if !self.day_matches(&t) {
                t = start_of_next_day(&t)?;
                continue;
            }
            if let Some(found) = self.next_minute_in_day(&t) {
                return Some(found);
            }
            t = start_of_next_day(&t)?;
        }
        None
    }

    fn day_matches(&self, t: &DateTime<Utc>) -> bool {
        let dom_ok = bit(self.dom, t.day());
        let dow_ok = bit(self.dow, t.weekday().num_days_from_sunday());
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom_ok || dow_ok,
            (true, false) => dom_ok,
            (false, true) => dow_ok,
            (false, false) => true,
        }
    }

    /// First matching hour/minute on `t`'s date at or after `t` itself.
    fn next_minute_in_day(&self, t: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        let date = t.date_naive();
        for h in t.hour()..24 {
            if !bit(self.hours, h) {
                continue;
            }
            let from = if h == t.hour() { t.minute() } else { 0 };
            for m in from..60 {
                if bit(self.minutes, m) {
                    return date.and_hms_opt(h, m, 0).map(|n| n.and_utc());
                }
            }
        }
        None
    }
}

impl std::fmt::Display for CronExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl TryFrom<String> for CronExpr {
    type Error = CronError;

    fn try_from(s: String) -> Result<Self, CronError> {
        Self::parse(&s)
    }
}

impl From<CronExpr> for String {
    fn from(expr: CronExpr) -> String {
        expr.source
    }
}

fn bit(mask: u64, value: u32) -> bool {
    value < 64 && mask & (1u64 << value) != 0
}

fn truncate_to_minute(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    t.with_second(0)?.with_nanosecond(0)
}

fn start_of_next_day(t: &DateTime<Utc>) -> Option<DateTime<Utc>> {
    let next = t.date_naive().checked_add_days(Days::new(1))?;
    next.and_hms_opt(0, 0, 0).map(|n| n.and_utc())
}

fn first_of_next_month(t: &DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()
}

/// Parse one field into a bitmask over `min..=max`.
fn parse_field(spec: &str, min: u32, max: u32, field: &'static str) -> Result<u64, CronError> {
    if spec.is_empty() {
        return Err(CronError::Field {
            field,
            value: spec.to_string(),
        });
    }

    let mut mask = 0u64;
    for part in spec.split(',') {
        mask |= parse_part(part, min, max, field)?;
    }
    Ok(mask)
}

fn parse_part(part: &str, min: u32, max: u32, field: &'static str) -> Result<u64, CronError> {
    let bad = || CronError::Field {
        field,
        value: part.to_string(),
    };

    let (range, step) = match part.split_once('/') {
        Some((range, step_str)) => {
            let step: u32 = step_str.parse().map_err(|_| bad())?;
            if step == 0 {
                return Err(bad());
            }
            (range, step)
        }
        None => (part, 1),
    };

    let (lo, hi) = if range == "*" {
        (min, max)
    } else if let Some((a, b)) = range.split_once('-') {
        let lo: u32 = a.parse().map_err(|_| bad())?;
        let hi: u32 = b.parse().map_err(|_| bad())?;
        if lo > hi {
            return Err(bad());
        }
        (lo, hi)
    } else {
        let v: u32 = range.parse().map_err(|_| bad())?;
        if part.contains('/') {
            // "5/2" style is not standard five-field cron
            return Err(bad());
        }
        (v, v)
    };

    for v in [lo, hi] {
        if v < min || v > max {
            return Err(CronError::OutOfRange {
                field,
                value: v,
                min,
                max,
            });
        }
    }

    let mut mask = 0u64;
    let mut v = lo;
    while v <= hi {
        mask |= 1u64 << v;
        v += step;
    }
    Ok(mask)
}

#[cfg(test)]
#[path = "cron_tests.rs"]
mod tests;
