//! Cron expressions for schedule triggers.
//!
//! Configuration uses the standard 5-field syntax (`minute hour day month
//! weekday`, evaluated in UTC), optionally followed by a 6th `year` field so
//! that a schedule can run out of occurrences. Expressions are translated into
//! the seconds-first dialect of the `cron` crate at parse time.
//!
//! When both the day-of-month and the day-of-week field are restricted, a day
//! matches if it satisfies either one, as in classic cron. The `cron` crate
//! requires both, so such expressions are kept as two schedules (one per day
//! field) and the earlier occurrence wins. A field starting with `*` counts
//! as unrestricted, so `*/2` in day-of-month still narrows day-of-week.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::error::{CadenceError, Result};

/// Weekday names indexed by the standard numeric form (0 and 7 are Sunday).
const WEEKDAY_NAMES: [&str; 8] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

/// A parsed, UTC cron schedule.
#[derive(Clone)]
pub struct CronExpression {
    source: String,
    /// One schedule, or two when both day fields are restricted.
    schedules: Vec<Schedule>,
}

impl CronExpression {
    /// Parse a 5-field (or 6-field with year) cron expression.
    pub fn parse(expression: &str) -> Result<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if !(5..=6).contains(&fields.len()) {
            return Err(invalid(
                expression,
                format!("expected 5 fields (or 6 with year), found {}", fields.len()),
            ));
        }

        let weekdays = translate_weekdays(fields[4]).map_err(|r| invalid(expression, r))?;

        // The `cron` crate wants: sec min hour dom month dow [year]
        let build = |days: &str, weekdays: &str| -> Result<Schedule> {
            let mut translated = format!(
                "0 {} {} {} {} {}",
                fields[0], fields[1], days, fields[3], weekdays
            );
            if let Some(year) = fields.get(5) {
                translated.push(' ');
                translated.push_str(year);
            }
            Schedule::from_str(&translated).map_err(|e| invalid(expression, e.to_string()))
        };

        let schedules = if is_restricted(fields[2]) && is_restricted(fields[4]) {
            vec![build(fields[2], "*")?, build("*", &weekdays)?]
        } else {
            vec![build(fields[2], &weekdays)?]
        };

        Ok(Self {
            source: fields.join(" "),
            schedules,
        })
    }

    /// The first occurrence strictly after `from`, or `None` once the
    /// expression has no further occurrences.
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedules
            .iter()
            .filter_map(|schedule| schedule.after(&from).next())
            .min()
    }

    /// Normalized source text (fields separated by single spaces).
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl PartialEq for CronExpression {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for CronExpression {}

impl fmt::Debug for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronExpression").field(&self.source).finish()
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for CronExpression {
    type Err = CadenceError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn is_restricted(field: &str) -> bool {
    !(field.starts_with('*') || field == "?")
}

fn invalid(expression: &str, reason: impl Into<String>) -> CadenceError {
    CadenceError::InvalidCron {
        expression: expression.to_string(),
        reason: reason.into(),
    }
}

// ---------------------------------------------------------------------------
// Weekday translation
// ---------------------------------------------------------------------------

/// Rewrite numeric weekdays (0-7, Sunday = 0 or 7) as names, because the
/// `cron` crate numbers weekdays 1-7 starting at Sunday.
fn translate_weekdays(field: &str) -> std::result::Result<String, String> {
    let mut parts = Vec::new();

    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (item, None),
        };

        let translated = match range.split_once('-') {
            Some((start, "7")) if step.is_none() && start != "0" && start != "7" => {
                // `5-7` means Fri..Sun, which the cron crate cannot express as one range.
                format!("{}-Sat,Sun", weekday_name(start)?)
            }
            Some((_, "7")) if step.is_some() => {
                return Err(format!("weekday range `{range}` ending in 7 cannot take a step"));
            }
            Some((start, end)) => format!("{}-{}", weekday_name(start)?, weekday_name(end)?),
            None => weekday_name(range)?,
        };

        match step {
            Some(step) => parts.push(format!("{translated}/{step}")),
            None => parts.push(translated),
        }
    }

    Ok(parts.join(","))
}

fn weekday_name(token: &str) -> std::result::Result<String, String> {
    if token == "*" || token == "?" || token.chars().all(|c| c.is_ascii_alphabetic()) {
        return Ok(token.to_string());
    }
    let n: usize = token
        .parse()
        .map_err(|_| format!("invalid weekday `{token}`"))?;
    WEEKDAY_NAMES
        .get(n)
        .map(|name| name.to_string())
        .ok_or_else(|| format!("weekday `{token}` out of range 0-7"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn next(expr: &str, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        CronExpression::parse(expr).unwrap().next_after(from)
    }

    #[test]
    fn every_minute_advances_one_minute() {
        assert_eq!(next("* * * * *", at(2023, 1, 23, 11, 0)), Some(at(2023, 1, 23, 11, 1)));
    }

    #[test]
    fn stepped_minutes_within_hour_window() {
        assert_eq!(
            next("*/10 7-9 * * *", at(2023, 1, 23, 7, 10)),
            Some(at(2023, 1, 23, 7, 20))
        );
        assert_eq!(
            next("*/30 10-13 * * *", at(2023, 1, 23, 10, 10)),
            Some(at(2023, 1, 23, 10, 30))
        );
        assert_eq!(
            next("*/10 14 * * *", at(2023, 1, 23, 14, 0)),
            Some(at(2023, 1, 23, 14, 10))
        );
    }

    #[test]
    fn window_closed_rolls_to_next_day() {
        assert_eq!(
            next("*/10 7-9 * * *", at(2023, 1, 23, 10, 0)),
            Some(at(2023, 1, 24, 7, 0))
        );
    }

    #[test]
    fn result_is_strictly_after_anchor_with_subsecond_precision() {
        let anchor = at(2023, 1, 23, 11, 0) + chrono::Duration::milliseconds(250);
        let result = next("* * * * *", anchor).unwrap();
        assert!(result > anchor);
        assert_eq!(result, at(2023, 1, 23, 11, 1));
    }

    #[test]
    fn numeric_weekdays_use_sunday_zero() {
        // 2023-01-23 is a Monday.
        assert_eq!(next("0 9 * * 0", at(2023, 1, 23, 0, 0)), Some(at(2023, 1, 29, 9, 0)));
        assert_eq!(next("0 9 * * 7", at(2023, 1, 23, 0, 0)), Some(at(2023, 1, 29, 9, 0)));
        assert_eq!(next("0 9 * * 1-5", at(2023, 1, 23, 10, 0)), Some(at(2023, 1, 24, 9, 0)));
        assert_eq!(next("0 9 * * MON", at(2023, 1, 23, 10, 0)), Some(at(2023, 1, 30, 9, 0)));
    }

    #[test]
    fn weekday_range_ending_in_seven_includes_sunday() {
        // Saturday 2023-01-28 10:00 -> Sunday 09:00
        assert_eq!(next("0 9 * * 5-7", at(2023, 1, 28, 10, 0)), Some(at(2023, 1, 29, 9, 0)));
    }

    #[test]
    fn restricted_day_fields_match_either() {
        // Friday the 27th comes before the next Friday the 13th (October).
        assert_eq!(next("0 0 13 * 5", at(2023, 1, 23, 0, 0)), Some(at(2023, 1, 27, 0, 0)));
        // Monday the 13th comes before Friday the 17th.
        assert_eq!(next("0 0 13 * 5", at(2023, 2, 11, 0, 0)), Some(at(2023, 2, 13, 0, 0)));
        assert_eq!(next("30 8 1,15 * MON", at(2023, 1, 10, 0, 0)), Some(at(2023, 1, 15, 8, 30)));
        assert_eq!(next("30 8 1,15 * MON", at(2023, 1, 15, 9, 0)), Some(at(2023, 1, 16, 8, 30)));
    }

    #[test]
    fn starred_day_of_month_still_narrows_weekday() {
        // Odd days AND Fridays: Feb 10 is even, so Feb 17.
        assert_eq!(next("0 0 */2 * 5", at(2023, 2, 4, 0, 0)), Some(at(2023, 2, 17, 0, 0)));
    }

    #[test]
    fn either_day_field_respects_the_year() {
        assert_eq!(next("0 0 13 * 5 2020", at(2023, 1, 1, 0, 0)), None);
    }

    #[test]
    fn year_field_allows_exhausted_schedules() {
        assert_eq!(next("0 0 1 1 * 2020", at(2023, 1, 1, 0, 0)), None);
        assert_eq!(
            next("0 0 1 1 * 2030", at(2023, 1, 1, 0, 0)),
            Some(at(2030, 1, 1, 0, 0))
        );
    }

    #[test]
    fn rejects_wrong_field_count() {
        let err = CronExpression::parse("* * * *").unwrap_err();
        assert_eq!(err.code(), "INVALID_CRON");
        assert!(CronExpression::parse("0 * * * * * *").is_err());
    }

    #[test]
    fn rejects_out_of_range_weekday() {
        assert!(CronExpression::parse("* * * * 8").is_err());
    }

    #[test]
    fn equality_uses_normalized_source() {
        let a = CronExpression::parse("*/5  *  * * *").unwrap();
        let b = CronExpression::parse("*/5 * * * *").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "*/5 * * * *");
    }
}
