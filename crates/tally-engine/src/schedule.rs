//! Five-field cron expressions (minute, hour, day-of-month, month,
//! day-of-week) evaluated in UTC.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use thiserror::Error;

const WEEKDAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CronError {
    #[error("cron expression '{expr}' must have 5 fields, found {found}")]
    FieldCount { expr: String, found: usize },
    #[error("invalid cron expression '{expr}': {message}")]
    Invalid { expr: String, message: String },
}

/// A validated cron pattern.
///
/// When both day fields are restricted a day matches if either field
/// matches, so the pattern is held as one schedule per day field.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedules: Vec<Schedule>,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount {
                expr: expression.to_string(),
                found: fields.len(),
            });
        }

        let invalid = |message: String| CronError::Invalid {
            expr: expression.to_string(),
            message,
        };
        let day_of_week = translate_day_of_week(fields[4]).map_err(invalid)?;
        let day_pairs = if is_wildcard(fields[2]) || is_wildcard(&day_of_week) {
            vec![(fields[2], day_of_week.as_str())]
        } else {
            vec![(fields[2], "*"), ("*", day_of_week.as_str())]
        };

        let mut schedules = Vec::with_capacity(day_pairs.len());
        for (day_of_month, day_of_week) in day_pairs {
            // The evaluator expects a leading seconds field; firings land on :00.
            let full = format!(
                "0 {} {} {} {} {}",
                fields[0], fields[1], day_of_month, fields[3], day_of_week
            );
            schedules.push(Schedule::from_str(&full).map_err(|err| invalid(err.to_string()))?);
        }

        Ok(Self {
            expression: fields.join(" "),
            schedules,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Earliest matching instant strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedules
            .iter()
            .filter_map(|schedule| schedule.after(&after).next())
            .min()
    }
}

fn is_wildcard(field: &str) -> bool {
    field == "*" || field == "?"
}

/// Rewrites a classic day-of-week field (0-7, 0 and 7 both Sunday) into
/// weekday names so its meaning does not depend on the evaluator's numbering.
fn translate_day_of_week(field: &str) -> Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let mut parts = Vec::new();
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step = step
                    .parse::<u32>()
                    .ok()
                    .filter(|step| *step > 0)
                    .ok_or_else(|| format!("invalid day-of-week step '{step}'"))?;
                (range, Some(step))
            }
            None => (part, None),
        };

        if !range.chars().all(|c| c.is_ascii_digit() || c == '-' || c == '*') {
            // Named days; normalise case and leave numbering to the names.
            parts.push(normalise_names(part));
            continue;
        }

        let (start, end) = match range {
            "*" => (0, 6),
            _ => match range.split_once('-') {
                Some((start, end)) => (parse_day(start)?, parse_day(end)?),
                None => {
                    let day = parse_day(range)?;
                    (day, if step.is_some() { 6 } else { day })
                }
            },
        };
        if start > end {
            return Err(format!("invalid day-of-week range '{range}'"));
        }

        let step = step.unwrap_or(1) as usize;
        for day in (start..=end).step_by(step) {
            parts.push(WEEKDAYS[day % 7].to_string());
        }
    }

    parts.dedup();
    Ok(parts.join(","))
}

fn parse_day(raw: &str) -> Result<usize, String> {
    raw.parse::<usize>()
        .ok()
        .filter(|day| *day <= 7)
        .ok_or_else(|| format!("invalid day-of-week '{raw}'"))
}

fn normalise_names(part: &str) -> String {
    let mut out = String::with_capacity(part.len());
    let mut word_start = true;
    for c in part.chars() {
        if c.is_ascii_alphabetic() {
            if word_start {
                out.push(c.to_ascii_uppercase());
            } else {
                out.push(c.to_ascii_lowercase());
            }
            word_start = false;
        } else {
            out.push(c);
            word_start = true;
        }
    }
    out
}
