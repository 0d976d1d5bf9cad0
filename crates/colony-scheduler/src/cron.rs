//! Cron expression helpers: next fire time and jittered fire time.
//!
//! Expressions carry a seconds field (`sec min hour dom month dow [year]`).
//! Classic 5-field expressions are read with a leading `0` seconds field, and
//! the usual `@` descriptors are accepted.

use chrono::{DateTime, Duration, Utc};
use colony_core::error::{ColonyError, Result};
use colony_core::types::CronSchedule;
use colony_core::types::process::checked_offset;
use cron::Schedule;
use rand::Rng;
use std::str::FromStr;

fn expand_descriptor(expr: &str) -> Option<&'static str> {
    match expr.to_ascii_lowercase().as_str() {
        "@yearly" | "@annually" => Some("0 0 0 1 1 *"),
        "@monthly" => Some("0 0 0 1 * *"),
        "@weekly" => Some("0 0 0 * * Sun"),
        "@daily" | "@midnight" => Some("0 0 0 * * *"),
        "@hourly" => Some("0 0 * * * *"),
        _ => None,
    }
}

const DAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

fn day_number(token: &str, field: &str) -> Result<u32> {
    token
        .parse::<u32>()
        .ok()
        .filter(|n| *n <= 7)
        .ok_or_else(|| ColonyError::Validation(format!("invalid day of week '{token}' in '{field}'")))
}

/// Rewrite numeric day-of-week items (0 or 7 = Sunday, 1 = Monday) as day
/// names. Named items and `*`/`?` pass through unchanged.
fn normalize_day_of_week(field: &str) -> Result<String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }
    let mut items = Vec::new();
    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => match step.parse::<usize>() {
                Ok(step) if step > 0 => (base, Some(step)),
                _ => return Err(ColonyError::Validation(format!("invalid step in '{field}'"))),
            },
            None => (item, None),
        };
        if base.chars().any(|c| c.is_ascii_alphabetic() || c == '#') {
            items.push(item.to_string());
            continue;
        }

        let (first, last) = if base == "*" {
            (0, 6)
        } else if let Some((a, b)) = base.split_once('-') {
            (day_number(a, field)?, day_number(b, field)?)
        } else {
            let n = day_number(base, field)?;
            // `n/step` runs to the end of the week
            (n, if step.is_some() { n.max(6) } else { n })
        };
        if first > last {
            return Err(ColonyError::Validation(format!("invalid day range '{base}' in '{field}'")));
        }

        let mut days: Vec<u32> = (first..=last).step_by(step.unwrap_or(1)).map(|d| d % 7).collect();
        days.sort_unstable();
        days.dedup();
        items.extend(days.into_iter().map(|d| DAY_NAMES[d as usize].to_string()));
    }
    Ok(items.join(","))
}

/// Parse an expression, reporting failures as validation errors.
pub fn parse(expr: &str) -> Result<Schedule> {
    let expr = expr.trim();
    let normalized = if expr.starts_with('@') {
        expand_descriptor(expr)
            .ok_or_else(|| ColonyError::Validation(format!("unknown cron descriptor '{expr}'")))?
            .to_string()
    } else {
        let mut fields: Vec<String> = expr.split_whitespace().map(str::to_string).collect();
        match fields.len() {
            5 => fields.insert(0, "0".into()),
            6 | 7 => {}
            n => {
                return Err(ColonyError::Validation(format!(
                    "cron expression '{expr}' has {n} fields, expected 5 to 7"
                )));
            }
        }
        fields[5] = normalize_day_of_week(&fields[5])?;
        fields.join(" ")
    };
    Schedule::from_str(&normalized)
        .map_err(|e| ColonyError::Validation(format!("invalid cron expression '{expr}': {e}")))
}

/// Next fire time strictly after `after`.
pub fn next_after(expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    parse(expr)?
        .after(&after)
        .next()
        .ok_or_else(|| ColonyError::Validation(format!("cron expression '{expr}' never fires again")))
}

pub fn next(expr: &str) -> Result<DateTime<Utc>> {
    next_after(expr, Utc::now())
}

/// A uniformly random instant in `[now, next_after(expr, now))`.
pub fn random_after(expr: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let next = next_after(expr, now)?;
    Ok(random_between(now, next))
}

pub fn random(expr: &str) -> Result<DateTime<Utc>> {
    random_after(expr, Utc::now())
}

fn random_between(from: DateTime<Utc>, until: DateTime<Utc>) -> DateTime<Utc> {
    let span_ms = (until - from).num_milliseconds();
    if span_ms <= 0 {
        return from;
    }
    from + Duration::milliseconds(rand::thread_rng().gen_range(0..span_ms))
}

/// Next run for a validated schedule.
pub fn next_run(schedule: &CronSchedule, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    match schedule {
        CronSchedule::Expression(expr) => next_after(expr, now),
        CronSchedule::Interval { secs, random } => {
            let until = checked_offset(now, *secs).ok_or_else(|| {
                ColonyError::Validation(format!("interval of {secs}s is out of range"))
            })?;
            Ok(if *random { random_between(now, until) } else { until })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, h, m, s).unwrap()
    }

    #[test]
    fn test_next_with_seconds_field() {
        let next = next_after("*/10 * * * * *", at(12, 0, 3)).unwrap();
        assert_eq!(next, at(12, 0, 10));
    }

    #[test]
    fn test_five_field_expression() {
        let next = next_after("30 9 * * *", at(8, 0, 0)).unwrap();
        assert_eq!(next, at(9, 30, 0));
    }

    #[test]
    fn test_descriptors() {
        let daily = next_after("@daily", at(8, 0, 0)).unwrap();
        assert_eq!(daily, Utc.with_ymd_and_hms(2026, 3, 11, 0, 0, 0).unwrap());
        let hourly = next_after("@hourly", at(8, 15, 0)).unwrap();
        assert_eq!(hourly, at(9, 0, 0));
        assert!(parse("@weekly").is_ok());
        assert!(parse("@fortnightly").is_err());
    }

    #[test]
    fn test_invalid_expressions() {
        for bad in ["", "* *", "61 * * * * *", "not a cron at all"] {
            assert!(
                matches!(parse(bad), Err(ColonyError::Validation(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn test_numeric_weekdays_follow_classic_cron() {
        // 2026-03-10 is a Tuesday
        let monday = Utc.with_ymd_and_hms(2026, 3, 16, 9, 0, 0).unwrap();
        let sunday = Utc.with_ymd_and_hms(2026, 3, 15, 9, 0, 0).unwrap();
        assert_eq!(next_after("0 9 * * 1", at(10, 0, 0)).unwrap(), monday);
        assert_eq!(next_after("0 9 * * 0", at(10, 0, 0)).unwrap(), sunday);
        assert_eq!(next_after("0 9 * * 7", at(10, 0, 0)).unwrap(), sunday);

        let saturday = Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).unwrap();
        assert_eq!(next_after("0 9 * * 1-5", saturday).unwrap(), monday);
        assert_eq!(next_after("0 0 9 * * 1", at(10, 0, 0)).unwrap(), monday);
    }

    #[test]
    fn test_weekday_lists_and_steps() {
        assert_eq!(normalize_day_of_week("1-5").unwrap(), "Mon,Tue,Wed,Thu,Fri");
        assert_eq!(normalize_day_of_week("0,6").unwrap(), "Sun,Sat");
        assert_eq!(normalize_day_of_week("5-7").unwrap(), "Sun,Fri,Sat");
        assert_eq!(normalize_day_of_week("*/2").unwrap(), "Sun,Tue,Thu,Sat");
        assert_eq!(normalize_day_of_week("1/3").unwrap(), "Mon,Thu");
        assert_eq!(normalize_day_of_week("MON-FRI").unwrap(), "MON-FRI");
        assert_eq!(normalize_day_of_week("?").unwrap(), "?");
        for bad in ["8", "5-2", "1/0", "3-"] {
            assert!(normalize_day_of_week(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_interval_out_of_range_is_an_error() {
        let schedule = CronSchedule::Interval { secs: i64::MAX / 2, random: false };
        assert!(matches!(next_run(&schedule, at(10, 0, 0)), Err(ColonyError::Validation(_))));
    }

    #[test]
    fn test_random_within_window() {
        let now = at(10, 0, 0);
        let expr = "0 0 0 * * *";
        let next = next_after(expr, now).unwrap();
        let samples: Vec<_> = (0..20).map(|_| random_after(expr, now).unwrap()).collect();
        for t in &samples {
            assert!(*t >= now && *t < next, "{t} outside [{now}, {next})");
        }
        assert!(samples.iter().any(|t| *t != samples[0]));
    }

    #[test]
    fn test_random_uses_wall_clock() {
        let before = Utc::now();
        let t = random("0 0 * * * *").unwrap();
        assert!(t >= before);
        assert!(t < next("0 0 * * * *").unwrap() + Duration::seconds(1));
    }

    #[test]
    fn test_interval_schedules() {
        let now = at(10, 0, 0);
        let fixed = next_run(&CronSchedule::Interval { secs: 30, random: false }, now).unwrap();
        assert_eq!(fixed, at(10, 0, 30));

        for _ in 0..20 {
            let t = next_run(&CronSchedule::Interval { secs: 30, random: true }, now).unwrap();
            assert!(t >= now && t < at(10, 0, 30));
        }

        let expr = next_run(&CronSchedule::Expression("0 5 * * * *".into()), now).unwrap();
        assert_eq!(expr.minute(), 5);
    }
}
