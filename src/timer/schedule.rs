// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Validation of schedule expressions.
//!
//! Two textual forms are accepted by the cloud:
//!
//! - five-field cron-like patterns (`minute hour day month weekday`) for
//!   repeating timers, where each field is `*`, a number, a range `a-b`, or a
//!   comma separated list of numbers and ranges;
//! - ISO 8601 timestamps (`2024-01-01T08:30:00`, optionally with fractional
//!   seconds and a `Z` or `+hh:mm` offset) for one-shot and duration timers.

use chrono::{DateTime, NaiveDateTime};

use crate::error::ValidationError;

/// Field names and inclusive bounds, in cron order.
const CRON_FIELDS: [(&str, u8, u8); 5] = [
    ("minute", 0, 59),
    ("hour", 0, 23),
    ("day", 1, 31),
    ("month", 1, 12),
    ("weekday", 0, 6),
];

/// Checks a five-field cron-like pattern.
///
/// # Errors
///
/// Returns [`ValidationError::InvalidSchedule`] naming the first offending
/// field, or the field count when it is not five.
///
/// # Examples
///
/// ```
/// use ewegate::timer::validate_cron;
///
/// assert!(validate_cron("30 7 * * 1-5").is_ok());
/// assert!(validate_cron("61 7 * * *").is_err());
/// assert!(validate_cron("30 7 * *").is_err());
/// ```
pub fn validate_cron(expr: &str) -> Result<(), ValidationError> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != CRON_FIELDS.len() {
        return Err(ValidationError::InvalidSchedule(format!(
            "expected 5 cron fields, got {} in {expr:?}",
            fields.len()
        )));
    }

    for (field, (name, min, max)) in fields.iter().zip(CRON_FIELDS) {
        if !is_valid_cron_field(field, min, max) {
            return Err(ValidationError::InvalidSchedule(format!(
                "invalid {name} field {field:?}"
            )));
        }
    }
    Ok(())
}

fn is_valid_cron_field(field: &str, min: u8, max: u8) -> bool {
    if field == "*" {
        return true;
    }
    field.split(',').all(|item| match item.split_once('-') {
        Some((start, end)) => match (cron_number(start, min, max), cron_number(end, min, max)) {
            (Some(start), Some(end)) => start <= end,
            _ => false,
        },
        None => cron_number(item, min, max).is_some(),
    })
}

fn cron_number(text: &str, min: u8, max: u8) -> Option<u8> {
    if text.is_empty() || text.len() > 2 || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse::<u8>()
        .ok()
        .filter(|value| (min..=max).contains(value))
}

/// Checks an ISO 8601 timestamp.
///
/// The offset is optional; a timestamp without one is taken as given.
///
/// # Errors
///
/// Returns [`ValidationError::InvalidSchedule`] if the text is not a valid
/// timestamp.
///
/// # Examples
///
/// ```
/// use ewegate::timer::validate_iso8601;
///
/// assert!(validate_iso8601("2024-01-01T00:00:00Z").is_ok());
/// assert!(validate_iso8601("2024-01-01T00:00:00.250+02:00").is_ok());
/// assert!(validate_iso8601("2024-01-01T00:00:00").is_ok());
/// assert!(validate_iso8601("2024-13-01T00:00:00Z").is_err());
/// ```
pub fn validate_iso8601(text: &str) -> Result<(), ValidationError> {
    let has_date_time_separator = text.as_bytes().get(10) == Some(&b'T');
    let valid = has_date_time_separator
        && (DateTime::parse_from_rfc3339(text).is_ok()
            || NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f").is_ok());

    if valid {
        Ok(())
    } else {
        Err(ValidationError::InvalidSchedule(format!(
            "invalid ISO 8601 timestamp {text:?}"
        )))
    }
}
