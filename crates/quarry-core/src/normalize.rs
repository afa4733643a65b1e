//! Helpers for mapping free-form provider fields onto the closed [`Job`] shape.
//!
//! Every function here is total: unrecognized input maps to `Unknown` / `None`,
//! never to an error, so one odd listing cannot fail a whole provider response.
//!
//! [`Job`]: crate::models::Job

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

use crate::models::{EmploymentType, RemoteType, SalaryRange};

const HOURS_PER_YEAR: f64 = 2080.0;

/// Classify a free-text remote hint ("Remote (US)", "Hybrid - 2 days", ...).
pub fn classify_remote(hint: &str) -> RemoteType {
    let hint = hint.to_lowercase();
    if hint.contains("hybrid") {
        RemoteType::Hybrid
    } else if hint.contains("not remote") || hint.contains("no remote") {
        RemoteType::Onsite
    } else if hint.contains("remote")
        || hint.contains("anywhere")
        || hint.contains("work from home")
        || hint.contains("wfh")
        || hint.contains("telecommute")
    {
        RemoteType::Remote
    } else if hint.contains("on-site")
        || hint.contains("onsite")
        || hint.contains("on site")
        || hint.contains("in office")
        || hint.contains("in-office")
    {
        RemoteType::Onsite
    } else {
        RemoteType::Unknown
    }
}

/// Classify a free-text contract hint ("Full-time", "permanent", "Contractor", ...).
pub fn classify_employment(hint: &str) -> EmploymentType {
    let hint = hint.to_lowercase().replace(['-', '_'], " ");
    if hint.contains("intern") {
        EmploymentType::Internship
    } else if hint.contains("part time") || hint.contains("parttime") {
        EmploymentType::PartTime
    } else if hint.contains("full time") || hint.contains("fulltime") || hint.contains("permanent")
    {
        EmploymentType::FullTime
    } else if hint.contains("contract")
        || hint.contains("freelance")
        || hint.contains("temporary")
        || hint.contains("temp ")
    {
        EmploymentType::Contract
    } else {
        EmploymentType::Unknown
    }
}

/// Parse a salary string such as `"$80k - $120k"`, `"€45,000–55,000"`,
/// `"up to 90000"` or `"$40/hr"` into an annual range.
pub fn parse_salary(text: &str) -> Option<SalaryRange> {
    let lower = text.to_lowercase();
    let numbers = extract_amounts(&lower);
    if numbers.is_empty() {
        return None;
    }

    let hourly = lower.contains("/hr")
        || lower.contains("/hour")
        || lower.contains("per hour")
        || lower.contains("hourly");
    let scale = if hourly { HOURS_PER_YEAR } else { 1.0 };

    let range = match numbers.as_slice() {
        [single] if lower.contains("up to") => SalaryRange::new(None, Some(single * scale)),
        [single] => SalaryRange::new(Some(single * scale), Some(single * scale)),
        [low, high, ..] => SalaryRange::new(Some(low * scale), Some(high * scale)),
        [] => None,
    }?;

    Some(match detect_currency(text) {
        Some(currency) => range.with_currency(currency),
        None => range,
    })
}

/// Build a range from numeric provider fields, ignoring zero / negative values.
pub fn salary_from_numbers(min: Option<f64>, max: Option<f64>) -> Option<SalaryRange> {
    let positive = |v: Option<f64>| v.filter(|n| n.is_finite() && *n > 0.0);
    SalaryRange::new(positive(min), positive(max))
}

fn detect_currency(text: &str) -> Option<&'static str> {
    if text.contains('$') {
        Some("USD")
    } else if text.contains('€') {
        Some("EUR")
    } else if text.contains('£') {
        Some("GBP")
    } else {
        None
    }
}

/// Pull numeric amounts out of a lowercase string, honouring `k` suffixes
/// and thousands separators.
fn extract_amounts(text: &str) -> Vec<f64> {
    let chars: Vec<char> = text.chars().collect();
    let mut amounts = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        if !chars[i].is_ascii_digit() {
            i += 1;
            continue;
        }
        let mut raw = String::new();
        while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == ',' || chars[i] == '.')
        {
            if chars[i] != ',' {
                raw.push(chars[i]);
            }
            i += 1;
        }
        let raw = raw.trim_end_matches('.');
        let Ok(mut value) = raw.parse::<f64>() else {
            continue;
        };
        if i < chars.len() && chars[i] == 'k' {
            value *= 1000.0;
            i += 1;
        }
        amounts.push(value);
    }

    amounts
}

/// Parse the timestamp formats providers commonly emit: RFC 3339, naive
/// ISO datetimes, plain dates, and unix epochs in seconds or milliseconds.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|n| Utc.from_utc_datetime(&n));
    }
    value.parse::<i64>().ok().and_then(epoch_to_datetime)
}

/// Interpret an integer as unix seconds, or milliseconds when it is too
/// large to be seconds.
pub fn epoch_to_datetime(epoch: i64) -> Option<DateTime<Utc>> {
    if epoch <= 0 {
        return None;
    }
    if epoch > 100_000_000_000 {
        DateTime::from_timestamp_millis(epoch)
    } else {
        DateTime::from_timestamp(epoch, 0)
    }
}
