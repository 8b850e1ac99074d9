use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::errors::{AppError, AppResult};

pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Parses durations such as `500ms`, `20s`, `1m`, `2h` or `1d`.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);
    let amount: u64 = digits.parse().ok()?;
    let multiplier_ms = match unit.to_ascii_lowercase().as_str() {
        "ms" => 1,
        "s" | "" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        _ => return None,
    };
    Some(Duration::from_millis(amount.saturating_mul(multiplier_ms)))
}

pub fn require_duration(field: &str, value: &str) -> AppResult<Duration> {
    match parse_duration(value) {
        Some(duration) if !duration.is_zero() => Ok(duration),
        Some(_) => Err(AppError::Config(format!("{field} must be greater than zero"))),
        None => Err(AppError::Config(format!(
            "{field}: invalid duration '{value}'"
        ))),
    }
}
