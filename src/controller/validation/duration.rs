//! # Duration Validation
//!
//! Handles parsing and validating Kubernetes duration strings.

use anyhow::Result;
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

static DURATION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<number>\d+)(?P<unit>ms|[smhd])$").expect("duration regex is valid")
});

/// Parse Kubernetes duration string into std::time::Duration
/// Supports formats: "500ms", "30s", "1m", "5m", "1h", "2h", "1d"
pub fn parse_kubernetes_duration(duration_str: &str) -> Result<Duration> {
    let duration_trimmed = duration_str.trim();

    if duration_trimmed.is_empty() {
        return Err(anyhow::anyhow!("Duration string cannot be empty"));
    }

    let lower = duration_trimmed.to_lowercase();
    let captures = DURATION_REGEX.captures(&lower).ok_or_else(|| {
        anyhow::anyhow!(
            "Invalid duration format '{duration_trimmed}'. Expected format: <number><unit> (e.g., '30s', '5m', '1h')"
        )
    })?;

    let number: u64 = captures["number"].parse().map_err(|e| {
        anyhow::anyhow!("Invalid duration number in '{duration_trimmed}': {e}")
    })?;

    if number == 0 {
        return Err(anyhow::anyhow!(
            "Duration number must be greater than 0, got '{duration_trimmed}'"
        ));
    }

    let duration = match &captures["unit"] {
        "ms" => Duration::from_millis(number),
        "s" => Duration::from_secs(number),
        "m" => Duration::from_secs(number.saturating_mul(60)),
        "h" => Duration::from_secs(number.saturating_mul(3600)),
        "d" => Duration::from_secs(number.saturating_mul(86400)),
        unit => {
            return Err(anyhow::anyhow!(
                "Invalid unit '{unit}' in duration '{duration_trimmed}'. Expected: ms, s, m, h, or d"
            ));
        }
    };

    Ok(duration)
}

/// Validate duration interval with minimum value check
///
/// # Arguments
/// * `interval` - The duration string to validate
/// * `field_name` - The name of the field being validated (for error messages)
/// * `min_seconds` - Minimum duration in seconds
pub fn validate_duration_interval(
    interval: &str,
    field_name: &str,
    min_seconds: u64,
) -> Result<Duration> {
    let interval_trimmed = interval.trim();

    if interval_trimmed.is_empty() {
        return Err(anyhow::anyhow!("{field_name} cannot be empty"));
    }

    let duration = parse_kubernetes_duration(interval_trimmed)
        .map_err(|e| anyhow::anyhow!("{field_name}: {e}"))?;

    if duration < Duration::from_secs(min_seconds) {
        return Err(anyhow::anyhow!(
            "{field_name} '{interval_trimmed}' must be at least {min_seconds} seconds"
        ));
    }

    Ok(duration)
}
