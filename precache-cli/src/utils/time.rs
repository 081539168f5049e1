use crate::error::AppError;
use std::time::Duration;

/// Parse a duration with an optional unit (ms, s, m, h, d). Bare numbers are seconds.
pub fn parse_duration(time_str: &str) -> Result<Duration, AppError> {
    let time_str = time_str.trim();
    if time_str.is_empty() {
        return Err(AppError::ParseError("Invalid format: empty string".to_string()));
    }

    // Find the split point between numeric part and unit part
    let split_index = time_str
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit() && *c != '.')
        .map(|(i, _)| i)
        .unwrap_or(time_str.len());

    let numeric_part = &time_str[..split_index];
    let unit_part = time_str[split_index..].trim().to_lowercase();

    let value = numeric_part
        .parse::<f64>()
        .map_err(|_| AppError::ParseError(format!("Invalid number in '{time_str}'")))?;

    let seconds = match unit_part.as_str() {
        "ms" => value / 1000.0,
        "" | "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        "d" => value * 86400.0,
        other => return Err(AppError::ParseError(format!("Invalid unit '{other}'"))),
    };

    Duration::try_from_secs_f64(seconds)
        .map_err(|e| AppError::ParseError(format!("Invalid duration '{time_str}': {e}")))
}

/// Convert a duration to a human-readable format
pub fn format_duration(duration: Duration) -> String {
    let seconds = duration.as_secs_f64();
    if seconds >= 86400.0 {
        format!("{:.2}d", seconds / 86400.0)
    } else if seconds >= 3600.0 {
        format!("{:.2}h", seconds / 3600.0)
    } else if seconds >= 60.0 {
        format!("{:.2}m", seconds / 60.0)
    } else if seconds >= 1.0 {
        format!("{seconds:.2}s")
    } else {
        format!("{}ms", duration.as_millis())
    }
}
