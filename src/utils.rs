use std::time::Duration;

/// Parses `"<n><unit>"` durations such as `30s`, `10m`, `5h` or `1d`.
pub fn parse_duration_string(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("duration is empty (expected e.g. 30s, 10m, 2h, 1d)".to_string());
    }

    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("duration '{}' has no leading number", s))?;

    let multiplier = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 24 * 60 * 60,
        "" => return Err(format!("duration '{}' is missing a unit (s, m, h or d)", s)),
        other => return Err(format!("duration '{}' has unknown unit '{}'", s, other)),
    };

    value
        .checked_mul(multiplier)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("duration '{}' is too large", s))
}

/// Splits a comma-separated pattern list ("burst, steady,,spike").
///
/// Names are trimmed and empty entries dropped; order and duplicates are kept
/// so the same pattern can be requested twice.
pub fn parse_pattern_list(patterns: &str) -> Vec<String> {
    patterns
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// Returns the destination without its `http://` or `https://` prefix.
///
/// Used as the `destination_host` metric label.
pub fn destination_host(destination: &str) -> &str {
    destination
        .strip_prefix("https://")
        .or_else(|| destination.strip_prefix("http://"))
        .unwrap_or(destination)
}
