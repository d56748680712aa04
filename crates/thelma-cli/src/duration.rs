//! Durations on the command line: `90m`, `6h`, `2d`, `1h30m`.

use chrono::Duration;

pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total = Duration::zero();
    let mut digits = String::new();
    for ch in s.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        if digits.is_empty() {
            return Err(format!("invalid duration '{s}': expected a number before '{ch}'"));
        }
        let n: i64 = digits
            .parse()
            .map_err(|_| format!("invalid duration '{s}': number too large"))?;
        digits.clear();
        let part = match ch {
            's' => Duration::try_seconds(n),
            'm' => Duration::try_minutes(n),
            'h' => Duration::try_hours(n),
            'd' => Duration::try_days(n),
            _ => {
                return Err(format!(
                    "invalid duration '{s}': unknown unit '{ch}' (use s, m, h or d)"
                ))
            }
        };
        total = part
            .and_then(|p| total.checked_add(&p))
            .ok_or_else(|| format!("invalid duration '{s}': out of range"))?;
    }
    if !digits.is_empty() {
        return Err(format!("invalid duration '{s}': missing unit after {digits}"));
    }
    Ok(total)
}
