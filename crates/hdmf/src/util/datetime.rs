//! ISO 8601 date/time parsing and formatting for `isodatetime` values.
//!
//! Values are held as microseconds since the Unix epoch (UTC) plus the
//! offset, in minutes, that the text carried. A bare date means midnight
//! UTC; a datetime without an offset is taken as UTC.

const MICROSECONDS_PER_SECOND: i64 = 1_000_000;
const MICROSECONDS_PER_MINUTE: i64 = 60 * MICROSECONDS_PER_SECOND;
const MICROSECONDS_PER_HOUR: i64 = 60 * MICROSECONDS_PER_MINUTE;
const MICROSECONDS_PER_DAY: i64 = 24 * MICROSECONDS_PER_HOUR;

/// Error type for ISO 8601 parsing failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateTimeParseError {
    pub message: String,
}

impl std::fmt::Display for DateTimeParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for DateTimeParseError {}

fn invalid(what: &str, input: &str) -> DateTimeParseError {
    DateTimeParseError {
        message: format!("Invalid {}: {}", what, input),
    }
}

/// Parses a timezone offset (Z, +HH:MM, +HHMM, +HH) into minutes.
fn parse_timezone_offset(offset: &str) -> Result<i16, DateTimeParseError> {
    if offset == "Z" || offset == "z" {
        return Ok(0);
    }
    let sign = match offset.chars().next() {
        Some('+') => 1i16,
        Some('-') => -1i16,
        _ => return Err(invalid("timezone offset", offset)),
    };
    let digits: String = offset[1..].chars().filter(|c| *c != ':').collect();
    if digits.len() != 2 && digits.len() != 4 {
        return Err(invalid("timezone offset", offset));
    }
    let hours: i16 = digits[..2].parse().map_err(|_| invalid("timezone offset", offset))?;
    let minutes: i16 = if digits.len() == 4 {
        digits[2..].parse().map_err(|_| invalid("timezone offset", offset))?
    } else {
        0
    };
    if hours > 23 || minutes > 59 {
        return Err(invalid("timezone offset", offset));
    }
    Ok(sign * (hours * 60 + minutes))
}

/// Formats an offset in minutes as Z, +HH:MM or -HH:MM.
fn format_timezone_offset(offset_min: i16) -> String {
    if offset_min == 0 {
        return "Z".to_string();
    }
    let sign = if offset_min >= 0 { '+' } else { '-' };
    let abs_offset = offset_min.abs();
    format!("{}{:02}:{:02}", sign, abs_offset / 60, abs_offset % 60)
}

/// Parses fractional seconds, truncated to microseconds.
fn parse_fractional_seconds(frac: &str) -> i64 {
    let mut padded: String = frac.chars().take(6).collect();
    while padded.len() < 6 {
        padded.push('0');
    }
    padded.parse().unwrap_or(0)
}

fn format_fractional_seconds(us: i64) -> String {
    if us == 0 {
        return String::new();
    }
    let digits = format!("{:06}", us);
    format!(".{}", digits.trim_end_matches('0'))
}

fn is_leap_year(year: i32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || (year % 400 == 0)
}

fn days_in_month(year: i32, month: u32) -> u32 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 if is_leap_year(year) => 29,
        2 => 28,
        _ => 0,
    }
}

/// Days since the Unix epoch (Howard Hinnant's days_from_civil).
fn date_to_days(year: i32, month: u32, day: u32) -> i64 {
    let y = if month <= 2 { year - 1 } else { year } as i64;
    let m = if month <= 2 { month as i64 + 9 } else { month as i64 - 3 };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as u32;
    let doy = (153 * m as u32 + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146097 + doe as i64 - 719468
}

/// Inverse of [`date_to_days`].
fn days_to_date(days: i64) -> (i32, u32, u32) {
    let z = days + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u32;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    ((if m <= 2 { y + 1 } else { y }) as i32, m, d)
}

fn parse_date(input: &str, date: &str) -> Result<i64, DateTimeParseError> {
    if date.len() != 10 || date.as_bytes()[4] != b'-' || date.as_bytes()[7] != b'-' {
        return Err(invalid("date", input));
    }
    let year: i32 = date[..4].parse().map_err(|_| invalid("year", input))?;
    let month: u32 = date[5..7].parse().map_err(|_| invalid("month", input))?;
    let day: u32 = date[8..10].parse().map_err(|_| invalid("day", input))?;
    if !(1..=12).contains(&month) {
        return Err(invalid("month", input));
    }
    if day < 1 || day > days_in_month(year, month) {
        return Err(invalid("day", input));
    }
    Ok(date_to_days(year, month, day))
}

/// Parses an ISO 8601 date or datetime.
///
/// Returns microseconds since the Unix epoch (UTC) and the offset in minutes.
pub fn parse_isodatetime(input: &str) -> Result<(i64, i16), DateTimeParseError> {
    let input = input.trim();
    if !input.is_ascii() || input.len() < 10 {
        return Err(invalid("isodatetime", input));
    }
    let days = parse_date(input, &input[..10])?;
    if input.len() == 10 {
        return Ok((days * MICROSECONDS_PER_DAY, 0));
    }

    let sep = input.as_bytes()[10];
    if sep != b'T' && sep != b't' && sep != b' ' {
        return Err(invalid("isodatetime", input));
    }
    let time = &input[11..];
    if time.len() < 5 || time.as_bytes()[2] != b':' {
        return Err(invalid("time", input));
    }
    let hours: i64 = time[..2].parse().map_err(|_| invalid("hours", input))?;
    let minutes: i64 = time[3..5].parse().map_err(|_| invalid("minutes", input))?;
    let mut rest = &time[5..];
    let mut seconds = 0i64;
    if rest.starts_with(':') {
        if rest.len() < 3 {
            return Err(invalid("seconds", input));
        }
        seconds = rest[1..3].parse().map_err(|_| invalid("seconds", input))?;
        rest = &rest[3..];
    }
    let mut micros = 0i64;
    if let Some(frac) = rest.strip_prefix('.') {
        let end = frac.find(|c: char| !c.is_ascii_digit()).unwrap_or(frac.len());
        if end == 0 {
            return Err(invalid("fractional seconds", input));
        }
        micros = parse_fractional_seconds(&frac[..end]);
        rest = &frac[end..];
    }
    if hours > 23 || minutes > 59 || seconds > 59 {
        return Err(invalid("time", input));
    }
    let offset_min = if rest.is_empty() { 0 } else { parse_timezone_offset(rest)? };

    let local = days * MICROSECONDS_PER_DAY
        + hours * MICROSECONDS_PER_HOUR
        + minutes * MICROSECONDS_PER_MINUTE
        + seconds * MICROSECONDS_PER_SECOND
        + micros;
    Ok((local - offset_min as i64 * MICROSECONDS_PER_MINUTE, offset_min))
}

/// Formats an epoch timestamp as an ISO 8601 datetime in its original offset.
pub fn format_isodatetime(epoch_us: i64, offset_min: i16) -> String {
    let local = epoch_us + offset_min as i64 * MICROSECONDS_PER_MINUTE;
    let days = local.div_euclid(MICROSECONDS_PER_DAY);
    let time = local.rem_euclid(MICROSECONDS_PER_DAY);
    let (year, month, day) = days_to_date(days);
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}{}{}",
        year,
        month,
        day,
        time / MICROSECONDS_PER_HOUR,
        time % MICROSECONDS_PER_HOUR / MICROSECONDS_PER_MINUTE,
        time % MICROSECONDS_PER_MINUTE / MICROSECONDS_PER_SECOND,
        format_fractional_seconds(time % MICROSECONDS_PER_SECOND),
        format_timezone_offset(offset_min)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_datetime() {
        let (us, off) = parse_isodatetime("2024-01-15T10:30:00Z").unwrap();
        assert_eq!(off, 0);
        assert_eq!(us, 1_705_314_600_000_000);

        let (us2, off2) = parse_isodatetime("2024-01-15T12:30:00+02:00").unwrap();
        assert_eq!(off2, 120);
        assert_eq!(us2, us);

        let (frac, _) = parse_isodatetime("1970-01-01T00:00:00.25").unwrap();
        assert_eq!(frac, 250_000);
    }

    #[test]
    fn test_parse_date_only() {
        let (us, off) = parse_isodatetime("1970-01-02").unwrap();
        assert_eq!(us, MICROSECONDS_PER_DAY);
        assert_eq!(off, 0);
    }

    #[test]
    fn test_invalid() {
        assert!(parse_isodatetime("2024-02-30").is_err());
        assert!(parse_isodatetime("2024-13-01T00:00:00Z").is_err());
        assert!(parse_isodatetime("2024-01-01T25:00:00Z").is_err());
        assert!(parse_isodatetime("yesterday").is_err());
        assert!(parse_isodatetime("2024-01-01T10:00:00+2").is_err());
    }

    #[test]
    fn test_format_roundtrip() {
        for text in [
            "2024-01-15T10:30:00Z",
            "2024-01-15T12:30:00.5+02:00",
            "1969-12-31T23:59:59.999999-05:30",
            "2000-02-29T00:00:00Z",
        ] {
            let (us, off) = parse_isodatetime(text).unwrap();
            assert_eq!(format_isodatetime(us, off), text);
        }
    }
}
