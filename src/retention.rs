use time::{Duration, OffsetDateTime};

use crate::error::KairosError;

/// `"<n><m|h|d|w>"` added to `base`.
pub fn calc(spec: &str, base: OffsetDateTime) -> Result<OffsetDateTime, KairosError> {
    let bad = || KairosError::InvalidRetentionFormat(spec.to_string());
    let s = spec.trim();
    let unit = s.chars().last().ok_or_else(bad)?;
    let digits = &s[..s.len() - unit.len_utf8()];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(bad());
    }
    let n: i64 = digits.parse().map_err(|_| bad())?;

    let d = match unit {
        'm' => Duration::minutes(n),
        'h' => Duration::hours(n),
        'd' => Duration::days(n),
        'w' => Duration::weeks(n),
        _ => return Err(bad()),
    };
    base.checked_add(d).ok_or_else(bad)
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    const T: OffsetDateTime = datetime!(2024-03-01 12:00 UTC);

    #[test]
    fn minutes_days_weeks() {
        assert_eq!(calc("30m", T).unwrap(), T + Duration::minutes(30));
        assert_eq!(calc("2d", T).unwrap(), T + Duration::days(2));
        assert_eq!(calc("1w", T).unwrap(), T + Duration::days(7));
        assert_eq!(calc("12h", T).unwrap(), T + Duration::hours(12));
    }

    #[test]
    fn unknown_unit_is_an_error() {
        assert!(matches!(
            calc("5y", T),
            Err(KairosError::InvalidRetentionFormat(s)) if s == "5y"
        ));
    }

    #[test]
    fn garbage_rejected() {
        for s in ["", "d", "-1d", "1.5h", "7 d", "七d"] {
            assert!(calc(s, T).is_err(), "{s} should be rejected");
        }
    }
}
