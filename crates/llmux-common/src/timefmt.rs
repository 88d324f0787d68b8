use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

pub fn format_rfc3339(at: OffsetDateTime) -> String {
    at.format(&Rfc3339)
        .unwrap_or_else(|_| at.unix_timestamp().to_string())
}

/// Parse an `expiresAt` value from a credential or pool file.
///
/// RFC-3339 strings are the canonical form; integer epoch values (seconds or
/// milliseconds) are accepted for tolerance with older credential files.
pub fn parse_expires_at(raw: &str) -> Option<OffsetDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(parsed) = OffsetDateTime::parse(raw, &Rfc3339) {
        return Some(parsed);
    }
    let numeric = raw.parse::<i64>().ok()?;
    parse_epoch(numeric)
}

pub fn parse_epoch(value: i64) -> Option<OffsetDateTime> {
    // Anything past the year ~33658 in seconds is really milliseconds.
    if value > 100_000_000_000 {
        OffsetDateTime::from_unix_timestamp_nanos(value as i128 * 1_000_000).ok()
    } else {
        OffsetDateTime::from_unix_timestamp(value).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc3339_round_trip() {
        let at = OffsetDateTime::from_unix_timestamp(1_760_000_000).unwrap();
        let text = format_rfc3339(at);
        assert_eq!(parse_expires_at(&text), Some(at));
    }

    #[test]
    fn epoch_seconds_and_millis_both_parse() {
        let secs = parse_expires_at("1760000000").unwrap();
        let millis = parse_expires_at("1760000000000").unwrap();
        assert_eq!(secs.unix_timestamp(), millis.unix_timestamp());
    }

    #[test]
    fn garbage_is_none() {
        assert!(parse_expires_at("").is_none());
        assert!(parse_expires_at("not a date").is_none());
    }
}
