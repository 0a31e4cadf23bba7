use chrono::{DateTime, SecondsFormat, Utc};

/// Current time of local observation as an RFC 3339 UTC string. Used as the
/// default timestamp wherever the wire left one out.
#[must_use]
pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Normalize a raw wire timestamp for display. Timestamps are informational
/// only; a missing or unparseable value degrades to a label instead of an
/// error.
#[must_use]
pub fn format_timestamp(raw: Option<&str>) -> String {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return "Unknown time".to_string();
    };
    match DateTime::parse_from_rfc3339(raw) {
        Ok(parsed) => parsed
            .with_timezone(&Utc)
            .format("%Y-%m-%d %H:%M:%S UTC")
            .to_string(),
        Err(_) => "Invalid date".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn now_is_rfc3339() {
        let now = now_iso8601();
        assert!(DateTime::parse_from_rfc3339(&now).is_ok());
    }

    #[test]
    fn missing_timestamp_formats_as_unknown() {
        assert_eq!(format_timestamp(None), "Unknown time");
        assert_eq!(format_timestamp(Some("   ")), "Unknown time");
    }

    #[test]
    fn unparseable_timestamp_formats_as_invalid() {
        assert_eq!(format_timestamp(Some("yesterday-ish")), "Invalid date");
    }

    #[test]
    fn valid_timestamp_is_rendered() {
        assert_eq!(
            format_timestamp(Some("2024-03-01T12:30:45Z")),
            "2024-03-01 12:30:45 UTC"
        );
    }
}
