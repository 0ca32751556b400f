use chrono::{Datelike, NaiveDate, TimeZone};
use chrono_tz::Tz;

use crate::error::BadDateError;

/// Bidirectional, pure, stateless conversion between an ISO date and the
/// exact accessibility-label form the target sites render:
/// `"Weekday, Month D, YYYY"` (full weekday name, full month name, day
/// with no leading zero, four-digit year).
///
/// The supplied zone only disambiguates which wall-clock weekday a
/// calendar date falls on; the coder never reads the actual wall clock.
pub struct DateCoder;

impl DateCoder {
    pub fn encode(date: NaiveDate, zone: Tz) -> String {
        let midnight = date.and_hms_opt(0, 0, 0).expect("midnight is always valid");
        let localized = zone.from_local_datetime(&midnight).single().unwrap_or_else(|| {
            // Ambiguous/nonexistent local time (DST fold) — both offsets
            // land on the same calendar date, so taking either is fine.
            zone.from_utc_datetime(&midnight)
        });

        format!(
            "{}, {} {}, {}",
            localized.format("%A"),
            localized.format("%B"),
            localized.day(),
            localized.year()
        )
    }

    pub fn decode(label: &str) -> Result<NaiveDate, BadDateError> {
        let (_weekday, rest) = label
            .split_once(',')
            .ok_or_else(|| BadDateError(label.to_string()))?;
        let rest = rest.trim();

        NaiveDate::parse_from_str(rest, "%B %d, %Y").map_err(|_| BadDateError(label.to_string()))
    }
}
