use std::time::SystemTime;

use chrono::{DateTime, NaiveDateTime, Utc};

/// Format used for suffixes of rotated files; it sorts lexicographically
/// in chronological order.
const ROTATION_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

/// Format a timestamp as `YYYY-MM-DD-HH-MM-SS` (UTC).
pub fn format_rotation_timestamp(t: SystemTime) -> String {
    DateTime::<Utc>::from(t).format(ROTATION_FORMAT).to_string()
}

/// Try to parse a `YYYY-MM-DD-HH-MM-SS` suffix, returning `None` if it
/// is not one.
pub fn try_parse_rotation_timestamp(t: &str) -> Option<DateTime<Utc>> {
    match NaiveDateTime::parse_from_str(t, ROTATION_FORMAT) {
        Ok(t) => Some(t.and_utc()),
        Err(e) => {
            tracing::trace!("Not a rotation timestamp: {t}: {e}");
            None
        }
    }
}
