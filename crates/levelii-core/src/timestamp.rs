//! Volume timestamp derivation.
//!
//! Archive volume headers carry a NEXRAD-modified Julian date (1-based,
//! 1970-01-01 = day 1) and milliseconds past midnight. Everything
//! downstream keys on the derived `YYYYMMDD_HHMMSS` string.

use chrono::{Duration, TimeZone, Utc};

/// Derive the canonical volume timestamp from header fields.
///
/// Returns `None` for dates that fall outside chrono's representable
/// range (only reachable with garbage headers).
pub fn volume_timestamp(julian_date: u32, milliseconds: u32) -> Option<String> {
    let epoch = Utc.timestamp_opt(0, 0).single()?;
    let instant = epoch
        .checked_add_signed(Duration::days(julian_date as i64 - 1))?
        .checked_add_signed(Duration::milliseconds(milliseconds as i64))?;
    Some(instant.format("%Y%m%d_%H%M%S").to_string())
}
