//! Weekly fetch schedule, packed as a 168-bit bitmap.
//!
//! Each bit covers one UTC hour of the week, Sunday 00:00 first. The
//! `SCHEDULE` environment variable carries the base64 encoding of the
//! bitmap interpreted as a big-endian integer, so leading zero hours
//! compress away.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use thiserror::Error;
use time::OffsetDateTime;

const WEEK_BYTES: usize = 24 * 7 / 8;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("schedule is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("schedule longer than {WEEK_BYTES} bytes")]
    TooLong,
}

/// One bit per UTC hour in a week; `true` means the fetcher may run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeekMap {
    bits: [u8; WEEK_BYTES],
}

impl WeekMap {
    /// A schedule with every hour enabled.
    pub fn always() -> Self {
        WeekMap {
            bits: [0xff; WEEK_BYTES],
        }
    }

    /// A schedule with every hour disabled.
    pub fn never() -> Self {
        WeekMap {
            bits: [0; WEEK_BYTES],
        }
    }

    pub fn parse(packed: &str) -> Result<Self, ScheduleError> {
        let raw = STANDARD.decode(packed)?;
        if raw.len() > WEEK_BYTES {
            return Err(ScheduleError::TooLong);
        }
        let mut bits = [0u8; WEEK_BYTES];
        bits[WEEK_BYTES - raw.len()..].copy_from_slice(&raw);
        Ok(WeekMap { bits })
    }

    pub fn pack(&self) -> String {
        let first = self.bits.iter().position(|&b| b != 0).unwrap_or(WEEK_BYTES);
        STANDARD.encode(&self.bits[first..])
    }

    fn bit(&self, pos: usize) -> bool {
        let byte = self.bits[WEEK_BYTES - 1 - pos / 8];
        byte >> (pos % 8) & 1 == 1
    }

    fn set_bit(&mut self, pos: usize, val: bool) {
        let byte = &mut self.bits[WEEK_BYTES - 1 - pos / 8];
        if val {
            *byte |= 1 << (pos % 8);
        } else {
            *byte &= !(1 << (pos % 8));
        }
    }

    /// Whether the hour containing `t` is enabled.
    pub fn get(&self, t: OffsetDateTime) -> bool {
        let t = t.to_offset(time::UtcOffset::UTC);
        let pos = t.weekday().number_days_from_sunday() as usize * 24 + t.hour() as usize;
        self.bit(pos)
    }

    pub fn set(&mut self, weekday: time::Weekday, hour: u8, val: bool) {
        let pos = weekday.number_days_from_sunday() as usize * 24 + hour as usize;
        self.set_bit(pos, val);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_set_get() {
        let mut w = WeekMap::never();
        w.set(time::Weekday::Tuesday, 13, true);

        // 2016-03-01 was a Tuesday.
        assert!(w.get(datetime!(2016-03-01 13:30 UTC)));
        assert!(!w.get(datetime!(2016-03-01 14:30 UTC)));
        assert!(!w.get(datetime!(2016-03-02 13:30 UTC)));

        w.set(time::Weekday::Tuesday, 13, false);
        assert!(!w.get(datetime!(2016-03-01 13:30 UTC)));
    }

    #[test]
    fn test_offset_normalized_to_utc() {
        let mut w = WeekMap::never();
        w.set(time::Weekday::Tuesday, 13, true);
        // 15:30+02:00 is 13:30 UTC.
        assert!(w.get(datetime!(2016-03-01 15:30 +02:00)));
    }

    #[test]
    fn test_pack_round_trip() {
        let mut w = WeekMap::never();
        w.set(time::Weekday::Sunday, 0, true);
        w.set(time::Weekday::Saturday, 23, true);
        w.set(time::Weekday::Wednesday, 7, true);

        let packed = w.pack();
        let parsed = WeekMap::parse(&packed).unwrap();
        assert_eq!(w, parsed);
    }

    #[test]
    fn test_always() {
        let w = WeekMap::always();
        assert!(w.get(datetime!(2016-03-01 00:00 UTC)));
        assert!(w.get(datetime!(2016-03-05 23:00 UTC)));
        assert_eq!(WeekMap::parse(&w.pack()).unwrap(), w);
    }

    #[test]
    fn test_parse_rejects_oversize() {
        let too_long = STANDARD.encode([0xffu8; WEEK_BYTES + 1]);
        assert!(matches!(
            WeekMap::parse(&too_long),
            Err(ScheduleError::TooLong)
        ));
    }

    #[test]
    fn test_parse_short_input_is_right_aligned() {
        // A single 0x01 byte is hour 0 of Sunday.
        let w = WeekMap::parse(&STANDARD.encode([0x01u8])).unwrap();
        assert!(w.get(datetime!(2016-03-06 00:30 UTC))); // a Sunday
        assert!(!w.get(datetime!(2016-03-06 01:30 UTC)));
    }
}
