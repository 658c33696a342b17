//! Packed date-time: a 32-bit encoding of `YYYY-MM-DD HH:MM:SS` whose
//! unsigned integer order coincides with chronological order, so index
//! comparators can compare raw words.

use chrono::{Datelike, NaiveDate, Timelike, Utc};
use std::fmt;

// ---------------------------------------------------------------------------
// Bit layout (MSB first): year-2005:6, month:4, day:5, hour:5, minute:6, second:6
// ---------------------------------------------------------------------------

pub const BASE_YEAR: u32 = 2005;
/// Largest representable year (6-bit year field).
pub const MAX_YEAR: u32 = BASE_YEAR + 63;

const YEAR_SHIFT: u32 = 26;
const MONTH_SHIFT: u32 = 22;
const DAY_SHIFT: u32 = 17;
const HOUR_SHIFT: u32 = 12;
const MINUTE_SHIFT: u32 = 6;

/// A valid date-time packed into a `u32`. Construction always validates,
/// so a held value is well-formed by invariant.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub struct Stamp(u32);

impl Stamp {
    /// Build from calendar parts. Rejects years outside the representable
    /// range, invalid calendar dates (month lengths, leap years), invalid
    /// times, and anything after the current wall-clock time.
    pub fn from_parts(year: u32, month: u32, day: u32, hour: u32, minute: u32, second: u32) -> Option<Self> {
        if !(BASE_YEAR..=MAX_YEAR).contains(&year) {
            return None;
        }
        NaiveDate::from_ymd_opt(year as i32, month, day)?;
        if hour > 23 || minute > 59 || second > 59 {
            return None;
        }
        let packed = Self::pack(year, month, day, hour, minute, second);
        if packed > Self::now().0 {
            return None;
        }
        Some(Stamp(packed))
    }

    fn pack(year: u32, month: u32, day: u32, hour: u32, minute: u32, second: u32) -> u32 {
        ((year - BASE_YEAR) << YEAR_SHIFT)
            | (month << MONTH_SHIFT)
            | (day << DAY_SHIFT)
            | (hour << HOUR_SHIFT)
            | (minute << MINUTE_SHIFT)
            | second
    }

    /// The current wall-clock time, saturated to the representable range.
    pub fn now() -> Self {
        let now = Utc::now().naive_utc();
        let year = now.year() as u32;
        if year > MAX_YEAR {
            return Stamp(u32::MAX);
        }
        Stamp(Self::pack(
            year,
            now.month(),
            now.day(),
            now.hour(),
            now.minute(),
            now.second(),
        ))
    }

    /// Parse `YYYY-MM-DD HH:MM:SS`.
    pub fn parse_date_time(text: &str) -> Option<Self> {
        let (date, time) = text.split_once(' ')?;
        let (y, mo, d) = parse_date_fields(date)?;
        let mut it = time.splitn(3, ':');
        let h = parse_two(it.next()?)?;
        let mi = parse_two(it.next()?)?;
        let s = parse_two(it.next()?)?;
        Self::from_parts(y, mo, d, h, mi, s)
    }

    /// Parse `YYYY-MM-DD` as midnight of that day.
    pub fn parse_date(text: &str) -> Option<Self> {
        let (y, mo, d) = parse_date_fields(text)?;
        Self::from_parts(y, mo, d, 0, 0, 0)
    }

    /// Sentinel for "no commit observed": packs below every valid stamp.
    pub const NEVER: Stamp = Stamp(0);

    /// Trusted decode for self-produced binary files. Accepts `NEVER`.
    pub fn from_word(word: u32) -> Self {
        Stamp(word)
    }

    /// Reinterpret a raw word previously produced by `raw()`. Field-validates
    /// but does not clamp to "now" (persisted stamps were validated at ingest).
    pub fn from_raw(word: u32) -> Option<Self> {
        let s = Stamp(word);
        NaiveDate::from_ymd_opt(s.year() as i32, s.month(), s.day())?;
        if s.hour() > 23 || s.minute() > 59 || s.second() > 59 {
            return None;
        }
        Some(s)
    }

    /// The packed word. Unsigned order on these is chronological order.
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Same day, time forced to 23:59:59. Used to make an inclusive
    /// end-of-interval bound out of a plain date.
    pub fn end_of_day(self) -> Self {
        Stamp(Self::pack(self.year(), self.month(), self.day(), 23, 59, 59))
    }

    pub fn year(self) -> u32 {
        (self.0 >> YEAR_SHIFT) + BASE_YEAR
    }

    pub fn month(self) -> u32 {
        (self.0 >> MONTH_SHIFT) & 0xf
    }

    pub fn day(self) -> u32 {
        (self.0 >> DAY_SHIFT) & 0x1f
    }

    pub fn hour(self) -> u32 {
        (self.0 >> HOUR_SHIFT) & 0x1f
    }

    pub fn minute(self) -> u32 {
        (self.0 >> MINUTE_SHIFT) & 0x3f
    }

    pub fn second(self) -> u32 {
        self.0 & 0x3f
    }

    /// `YYYY-MM-DD` form (no time component).
    pub fn date_string(self) -> String {
        format!("{:04}-{:02}-{:02}", self.year(), self.month(), self.day())
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year(),
            self.month(),
            self.day(),
            self.hour(),
            self.minute(),
            self.second()
        )
    }
}

fn parse_date_fields(text: &str) -> Option<(u32, u32, u32)> {
    let mut it = text.splitn(3, '-');
    let y = it.next()?;
    let mo = it.next()?;
    let d = it.next()?;
    if y.len() != 4 || mo.len() != 2 || d.len() != 2 {
        return None;
    }
    Some((
        parse_digits(y)?,
        parse_digits(mo)?,
        parse_digits(d)?,
    ))
}

fn parse_two(text: &str) -> Option<u32> {
    if text.len() != 2 {
        return None;
    }
    parse_digits(text)
}

fn parse_digits(text: &str) -> Option<u32> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}
