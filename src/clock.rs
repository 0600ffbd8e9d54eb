//! Calendar and monotonic time supplied by the board

use core::fmt;

/// Calendar date and time as read from the RTC (no time zone).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub struct DateTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

const DAYS_BEFORE_MONTH: [u16; 12] = [0, 31, 59, 90, 120, 151, 181, 212, 243, 273, 304, 334];
const SECS_PER_DAY: u32 = 86_400;

fn is_leap(year: u32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

fn days_in_year(year: u32) -> u32 {
    if is_leap(year) {
        366
    } else {
        365
    }
}

fn days_in_month(year: u32, month: u8) -> u32 {
    match month {
        2 if is_leap(year) => 29,
        2 => 28,
        4 | 6 | 9 | 11 => 30,
        _ => 31,
    }
}

impl DateTime {
    pub const fn new(year: u16, month: u8, day: u8, hour: u8, minute: u8, second: u8) -> Self {
        Self {
            year,
            month,
            day,
            hour,
            minute,
            second,
        }
    }

    /// Seconds since 1970-01-01 00:00:00, treating the RTC time as UTC.
    pub fn to_unix(&self) -> u32 {
        let year = u32::from(self.year);
        let mut days: u32 = (1970..year).map(days_in_year).sum();
        let month_idx = usize::from(self.month.clamp(1, 12) - 1);
        days += u32::from(DAYS_BEFORE_MONTH[month_idx]);
        if self.month > 2 && is_leap(year) {
            days += 1;
        }
        days += u32::from(self.day.max(1)) - 1;

        // 32-bit seconds wrap in 2106, like the RTC's own counter
        days.wrapping_mul(SECS_PER_DAY)
            .wrapping_add(u32::from(self.hour) * 3600)
            .wrapping_add(u32::from(self.minute) * 60)
            .wrapping_add(u32::from(self.second))
    }

    /// Inverse of [`to_unix`](Self::to_unix).
    pub fn from_unix(ts: u32) -> Self {
        let mut days = ts / SECS_PER_DAY;
        let rem = ts % SECS_PER_DAY;

        let mut year = 1970u32;
        while days >= days_in_year(year) {
            days -= days_in_year(year);
            year += 1;
        }
        let mut month = 1u8;
        while days >= days_in_month(year, month) {
            days -= days_in_month(year, month);
            month += 1;
        }

        Self {
            year: year as u16,
            month,
            day: days as u8 + 1,
            hour: (rem / 3600) as u8,
            minute: ((rem % 3600) / 60) as u8,
            second: (rem % 60) as u8,
        }
    }

    /// `YYYYMMDDHHmmss`, as used in generated file names.
    pub fn compact(&self) -> Compact<'_> {
        Compact(self)
    }
}

/// `YYYY-MM-DD HH:MM:SS`
impl fmt::Display for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

pub struct Compact<'a>(&'a DateTime);

impl fmt::Display for Compact<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dt = self.0;
        write!(
            f,
            "{:04}{:02}{:02}{:02}{:02}{:02}",
            dt.year, dt.month, dt.day, dt.hour, dt.minute, dt.second
        )
    }
}

/// Board time services.
pub trait Clock {
    /// Current calendar time from the RTC.
    fn now(&self) -> DateTime;

    /// Free-running millisecond tick. Wraps at `u32::MAX`.
    fn monotonic_ms(&self) -> u32;
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> DateTime {
        (**self).now()
    }

    fn monotonic_ms(&self) -> u32 {
        (**self).monotonic_ms()
    }
}

/// Milliseconds from `since` to `now`, correct across tick wraparound.
#[inline]
pub fn elapsed_ms(now: u32, since: u32) -> u32 {
    now.wrapping_sub(since)
}
