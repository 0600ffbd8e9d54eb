//! Record categories and line formatting
//!
//! Every formatter is a pure function of its inputs and writes into a
//! fixed-capacity [`Line`]. Overflowing the buffer is reported as
//! [`FormatError`] instead of truncating the record.

use core::fmt::Write;

use heapless::String;

use crate::clock::DateTime;
use crate::config::LINE_CAP;
use crate::error::FormatError;

/// Formatted record text
pub type Line = String<LINE_CAP>;

/// Closed set of record categories, each stored in its own directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum Category {
    Sample,
    ThresholdViolation,
    Log,
    HiddenSample,
}

impl Category {
    pub const COUNT: usize = 4;
    pub const ALL: [Category; Category::COUNT] = [
        Category::Sample,
        Category::ThresholdViolation,
        Category::Log,
        Category::HiddenSample,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    /// Directory under the volume root
    pub const fn directory(self) -> &'static str {
        match self {
            Category::Sample => "sample",
            Category::ThresholdViolation => "overLimit",
            Category::Log => "log",
            Category::HiddenSample => "hideData",
        }
    }

    /// File name prefix inside the category directory
    pub const fn prefix(self) -> &'static str {
        match self {
            Category::Sample => "sampleData",
            Category::ThresholdViolation => "overLimit",
            Category::Log => "log",
            Category::HiddenSample => "hideData",
        }
    }
}

/// `"<date> <time> <voltage:1dp>V"`
pub fn sample_line(at: &DateTime, voltage: f32) -> Result<Line, FormatError> {
    let mut line = Line::new();
    write!(line, "{} {:.1}V", at, voltage).map_err(|_| FormatError)?;
    Ok(line)
}

/// `"<date> <time> <voltage:0dp>V limit <limit:0dp>V"`
pub fn violation_line(at: &DateTime, voltage: f32, limit: f32) -> Result<Line, FormatError> {
    let mut line = Line::new();
    write!(line, "{} {:.0}V limit {:.0}V", at, voltage, limit).map_err(|_| FormatError)?;
    Ok(line)
}

/// `"<date> <time> <text>"`
pub fn log_line(at: &DateTime, text: &str) -> Result<Line, FormatError> {
    let mut line = Line::new();
    write!(line, "{} {}", at, text).map_err(|_| FormatError)?;
    Ok(line)
}

/// Sample line, newline, then `"hide: "` and the compact hex encoding.
pub fn hidden_line(at: &DateTime, voltage: f32, over_limit: bool) -> Result<Line, FormatError> {
    let mut line = sample_line(at, voltage)?;
    line.push_str("\nhide: ").map_err(|_| FormatError)?;
    write_storage_hex(&mut line, at.to_unix(), voltage, over_limit).map_err(|_| FormatError)?;
    Ok(line)
}

/// `TTTTTTTTIIIIFFFF[*]`: unix time, integer volts and tenths of a volt.
///
/// The fraction keeps one decimal digit, truncated (23.47 -> `0004`). This is
/// not the 16-bit fixed-point split of [`display_hex`].
pub fn write_storage_hex<W: Write>(
    out: &mut W,
    timestamp: u32,
    voltage: f32,
    over_limit: bool,
) -> core::fmt::Result {
    let whole = voltage as u16;
    let tenths = ((voltage - f32::from(whole)) * 10.0) as u16;
    write!(out, "{:08X}{:04X}{:04X}", timestamp, whole, tenths)?;
    if over_limit {
        out.write_char('*')?;
    }
    Ok(())
}

/// Integer part and 16-bit binary fraction, as shown on the serial console
/// in hidden mode.
pub fn display_hex(voltage: f32) -> (u16, u16) {
    let whole = voltage as u16;
    let frac = ((voltage - f32::from(whole)) * 65_536.0) as u16;
    (whole, frac)
}
