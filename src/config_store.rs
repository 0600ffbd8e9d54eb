//! `config.ini` and boot counter persistence
//!
//! The document has two sections, each with a single `Ch0` key:
//!
//! ```text
//! [Ratio]
//! Ch0 = 1.0
//!
//! [Limit]
//! Ch0 = 200.0
//! ```
//!
//! Numbers are parsed leniently: a malformed value reads as `0.0`, matching
//! the firmware that produced existing cards. Downstream code treats zero as
//! a plausible setting, so this is kept rather than reported.

use core::fmt::Write;

use heapless::{String, Vec};

use crate::config::{BOOT_COUNT_PATH, CONFIG_LINE_CAP, CONFIG_PATH, DEFAULT_LIMIT, DEFAULT_RATIO};
use crate::error::{FsError, StorageError};
use crate::volume::{write_all, OpenMode, Volume};

/// Parsed configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub struct ConfigDocument {
    /// Channel scale factor
    pub ratio: f32,
    /// Threshold in volts
    pub limit: f32,
    /// Both keys were present in the same parse
    pub valid: bool,
}

impl ConfigDocument {
    pub const fn new(ratio: f32, limit: f32) -> Self {
        Self {
            ratio,
            limit,
            valid: true,
        }
    }

    pub const fn invalid() -> Self {
        Self {
            ratio: 0.0,
            limit: 0.0,
            valid: false,
        }
    }

    pub fn ratio_or_default(&self) -> f32 {
        if self.valid {
            self.ratio
        } else {
            DEFAULT_RATIO
        }
    }

    pub fn limit_or_default(&self) -> f32 {
        if self.valid {
            self.limit
        } else {
            DEFAULT_LIMIT
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Section {
    None,
    Ratio,
    Limit,
}

/// Line-at-a-time parser state.
struct Parser {
    section: Section,
    ratio: Option<f32>,
    limit: Option<f32>,
    damaged: bool,
}

impl Parser {
    fn new() -> Self {
        Self {
            section: Section::None,
            ratio: None,
            limit: None,
            damaged: false,
        }
    }

    fn line(&mut self, raw: &str) {
        let line = raw.trim();
        if line.is_empty() || is_comment(line.as_bytes()) {
            return;
        }
        if line.starts_with('[') {
            self.section = if line.starts_with("[Ratio]") {
                Section::Ratio
            } else if line.starts_with("[Limit]") {
                Section::Limit
            } else {
                Section::None
            };
            return;
        }
        let Some((key, value)) = line.split_once('=') else {
            return;
        };
        if key.trim() != "Ch0" {
            return;
        }
        let value = parse_lenient_f32(value.trim());
        match self.section {
            Section::Ratio => self.ratio = Some(value),
            Section::Limit => self.limit = Some(value),
            Section::None => {}
        }
    }

    /// A raw line from the medium. `overflowed` lines lost their tail.
    fn raw_line(&mut self, bytes: &[u8], overflowed: bool) {
        if is_comment(bytes) {
            return;
        }
        match core::str::from_utf8(bytes) {
            Ok(text) if !overflowed => self.line(text),
            _ => {
                warn!("unreadable config.ini line, document rejected");
                self.damaged = true;
            }
        }
    }

    fn finish(self) -> ConfigDocument {
        match (self.ratio, self.limit) {
            (Some(ratio), Some(limit)) if !self.damaged => ConfigDocument::new(ratio, limit),
            _ => ConfigDocument::invalid(),
        }
    }
}

fn is_comment(line: &[u8]) -> bool {
    matches!(
        line.iter().find(|b| !b.is_ascii_whitespace()),
        Some(b';' | b'#')
    )
}

/// Parse the document text. Unknown sections and keys are skipped.
pub fn parse(text: &str) -> ConfigDocument {
    let mut parser = Parser::new();
    for line in text.lines() {
        parser.line(line);
    }
    parser.finish()
}

/// `atof`-style parse: the longest numeric prefix, `0.0` when there is none.
pub fn parse_lenient_f32(s: &str) -> f32 {
    let bytes = s.trim_start().as_bytes();
    let mut end = 0;
    if matches!(bytes.first(), Some(b'+' | b'-')) {
        end += 1;
    }
    let int_digits = count_digits(&bytes[end..]);
    end += int_digits;
    let mut frac_digits = 0;
    if bytes.get(end) == Some(&b'.') {
        frac_digits = count_digits(&bytes[end + 1..]);
        end += 1 + frac_digits;
    }
    if int_digits + frac_digits == 0 {
        return 0.0;
    }
    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let mut exp_end = end + 1;
        if matches!(bytes.get(exp_end), Some(b'+' | b'-')) {
            exp_end += 1;
        }
        let exp_digits = count_digits(&bytes[exp_end.min(bytes.len())..]);
        if exp_digits > 0 {
            end = exp_end + exp_digits;
        }
    }

    core::str::from_utf8(&bytes[..end])
        .ok()
        .and_then(|n| n.parse::<f32>().ok())
        .unwrap_or(0.0)
}

fn count_digits(bytes: &[u8]) -> usize {
    bytes.iter().take_while(|b| b.is_ascii_digit()).count()
}

const RENDER_CAP: usize = 128;

/// Deterministic serialization: fixed key order, one decimal place.
pub fn render(doc: &ConfigDocument) -> Result<String<RENDER_CAP>, StorageError> {
    let mut out = String::new();
    write!(
        out,
        "; Configuration file\r\n\r\n[Ratio]\r\nCh0 = {:.1}\r\n\r\n[Limit]\r\nCh0 = {:.1}\r\n",
        doc.ratio, doc.limit
    )
    .map_err(|_| StorageError::InvalidInput)?;
    Ok(out)
}

/// Read and parse `/config.ini`.
///
/// An absent file is [`StorageError::NotFound`]; a file missing either key
/// parses to a document with `valid == false`. The file is streamed line by
/// line, so its length is not bounded; a setting line longer than
/// [`CONFIG_LINE_CAP`] makes the document invalid rather than being cut.
pub fn read_config<V: Volume>(volume: &mut V) -> Result<ConfigDocument, StorageError> {
    let mut file = volume.open(CONFIG_PATH, OpenMode::Read)?;
    let result = parse_stream(volume, &mut file);
    let _ = volume.close(file);
    result
}

fn parse_stream<V: Volume>(volume: &mut V, file: &mut V::File) -> Result<ConfigDocument, StorageError> {
    let mut parser = Parser::new();
    let mut line: Vec<u8, CONFIG_LINE_CAP> = Vec::new();
    let mut overflowed = false;
    let mut chunk = [0u8; 64];

    loop {
        let n = volume.read(file, &mut chunk).map_err(io)?;
        if n == 0 {
            break;
        }
        for &b in &chunk[..n] {
            if b == b'\n' {
                parser.raw_line(&line, overflowed);
                line.clear();
                overflowed = false;
            } else if line.push(b).is_err() {
                overflowed = true;
            }
        }
    }
    if !line.is_empty() {
        parser.raw_line(&line, overflowed);
    }
    Ok(parser.finish())
}

/// Replace `/config.ini` with the serialized document and flush it.
pub fn write_config<V: Volume>(volume: &mut V, doc: &ConfigDocument) -> Result<(), StorageError> {
    let text = render(doc)?;
    write_file(volume, CONFIG_PATH, text.as_bytes())
}

const SAMPLE_CONFIG: &str = "; Sample configuration file\r\n\
    ; Edit values and save to SD card\r\n\
    \r\n\
    [Ratio]\r\n\
    Ch0 = 1.0\r\n\
    \r\n\
    [Limit]\r\n\
    Ch0 = 200.0\r\n";

/// Write the commented default document.
pub fn create_sample_config<V: Volume>(volume: &mut V) -> Result<(), StorageError> {
    write_file(volume, CONFIG_PATH, SAMPLE_CONFIG.as_bytes())
}

/// Boot counter, `0` when the file is missing or shorter than four bytes.
pub fn read_boot_counter<V: Volume>(volume: &mut V) -> u32 {
    let mut buf = [0u8; 4];
    match read_file(volume, BOOT_COUNT_PATH, &mut buf) {
        Ok(4) => u32::from_le_bytes(buf),
        Ok(n) => {
            warn!("boot counter truncated ({} bytes), starting from 0", n);
            0
        }
        Err(_) => 0,
    }
}

pub fn write_boot_counter<V: Volume>(volume: &mut V, count: u32) -> Result<(), StorageError> {
    write_file(volume, BOOT_COUNT_PATH, &count.to_le_bytes())
}

/// Fill `buf` from the start of `path`, returning the byte count.
fn read_file<V: Volume>(volume: &mut V, path: &str, buf: &mut [u8]) -> Result<usize, StorageError> {
    let mut file = volume.open(path, OpenMode::Read)?;
    let mut len = 0;
    let result = loop {
        match volume.read(&mut file, &mut buf[len..]) {
            Ok(0) => break Ok(len),
            Ok(n) => {
                len += n;
                if len == buf.len() {
                    break Ok(len);
                }
            }
            Err(e) => break Err(StorageError::Io(e)),
        }
    };
    let _ = volume.close(file);
    result
}

/// Truncating write followed by a durable flush.
fn write_file<V: Volume>(volume: &mut V, path: &str, data: &[u8]) -> Result<(), StorageError> {
    let mut file = volume.open(path, OpenMode::WriteTruncate).map_err(io)?;
    let result = write_all(volume, &mut file, data).and_then(|()| volume.sync(&mut file));
    let closed = volume.close(file);
    result.and(closed).map_err(StorageError::Io)
}

fn io(e: FsError) -> StorageError {
    StorageError::Io(e)
}
