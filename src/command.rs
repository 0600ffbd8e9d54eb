//! Serial console commands
//!
//! `ratio` and `limit` are two-step: the bare keyword prompts, the next
//! frame carries the value.

use crate::config_store::parse_lenient_f32;

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum Command {
    Start,
    Stop,
    Hide,
    Unhide,
    SelfTest,
    ShowConfig,
    AskRatio,
    AskLimit,
    /// `None` when the answer was not a plain number
    SetRatio(Option<f32>),
    SetLimit(Option<f32>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Awaiting {
    Nothing,
    Ratio,
    Limit,
}

pub struct CommandParser {
    awaiting: Awaiting,
}

impl Default for CommandParser {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandParser {
    pub const fn new() -> Self {
        Self {
            awaiting: Awaiting::Nothing,
        }
    }

    /// Interpret one received frame.
    pub fn feed(&mut self, frame: &[u8]) -> Option<Command> {
        let text = core::str::from_utf8(frame).ok()?.trim_matches(|c: char| c.is_whitespace() || c == '\0');

        match core::mem::replace(&mut self.awaiting, Awaiting::Nothing) {
            Awaiting::Ratio => return Some(Command::SetRatio(plain_number(text))),
            Awaiting::Limit => return Some(Command::SetLimit(plain_number(text))),
            Awaiting::Nothing => {}
        }

        let command = match text {
            "hide" => Command::Hide,
            "unhide" => Command::Unhide,
            _ if text.starts_with("start") => Command::Start,
            _ if text.starts_with("stop") => Command::Stop,
            _ if text.starts_with("test") => Command::SelfTest,
            _ if text.starts_with("conf") => Command::ShowConfig,
            _ if text.starts_with("ratio") => Command::AskRatio,
            _ if text.starts_with("limit") => Command::AskLimit,
            _ => {
                debug!("unknown command");
                return None;
            }
        };
        self.awaiting = match command {
            Command::AskRatio => Awaiting::Ratio,
            Command::AskLimit => Awaiting::Limit,
            _ => Awaiting::Nothing,
        };
        Some(command)
    }

    /// Forget a pending prompt, e.g. when reading the current value failed.
    pub fn cancel_prompt(&mut self) {
        self.awaiting = Awaiting::Nothing;
    }
}

/// Digits, `.` and spaces only, with at least one digit or dot.
fn plain_number(text: &str) -> Option<f32> {
    let plain = text.bytes().all(|b| b.is_ascii_digit() || b == b'.' || b == b' ');
    let has_digit = text.bytes().any(|b| b.is_ascii_digit() || b == b'.');
    (plain && has_digit).then(|| parse_lenient_f32(text))
}
