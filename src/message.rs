//! Client wire messages.
//!
//! One message is one text line:
//!
//! ```text
//! Hello #<seq> from client at <ts>\n
//! Hello #<seq> (attempt <n>) from client at <ts>\n
//! ```
//!
//! The attempt marker only appears on retries. The timestamp is RFC 3339
//! with nanoseconds and is taken when the message is built, so every retry
//! carries its own time.

use chrono::{DateTime, Local, SecondsFormat, TimeZone};
use std::fmt;

/// An immutable, newline-terminated client line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    sequence: u64,
    attempt: u32,
    line: String,
}

impl Message {
    /// Build the message for `attempt` of tick `sequence`, stamped now.
    pub fn now(sequence: u64, attempt: u32) -> Self {
        Self::at(sequence, attempt, Local::now())
    }

    /// Build the message with an explicit timestamp.
    pub fn at<Tz>(sequence: u64, attempt: u32, timestamp: DateTime<Tz>) -> Self
    where
        Tz: TimeZone,
        Tz::Offset: fmt::Display,
    {
        let ts = timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true);
        let line = if attempt <= 1 {
            format!("Hello #{sequence} from client at {ts}\n")
        } else {
            format!("Hello #{sequence} (attempt {attempt}) from client at {ts}\n")
        };

        Message {
            sequence,
            attempt,
            line,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Wire bytes, including the trailing newline.
    pub fn as_bytes(&self) -> &[u8] {
        self.line.as_bytes()
    }

    /// The line without its terminator, for logging.
    pub fn text(&self) -> &str {
        self.line.trim_end_matches('\n')
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.text())
    }
}
