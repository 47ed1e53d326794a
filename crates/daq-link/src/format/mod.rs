//! Per-vendor frame formats.
//!
//! A [`FrameFormat`] owns everything that differs between instrument
//! families: how an address is written, which terminator ends a frame, how a
//! reply is recognised as complete, and which status markers and error texts
//! the firmware uses. The transport and session layers never hard-code any
//! of these.
//!
//! | Family | Type | Addresses |
//! |--------|------|-----------|
//! | Hamilton Protocol 1 | [`Hamilton`] | 1..=16 (`a`..`p`) |
//! | Harvard Apparatus Protocol 11 | [`Harvard`] | 0..=98 |
//! | Huber PB | [`HuberPb`] | 0x00..=0xFF (function code) |
//! | Knauer ethernet ASCII | [`Knauer`] | 0 |
//! | VICI Valco | [`Vici`] | 0..=9 |

mod hamilton;
mod harvard;
mod huber;
mod knauer;
mod vici;

pub use hamilton::Hamilton;
pub use harvard::Harvard;
pub use huber::HuberPb;
pub use knauer::Knauer;
pub use vici::Vici;

use std::fmt;
use std::ops::RangeInclusive;

use serde::Serialize;

use crate::command::Command;
use crate::error::{LinkError, LinkResult};
use crate::parser::ResponseParser;

/// Status carried by a decoded reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    /// Command accepted.
    Ack,
    /// Command rejected.
    Nak,
    /// Device is busy; the command may succeed later.
    Busy,
    /// Motion complete (Harvard `T*`).
    TargetReached,
    /// Motor stall or equivalent fault (Harvard `*`).
    Stalled,
    /// Status marker not in the format's table.
    Unknown,
}

/// Decoded reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplyEnvelope {
    /// Address the reply came from. `None` while decoding a format that does
    /// not echo addresses; a session fills it before returning.
    pub origin_address: Option<u16>,
    /// Status marker.
    pub status: StatusKind,
    /// Body lines with address, status prefix and terminators stripped.
    pub body: Vec<String>,
    /// Raw bytes as read from the medium.
    #[serde(skip)]
    pub raw: Vec<u8>,
}

impl ReplyEnvelope {
    /// Successful reply for a command the device does not answer.
    pub fn empty(address: u16) -> Self {
        Self {
            origin_address: Some(address),
            status: StatusKind::Ack,
            body: Vec::new(),
            raw: Vec::new(),
        }
    }

    /// First body line, if any.
    pub fn first_line(&self) -> Option<&str> {
        self.body.first().map(String::as_str)
    }

    /// Body lines joined with `\n`.
    pub fn text(&self) -> String {
        self.body.join("\n")
    }
}

/// How the transport decides that a reply is complete.
#[derive(Debug, Clone, Copy)]
pub enum ReadPlan {
    /// The device does not answer; return right after the write.
    NoReply,
    /// Read until `count` terminators have been seen.
    Lines {
        /// Line terminator.
        terminator: &'static [u8],
        /// Number of terminated lines.
        count: usize,
    },
    /// Read exactly this many bytes.
    Exact(usize),
    /// Read until the predicate accepts the accumulated bytes.
    Until(fn(&[u8]) -> bool),
}

impl ReadPlan {
    /// Whether `buf` holds a complete reply.
    pub fn is_satisfied(&self, buf: &[u8]) -> bool {
        match self {
            ReadPlan::NoReply => true,
            ReadPlan::Lines { terminator, count } => {
                count_occurrences(buf, terminator) >= *count
            }
            ReadPlan::Exact(n) => buf.len() >= *n,
            ReadPlan::Until(done) => done(buf),
        }
    }
}

/// Outbound frame decoded back into its parts.
///
/// `payload` is the frame with address, framing bytes and terminator
/// removed: mnemonic, value, separator-prefixed argument and execute marker,
/// in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    /// Target address.
    pub address: u16,
    /// Command body.
    pub payload: String,
}

/// Encoding and decoding rules for one instrument family.
pub trait FrameFormat: Send + Sync + fmt::Debug {
    /// Family name used in logs and configuration.
    fn name(&self) -> &'static str;

    /// Valid device addresses.
    fn address_range(&self) -> RangeInclusive<u16>;

    /// Terminator ending an outbound frame.
    fn request_terminator(&self) -> &'static [u8];

    /// Format-specific checks on value and argument shape.
    fn validate(&self, _command: &Command) -> LinkResult<()> {
        Ok(())
    }

    /// Serialize a command into its exact wire bytes.
    fn encode(&self, command: &Command) -> Vec<u8>;

    /// How to recognise the end of the reply to `command`.
    fn read_plan(&self, command: &Command) -> ReadPlan;

    /// Decode a complete raw reply.
    fn decode(&self, raw: &[u8]) -> LinkResult<ReplyEnvelope>;

    /// Decode an outbound frame, as a device on the bus would.
    fn parse_request(&self, frame: &[u8]) -> LinkResult<RequestFrame>;

    /// Error table for reply bodies.
    fn response_parser(&self) -> &ResponseParser;
}

/// Number of non-overlapping occurrences of `needle` in `haystack`.
pub(crate) fn count_occurrences(haystack: &[u8], needle: &[u8]) -> usize {
    if needle.is_empty() {
        return 0;
    }
    let mut count = 0;
    let mut i = 0;
    while i + needle.len() <= haystack.len() {
        if &haystack[i..i + needle.len()] == needle {
            count += 1;
            i += needle.len();
        } else {
            i += 1;
        }
    }
    count
}

/// Split `raw` on `terminator`, dropping empty segments.
pub(crate) fn split_lines(raw: &[u8], terminator: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(raw)
        .split(std::str::from_utf8(terminator).unwrap_or("\r"))
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Strip `terminator` from the end of an outbound frame.
pub(crate) fn strip_terminator<'a>(frame: &'a [u8], terminator: &[u8]) -> LinkResult<&'a str> {
    let body = frame.strip_suffix(terminator).ok_or_else(|| {
        LinkError::protocol(format!(
            "frame \"{}\" lacks terminator",
            crate::error::escape_bytes(frame)
        ))
    })?;
    std::str::from_utf8(body).map_err(|_| LinkError::protocol("frame is not valid ASCII"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_plan() {
        let plan = ReadPlan::Lines {
            terminator: b"\r\n",
            count: 2,
        };
        assert!(!plan.is_satisfied(b"one\r\n"));
        assert!(!plan.is_satisfied(b"one\r\ntwo\r"));
        assert!(plan.is_satisfied(b"one\r\ntwo\r\n"));
    }

    #[test]
    fn test_exact_plan() {
        assert!(!ReadPlan::Exact(10).is_satisfied(b"{S00"));
        assert!(ReadPlan::Exact(4).is_satisfied(b"{S00"));
    }

    #[test]
    fn test_split_lines_drops_blanks() {
        assert_eq!(split_lines(b"\r\nA\r\n\r\nB\r\n", b"\r\n"), vec!["A", "B"]);
    }

    #[test]
    fn test_envelope_text() {
        let env = ReplyEnvelope {
            origin_address: Some(1),
            status: StatusKind::Ack,
            body: vec!["a".into(), "b".into()],
            raw: Vec::new(),
        };
        assert_eq!(env.text(), "a\nb");
        assert_eq!(env.first_line(), Some("a"));
    }
}
