//! Knauer ethernet ASCII protocol (Azura pumps and valve drives).
//!
//! One device per TCP connection, so the address is implicit and always 0.
//! Frames are `KEYWORD[:value][,argument]` followed by the terminator, which
//! differs between pumps (`\n\r`) and valves (`\r\n`). Devices answer with
//! `OK`, `KEYWORD:OK`, the queried value, or `ERROR:<code>`.

use std::ops::RangeInclusive;
use std::sync::LazyLock;

use crate::command::Command;
use crate::error::{ErrorKind, LinkError, LinkResult};
use crate::format::{
    split_lines, strip_terminator, FrameFormat, ReadPlan, ReplyEnvelope, RequestFrame, StatusKind,
};
use crate::parser::ResponseParser;

const PUMP_TERMINATOR: &[u8] = b"\n\r";
const VALVE_TERMINATOR: &[u8] = b"\r\n";

static RESPONSES: LazyLock<ResponseParser> = LazyLock::new(|| {
    ResponseParser::from_table(
        &[
            (r"^ERROR:1$", ErrorKind::Nak, "command not recognized"),
            (r"^ERROR:2$", ErrorKind::Nak, "parameter out of range"),
            (r"^ERROR:3$", ErrorKind::Nak, "wrong number of parameters"),
            (r"^ERROR:4$", ErrorKind::DeviceBusy, "command not possible in current state"),
        ],
        Some(r"^ERROR"),
    )
    .expect("Invalid Knauer response table")
});

/// Knauer ethernet ASCII frame format.
#[derive(Debug, Clone, Copy)]
pub struct Knauer {
    terminator: &'static [u8],
    family: &'static str,
}

impl Knauer {
    /// Azura pump variant (`\n\r` terminator).
    pub const fn pump() -> Self {
        Self {
            terminator: PUMP_TERMINATOR,
            family: "knauer_pump",
        }
    }

    /// Valve drive variant (`\r\n` terminator).
    pub const fn valve() -> Self {
        Self {
            terminator: VALVE_TERMINATOR,
            family: "knauer_valve",
        }
    }
}

impl FrameFormat for Knauer {
    fn name(&self) -> &'static str {
        self.family
    }

    fn address_range(&self) -> RangeInclusive<u16> {
        0..=0
    }

    fn request_terminator(&self) -> &'static [u8] {
        self.terminator
    }

    fn encode(&self, command: &Command) -> Vec<u8> {
        let mut frame = command.mnemonic().to_string();
        if !command.value().is_empty() {
            frame.push(':');
            frame.push_str(command.value());
        }
        frame.push_str(&command.separated_argument());
        let mut bytes = frame.into_bytes();
        bytes.extend_from_slice(self.terminator);
        bytes
    }

    fn read_plan(&self, command: &Command) -> ReadPlan {
        match command.expected_reply_lines() {
            0 => ReadPlan::NoReply,
            count => ReadPlan::Lines {
                terminator: self.terminator,
                count,
            },
        }
    }

    fn decode(&self, raw: &[u8]) -> LinkResult<ReplyEnvelope> {
        let body = split_lines(raw, self.terminator);
        if body.is_empty() {
            return Err(LinkError::protocol("empty Knauer reply"));
        }
        // Rejections arrive as ERROR:<code> bodies and are classified by the table.
        Ok(ReplyEnvelope {
            origin_address: None,
            status: StatusKind::Ack,
            body,
            raw: raw.to_vec(),
        })
    }

    fn parse_request(&self, frame: &[u8]) -> LinkResult<RequestFrame> {
        let body = strip_terminator(frame, self.terminator)?;
        Ok(RequestFrame {
            address: 0,
            payload: body.to_string(),
        })
    }

    fn response_parser(&self) -> &ResponseParser {
        &RESPONSES
    }
}
