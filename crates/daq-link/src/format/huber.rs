//! Huber PB protocol (Unistat, Ministat and CC thermoregulators).
//!
//! Every request and reply is exactly 10 bytes: `{`, a mode letter (`M` for
//! master requests, `S` for slave replies), a two-digit hex function code, a
//! four-character value field and `\r\n`. A value of `****` queries the
//! current value without changing it. The function code plays the role of
//! the address: the reply must echo it.

use std::ops::RangeInclusive;
use std::sync::LazyLock;

use crate::command::Command;
use crate::error::{escape_bytes, ErrorKind, LinkError, LinkResult};
use crate::format::{FrameFormat, ReadPlan, ReplyEnvelope, RequestFrame, StatusKind};
use crate::parser::ResponseParser;

const TERMINATOR: &[u8] = b"\r\n";
const FRAME_LEN: usize = 10;
const QUERY: &str = "****";

static RESPONSES: LazyLock<ResponseParser> = LazyLock::new(|| {
    ResponseParser::from_table(
        &[(
            r"^\*\*\*\*$",
            ErrorKind::Nak,
            "function not supported by this unit",
        )],
        None,
    )
    .expect("Invalid Huber response table")
});

/// Huber PB frame format.
#[derive(Debug, Clone, Copy, Default)]
pub struct HuberPb;

impl HuberPb {
    /// Encode a signed 16-bit quantity as the four-digit two's complement
    /// hex value field.
    pub fn encode_value(value: i16) -> String {
        format!("{:04X}", value as u16)
    }

    /// Decode a four-digit hex value field as a signed 16-bit quantity.
    ///
    /// # Errors
    ///
    /// `ProtocolViolation` when `field` is not four hex digits.
    pub fn decode_value(field: &str) -> LinkResult<i16> {
        if field.len() != 4 {
            return Err(LinkError::protocol(format!(
                "Huber value field \"{}\" is not 4 characters",
                field
            )));
        }
        u16::from_str_radix(field, 16)
            .map(|v| v as i16)
            .map_err(|_| LinkError::protocol(format!("Huber value field \"{}\" is not hex", field)))
    }

    fn value_field(command: &Command) -> &str {
        if command.value().is_empty() {
            QUERY
        } else {
            command.value()
        }
    }
}

impl FrameFormat for HuberPb {
    fn name(&self) -> &'static str {
        "huber"
    }

    fn address_range(&self) -> RangeInclusive<u16> {
        0x00..=0xFF
    }

    fn request_terminator(&self) -> &'static [u8] {
        TERMINATOR
    }

    fn validate(&self, command: &Command) -> LinkResult<()> {
        if command.mnemonic().len() != 1 {
            return Err(LinkError::new(
                ErrorKind::InvalidArgument,
                format!("Huber mode \"{}\" must be one character", command.mnemonic()),
            ));
        }
        if !command.argument().is_empty() {
            return Err(LinkError::new(
                ErrorKind::InvalidArgument,
                "Huber frames carry no argument",
            ));
        }
        let value = Self::value_field(command);
        if value != QUERY && (value.len() != 4 || !value.bytes().all(|b| b.is_ascii_hexdigit())) {
            return Err(LinkError::new(
                ErrorKind::InvalidArgument,
                format!("Huber value \"{}\" must be 4 hex digits or \"****\"", value),
            ));
        }
        Ok(())
    }

    fn encode(&self, command: &Command) -> Vec<u8> {
        let mut frame = format!(
            "{{{}{:02X}{}",
            command.mnemonic(),
            command.address(),
            Self::value_field(command)
        )
        .into_bytes();
        frame.extend_from_slice(TERMINATOR);
        frame
    }

    fn read_plan(&self, command: &Command) -> ReadPlan {
        match command.expected_reply_lines() {
            0 => ReadPlan::NoReply,
            _ => ReadPlan::Exact(FRAME_LEN),
        }
    }

    fn decode(&self, raw: &[u8]) -> LinkResult<ReplyEnvelope> {
        if raw.len() != FRAME_LEN || raw[0] != b'{' || !raw.ends_with(TERMINATOR) {
            return Err(LinkError::protocol(format!(
                "Huber reply \"{}\" is not a 10-byte frame",
                escape_bytes(raw)
            )));
        }
        let text = std::str::from_utf8(&raw[1..8])
            .ok()
            .filter(|t| t.is_ascii())
            .ok_or_else(|| LinkError::protocol("Huber reply is not valid ASCII"))?;
        let status = match &text[..1] {
            "S" => StatusKind::Ack,
            _ => StatusKind::Unknown,
        };
        let origin = u16::from_str_radix(&text[1..3], 16).map_err(|_| {
            LinkError::protocol(format!("Huber function code \"{}\" is not hex", &text[1..3]))
        })?;
        Ok(ReplyEnvelope {
            origin_address: Some(origin),
            status,
            body: vec![text[3..].to_string()],
            raw: raw.to_vec(),
        })
    }

    fn parse_request(&self, frame: &[u8]) -> LinkResult<RequestFrame> {
        if frame.len() != FRAME_LEN || frame[0] != b'{' || !frame.ends_with(TERMINATOR) {
            return Err(LinkError::protocol(format!(
                "Huber request \"{}\" is not a 10-byte frame",
                escape_bytes(frame)
            )));
        }
        let text = std::str::from_utf8(&frame[1..8])
            .ok()
            .filter(|t| t.is_ascii())
            .ok_or_else(|| LinkError::protocol("Huber request is not valid ASCII"))?;
        let address = u16::from_str_radix(&text[1..3], 16).map_err(|_| {
            LinkError::protocol(format!("Huber function code \"{}\" is not hex", &text[1..3]))
        })?;
        Ok(RequestFrame {
            address,
            payload: format!("{}{}", &text[..1], &text[3..]),
        })
    }

    fn response_parser(&self) -> &ResponseParser {
        &RESPONSES
    }
}
