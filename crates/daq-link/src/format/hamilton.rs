//! Hamilton Protocol 1 (PSD syringe pumps, MVP valve positioners).
//!
//! Frames are `<addr><mnemonic><value>[<sep><arg>][R]\r` where the address is
//! a letter, `a` for slot 1 up to `p` for slot 16. Replies start with ACK
//! (0x06) or NAK (0x15), followed by optional data and `\r`.

use std::ops::RangeInclusive;
use std::sync::LazyLock;

use crate::command::Command;
use crate::error::{escape_bytes, LinkError, LinkResult};
use crate::format::{
    split_lines, strip_terminator, FrameFormat, ReadPlan, ReplyEnvelope, RequestFrame, StatusKind,
};
use crate::parser::ResponseParser;

const ACK: u8 = 0x06;
const NAK: u8 = 0x15;
const TERMINATOR: &[u8] = b"\r";

// Data replies are free text; only the status byte signals rejection.
static RESPONSES: LazyLock<ResponseParser> = LazyLock::new(ResponseParser::new);

/// Hamilton Protocol 1 frame format.
#[derive(Debug, Clone, Copy, Default)]
pub struct Hamilton;

impl Hamilton {
    /// Broadcast that makes a daisy chain assign addresses `a`, `b`, ...
    /// in wiring order.
    pub const INIT_BROADCAST: &'static [u8] = b"1a\r";

    fn address_char(address: u16) -> char {
        // bind() guarantees 1..=16
        char::from(b'a' + (address.saturating_sub(1) as u8))
    }
}

impl FrameFormat for Hamilton {
    fn name(&self) -> &'static str {
        "hamilton"
    }

    fn address_range(&self) -> RangeInclusive<u16> {
        1..=16
    }

    fn request_terminator(&self) -> &'static [u8] {
        TERMINATOR
    }

    fn encode(&self, command: &Command) -> Vec<u8> {
        let mut frame = String::with_capacity(16);
        frame.push(Self::address_char(command.address()));
        frame.push_str(command.mnemonic());
        frame.push_str(command.value());
        frame.push_str(&command.separated_argument());
        if command.template().execute_flag {
            frame.push('R');
        }
        let mut bytes = frame.into_bytes();
        bytes.extend_from_slice(TERMINATOR);
        bytes
    }

    fn read_plan(&self, command: &Command) -> ReadPlan {
        match command.expected_reply_lines() {
            0 => ReadPlan::NoReply,
            count => ReadPlan::Lines {
                terminator: TERMINATOR,
                count,
            },
        }
    }

    fn decode(&self, raw: &[u8]) -> LinkResult<ReplyEnvelope> {
        let Some((&marker, rest)) = raw.split_first() else {
            return Err(LinkError::protocol("empty Hamilton reply"));
        };
        let (status, body) = match marker {
            ACK => (StatusKind::Ack, split_lines(rest, TERMINATOR)),
            NAK => (StatusKind::Nak, split_lines(rest, TERMINATOR)),
            _ => (StatusKind::Unknown, split_lines(raw, TERMINATOR)),
        };
        Ok(ReplyEnvelope {
            origin_address: None,
            status,
            body,
            raw: raw.to_vec(),
        })
    }

    fn parse_request(&self, frame: &[u8]) -> LinkResult<RequestFrame> {
        let body = strip_terminator(frame, TERMINATOR)?;
        let mut chars = body.chars();
        let address = match chars.next() {
            Some(c @ 'a'..='p') => u16::from(c as u8 - b'a') + 1,
            _ => {
                return Err(LinkError::protocol(format!(
                    "\"{}\" does not start with a slot letter",
                    escape_bytes(frame)
                )))
            }
        };
        Ok(RequestFrame {
            address,
            payload: chars.as_str().to_string(),
        })
    }

    fn response_parser(&self) -> &ResponseParser {
        &RESPONSES
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandTemplate;

    const FIRMWARE: CommandTemplate = CommandTemplate::new("U").executed();
    const VALVE_POSITION: CommandTemplate = CommandTemplate::new("LQP");

    #[test]
    fn test_encode_firmware_query() {
        let cmd = FIRMWARE.bind(&Hamilton, 1, "", "").unwrap();
        assert_eq!(Hamilton.encode(&cmd), b"aUR\r");
    }

    #[test]
    fn test_encode_last_slot_with_argument() {
        let tmpl = CommandTemplate::new("LP0").with_argument("").executed();
        let cmd = tmpl.bind(&Hamilton, 16, "", "3").unwrap();
        assert_eq!(Hamilton.encode(&cmd), b"pLP03R\r");
    }

    #[test]
    fn test_decode_ack_with_data() {
        let env = Hamilton.decode(b"\x06MVP 1.2\r").unwrap();
        assert_eq!(env.status, StatusKind::Ack);
        assert_eq!(env.body, vec!["MVP 1.2"]);
        assert_eq!(env.origin_address, None);
    }

    #[test]
    fn test_decode_nak() {
        let env = Hamilton.decode(b"\x15\r").unwrap();
        assert_eq!(env.status, StatusKind::Nak);
        assert!(env.body.is_empty());
    }

    #[test]
    fn test_decode_unknown_marker() {
        let env = Hamilton.decode(b"?\r").unwrap();
        assert_eq!(env.status, StatusKind::Unknown);
        assert!(Hamilton.decode(b"").is_err());
    }

    #[test]
    fn test_parse_request_recovers_address() {
        let cmd = VALVE_POSITION.bind(&Hamilton, 3, "", "").unwrap();
        let req = Hamilton.parse_request(&Hamilton.encode(&cmd)).unwrap();
        assert_eq!(req.address, 3);
        assert_eq!(req.payload, "LQP");
        assert!(Hamilton.parse_request(b"1a\r").is_err());
    }
}
