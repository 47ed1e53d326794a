//! VICI Valco universal actuator protocol.
//!
//! Frames are `<id><mnemonic>[<value>]\r` with a single decimal device id.
//! There is no acknowledgement byte: motion commands are silent and queries
//! return a text line.

use std::ops::RangeInclusive;
use std::sync::LazyLock;

use crate::command::Command;
use crate::error::{escape_bytes, ErrorKind, LinkError, LinkResult};
use crate::format::{
    split_lines, strip_terminator, FrameFormat, ReadPlan, ReplyEnvelope, RequestFrame, StatusKind,
};
use crate::parser::ResponseParser;

const TERMINATOR: &[u8] = b"\r";

static RESPONSES: LazyLock<ResponseParser> = LazyLock::new(|| {
    ResponseParser::from_table(
        &[
            (r"(?i)bad command", ErrorKind::Nak, "command not recognized"),
            (r"COMMAND ERR", ErrorKind::Nak, "command rejected"),
            (r"(?i)^busy", ErrorKind::DeviceBusy, "actuator moving"),
        ],
        Some(r"(?i)\berr"),
    )
    .expect("Invalid VICI response table")
});

/// VICI Valco frame format.
#[derive(Debug, Clone, Copy, Default)]
pub struct Vici;

impl FrameFormat for Vici {
    fn name(&self) -> &'static str {
        "vici"
    }

    fn address_range(&self) -> RangeInclusive<u16> {
        0..=9
    }

    fn request_terminator(&self) -> &'static [u8] {
        TERMINATOR
    }

    fn encode(&self, command: &Command) -> Vec<u8> {
        let mut frame = format!(
            "{}{}{}{}",
            command.address(),
            command.mnemonic(),
            command.value(),
            command.separated_argument()
        )
        .into_bytes();
        frame.extend_from_slice(TERMINATOR);
        frame
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
        Ok(ReplyEnvelope {
            origin_address: None,
            status: StatusKind::Ack,
            body: split_lines(raw, TERMINATOR),
            raw: raw.to_vec(),
        })
    }

    fn parse_request(&self, frame: &[u8]) -> LinkResult<RequestFrame> {
        let body = strip_terminator(frame, TERMINATOR)?;
        let mut chars = body.chars();
        let address = chars
            .next()
            .and_then(|c| c.to_digit(10))
            .ok_or_else(|| {
                LinkError::protocol(format!(
                    "\"{}\" does not start with a device id",
                    escape_bytes(frame)
                ))
            })?;
        Ok(RequestFrame {
            address: address as u16,
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

    const GO_TO: CommandTemplate = CommandTemplate::new("GO").without_reply();
    const CURRENT_POSITION: CommandTemplate = CommandTemplate::new("CP");

    #[test]
    fn test_encode() {
        let cmd = GO_TO.bind(&Vici, 2, "5", "").unwrap();
        assert_eq!(Vici.encode(&cmd), b"2GO5\r");
        assert!(matches!(Vici.read_plan(&cmd), ReadPlan::NoReply));

        let cmd = CURRENT_POSITION.bind(&Vici, 0, "", "").unwrap();
        assert!(matches!(
            Vici.read_plan(&cmd),
            ReadPlan::Lines { count: 1, .. }
        ));
    }

    #[test]
    fn test_decode_position() {
        let env = Vici.decode(b"Position is = 5\r").unwrap();
        assert_eq!(env.body, vec!["Position is = 5"]);
        assert!(Vici.response_parser().classify(&env).is_ok());
    }

    #[test]
    fn test_error_table() {
        let env = Vici.decode(b"Bad command\r").unwrap();
        assert_eq!(
            Vici.response_parser().classify(&env).unwrap_err().kind,
            ErrorKind::Nak
        );
        let env = Vici.decode(b"Busy\r").unwrap();
        assert_eq!(
            Vici.response_parser().classify(&env).unwrap_err().kind,
            ErrorKind::DeviceBusy
        );
        let env = Vici.decode(b"Err 4\r").unwrap();
        assert_eq!(
            Vici.response_parser().classify(&env).unwrap_err().kind,
            ErrorKind::ProtocolViolation
        );
    }

    #[test]
    fn test_parse_request() {
        let req = Vici.parse_request(b"2GO5\r").unwrap();
        assert_eq!(req.address, 2);
        assert_eq!(req.payload, "GO5");
    }
}
