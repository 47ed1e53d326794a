//! Harvard Apparatus Protocol 11 (Pump 11 Elite, PHD Ultra).
//!
//! Frames are `<addr><mnemonic> <args>\r\n` with an unpadded decimal address.
//! Replies are `\r\n`-separated lines ending in a prompt: the two-digit
//! address followed by `:` (idle), `>` (infusing), `<` (withdrawing),
//! `T*` (target reached) or `*` (stalled). The prompt carries no trailing
//! terminator.
//!
//! The line before the first `\r\n` is always discarded: firmware sometimes
//! leaks a stale `T*` status into it.

use std::ops::RangeInclusive;
use std::sync::LazyLock;

use crate::command::Command;
use crate::error::{escape_bytes, ErrorKind, LinkError, LinkResult};
use crate::format::{
    strip_terminator, FrameFormat, ReadPlan, ReplyEnvelope, RequestFrame, StatusKind,
};
use crate::parser::ResponseParser;

const TERMINATOR: &[u8] = b"\r\n";

static RESPONSES: LazyLock<ResponseParser> = LazyLock::new(|| {
    ResponseParser::from_table(
        &[
            (r"(?i)command error", ErrorKind::Nak, "command not recognized"),
            (r"(?i)argument error", ErrorKind::Nak, "invalid argument"),
            (r"(?i)out of range", ErrorKind::Nak, "value out of range"),
        ],
        Some(r"(?i)error"),
    )
    .expect("Invalid Harvard response table")
});

/// Harvard Apparatus Protocol 11 frame format.
#[derive(Debug, Clone, Copy, Default)]
pub struct Harvard;

/// Status carried by a complete prompt, or `None` if `line` is not a prompt.
fn prompt_status(line: &[u8]) -> Option<(u16, StatusKind)> {
    if line.len() < 3 || !line[..2].iter().all(u8::is_ascii_digit) {
        return None;
    }
    let address = u16::from(line[0] - b'0') * 10 + u16::from(line[1] - b'0');
    let status = match &line[2..] {
        b":" | b">" | b"<" => StatusKind::Ack,
        b"T*" => StatusKind::TargetReached,
        b"*" => StatusKind::Stalled,
        _ => return None,
    };
    Some((address, status))
}

/// A reply is complete once the bytes after the last `\r\n` are shaped like
/// a prompt: two digits and one marker, or `NNT*`. A bare `NNT` still waits
/// for its `*`. Unknown markers complete too so that `decode` can reject them.
fn reply_complete(buf: &[u8]) -> bool {
    let Some(pos) = buf.windows(2).rposition(|w| w == TERMINATOR) else {
        return false;
    };
    match &buf[pos + 2..] {
        [a, b, marker] if a.is_ascii_digit() && b.is_ascii_digit() => *marker != b'T',
        [a, b, b'T', b'*'] => a.is_ascii_digit() && b.is_ascii_digit(),
        _ => false,
    }
}

impl FrameFormat for Harvard {
    fn name(&self) -> &'static str {
        "harvard"
    }

    fn address_range(&self) -> RangeInclusive<u16> {
        0..=98
    }

    fn request_terminator(&self) -> &'static [u8] {
        TERMINATOR
    }

    fn encode(&self, command: &Command) -> Vec<u8> {
        let mut frame = format!(
            "{}{} {}{}",
            command.address(),
            command.mnemonic(),
            command.value(),
            command.separated_argument()
        )
        .into_bytes();
        frame.extend_from_slice(TERMINATOR);
        frame
    }

    fn read_plan(&self, _command: &Command) -> ReadPlan {
        // Every command is answered with at least a prompt.
        ReadPlan::Until(reply_complete)
    }

    fn decode(&self, raw: &[u8]) -> LinkResult<ReplyEnvelope> {
        let text = String::from_utf8_lossy(raw);
        let mut lines = text.split("\r\n");
        // Line 0 is discarded unconditionally.
        let _ = lines.next();
        let mut lines: Vec<&str> = lines.map(str::trim).filter(|l| !l.is_empty()).collect();

        let Some(prompt) = lines.pop() else {
            return Err(LinkError::protocol(format!(
                "Harvard reply without prompt: \"{}\"",
                escape_bytes(raw)
            )));
        };
        let (origin, status) = match prompt_status(prompt.as_bytes()) {
            Some(parsed) => parsed,
            None if prompt.len() >= 3 && prompt.as_bytes()[..2].iter().all(u8::is_ascii_digit) => {
                let origin = prompt[..2].parse::<u16>().unwrap_or_default();
                (origin, StatusKind::Unknown)
            }
            None => {
                return Err(LinkError::protocol(format!(
                    "malformed Harvard prompt \"{}\"",
                    prompt
                )))
            }
        };

        Ok(ReplyEnvelope {
            origin_address: Some(origin),
            status,
            body: lines.into_iter().map(str::to_owned).collect(),
            raw: raw.to_vec(),
        })
    }

    fn parse_request(&self, frame: &[u8]) -> LinkResult<RequestFrame> {
        let body = strip_terminator(frame, TERMINATOR)?;
        let split = body
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(body.len());
        let address = body[..split].parse::<u16>().map_err(|_| {
            LinkError::protocol(format!("\"{}\" lacks a decimal address", escape_bytes(frame)))
        })?;
        Ok(RequestFrame {
            address,
            payload: body[split..].to_string(),
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

    const VERSION: CommandTemplate = CommandTemplate::new("VER");

    #[test]
    fn test_encode_version_query() {
        let cmd = VERSION.bind(&Harvard, 9, "", "").unwrap();
        assert_eq!(Harvard.encode(&cmd), b"9VER \r\n");
    }

    #[test]
    fn test_encode_with_arguments() {
        let tmpl = CommandTemplate::new("irate").with_argument(" ");
        let cmd = tmpl.bind(&Harvard, 12, "2.5", "ml/min").unwrap();
        assert_eq!(Harvard.encode(&cmd), b"12irate 2.5 ml/min\r\n");
    }

    #[test]
    fn test_reply_completion() {
        assert!(!reply_complete(b"\r\n"));
        assert!(!reply_complete(b"\r\nPHD ULTRA 3.0\r\n"));
        assert!(!reply_complete(b"\r\n09T"));
        assert!(reply_complete(b"\r\nPHD ULTRA 3.0\r\n09:"));
        assert!(reply_complete(b"\r\n09T*"));
        assert!(reply_complete(b"\r\n09*"));
        assert!(reply_complete(b"\r\n09?"));
        assert!(!reply_complete(b"\r\nOK"));
    }

    #[test]
    fn test_decode_body_and_prompt() {
        let env = Harvard.decode(b"\r\nPHD ULTRA 3.0.4\r\n09:").unwrap();
        assert_eq!(env.origin_address, Some(9));
        assert_eq!(env.status, StatusKind::Ack);
        assert_eq!(env.body, vec!["PHD ULTRA 3.0.4"]);
    }

    #[test]
    fn test_decode_discards_leaked_line_zero() {
        let env = Harvard.decode(b"T*\r\n1.5 ml/min\r\n03>").unwrap();
        assert_eq!(env.status, StatusKind::Ack);
        assert_eq!(env.body, vec!["1.5 ml/min"]);
        assert_eq!(env.origin_address, Some(3));
    }

    #[test]
    fn test_decode_stall_and_target() {
        assert_eq!(Harvard.decode(b"\r\n00*").unwrap().status, StatusKind::Stalled);
        assert_eq!(
            Harvard.decode(b"\r\n00T*").unwrap().status,
            StatusKind::TargetReached
        );
    }

    #[test]
    fn test_decode_malformed() {
        assert!(Harvard.decode(b"09:").is_err());
        assert!(Harvard.decode(b"\r\nhello").is_err());
        assert_eq!(Harvard.decode(b"\r\n09?").unwrap().status, StatusKind::Unknown);
    }

    #[test]
    fn test_error_table() {
        let env = Harvard.decode(b"\r\nOut of range\r\n00:").unwrap();
        let err = Harvard.response_parser().classify(&env).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Nak);
    }

    #[test]
    fn test_parse_request() {
        let req = Harvard.parse_request(b"12irate 2.5 ml/min\r\n").unwrap();
        assert_eq!(req.address, 12);
        assert_eq!(req.payload, "irate 2.5 ml/min");
    }
}
