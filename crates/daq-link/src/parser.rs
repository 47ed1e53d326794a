//! Table-driven reply classification.
//!
//! Each frame format carries a [`ResponseParser`]: an ordered list of
//! `(pattern, kind, description)` rules matched against the reply body, plus
//! an optional generic pattern for bodies that look like an error but match
//! no rule. Status markers are classified first; body rules apply only to
//! replies whose status says the command was accepted.

use regex::Regex;

use crate::error::{ErrorKind, LinkError, LinkResult};
use crate::format::{ReplyEnvelope, StatusKind};

/// One entry of an error table.
#[derive(Debug, Clone)]
pub struct ErrorRule {
    pattern: Regex,
    kind: ErrorKind,
    description: &'static str,
}

impl ErrorRule {
    /// Kind reported when the rule matches.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Human-readable meaning of the vendor text.
    pub fn description(&self) -> &'static str {
        self.description
    }
}

/// Ordered error table for one instrument family.
#[derive(Debug, Clone, Default)]
pub struct ResponseParser {
    rules: Vec<ErrorRule>,
    error_hint: Option<Regex>,
}

impl ResponseParser {
    /// Parser with no rules; every accepted reply classifies as success.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a parser from static rule and hint patterns.
    ///
    /// # Errors
    ///
    /// Returns the regex error if a pattern does not compile.
    pub fn from_table(
        rules: &[(&str, ErrorKind, &'static str)],
        error_hint: Option<&str>,
    ) -> Result<Self, regex::Error> {
        let mut parser = Self::new();
        for (pattern, kind, description) in rules {
            parser = parser.with_rule(pattern, *kind, description)?;
        }
        if let Some(hint) = error_hint {
            parser = parser.with_error_hint(hint)?;
        }
        Ok(parser)
    }

    /// Append a rule. Rules are tried in insertion order.
    ///
    /// # Errors
    ///
    /// Returns the regex error if `pattern` does not compile.
    pub fn with_rule(
        mut self,
        pattern: &str,
        kind: ErrorKind,
        description: &'static str,
    ) -> Result<Self, regex::Error> {
        self.rules.push(ErrorRule {
            pattern: Regex::new(pattern)?,
            kind,
            description,
        });
        Ok(self)
    }

    /// Set the generic "looks like an error" pattern.
    ///
    /// # Errors
    ///
    /// Returns the regex error if `pattern` does not compile.
    pub fn with_error_hint(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.error_hint = Some(Regex::new(pattern)?);
        Ok(self)
    }

    /// Rules in match order.
    pub fn rules(&self) -> &[ErrorRule] {
        &self.rules
    }

    /// First rule matching `text`, if any.
    pub fn lookup(&self, text: &str) -> Option<&ErrorRule> {
        self.rules.iter().find(|rule| rule.pattern.is_match(text))
    }

    /// Classify a decoded reply.
    ///
    /// # Errors
    ///
    /// - `Nak`, `DeviceBusy`, `DeviceFault` or `ProtocolViolation` from the
    ///   status marker
    /// - the matching rule's kind when an accepted reply carries a known
    ///   error text
    /// - `ProtocolViolation` when the body looks like an error but matches no rule
    pub fn classify(&self, envelope: &ReplyEnvelope) -> LinkResult<()> {
        let text = envelope.text();
        match envelope.status {
            StatusKind::Nak => Err(LinkError::new(
                ErrorKind::Nak,
                self.describe("device rejected the command", &text),
            )),
            StatusKind::Busy => Err(LinkError::new(
                ErrorKind::DeviceBusy,
                self.describe("device busy", &text),
            )),
            StatusKind::Stalled => Err(LinkError::new(
                ErrorKind::DeviceFault,
                self.describe("device stalled", &text),
            )),
            StatusKind::Unknown => Err(LinkError::protocol(format!(
                "unknown status marker in reply \"{}\"",
                crate::error::escape_bytes(&envelope.raw)
            ))),
            StatusKind::Ack | StatusKind::TargetReached => self.inspect_body(&text),
        }
    }

    fn inspect_body(&self, text: &str) -> LinkResult<()> {
        if text.is_empty() {
            return Ok(());
        }
        if let Some(rule) = self.lookup(text) {
            return Err(LinkError::new(
                rule.kind,
                format!("{}: \"{}\"", rule.description, text),
            ));
        }
        match &self.error_hint {
            Some(hint) if hint.is_match(text) => Err(LinkError::protocol(format!(
                "unrecognized error reply \"{}\"",
                text
            ))),
            _ => Ok(()),
        }
    }

    fn describe(&self, fallback: &str, text: &str) -> String {
        match (self.lookup(text), text.is_empty()) {
            (Some(rule), _) => format!("{}: \"{}\"", rule.description, text),
            (None, true) => fallback.to_string(),
            (None, false) => format!("{}: \"{}\"", fallback, text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(status: StatusKind, body: &[&str]) -> ReplyEnvelope {
        ReplyEnvelope {
            origin_address: Some(0),
            status,
            body: body.iter().map(|s| s.to_string()).collect(),
            raw: Vec::new(),
        }
    }

    fn parser() -> ResponseParser {
        ResponseParser::from_table(
            &[
                (r"^Out of range", ErrorKind::Nak, "value out of range"),
                (r"(?i)busy", ErrorKind::DeviceBusy, "actuator busy"),
            ],
            Some(r"(?i)error"),
        )
        .unwrap()
    }

    #[test]
    fn test_status_markers() {
        let p = parser();
        assert!(p.classify(&envelope(StatusKind::Ack, &["1.0"])).is_ok());
        assert!(p.classify(&envelope(StatusKind::TargetReached, &[])).is_ok());
        assert_eq!(
            p.classify(&envelope(StatusKind::Nak, &[])).unwrap_err().kind,
            ErrorKind::Nak
        );
        assert_eq!(
            p.classify(&envelope(StatusKind::Busy, &[])).unwrap_err().kind,
            ErrorKind::DeviceBusy
        );
        assert_eq!(
            p.classify(&envelope(StatusKind::Stalled, &[])).unwrap_err().kind,
            ErrorKind::DeviceFault
        );
        assert_eq!(
            p.classify(&envelope(StatusKind::Unknown, &[])).unwrap_err().kind,
            ErrorKind::ProtocolViolation
        );
    }

    #[test]
    fn test_rule_match_on_accepted_reply() {
        let err = parser()
            .classify(&envelope(StatusKind::Ack, &["Out of range"]))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Nak);
        assert!(err.message.contains("value out of range"));

        let err = parser()
            .classify(&envelope(StatusKind::Ack, &["Busy"]))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::DeviceBusy);
    }

    #[test]
    fn test_unrecognized_error_text() {
        let err = parser()
            .classify(&envelope(StatusKind::Ack, &["Firmware ERROR 77"]))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ProtocolViolation);
        assert!(err.message.contains("Firmware ERROR 77"));
    }

    #[test]
    fn test_rules_in_order() {
        let p = ResponseParser::new()
            .with_rule("E1", ErrorKind::Nak, "first")
            .unwrap()
            .with_rule("E", ErrorKind::DeviceFault, "second")
            .unwrap();
        assert_eq!(p.lookup("E1").map(|r| r.description()), Some("first"));
        assert_eq!(p.lookup("E2").map(|r| r.kind()), Some(ErrorKind::DeviceFault));
    }

    #[test]
    fn test_invalid_pattern_is_reported() {
        assert!(ResponseParser::new().with_error_hint("(").is_err());
    }
}
