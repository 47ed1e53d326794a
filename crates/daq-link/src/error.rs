//! Error types for command framing and shared-link I/O.
//!
//! Every failure surfaced by this crate is a [`LinkError`]: a category
//! ([`ErrorKind`]), a human-readable message, and, when bytes were actually
//! exchanged with an instrument, the raw [`Exchange`] so that vendor quirks can
//! be diagnosed after the fact.
//!
//! ## Error Categories
//!
//! 1. **Construction errors** - `InvalidAddress`, `MissingArgument`, `InvalidArgument`
//!    - Raised while binding a command; never reach the transport
//!
//! 2. **Link errors** - `ConfigurationFailure`, `Io`, `Timeout`, `Cancelled`
//!    - Raised by the medium or by deadlines
//!
//! 3. **Device errors** - `Nak`, `DeviceBusy`, `DeviceFault`, `ProtocolViolation`
//!    - Raised after decoding what the instrument sent back
//!
//! Only `DeviceBusy` is transient. The retry layer resolves it locally and
//! escalates to `Timeout` once its budget is spent.

use std::fmt;
use thiserror::Error;

/// Category of a [`LinkError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Address outside the protocol's valid range.
    InvalidAddress,
    /// The command template requires an argument and none was given.
    MissingArgument,
    /// The value or argument does not fit the protocol's field shape.
    InvalidArgument,
    /// A link could not be opened, or its configuration is unusable.
    ConfigurationFailure,
    /// Address discovery found no responsive device.
    NoDeviceFound,
    /// No (or an incomplete) reply within the deadline, or retry exhaustion.
    Timeout,
    /// The device explicitly rejected the command.
    Nak,
    /// The reply was malformed, came from the wrong address, or carried an
    /// unknown status.
    ProtocolViolation,
    /// The device is busy. The only retry-eligible kind.
    DeviceBusy,
    /// The device reported a fault (e.g. a stall) that needs explicit recovery.
    DeviceFault,
    /// The underlying medium failed, reached EOF, or was closed.
    Io,
    /// The caller cancelled the operation.
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::InvalidAddress => "invalid_address",
            ErrorKind::MissingArgument => "missing_argument",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::ConfigurationFailure => "configuration_failure",
            ErrorKind::NoDeviceFound => "no_device_found",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Nak => "nak",
            ErrorKind::ProtocolViolation => "protocol_violation",
            ErrorKind::DeviceBusy => "device_busy",
            ErrorKind::DeviceFault => "device_fault",
            ErrorKind::Io => "io",
            ErrorKind::Cancelled => "cancelled",
        };
        write!(f, "{}", label)
    }
}

/// Raw bytes written to and read from a link during one transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Exchange {
    /// Frame written to the medium.
    pub sent: Vec<u8>,
    /// Bytes read back (possibly partial).
    pub received: Vec<u8>,
}

impl Exchange {
    /// Create an exchange record.
    pub fn new(sent: impl Into<Vec<u8>>, received: impl Into<Vec<u8>>) -> Self {
        Self {
            sent: sent.into(),
            received: received.into(),
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sent \"{}\", received \"{}\"",
            escape_bytes(&self.sent),
            escape_bytes(&self.received)
        )
    }
}

/// Render bytes as printable ASCII, escaping control and non-ASCII bytes.
///
/// Used for logs and error messages; `\r`, `\n`, ACK (0x06) and NAK (0x15)
/// are the characters that matter when reading instrument traffic.
pub fn escape_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .flat_map(|b| std::ascii::escape_default(*b))
        .map(char::from)
        .collect()
}

/// Error returned by every fallible operation in this crate.
#[derive(Error, Debug, Clone)]
#[error("{kind} error: {message}")]
pub struct LinkError {
    /// Category used by callers to pick a remediation.
    pub kind: ErrorKind,
    /// Description of what failed.
    pub message: String,
    /// Bytes exchanged with the device, when any were.
    pub exchange: Option<Exchange>,
    /// Underlying error, e.g. the last busy reply behind a retry timeout.
    #[source]
    pub cause: Option<Box<LinkError>>,
}

impl LinkError {
    /// Create an error without exchange or cause.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            exchange: None,
            cause: None,
        }
    }

    /// Attach the bytes exchanged with the device.
    pub fn with_exchange(mut self, exchange: Exchange) -> Self {
        self.exchange = Some(exchange);
        self
    }

    /// Attach a cause.
    pub fn caused_by(mut self, cause: LinkError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Whether a retry may resolve this error.
    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::DeviceBusy
    }

    /// Raw reply bytes, if any were captured.
    pub fn received(&self) -> Option<&[u8]> {
        self.exchange.as_ref().map(|e| e.received.as_slice())
    }

    pub(crate) fn invalid_address(address: u16, valid: &std::ops::RangeInclusive<u16>) -> Self {
        Self::new(
            ErrorKind::InvalidAddress,
            format!(
                "address {} outside valid range {}..={}",
                address,
                valid.start(),
                valid.end()
            ),
        )
    }

    pub(crate) fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProtocolViolation, message)
    }

    pub(crate) fn io(context: &str, err: std::io::Error) -> Self {
        Self::new(ErrorKind::Io, format!("{}: {}", context, err))
    }
}

/// Convenience alias for results using [`LinkError`].
pub type LinkResult<T> = std::result::Result<T, LinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LinkError::new(ErrorKind::Nak, "device rejected 'aUR'");
        assert_eq!(err.to_string(), "nak error: device rejected 'aUR'");
    }

    #[test]
    fn test_only_busy_is_transient() {
        assert!(LinkError::new(ErrorKind::DeviceBusy, "busy").is_transient());
        assert!(!LinkError::new(ErrorKind::Nak, "nak").is_transient());
        assert!(!LinkError::new(ErrorKind::DeviceFault, "stalled").is_transient());
        assert!(!LinkError::new(ErrorKind::Timeout, "late").is_transient());
    }

    #[test]
    fn test_cause_is_error_source() {
        use std::error::Error;

        let busy = LinkError::new(ErrorKind::DeviceBusy, "valve moving");
        let err = LinkError::timeout("retry budget exhausted").caused_by(busy);
        let source = err.source().map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("device_busy error: valve moving"));
    }

    #[test]
    fn test_exchange_escapes_control_bytes() {
        let exchange = Exchange::new(b"aUR\r".to_vec(), vec![0x15, b'\r']);
        assert_eq!(
            exchange.to_string(),
            "sent \"aUR\\r\", received \"\\x15\\r\""
        );
    }
}
