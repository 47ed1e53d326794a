//! One logical device on a (possibly shared) link.
//!
//! Drivers hold a [`DeviceSession`] and call [`send`](DeviceSession::send);
//! everything below it (framing, the link lock, stale-input drain, reply
//! decoding, address checks and error classification) happens here.
//!
//! # State machine
//!
//! ```text
//! Uninitialized ─► Probing ─► Ready ⇄ InTransaction
//!       └────────── send ───────►┘         │ stall / device fault
//!                                          ▼
//!                     Ready ◄─ clear_fault ─ Faulted
//! ```
//!
//! While `Faulted`, [`send`](DeviceSession::send) refuses with `DeviceFault`
//! without touching the link.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::command::{Command, CommandTemplate};
use crate::error::{escape_bytes, ErrorKind, Exchange, LinkError, LinkResult};
use crate::format::{FrameFormat, ReadPlan, ReplyEnvelope};
use crate::parser::ResponseParser;
use crate::transport::TransportLink;

/// Lifecycle of a [`DeviceSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Created, no exchange yet.
    Uninitialized,
    /// Address bring-up in progress.
    Probing,
    /// Idle and usable.
    Ready,
    /// A send is in flight.
    InTransaction,
    /// The device reported a fault; only `clear_fault` may talk to it.
    Faulted,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Probing => "probing",
            SessionState::Ready => "ready",
            SessionState::InTransaction => "in_transaction",
            SessionState::Faulted => "faulted",
        };
        write!(f, "{}", label)
    }
}

/// One addressed device behind a shared [`TransportLink`].
pub struct DeviceSession {
    name: String,
    link: Arc<TransportLink>,
    address: u16,
    format: Arc<dyn FrameFormat>,
    parser: Option<Arc<ResponseParser>>,
    timeout: Duration,
    state: Mutex<SessionState>,
    in_flight: AtomicUsize,
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("name", &self.name)
            .field("endpoint", &self.link.endpoint())
            .field("address", &self.address)
            .field("format", &self.format.name())
            .field("state", &self.state())
            .finish()
    }
}

// Decrements the in-flight count on every exit path, including drop.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl DeviceSession {
    /// Session for the device at `address`, using the link's default timeout.
    pub fn new(
        name: impl Into<String>,
        link: Arc<TransportLink>,
        address: u16,
        format: Arc<dyn FrameFormat>,
    ) -> Self {
        let timeout = link.settings().default_timeout;
        Self {
            name: name.into(),
            link,
            address,
            format,
            parser: None,
            timeout,
            state: Mutex::new(SessionState::Uninitialized),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Override the transaction deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replace the format's error table, e.g. with one extended by
    /// driver-specific codes.
    #[must_use]
    pub fn with_parser(mut self, parser: ResponseParser) -> Self {
        self.parser = Some(Arc::new(parser));
        self
    }

    /// Driver-facing name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Device address.
    pub fn address(&self) -> u16 {
        self.address
    }

    /// Shared link.
    pub fn link(&self) -> &Arc<TransportLink> {
        &self.link
    }

    /// Frame format.
    pub fn format(&self) -> &Arc<dyn FrameFormat> {
        &self.format
    }

    /// Transaction deadline.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        let state = *self.state.lock();
        if state == SessionState::Ready && self.in_flight.load(Ordering::Acquire) > 0 {
            SessionState::InTransaction
        } else {
            state
        }
    }

    /// Enter `Probing` for address bring-up. No effect while `Faulted`.
    pub fn begin_probing(&self) {
        let mut state = self.state.lock();
        if *state != SessionState::Faulted {
            *state = SessionState::Probing;
        }
    }

    /// Finish bring-up and enter `Ready`. No effect while `Faulted`.
    pub fn mark_ready(&self) {
        let mut state = self.state.lock();
        if *state != SessionState::Faulted {
            *state = SessionState::Ready;
        }
    }

    /// Send a command and return the classified reply.
    ///
    /// # Errors
    ///
    /// - `DeviceFault` without I/O while the session is `Faulted`
    /// - `InvalidAddress`, `MissingArgument`, `InvalidArgument` from binding,
    ///   without I/O
    /// - `Timeout`, `Cancelled`, `Io` from the link
    /// - `ProtocolViolation` for malformed replies or a foreign origin address
    /// - `Nak`, `DeviceBusy`, `DeviceFault` from the reply status or body
    #[instrument(
        skip(self, template),
        fields(device = %self.name, address = self.address, mnemonic = template.mnemonic),
        err
    )]
    pub async fn send(
        &self,
        template: &CommandTemplate,
        value: &str,
        argument: &str,
    ) -> LinkResult<ReplyEnvelope> {
        self.send_with_cancel(template, value, argument, &CancellationToken::new())
            .await
    }

    /// [`send`](Self::send) abandoning the transaction when `cancel` fires.
    ///
    /// # Errors
    ///
    /// As [`send`](Self::send), plus `Cancelled`.
    pub async fn send_with_cancel(
        &self,
        template: &CommandTemplate,
        value: &str,
        argument: &str,
        cancel: &CancellationToken,
    ) -> LinkResult<ReplyEnvelope> {
        if self.state() == SessionState::Faulted {
            return Err(LinkError::new(
                ErrorKind::DeviceFault,
                format!("{} is faulted; clear the fault before sending", self.name),
            ));
        }
        let command = template.bind(self.format.as_ref(), self.address, value, argument)?;
        self.execute(&command, cancel).await
    }

    /// Send the device-specific clear command to leave `Faulted`.
    ///
    /// Returns to `Ready` on success and stays `Faulted` otherwise. Also
    /// usable outside `Faulted`, where it behaves like `send`.
    ///
    /// # Errors
    ///
    /// As [`send`](Self::send), without the faulted-state refusal.
    #[instrument(
        skip(self, template),
        fields(device = %self.name, address = self.address, mnemonic = template.mnemonic),
        err
    )]
    pub async fn clear_fault(
        &self,
        template: &CommandTemplate,
        value: &str,
        argument: &str,
    ) -> LinkResult<ReplyEnvelope> {
        let command = template.bind(self.format.as_ref(), self.address, value, argument)?;
        let was_faulted = self.state() == SessionState::Faulted;
        if was_faulted {
            // Run the clear command as an ordinary transaction.
            *self.state.lock() = SessionState::Ready;
        }
        let result = self.execute(&command, &CancellationToken::new()).await;
        if result.is_err() && was_faulted {
            *self.state.lock() = SessionState::Faulted;
        }
        result
    }

    async fn execute(&self, command: &Command, cancel: &CancellationToken) -> LinkResult<ReplyEnvelope> {
        let frame = self.format.encode(command);
        let plan = self.format.read_plan(command);

        let result = {
            let _in_flight = InFlight::enter(&self.in_flight);
            match self.link.transact(&frame, plan, self.timeout, cancel).await {
                Ok(raw) => {
                    debug!(
                        endpoint = %self.link.endpoint(),
                        sent = %escape_bytes(&frame),
                        received = %escape_bytes(&raw),
                        "Transaction complete"
                    );
                    self.interpret(command, plan, &frame, raw)
                }
                Err(e) => {
                    debug!(
                        endpoint = %self.link.endpoint(),
                        sent = %escape_bytes(&frame),
                        error = %e,
                        "Transaction failed"
                    );
                    Err(e)
                }
            }
        };

        self.settle(&result);
        result
    }

    fn interpret(
        &self,
        command: &Command,
        plan: ReadPlan,
        frame: &[u8],
        raw: Vec<u8>,
    ) -> LinkResult<ReplyEnvelope> {
        if matches!(plan, ReadPlan::NoReply) {
            return Ok(ReplyEnvelope::empty(command.address()));
        }
        let exchange = || Exchange::new(frame, raw.clone());

        let mut envelope = self
            .format
            .decode(&raw)
            .map_err(|e| e.with_exchange(exchange()))?;

        match envelope.origin_address {
            Some(origin) if origin != command.address() => {
                return Err(LinkError::protocol(format!(
                    "reply from address {} to a command for {}",
                    origin,
                    command.address()
                ))
                .with_exchange(exchange()));
            }
            _ => envelope.origin_address = Some(command.address()),
        }

        self.parser()
            .classify(&envelope)
            .map_err(|e| e.with_exchange(exchange()))?;
        Ok(envelope)
    }

    fn parser(&self) -> &ResponseParser {
        match &self.parser {
            Some(parser) => parser,
            None => self.format.response_parser(),
        }
    }

    fn settle(&self, result: &LinkResult<ReplyEnvelope>) {
        let mut state = self.state.lock();
        match result {
            Err(e) if e.kind == ErrorKind::DeviceFault => {
                if *state != SessionState::Faulted {
                    warn!(device = %self.name, address = self.address, error = %e, "Device faulted");
                }
                *state = SessionState::Faulted;
            }
            // A reply of any kind proves the device is there; lazy bring-up.
            _ if *state == SessionState::Uninitialized && device_answered(result) => {
                *state = SessionState::Ready;
            }
            _ => {}
        }
    }
}

/// Whether `result` came from a reply rather than a silent or broken link.
fn device_answered(result: &LinkResult<ReplyEnvelope>) -> bool {
    match result {
        Ok(_) => true,
        Err(e) => matches!(
            e.kind,
            ErrorKind::Nak | ErrorKind::DeviceBusy | ErrorKind::ProtocolViolation
        ),
    }
}
