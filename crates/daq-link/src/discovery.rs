//! Daisy-chain address allocation.
//!
//! Some chains (Hamilton) assign addresses in wiring order after an init
//! broadcast; others come pre-addressed. Either way the allocator then walks
//! the format's address range from the bottom, probing each address until
//! one stays silent, answers with an error, or fails the caller's signature
//! check.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::command::CommandTemplate;
use crate::error::{ErrorKind, LinkError, LinkResult};
use crate::format::{FrameFormat, ReadPlan, ReplyEnvelope};
use crate::session::DeviceSession;
use crate::transport::TransportLink;

/// Sequential address prober.
///
/// # Example
///
/// ```rust,ignore
/// let allocator = AddressAllocator::new()
///     .with_init_broadcast(Hamilton::INIT_BROADCAST, Duration::from_millis(500));
/// let addresses = allocator
///     .discover(&link, Arc::new(Hamilton), &FIRMWARE, |reply| reply.text().starts_with("MVP"))
///     .await?;
/// ```
#[derive(Debug, Clone)]
pub struct AddressAllocator {
    init_broadcast: Option<Vec<u8>>,
    settle_delay: Duration,
    probe_timeout: Duration,
    max_devices: Option<usize>,
}

impl Default for AddressAllocator {
    fn default() -> Self {
        Self {
            init_broadcast: None,
            settle_delay: Duration::ZERO,
            probe_timeout: Duration::from_millis(300),
            max_devices: None,
        }
    }
}

impl AddressAllocator {
    /// Allocator without init broadcast, 300 ms probe timeout, no device cap.
    pub fn new() -> Self {
        Self::default()
    }

    /// Write `frame` before probing and wait `settle` for the chain to
    /// assign addresses. The broadcast expects no reply.
    #[must_use]
    pub fn with_init_broadcast(mut self, frame: impl Into<Vec<u8>>, settle: Duration) -> Self {
        self.init_broadcast = Some(frame.into());
        self.settle_delay = settle;
        self
    }

    /// Deadline for each probe.
    #[must_use]
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Stop after this many devices.
    #[must_use]
    pub fn with_max_devices(mut self, max: usize) -> Self {
        self.max_devices = Some(max);
        self
    }

    /// Probe addresses upward from the bottom of `format`'s range.
    ///
    /// # Errors
    ///
    /// - `NoDeviceFound` when the first address does not qualify
    /// - errors from the init broadcast
    /// - construction errors from `probe` (e.g. a required argument)
    pub async fn discover<S>(
        &self,
        link: &Arc<TransportLink>,
        format: Arc<dyn FrameFormat>,
        probe: &CommandTemplate,
        signature_check: S,
    ) -> LinkResult<Vec<u16>>
    where
        S: Fn(&ReplyEnvelope) -> bool,
    {
        self.discover_with_cancel(link, format, probe, signature_check, &CancellationToken::new())
            .await
    }

    /// [`discover`](Self::discover) abandoning the scan when `cancel` fires.
    ///
    /// # Errors
    ///
    /// As [`discover`](Self::discover), plus `Cancelled`.
    #[instrument(
        skip(self, link, format, probe, signature_check, cancel),
        fields(endpoint = %link.endpoint(), family = format.name(), probe = probe.mnemonic),
        err
    )]
    pub async fn discover_with_cancel<S>(
        &self,
        link: &Arc<TransportLink>,
        format: Arc<dyn FrameFormat>,
        probe: &CommandTemplate,
        signature_check: S,
        cancel: &CancellationToken,
    ) -> LinkResult<Vec<u16>>
    where
        S: Fn(&ReplyEnvelope) -> bool,
    {
        if let Some(frame) = &self.init_broadcast {
            debug!(frame = %crate::error::escape_bytes(frame), "Sending init broadcast");
            link.transact(frame, ReadPlan::NoReply, self.probe_timeout, cancel)
                .await?;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(LinkError::new(ErrorKind::Cancelled, "discovery cancelled"));
                }
                _ = tokio::time::sleep(self.settle_delay) => {}
            }
        }

        let mut found = Vec::new();
        for address in format.address_range() {
            let session = DeviceSession::new(
                format!("probe@{}", address),
                link.clone(),
                address,
                format.clone(),
            )
            .with_timeout(self.probe_timeout);
            session.begin_probing();

            match session.send_with_cancel(probe, "", "", cancel).await {
                Ok(reply) if signature_check(&reply) => {
                    info!(address, reply = %reply.text(), "Found device");
                    found.push(address);
                }
                Ok(reply) => {
                    debug!(address, reply = %reply.text(), "Signature mismatch, stopping scan");
                    break;
                }
                Err(e) if is_fatal(e.kind) => return Err(e),
                Err(e) => {
                    debug!(address, error = %e, "No device, stopping scan");
                    break;
                }
            }

            if self.max_devices.is_some_and(|max| found.len() >= max) {
                break;
            }
        }

        if found.is_empty() {
            return Err(LinkError::new(
                ErrorKind::NoDeviceFound,
                format!("no {} device answered on {}", format.name(), link.endpoint()),
            ));
        }
        info!(count = found.len(), addresses = ?found, "Discovery complete");
        Ok(found)
    }
}

// Errors that say nothing about device presence.
fn is_fatal(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::Cancelled
            | ErrorKind::MissingArgument
            | ErrorKind::InvalidArgument
            | ErrorKind::InvalidAddress
            | ErrorKind::Io
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Hamilton;
    use crate::mock::SimulatedBus;
    use crate::transport::LinkSettings;

    const FIRMWARE: CommandTemplate = CommandTemplate::new("U").executed();

    fn chain(devices: u16) -> (Arc<TransportLink>, SimulatedBus) {
        let (medium, bus) = SimulatedBus::spawn(Arc::new(Hamilton), move |req| {
            (req.address <= devices).then(|| format!("\x06MVP {}\r", req.address).into_bytes())
        });
        let link = Arc::new(TransportLink::new("chain", medium, LinkSettings::default()));
        (link, bus)
    }

    fn is_mvp(reply: &ReplyEnvelope) -> bool {
        reply.text().starts_with("MVP")
    }

    #[tokio::test]
    async fn test_discovers_contiguous_chain() {
        let (link, bus) = chain(3);
        let found = AddressAllocator::new()
            .with_probe_timeout(Duration::from_millis(100))
            .discover(&link, Arc::new(Hamilton), &FIRMWARE, is_mvp)
            .await
            .unwrap();
        assert_eq!(found, vec![1, 2, 3]);
        assert_eq!(bus.requests().len(), 4);
    }

    #[tokio::test]
    async fn test_empty_chain() {
        let (link, _bus) = chain(0);
        let err = AddressAllocator::new()
            .with_probe_timeout(Duration::from_millis(50))
            .discover(&link, Arc::new(Hamilton), &FIRMWARE, is_mvp)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoDeviceFound);
    }

    #[tokio::test]
    async fn test_signature_failure_stops_scan() {
        let (link, _bus) = chain(3);
        let found = AddressAllocator::new()
            .with_probe_timeout(Duration::from_millis(100))
            .discover(&link, Arc::new(Hamilton), &FIRMWARE, |reply| {
                reply.text() != "MVP 2"
            })
            .await
            .unwrap();
        assert_eq!(found, vec![1]);
    }

    #[tokio::test]
    async fn test_max_devices_and_broadcast() {
        let (link, bus) = chain(5);
        let found = AddressAllocator::new()
            .with_init_broadcast(Hamilton::INIT_BROADCAST, Duration::from_millis(5))
            .with_max_devices(2)
            .discover(&link, Arc::new(Hamilton), &FIRMWARE, is_mvp)
            .await
            .unwrap();
        assert_eq!(found, vec![1, 2]);
        assert_eq!(bus.frames()[0], Hamilton::INIT_BROADCAST);
    }
}
