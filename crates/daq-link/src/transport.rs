//! Exclusive-access transactions over one physical medium.
//!
//! A [`TransportLink`] owns a serial port or TCP socket and serializes every
//! write-then-read exchange through an async mutex. Several
//! [`DeviceSession`](crate::DeviceSession)s on a daisy chain share one link
//! through an `Arc`; their bytes never interleave on the wire.
//!
//! # Transaction
//!
//! ```text
//! lock ─► drain stale input ─► write + flush ─► read until ReadPlan ─► unlock
//!  └──────────────────────── one deadline ─────────────────────────┘
//! ```
//!
//! The deadline covers the lock wait. The lock is released on every exit
//! path, including cancellation and dropping the future, and the next
//! transaction drains whatever a cancelled one left behind.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::{escape_bytes, ErrorKind, Exchange, LinkError, LinkResult};
use crate::format::ReadPlan;

/// Async byte stream a link can own.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` qualifies:
/// `tokio_serial::SerialStream`, `tokio::net::TcpStream`,
/// `tokio::io::DuplexStream` and the mocks in [`crate::mock`].
pub trait Medium: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Medium for T {}

/// Type-erased medium.
pub type DynMedium = Box<dyn Medium>;

/// Per-link timing defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSettings {
    /// Transaction deadline used by sessions that do not override it.
    pub default_timeout: Duration,
    /// Upper bound on the stale-input drain before each write.
    pub drain_window: Duration,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(1),
            drain_window: Duration::from_millis(10),
        }
    }
}

struct LinkIo {
    medium: DynMedium,
    // Bytes read past the end of the previous reply.
    pending: BytesMut,
}

/// One physical medium shared by every session addressed through it.
pub struct TransportLink {
    endpoint: String,
    settings: LinkSettings,
    io: Mutex<LinkIo>,
    closed: AtomicBool,
    transactions: AtomicU64,
}

impl fmt::Debug for TransportLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportLink")
            .field("endpoint", &self.endpoint)
            .field("settings", &self.settings)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl TransportLink {
    /// Wrap an opened medium.
    pub fn new(endpoint: impl Into<String>, medium: DynMedium, settings: LinkSettings) -> Self {
        Self {
            endpoint: endpoint.into(),
            settings,
            io: Mutex::new(LinkIo {
                medium,
                pending: BytesMut::with_capacity(64),
            }),
            closed: AtomicBool::new(false),
            transactions: AtomicU64::new(0),
        }
    }

    /// Endpoint identity (port path or `host:port`).
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Timing defaults.
    pub fn settings(&self) -> LinkSettings {
        self.settings
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether no transaction currently holds the link.
    pub fn is_idle(&self) -> bool {
        self.io.try_lock().is_ok()
    }

    /// Number of transactions that reached the write stage.
    pub fn transaction_count(&self) -> u64 {
        self.transactions.load(Ordering::Relaxed)
    }

    /// Run one exclusive write-then-read exchange.
    ///
    /// # Errors
    ///
    /// - `Timeout` when the lock, the write or the reply misses the deadline
    ///   (partial reply bytes attached)
    /// - `Cancelled` when `cancel` fires first
    /// - `Io` on medium failure, EOF, or a closed link
    pub async fn transact(
        &self,
        frame: &[u8],
        plan: ReadPlan,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> LinkResult<Vec<u8>> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let deadline = Instant::now() + timeout;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LinkError::new(
                ErrorKind::Cancelled,
                format!("transaction on {} cancelled", self.endpoint),
            )),
            result = self.exchange(frame, plan, deadline, timeout) => result,
        }
    }

    async fn exchange(
        &self,
        frame: &[u8],
        plan: ReadPlan,
        deadline: Instant,
        timeout: Duration,
    ) -> LinkResult<Vec<u8>> {
        let mut io = timeout_at(deadline, self.io.lock()).await.map_err(|_| {
            LinkError::timeout(format!(
                "link {} still busy after {:?}",
                self.endpoint, timeout
            ))
            .with_exchange(Exchange::new(frame, Vec::new()))
        })?;
        // A close may have landed while waiting for the lock.
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let LinkIo { medium, pending } = &mut *io;

        let drain_until = deadline.min(Instant::now() + self.settings.drain_window);
        let stale = drain_stale_input(medium, pending, drain_until).await;
        if !stale.is_empty() {
            tracing::trace!(
                endpoint = %self.endpoint,
                stale = %escape_bytes(&stale),
                "Discarded stale input"
            );
        }

        self.transactions.fetch_add(1, Ordering::Relaxed);
        match timeout_at(deadline, async {
            medium.write_all(frame).await?;
            medium.flush().await
        })
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(LinkError::io("write failed", e)
                    .with_exchange(Exchange::new(frame, Vec::new())))
            }
            Err(_) => {
                return Err(LinkError::timeout(format!("write not accepted within {:?}", timeout))
                    .with_exchange(Exchange::new(frame, Vec::new())))
            }
        }

        if matches!(plan, ReadPlan::NoReply) {
            return Ok(Vec::new());
        }

        let mut reply = BytesMut::with_capacity(64);
        let mut chunk = [0u8; 256];
        while !plan.is_satisfied(&reply) {
            match timeout_at(deadline, medium.read(&mut chunk)).await {
                Ok(Ok(0)) => {
                    return Err(LinkError::new(
                        ErrorKind::Io,
                        format!("{} reached end of stream", self.endpoint),
                    )
                    .with_exchange(Exchange::new(frame, reply.to_vec())))
                }
                Ok(Ok(n)) => reply.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Ok(Err(e)) => {
                    return Err(LinkError::io("read failed", e)
                        .with_exchange(Exchange::new(frame, reply.to_vec())))
                }
                Err(_) => {
                    return Err(LinkError::timeout(format!(
                        "no complete reply within {:?}",
                        timeout
                    ))
                    .with_exchange(Exchange::new(frame, reply.to_vec())))
                }
            }
        }

        if let ReadPlan::Exact(n) = plan {
            pending.extend_from_slice(&reply.split_off(n));
        }
        Ok(reply.to_vec())
    }

    /// Shut the medium down. Later transactions fail with `Io`.
    ///
    /// Waits for an in-flight transaction to finish first.
    ///
    /// # Errors
    ///
    /// `Io` if the medium reports an error while shutting down.
    pub async fn close(&self) -> LinkResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut io = self.io.lock().await;
        io.pending.clear();
        tracing::info!(endpoint = %self.endpoint, "Closing link");
        io.medium
            .shutdown()
            .await
            .map_err(|e| LinkError::io("shutdown failed", e))
    }

    fn closed_error(&self) -> LinkError {
        LinkError::new(ErrorKind::Io, format!("link {} is closed", self.endpoint))
    }
}

/// Discard buffered and immediately-available input until `until`.
///
/// Returns the discarded bytes.
async fn drain_stale_input<R: AsyncRead + Unpin>(
    medium: &mut R,
    pending: &mut BytesMut,
    until: Instant,
) -> Vec<u8> {
    let mut discarded = pending.split().to_vec();
    let mut scratch = [0u8; 256];

    while Instant::now() < until {
        match timeout_at(until, medium.read(&mut scratch)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => discarded.extend_from_slice(&scratch[..n]),
            // Nothing more arrived in the window, or the medium failed; the
            // write that follows reports real errors.
            Ok(Err(_)) | Err(_) => break,
        }
    }
    discarded
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::duplex;

    fn link(medium: DynMedium) -> TransportLink {
        TransportLink::new("test", medium, LinkSettings::default())
    }

    const ONE_LINE: ReadPlan = ReadPlan::Lines {
        terminator: b"\r",
        count: 1,
    };

    #[tokio::test]
    async fn test_transact_round_trip() {
        let (client, mut device) = duplex(64);
        let link = link(Box::new(client));

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            let n = device.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"aUR\r");
            device.write_all(b"\x06MVP\r").await.unwrap();
            device
        });

        let reply = link
            .transact(b"aUR\r", ONE_LINE, Duration::from_millis(500), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reply, b"\x06MVP\r");
        assert_eq!(link.transaction_count(), 1);
        let _device = responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_input_is_drained() {
        let (client, mut device) = duplex(64);
        let link = link(Box::new(client));

        device.write_all(b"garbage\r").await.unwrap();
        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            let n = device.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"1CP\r");
            device.write_all(b"Position is = 3\r").await.unwrap();
            device
        });

        let reply = link
            .transact(b"1CP\r", ONE_LINE, Duration::from_millis(500), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reply, b"Position is = 3\r");
        let _device = responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_carries_partial_reply() {
        let (client, mut device) = duplex(64);
        let link = link(Box::new(client));

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            let _ = device.read(&mut buf).await.unwrap();
            device.write_all(b"\r\nPHD").await.unwrap();
            device
        });

        let two_lines = ReadPlan::Lines {
            terminator: b"\r\n",
            count: 2,
        };
        let err = link
            .transact(b"0VER \r\n", two_lines, Duration::from_millis(100), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert_eq!(err.received(), Some(&b"\r\nPHD"[..]));
        assert!(link.is_idle());
        let _device = responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_eof_is_io_error() {
        let (client, device) = duplex(64);
        let link = link(Box::new(client));
        drop(device);

        let err = link
            .transact(b"x\r", ONE_LINE, Duration::from_millis(100), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Io);
    }

    #[tokio::test]
    async fn test_cancellation_releases_lock() {
        let (client, _device) = duplex(64);
        let link = Arc::new(link(Box::new(client)));
        let cancel = CancellationToken::new();

        let task = {
            let link = link.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                link.transact(b"x\r", ONE_LINE, Duration::from_secs(5), &cancel)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!link.is_idle());
        cancel.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
        assert!(link.is_idle());
    }

    #[tokio::test]
    async fn test_closed_link_rejects_transactions() {
        let (client, _device) = duplex(64);
        let link = link(Box::new(client));
        link.close().await.unwrap();
        assert!(link.is_closed());

        let err = link
            .transact(b"x\r", ReadPlan::NoReply, Duration::from_millis(100), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Io);
        assert_eq!(link.transaction_count(), 0);
    }

    #[tokio::test]
    async fn test_exact_plan_keeps_surplus_for_drain() {
        let (client, mut device) = duplex(64);
        let link = link(Box::new(client));

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            let _ = device.read(&mut buf).await.unwrap();
            device.write_all(b"{S000960\r\nXX").await.unwrap();
            device
        });

        let reply = link
            .transact(b"{M00****\r\n", ReadPlan::Exact(10), Duration::from_millis(500), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reply, b"{S000960\r\n");
        let _device = responder.await.unwrap();
    }
}
