//! In-memory media for testing drivers without hardware.
//!
//! - [`MockMedium`] + [`MockDeviceHarness`]: scripted expect/respond pair.
//!   The harness asserts on every byte the link writes and feeds replies
//!   back one chunk at a time.
//! - [`SilentMedium`]: accepts writes, never answers. Exercises timeouts.
//! - [`SimulatedBus`]: a background task decoding frames with
//!   [`FrameFormat::parse_request`] and answering through a closure, for
//!   daisy-chain and concurrency tests.
//!
//! # Example
//!
//! ```rust,ignore
//! let (medium, mut harness) = daq_link::mock::pair();
//! let link = Arc::new(TransportLink::new("mock", Box::new(medium), LinkSettings::default()));
//! let session = DeviceSession::new("valve", link, 1, Arc::new(Hamilton));
//!
//! let reply = tokio::spawn(async move { session.send(&FIRMWARE, "", "").await });
//! harness.expect_and_respond(b"aUR\r", b"\x06MVP 1.2\r").await;
//! ```

// Assertion failures in the harness panic, as test assertions do.
#![allow(clippy::panic, clippy::expect_used)]

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::format::{FrameFormat, RequestFrame};
use crate::transport::DynMedium;

/// Link-facing side of a scripted mock device.
#[derive(Debug)]
pub struct MockMedium {
    writes_tx: UnboundedSender<Vec<u8>>,
    reads_rx: UnboundedReceiver<Vec<u8>>,
    read_buffer: VecDeque<u8>,
}

/// Test-facing side controlling a [`MockMedium`].
#[derive(Debug)]
pub struct MockDeviceHarness {
    writes_rx: UnboundedReceiver<Vec<u8>>,
    reads_tx: UnboundedSender<Vec<u8>>,
    write_buffer: Vec<u8>,
}

/// Connected medium and harness.
pub fn pair() -> (MockMedium, MockDeviceHarness) {
    let (writes_tx, writes_rx) = mpsc::unbounded_channel();
    let (reads_tx, reads_rx) = mpsc::unbounded_channel();
    (
        MockMedium {
            writes_tx,
            reads_rx,
            read_buffer: VecDeque::new(),
        },
        MockDeviceHarness {
            writes_rx,
            reads_tx,
            write_buffer: Vec::new(),
        },
    )
}

impl AsyncRead for MockMedium {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.read_buffer.is_empty() {
            match self.reads_rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => self.read_buffer.extend(chunk),
                // Harness dropped: end of stream.
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
        let n = buf.remaining().min(self.read_buffer.len());
        let chunk: Vec<u8> = self.read_buffer.drain(..n).collect();
        buf.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MockMedium {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.writes_tx.send(buf.to_vec()) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mock device harness disconnected",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl MockDeviceHarness {
    /// Queue bytes for the link to read.
    ///
    /// # Errors
    ///
    /// Fails when the medium has been dropped.
    pub fn send_response(&self, data: &[u8]) -> Result<(), &'static str> {
        self.reads_tx
            .send(data.to_vec())
            .map_err(|_| "mock medium disconnected")
    }

    /// Wait up to 2 s for the link to write exactly `expected` next.
    ///
    /// # Panics
    ///
    /// On timeout, on a closed medium, or when the bytes differ.
    pub async fn expect_write(&mut self, expected: &[u8]) {
        while self.write_buffer.len() < expected.len() {
            match tokio::time::timeout(Duration::from_secs(2), self.writes_rx.recv()).await {
                Ok(Some(chunk)) => self.write_buffer.extend_from_slice(&chunk),
                Ok(None) => panic!("medium closed while expecting a write"),
                Err(_) => panic!(
                    "timeout waiting for write \"{}\", got \"{}\"",
                    crate::error::escape_bytes(expected),
                    crate::error::escape_bytes(&self.write_buffer)
                ),
            }
        }
        let actual: Vec<u8> = self.write_buffer.drain(..expected.len()).collect();
        assert_eq!(
            actual,
            expected,
            "expected write \"{}\", got \"{}\"",
            crate::error::escape_bytes(expected),
            crate::error::escape_bytes(&actual)
        );
    }

    /// [`expect_write`](Self::expect_write) followed by
    /// [`send_response`](Self::send_response).
    pub async fn expect_and_respond(&mut self, expected: &[u8], response: &[u8]) {
        self.expect_write(expected).await;
        self.send_response(response)
            .expect("mock medium disconnected");
    }

    /// Everything written so far that has not been asserted, waiting 50 ms
    /// for stragglers.
    pub async fn drain_writes(&mut self) -> Vec<u8> {
        while let Ok(Some(chunk)) =
            tokio::time::timeout(Duration::from_millis(50), self.writes_rx.recv()).await
        {
            self.write_buffer.extend_from_slice(&chunk);
        }
        std::mem::take(&mut self.write_buffer)
    }
}

/// Medium that records writes and never produces input.
#[derive(Debug, Clone, Default)]
pub struct SilentMedium {
    written: Arc<Mutex<Vec<u8>>>,
}

impl SilentMedium {
    /// New silent medium.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every byte written so far, across clones.
    pub fn written(&self) -> Vec<u8> {
        self.written.lock().clone()
    }
}

impl AsyncRead for SilentMedium {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        // Woken only by the caller's deadline.
        Poll::Pending
    }
}

impl AsyncWrite for SilentMedium {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.written.lock().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Simulated daisy chain answering decoded frames through a closure.
///
/// The responder sees every frame that [`FrameFormat::parse_request`]
/// accepts and returns the raw reply, or `None` to stay silent (an absent
/// device). Frames the format cannot parse, such as broadcasts, are
/// recorded but not answered.
#[derive(Debug)]
pub struct SimulatedBus {
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
    requests: Arc<Mutex<Vec<RequestFrame>>>,
    overlaps: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl SimulatedBus {
    /// Start a bus answering immediately.
    pub fn spawn<R>(format: Arc<dyn FrameFormat>, responder: R) -> (DynMedium, Self)
    where
        R: FnMut(&RequestFrame) -> Option<Vec<u8>> + Send + 'static,
    {
        Self::spawn_with_delay(format, Duration::ZERO, responder)
    }

    /// Start a bus that waits `reply_delay` before each reply.
    pub fn spawn_with_delay<R>(
        format: Arc<dyn FrameFormat>,
        reply_delay: Duration,
        responder: R,
    ) -> (DynMedium, Self)
    where
        R: FnMut(&RequestFrame) -> Option<Vec<u8>> + Send + 'static,
    {
        let (client, device) = tokio::io::duplex(1024);
        let frames = Arc::new(Mutex::new(Vec::new()));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let task = tokio::spawn(run_bus(
            device,
            format,
            reply_delay,
            responder,
            BusLog {
                frames: frames.clone(),
                requests: requests.clone(),
                overlaps: overlaps.clone(),
            },
        ));
        (
            Box::new(client),
            Self {
                frames,
                requests,
                overlaps,
                task,
            },
        )
    }

    /// Every raw frame received, in order.
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().clone()
    }

    /// Every decoded request, in order.
    pub fn requests(&self) -> Vec<RequestFrame> {
        self.requests.lock().clone()
    }

    /// Number of times a new frame started arriving before the previous
    /// request was answered.
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }
}

impl Drop for SimulatedBus {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct BusLog {
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
    requests: Arc<Mutex<Vec<RequestFrame>>>,
    overlaps: Arc<AtomicUsize>,
}

async fn run_bus<R>(
    mut device: DuplexStream,
    format: Arc<dyn FrameFormat>,
    reply_delay: Duration,
    mut responder: R,
    log: BusLog,
) where
    R: FnMut(&RequestFrame) -> Option<Vec<u8>> + Send + 'static,
{
    let terminator = format.request_terminator();
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 256];

    loop {
        match device.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }

        while let Some(end) = buf
            .windows(terminator.len())
            .position(|w| w == terminator)
        {
            let frame: Vec<u8> = buf.drain(..end + terminator.len()).collect();
            log.frames.lock().push(frame.clone());

            let Ok(request) = format.parse_request(&frame) else {
                continue;
            };
            log.requests.lock().push(request.clone());
            let Some(reply) = responder(&request) else {
                continue;
            };

            if !reply_delay.is_zero() {
                tokio::time::sleep(reply_delay).await;
            }
            if let Some(Ok(n)) = device.read(&mut chunk).now_or_never() {
                buf.extend_from_slice(&chunk[..n]);
            }
            if !buf.is_empty() {
                log.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            if device.write_all(&reply).await.is_err() {
                return;
            }
        }
    }
}
